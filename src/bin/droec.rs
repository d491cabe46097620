// CLI binary: exiting with a status code on unrecoverable errors is
// standard for command-line tools.
#![allow(clippy::exit)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use droec::artifact::{Artifact, MAGIC};
use droec::embed;
use droec::host::StdHost;
use droec::vm::Vm;
use droec::CompilationContext;

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "droec", about = "Droe DSL compiler and VM", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file to a bytecode artifact
    Compile {
        source: PathBuf,
        /// Code-generation target
        #[arg(long, default_value = "bytecode")]
        target: String,
        /// Output path (default: the source with the target's extension)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Compile if needed, then execute
    Run {
        /// A `.droe` source file or a compiled artifact
        input: PathBuf,
    },
    /// Produce a standalone executable with the artifact embedded
    Build {
        source: PathBuf,
        #[arg(long)]
        release: bool,
        /// Output path (default: the source without its extension)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // A standalone build carries its program behind framing markers; it
    // runs that program and ignores its command line.
    match embed::extract_from_current_exe() {
        Ok(Some(bytes)) => {
            let code = match Artifact::from_bytes(&bytes) {
                Ok(artifact) => run_artifact(artifact),
                Err(e) => {
                    eprintln!("droec: embedded artifact: {e}");
                    2
                }
            };
            process::exit(code);
        }
        Ok(None) => {}
        Err(e) => {
            eprintln!("droec: {e}");
            process::exit(2);
        }
    }

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Compile { source, target, out } => cmd_compile(&source, &target, out),
        Commands::Run { input } => cmd_run(&input),
        Commands::Build { source, out, .. } => cmd_build(&source, out),
    };
    process::exit(code);
}

fn new_context() -> CompilationContext {
    let include_root = std::env::var_os("DROE_HOME").map(PathBuf::from);
    CompilationContext::new().with_include_root(include_root)
}

// ── Commands ─────────────────────────────────────────────────────

fn cmd_compile(source: &Path, target: &str, out: Option<PathBuf>) -> i32 {
    let mut ctx = new_context();
    let extension = match ctx.backend(target) {
        Some(backend) => backend.file_extension(),
        None => {
            eprintln!("droec: unknown target `{target}`");
            return 1;
        }
    };

    let artifact = match ctx.compile_file(source) {
        Ok(artifact) => artifact,
        Err(errors) => {
            eprintln!("{}", ctx.render_errors(&errors));
            return 1;
        }
    };

    let out = out.unwrap_or_else(|| source.with_extension(extension));
    let bytes = match artifact.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("droec: {e}");
            return 2;
        }
    };
    if let Err(e) = fs::write(&out, bytes) {
        eprintln!("droec: cannot write {}: {e}", out.display());
        return 2;
    }
    0
}

fn cmd_run(input: &Path) -> i32 {
    let bytes = match fs::read(input) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("droec: cannot read {}: {e}", input.display());
            return 2;
        }
    };

    let artifact = if bytes.starts_with(MAGIC) {
        match Artifact::from_bytes(&bytes) {
            Ok(artifact) => artifact,
            Err(e) => {
                eprintln!("droec: {}: {e}", input.display());
                return 2;
            }
        }
    } else {
        let mut ctx = new_context();
        match ctx.compile_file(input) {
            Ok(artifact) => artifact,
            Err(errors) => {
                eprintln!("{}", ctx.render_errors(&errors));
                return 1;
            }
        }
    };

    run_artifact(artifact)
}

fn cmd_build(source: &Path, out: Option<PathBuf>) -> i32 {
    let mut ctx = new_context();
    let artifact = match ctx.compile_file(source) {
        Ok(artifact) => artifact,
        Err(errors) => {
            eprintln!("{}", ctx.render_errors(&errors));
            return 1;
        }
    };
    let bytes = match artifact.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("droec: {e}");
            return 2;
        }
    };

    let host_binary = match std::env::current_exe() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("droec: cannot locate the host binary: {e}");
            return 2;
        }
    };
    let out = out.unwrap_or_else(|| source.with_extension(""));
    if let Err(e) = embed::embed(&host_binary, &bytes, &out) {
        eprintln!("droec: cannot write {}: {e}", out.display());
        return 2;
    }
    0
}

fn run_artifact(artifact: Artifact) -> i32 {
    let mut vm = Vm::new(artifact, StdHost);
    match vm.run() {
        Ok(()) => 0,
        Err(diag) => {
            eprintln!("droec: {diag}");
            1
        }
    }
}
