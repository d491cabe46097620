//! droec: compiler toolchain and virtual machine for the Droe DSL.
//!
//! The pipeline is source → lex → parse → resolve → check → emit; the
//! emitted artifact is both the compiler's output and the VM's input.
//! Compile-time errors accumulate per phase, and the first failing phase
//! stops the pipeline: later phases never see a broken AST.

pub mod artifact;
pub mod ast;
pub mod compiler;
pub mod embed;
pub mod error;
pub mod format;
pub mod host;
pub mod lexer;
pub mod parser;
pub mod resolver;
pub mod typeck;
pub mod types;
pub mod vm;

use std::path::{Path, PathBuf};

use crate::artifact::Artifact;
use crate::compiler::EmitMeta;
use crate::error::{CompileError, SourceMap};
use crate::typeck::TypedProgram;

/// Output of a code-generation back end: the bytecode artifact for the
/// built-in back end, or text for pluggable source generators.
pub enum BackendOutput {
    Artifact(Artifact),
    Text(String),
}

/// A code-generation back end. The bytecode emitter is the privileged
/// implementation; alternative text generators share the checked AST.
pub trait Backend {
    fn name(&self) -> &'static str;
    fn generate(
        &self,
        program: &TypedProgram,
        meta: &EmitMeta,
    ) -> Result<BackendOutput, CompileError>;
    fn file_extension(&self) -> &'static str;
    fn runtime_libs(&self) -> &'static [&'static str];
}

struct BytecodeBackend;

impl Backend for BytecodeBackend {
    fn name(&self) -> &'static str {
        "bytecode"
    }

    fn generate(
        &self,
        program: &TypedProgram,
        meta: &EmitMeta,
    ) -> Result<BackendOutput, CompileError> {
        compiler::emit(program, meta).map(BackendOutput::Artifact)
    }

    fn file_extension(&self) -> &'static str {
        "droebc"
    }

    fn runtime_libs(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Everything one compilation threads through the phases: source texts,
/// the include search root, and the registered back ends.
pub struct CompilationContext {
    pub sources: SourceMap,
    include_root: Option<PathBuf>,
    created_at: i64,
    backends: Vec<Box<dyn Backend>>,
}

impl Default for CompilationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilationContext {
    pub fn new() -> Self {
        Self {
            sources: SourceMap::new(),
            include_root: None,
            created_at: chrono::Utc::now().timestamp(),
            backends: vec![Box::new(BytecodeBackend)],
        }
    }

    /// Override the artifact timestamp; compiling the same source with
    /// the same timestamp is byte-for-byte reproducible.
    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Include search root (the `DROE_HOME` environment variable in the
    /// CLI). Without it, includes resolve relative to the including file.
    pub fn with_include_root(mut self, root: Option<PathBuf>) -> Self {
        self.include_root = root;
        self
    }

    pub fn register_backend(&mut self, backend: Box<dyn Backend>) {
        self.backends.push(backend);
    }

    pub fn backend(&self, name: &str) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.name() == name)
            .map(|b| b.as_ref())
    }

    /// Lex, parse and check a single source text (no include expansion).
    pub fn check_source(
        &mut self,
        file_name: &str,
        text: &str,
    ) -> Result<TypedProgram, Vec<CompileError>> {
        let file = self.sources.add(file_name, text);
        let tokens = lexer::lex(text, file)?;
        let program = parser::parse(tokens)?;
        typeck::check(&program)
    }

    /// Compile a single source text to a bytecode artifact.
    pub fn compile_source(
        &mut self,
        file_name: &str,
        text: &str,
    ) -> Result<Artifact, Vec<CompileError>> {
        let program = self.check_source(file_name, text)?;
        self.emit(&program, file_name)
    }

    /// Compile a file, expanding `@include` references.
    pub fn compile_file(&mut self, path: &Path) -> Result<Artifact, Vec<CompileError>> {
        let program = resolver::resolve(path, self.include_root.as_deref(), &mut self.sources)?;
        let checked = typeck::check(&program)?;
        self.emit(&checked, &path.display().to_string())
    }

    fn emit(
        &self,
        program: &TypedProgram,
        source_file: &str,
    ) -> Result<Artifact, Vec<CompileError>> {
        let meta = EmitMeta {
            source_file: source_file.to_string(),
            created_at: self.created_at,
        };
        match compiler::emit(program, &meta) {
            Ok(artifact) => Ok(artifact),
            Err(e) => Err(vec![e]),
        }
    }

    /// Render diagnostics as `<file>:<line>:<col>: <kind>: <message>`
    /// lines.
    pub fn render_errors(&self, errors: &[CompileError]) -> String {
        self.sources.render_all(errors)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::host::RecordingHost;
    use crate::vm::Vm;

    #[test]
    fn pipeline_compiles_and_runs() {
        let mut ctx = CompilationContext::new();
        let artifact = ctx
            .compile_source("main.droe", "display \"Hello, World!\"")
            .unwrap();
        let mut vm = Vm::new(artifact, RecordingHost::new());
        vm.run().unwrap();
        assert_eq!(vm.host().out, vec!["Hello, World!"]);
    }

    #[test]
    fn compile_is_reproducible() {
        let source = "\
set price which is decimal to 1234.56
display format price as \"#,##0.00\"";
        let first = CompilationContext::new()
            .with_created_at(1_700_000_000)
            .compile_source("main.droe", source)
            .unwrap();
        let second = CompilationContext::new()
            .with_created_at(1_700_000_000)
            .compile_source("main.droe", source)
            .unwrap();
        assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
    }

    #[test]
    fn artifact_survives_load_store_cycle() {
        let mut ctx = CompilationContext::new().with_created_at(0);
        let artifact = ctx
            .compile_source("main.droe", "set n to 1\ndisplay n plus 2")
            .unwrap();
        let bytes = artifact.to_bytes().unwrap();
        let reloaded = Artifact::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn broken_parse_stops_before_check() {
        let mut ctx = CompilationContext::new();
        let errors = ctx
            .compile_source("main.droe", "set to\ndisplay undeclared")
            .unwrap_err();
        // Only parse errors: the checker never ran on the broken AST.
        assert!(errors.iter().all(|e| e.kind().starts_with("parse.")), "{errors:?}");
    }

    #[test]
    fn diagnostics_render_with_position() {
        let mut ctx = CompilationContext::new();
        let errors = ctx
            .compile_source("main.droe", "display nope")
            .unwrap_err();
        let rendered = ctx.render_errors(&errors);
        assert_eq!(
            rendered,
            "main.droe:1:9: type.unknown_identifier: `nope` is not declared"
        );
    }

    #[test]
    fn bytecode_backend_is_registered() {
        let ctx = CompilationContext::new();
        let backend = ctx.backend("bytecode").unwrap();
        assert_eq!(backend.file_extension(), "droebc");
        assert!(ctx.backend("cobol").is_none());
    }
}
