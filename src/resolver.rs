//! Include resolution: expands `@include` references into one program.
//!
//! Each file is parsed once, keyed by canonical path. Cycles are detected
//! by tracking the include stack and reported a single time before being
//! broken.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::ast::{Program, Span, Stmt, StmtKind};
use crate::error::{CompileError, SourceMap};
use crate::{lexer, parser};

/// Resolve `root` and everything it includes into a single program.
/// Included items are grafted in front of the root's own items, so
/// included modules are declared before use.
///
/// `search_root` overrides relative include resolution (the `DROE_HOME`
/// environment variable in the CLI); otherwise paths resolve relative to
/// the including file.
pub fn resolve(
    root: &Path,
    search_root: Option<&Path>,
    sources: &mut SourceMap,
) -> Result<Program, Vec<CompileError>> {
    let mut resolver = Resolver {
        sources,
        search_root,
        loaded: HashSet::new(),
        stack: Vec::new(),
        errors: Vec::new(),
    };

    // The root cannot be a duplicate or a cycle, so a failed load always
    // carries diagnostics.
    let Some(loaded) = resolver.load(root, None) else {
        return Err(resolver.errors);
    };

    let merged = resolver.merge(loaded);
    if resolver.errors.is_empty() {
        Ok(merged)
    } else {
        Err(resolver.errors)
    }
}

struct Resolver<'a> {
    sources: &'a mut SourceMap,
    search_root: Option<&'a Path>,
    loaded: HashSet<PathBuf>,
    stack: Vec<PathBuf>,
    errors: Vec<CompileError>,
}

/// A parsed file together with the programs it pulled in.
struct Loaded {
    program: Program,
    included: Vec<Loaded>,
}

impl Resolver<'_> {
    fn load(&mut self, path: &Path, at: Option<Span>) -> Option<Loaded> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        if self.stack.contains(&canonical) {
            let span = at.unwrap_or_else(default_span);
            self.errors.push(CompileError::resolve(
                "include_cycle",
                format!("include cycle through {}", canonical.display()),
                span,
            ));
            return None;
        }
        if !self.loaded.insert(canonical.clone()) {
            // Already expanded elsewhere; a module is included at most once.
            return None;
        }

        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                let span = at.unwrap_or_else(default_span);
                self.errors.push(CompileError::resolve(
                    "unknown_module",
                    format!("cannot read {}: {e}", path.display()),
                    span,
                ));
                return None;
            }
        };
        debug!(file = %path.display(), "resolving module");

        let file_id = self.sources.add(path.display().to_string(), text);
        let text = self.sources.text(file_id).to_string();

        let tokens = match lexer::lex(&text, file_id) {
            Ok(tokens) => tokens,
            Err(mut errs) => {
                self.errors.append(&mut errs);
                return None;
            }
        };
        let program = match parser::parse(tokens) {
            Ok(program) => program,
            Err(mut errs) => {
                self.errors.append(&mut errs);
                return None;
            }
        };

        self.stack.push(canonical);
        let mut included = Vec::new();
        for include in &program.includes {
            let target = self.resolve_path(path, &include.path);
            if let Some(loaded) = self.load(&target, Some(include.span)) {
                included.push(loaded);
            }
        }
        self.stack.pop();

        Some(Loaded { program, included })
    }

    fn resolve_path(&self, including: &Path, include_path: &str) -> PathBuf {
        let include_path = Path::new(include_path);
        if include_path.is_absolute() {
            return include_path.to_path_buf();
        }
        if let Some(root) = self.search_root {
            return root.join(include_path);
        }
        including
            .parent()
            .map_or_else(|| include_path.to_path_buf(), |dir| dir.join(include_path))
    }

    /// Flatten the include tree: dependencies first, then the includer's
    /// own items. Duplicate module definitions are rejected here.
    fn merge(&mut self, root: Loaded) -> Program {
        let Loaded { program, included } = root;
        let mut merged_items = Vec::new();
        Self::flatten(included, &mut merged_items);
        merged_items.extend(program.items);

        let mut seen = HashSet::new();
        for item in &merged_items {
            if let StmtKind::Module(def) = &item.kind {
                if !seen.insert(def.name.clone()) {
                    self.errors.push(CompileError::resolve(
                        "duplicate_module",
                        format!("module `{}` is defined more than once", def.name),
                        def.span,
                    ));
                }
            }
        }

        Program {
            metadata: program.metadata,
            includes: Vec::new(),
            items: merged_items,
        }
    }

    fn flatten(loaded: Vec<Loaded>, out: &mut Vec<Stmt>) {
        for entry in loaded {
            Self::flatten(entry.included, out);
            out.extend(entry.program.items);
        }
    }
}

fn default_span() -> Span {
    Span::point(crate::ast::Pos { file: 0, line: 1, column: 1 })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    struct TempTree {
        dir: PathBuf,
    }

    impl TempTree {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "droec-resolver-{tag}-{}",
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(&dir).unwrap();
            Self { dir }
        }

        fn write(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.join(name);
            let mut f = fs::File::create(&path).unwrap();
            f.write_all(content.as_bytes()).unwrap();
            path
        }
    }

    impl Drop for TempTree {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    #[test]
    fn include_grafts_modules_before_root_items() {
        let tree = TempTree::new("graft");
        tree.write(
            "math.droe",
            "module math\n  action square with n which is int gives int\n    give n times n\n  end action\nend module",
        );
        let root = tree.write(
            "main.droe",
            "@include Math from \"math.droe\"\nset s from math.square with 4\ndisplay s",
        );

        let mut sources = SourceMap::new();
        let program = resolve(&root, None, &mut sources).unwrap();
        assert!(matches!(program.items[0].kind, StmtKind::Module(ref m) if m.name == "math"));
        assert_eq!(program.items.len(), 3);
    }

    #[test]
    fn missing_include_is_reported() {
        let tree = TempTree::new("missing");
        let root = tree.write("main.droe", "@include Gone from \"gone.droe\"\ndisplay 1");

        let mut sources = SourceMap::new();
        let errors = resolve(&root, None, &mut sources).unwrap_err();
        assert_eq!(errors[0].kind(), "resolve.unknown_module");
    }

    #[test]
    fn include_cycle_reported_once() {
        let tree = TempTree::new("cycle");
        tree.write("a.droe", "@include B from \"b.droe\"\nmodule a\nend module");
        tree.write("b.droe", "@include A from \"a.droe\"\nmodule b\nend module");
        let root = tree.dir.join("a.droe");

        let mut sources = SourceMap::new();
        let errors = resolve(&root, None, &mut sources).unwrap_err();
        let cycles: Vec<_> = errors
            .iter()
            .filter(|e| e.kind() == "resolve.include_cycle")
            .collect();
        assert_eq!(cycles.len(), 1);
    }

    #[test]
    fn diamond_includes_deduplicate() {
        let tree = TempTree::new("diamond");
        tree.write("shared.droe", "module shared\nend module");
        tree.write("left.droe", "@include Shared from \"shared.droe\"\nmodule left\nend module");
        tree.write("right.droe", "@include Shared from \"shared.droe\"\nmodule right\nend module");
        let root = tree.write(
            "main.droe",
            "@include L from \"left.droe\"\n@include R from \"right.droe\"\ndisplay 1",
        );

        let mut sources = SourceMap::new();
        let program = resolve(&root, None, &mut sources).unwrap();
        let shared_count = program
            .items
            .iter()
            .filter(|s| matches!(&s.kind, StmtKind::Module(m) if m.name == "shared"))
            .count();
        assert_eq!(shared_count, 1, "shared module expanded exactly once");
    }

    #[test]
    fn duplicate_module_rejected() {
        let tree = TempTree::new("dup");
        tree.write("other.droe", "module billing\nend module");
        let root = tree.write(
            "main.droe",
            "@include Other from \"other.droe\"\nmodule billing\nend module",
        );

        let mut sources = SourceMap::new();
        let errors = resolve(&root, None, &mut sources).unwrap_err();
        assert!(errors.iter().any(|e| e.kind() == "resolve.duplicate_module"));
    }

    #[test]
    fn search_root_overrides_relative_resolution() {
        let lib = TempTree::new("libroot");
        lib.write("util.droe", "module util\nend module");
        let app = TempTree::new("approot");
        let root = app.write("main.droe", "@include Util from \"util.droe\"\ndisplay 1");

        let mut sources = SourceMap::new();
        let program = resolve(&root, Some(&lib.dir), &mut sources).unwrap();
        assert!(matches!(program.items[0].kind, StmtKind::Module(ref m) if m.name == "util"));
    }
}
