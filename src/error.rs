use std::fmt;

use thiserror::Error;

use crate::ast::{FileId, Span};

/// A compile-time diagnostic with source location.
///
/// Diagnostics are accumulated per file where possible: the parser and the
/// checker synchronize to the next statement boundary on failure, so one
/// compilation reports a list of errors rather than stopping at the first.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub phase: Phase,
    pub code: &'static str,
    pub message: String,
    pub span: Span,
}

/// Compiler phase the error originated from. Forms the first half of the
/// diagnostic kind, e.g. `lex.overflow` or `type.unknown_identifier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Lex,
    Parse,
    Resolve,
    Type,
    Codegen,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Lex => "lex",
            Phase::Parse => "parse",
            Phase::Resolve => "resolve",
            Phase::Type => "type",
            Phase::Codegen => "codegen",
        }
    }
}

impl CompileError {
    pub fn lex(code: &'static str, message: impl Into<String>, span: Span) -> Self {
        Self { phase: Phase::Lex, code, message: message.into(), span }
    }

    pub fn parse(code: &'static str, message: impl Into<String>, span: Span) -> Self {
        Self { phase: Phase::Parse, code, message: message.into(), span }
    }

    pub fn resolve(code: &'static str, message: impl Into<String>, span: Span) -> Self {
        Self { phase: Phase::Resolve, code, message: message.into(), span }
    }

    pub fn type_error(code: &'static str, message: impl Into<String>, span: Span) -> Self {
        Self { phase: Phase::Type, code, message: message.into(), span }
    }

    /// Codegen errors should never fire on a type-checked program; any
    /// occurrence is a compiler bug and is rendered as internal.
    pub fn codegen(code: &'static str, message: impl Into<String>, span: Span) -> Self {
        Self { phase: Phase::Codegen, code, message: message.into(), span }
    }

    /// The dotted diagnostic kind, e.g. `parse.missing_end`.
    pub fn kind(&self) -> String {
        format!("{}.{}", self.phase.as_str(), self.code)
    }

    /// Render as `<file>:<line>:<col>: <kind>: <message>`.
    pub fn render(&self, sources: &SourceMap) -> String {
        let pos = self.span.start;
        format!(
            "{}:{}:{}: {}: {}",
            sources.name(pos.file),
            pos.line,
            pos.column,
            self.kind(),
            self.message,
        )
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message)
    }
}

impl std::error::Error for CompileError {}

// ── Source map ───────────────────────────────────────────────────

/// Owns the text of every file that entered a compilation, keyed by
/// `FileId`. Diagnostics borrow it to render file names.
#[derive(Debug, Default)]
pub struct SourceMap {
    files: Vec<SourceFile>,
}

#[derive(Debug)]
struct SourceFile {
    name: String,
    text: String,
}

impl SourceMap {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    pub fn add(&mut self, name: impl Into<String>, text: impl Into<String>) -> FileId {
        let id = self.files.len() as FileId;
        self.files.push(SourceFile { name: name.into(), text: text.into() });
        id
    }

    pub fn name(&self, id: FileId) -> &str {
        self.files.get(id as usize).map_or("<unknown>", |f| f.name.as_str())
    }

    pub fn text(&self, id: FileId) -> &str {
        self.files.get(id as usize).map_or("", |f| f.text.as_str())
    }

    pub fn render_all(&self, errors: &[CompileError]) -> String {
        errors
            .iter()
            .map(|e| e.render(self))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Runtime errors ───────────────────────────────────────────────

/// A runtime failure inside the VM. Terminates the current handler and
/// propagates to the host as a single diagnostic; the language exposes no
/// catch construct.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("runtime.overflow: {0}")]
    Overflow(String),
    #[error("runtime.divzero: division by zero")]
    DivZero,
    #[error("runtime.bad_cast: {0}")]
    BadCast(String),
    #[error("runtime.unknown_endpoint: no endpoint matches {0}")]
    UnknownEndpoint(String),
    #[error("runtime.host_error: {0}")]
    HostError(String),
    /// Cooperative stop requested by the host. Not a failure.
    #[error("runtime.cancelled")]
    Cancelled,
}

impl RuntimeError {
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::Overflow(_) => "runtime.overflow",
            RuntimeError::DivZero => "runtime.divzero",
            RuntimeError::BadCast(_) => "runtime.bad_cast",
            RuntimeError::UnknownEndpoint(_) => "runtime.unknown_endpoint",
            RuntimeError::HostError(_) => "runtime.host_error",
            RuntimeError::Cancelled => "runtime.cancelled",
        }
    }
}

/// A runtime error together with the instruction index it fired at.
#[derive(Debug, Clone, Error)]
#[error("{error} (at instruction {at})")]
pub struct VmDiagnostic {
    pub error: RuntimeError,
    pub at: usize,
}

// ── Artifact errors ──────────────────────────────────────────────

/// Failures reading or writing a bytecode artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("not a Droe bytecode artifact (bad magic)")]
    BadMagic,
    #[error("unsupported artifact format version {0}")]
    UnsupportedVersion(u16),
    #[error("artifact truncated: {0}")]
    Truncated(&'static str),
    #[error("malformed artifact body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ast::Pos;

    fn span_at(line: u32, column: u32) -> Span {
        Span::point(Pos { file: 0, line, column })
    }

    #[test]
    fn kinds_are_dotted() {
        let e = CompileError::lex("overflow", "integer literal out of range", span_at(3, 7));
        assert_eq!(e.kind(), "lex.overflow");
        let e = CompileError::type_error("arity", "expected 2 args", span_at(1, 1));
        assert_eq!(e.kind(), "type.arity");
    }

    #[test]
    fn render_includes_file_line_col() {
        let mut sources = SourceMap::new();
        let file = sources.add("main.droe", "display 1\n");
        let e = CompileError::parse(
            "unexpected_token",
            "expected expression",
            Span::point(Pos { file, line: 1, column: 9 }),
        );
        assert_eq!(
            e.render(&sources),
            "main.droe:1:9: parse.unexpected_token: expected expression"
        );
    }

    #[test]
    fn runtime_error_kinds() {
        assert_eq!(RuntimeError::DivZero.kind(), "runtime.divzero");
        assert_eq!(RuntimeError::Cancelled.kind(), "runtime.cancelled");
        assert_eq!(
            RuntimeError::Overflow("int add".into()).to_string(),
            "runtime.overflow: int add"
        );
    }
}
