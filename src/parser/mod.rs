//! Recursive-descent parser for the Droe DSL.
//!
//! Statements terminate at newlines; blocks close with matching
//! `end <kind>` tokens. On a failed production the parser synchronizes to
//! the next statement boundary and keeps going, so one file yields a list
//! of diagnostics rather than stopping at the first.

mod expressions;
mod statements;
mod structures;
mod ui;

use crate::ast::{Include, Metadata, Pos, Program, Span, Stmt};
use crate::error::CompileError;
use crate::lexer::{StrPart, Token, TokenKind};

pub fn parse(tokens: Vec<Token>) -> Result<Program, Vec<CompileError>> {
    let mut parser = Parser::new(tokens);
    parser.parse_program()
}

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<CompileError>,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0, errors: Vec::new() }
    }

    fn parse_program(&mut self) -> Result<Program, Vec<CompileError>> {
        let mut metadata = Vec::new();
        let mut includes = Vec::new();
        let mut items = Vec::new();

        self.skip_newlines();
        while !self.at_eof() {
            if matches!(self.peek(), TokenKind::At) {
                match self.parse_annotation() {
                    Ok(Annotation::Metadata(m)) => metadata.push(m),
                    Ok(Annotation::Include(i)) => includes.push(i),
                    Err(e) => {
                        self.errors.push(e);
                        self.recover();
                    }
                }
            } else {
                match self.parse_stmt() {
                    Ok(stmt) => {
                        items.push(stmt);
                        if let Err(e) = self.expect_terminator() {
                            self.errors.push(e);
                            self.recover();
                        }
                    }
                    Err(e) => {
                        self.errors.push(e);
                        self.recover();
                    }
                }
            }
            self.skip_newlines();
        }

        if self.errors.is_empty() {
            Ok(Program { metadata, includes, items })
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    // ── Metadata and includes ────────────────────────────────────

    fn parse_annotation(&mut self) -> Result<Annotation, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::At)?;

        if self.eat(&TokenKind::Include) {
            // `@include Billing from "billing.droe"`
            let (module, _) = self.expect_ident()?;
            self.expect(&TokenKind::From)?;
            let (path, end) = self.expect_text_literal()?;
            return Ok(Annotation::Include(Include {
                module,
                path,
                span: start.merge(end),
            }));
        }

        let (key, _) = self.expect_ident()?;
        // The value is everything up to the end of line, preserved verbatim
        // for free-form keys.
        let mut words = Vec::new();
        let mut end = start;
        while !matches!(self.peek(), TokenKind::Newline | TokenKind::Eof) {
            end = self.span();
            let token = self.advance();
            words.push(Self::verbatim(&token.kind));
        }
        Ok(Annotation::Metadata(Metadata {
            key,
            value: words.join(" "),
            span: start.merge(end),
        }))
    }

    /// Reconstruct a token roughly as written, for verbatim metadata values.
    fn verbatim(kind: &TokenKind) -> String {
        match kind {
            TokenKind::Ident(s) => s.clone(),
            TokenKind::Int(v) => v.to_string(),
            TokenKind::Decimal(v) => format!("{}.{:02}", v / 100, (v % 100).abs()),
            TokenKind::Flag(b) => b.to_string(),
            TokenKind::Path(p) => p.clone(),
            TokenKind::Str(parts) => parts
                .iter()
                .map(|p| match p {
                    StrPart::Lit(s) => s.clone(),
                    StrPart::Interp { src, .. } => format!("[{src}]"),
                })
                .collect(),
            TokenKind::Dot => ".".into(),
            other => format!("{other:?}").to_lowercase(),
        }
    }

    // ── Cursor helpers ───────────────────────────────────────────

    pub(crate) fn peek(&self) -> &TokenKind {
        self.tokens.get(self.pos).map_or(&TokenKind::Eof, |t| &t.kind)
    }

    pub(crate) fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    pub(crate) fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or_else(
                || Span::point(Pos { file: 0, line: 1, column: 1 }),
                |t| t.span,
            )
    }

    pub(crate) fn at_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    pub(crate) fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    pub(crate) fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    pub(crate) fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, kind: &TokenKind) -> Result<Span, CompileError> {
        if self.check(kind) {
            let span = self.span();
            self.advance();
            Ok(span)
        } else {
            Err(CompileError::parse(
                "unexpected_token",
                format!("expected {}, found {}", describe(kind), describe(self.peek())),
                self.span(),
            ))
        }
    }

    pub(crate) fn expect_ident(&mut self) -> Result<(String, Span), CompileError> {
        if let TokenKind::Ident(name) = self.peek().clone() {
            let span = self.span();
            self.advance();
            Ok((name, span))
        } else {
            Err(CompileError::parse(
                "unexpected_token",
                format!("expected identifier, found {}", describe(self.peek())),
                self.span(),
            ))
        }
    }

    /// A contextual keyword: an identifier with a specific spelling.
    pub(crate) fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), TokenKind::Ident(w) if w == word) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Expect a plain (non-interpolated) string literal.
    pub(crate) fn expect_text_literal(&mut self) -> Result<(String, Span), CompileError> {
        let span = self.span();
        if let TokenKind::Str(parts) = self.peek().clone() {
            if parts.iter().any(|p| matches!(p, StrPart::Interp { .. })) {
                return Err(CompileError::parse(
                    "unexpected_token",
                    "interpolation is not allowed here",
                    span,
                ));
            }
            self.advance();
            let text = parts
                .into_iter()
                .map(|p| match p {
                    StrPart::Lit(s) => s,
                    StrPart::Interp { .. } => String::new(),
                })
                .collect();
            Ok((text, span))
        } else {
            Err(CompileError::parse(
                "unexpected_token",
                format!("expected string literal, found {}", describe(self.peek())),
                span,
            ))
        }
    }

    pub(crate) fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline) {
            self.advance();
        }
    }

    /// A statement ends at a newline, at EOF, or right before a block
    /// closer (`end <kind>` / `otherwise`), which stays for the caller.
    pub(crate) fn expect_terminator(&mut self) -> Result<(), CompileError> {
        match self.peek() {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof | TokenKind::Otherwise => Ok(()),
            k if is_block_closer(k) => Ok(()),
            other => Err(CompileError::parse(
                "trailing_content",
                format!("expected end of statement, found {}", describe(other)),
                self.span(),
            )),
        }
    }

    /// Synchronize to the next statement boundary after an error.
    pub(crate) fn recover(&mut self) {
        while !matches!(self.peek(), TokenKind::Newline | TokenKind::Eof) {
            if is_block_closer(self.peek()) {
                self.advance();
                return;
            }
            self.advance();
        }
        self.skip_newlines();
    }

    /// Parse statements until one of `closers` is seen (not consumed).
    pub(crate) fn parse_block(&mut self, closers: &[TokenKind]) -> Vec<Stmt> {
        let mut body = Vec::new();
        self.skip_newlines();
        while !self.at_eof() && !closers.iter().any(|c| self.check(c)) {
            match self.parse_stmt() {
                Ok(stmt) => {
                    body.push(stmt);
                    if let Err(e) = self.expect_terminator() {
                        self.errors.push(e);
                        self.recover();
                    }
                }
                Err(e) => {
                    self.errors.push(e);
                    self.recover();
                }
            }
            self.skip_newlines();
        }
        body
    }

    pub(crate) fn missing_end(&self, kind: &str, open: Span) -> CompileError {
        CompileError::parse("missing_end", format!("missing `end {kind}`"), open)
    }
}

enum Annotation {
    Metadata(Metadata),
    Include(Include),
}

pub(crate) fn is_block_closer(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::EndWhen
            | TokenKind::EndWhile
            | TokenKind::EndFor
            | TokenKind::EndAction
            | TokenKind::EndTask
            | TokenKind::EndData
            | TokenKind::EndModule
            | TokenKind::EndServe
            | TokenKind::EndHeaders
            | TokenKind::EndFragment
            | TokenKind::EndScreen
            | TokenKind::EndSlot
            | TokenKind::EndLayout
    )
}

pub(crate) fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(name) => format!("identifier `{name}`"),
        TokenKind::Int(v) => format!("`{v}`"),
        TokenKind::Str(_) => "string literal".into(),
        TokenKind::Newline => "end of line".into(),
        TokenKind::Eof => "end of file".into(),
        TokenKind::Path(p) => format!("path `{p}`"),
        other => format!("`{other:?}`"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ast::StmtKind;
    use crate::lexer::lex;

    pub(crate) fn parse_str(source: &str) -> Program {
        let tokens = lex(source, 0).unwrap();
        parse(tokens).unwrap()
    }

    #[test]
    fn metadata_and_include() {
        let program = parse_str(
            "@target web\n@name \"inventory\"\n@include Billing from \"billing.droe\"\ndisplay 1",
        );
        assert_eq!(program.metadata.len(), 2);
        assert_eq!(program.metadata[0].key, "target");
        assert_eq!(program.metadata[0].value, "web");
        assert_eq!(program.metadata[1].value, "inventory");
        assert_eq!(program.includes.len(), 1);
        assert_eq!(program.includes[0].module, "Billing");
        assert_eq!(program.includes[0].path, "billing.droe");
        assert_eq!(program.items.len(), 1);
    }

    #[test]
    fn error_recovery_collects_multiple() {
        let tokens = lex("set to 1\nset y to 2\nset to 3", 0).unwrap();
        let errors = parse(tokens).unwrap_err();
        assert_eq!(errors.len(), 2, "both bad lines reported: {errors:?}");
        assert!(errors.iter().all(|e| e.kind().starts_with("parse.")));
    }

    #[test]
    fn trailing_content_is_an_error() {
        let tokens = lex("display 1 2", 0).unwrap();
        let errors = parse(tokens).unwrap_err();
        assert_eq!(errors[0].kind(), "parse.trailing_content");
    }

    #[test]
    fn statements_separated_by_newlines() {
        let program = parse_str("display 1\ndisplay 2\ndisplay 3");
        assert_eq!(program.items.len(), 3);
        assert!(matches!(program.items[0].kind, StmtKind::Display(_)));
    }
}
