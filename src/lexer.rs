//! Lexical analysis for the Droe DSL.
//!
//! Multi-word keywords are scanned longest-match-first, so
//! `is greater than or equal to` arrives at the parser as one token and
//! never decays into `is` followed by stray identifiers.

use crate::ast::{FileId, Pos, Span};
use crate::error::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Int(i32),
    /// Decimal literal, scaled by 100.
    Decimal(i64),
    /// String literal, split into literal and `[expr]` interpolation parts.
    Str(Vec<StrPart>),
    Flag(bool),
    Ident(String),
    /// URL path literal, e.g. `/users/:id`.
    Path(String),

    // Declaration / block keywords
    Set,
    Which,
    Is,
    Are,
    To,
    From,
    Display,
    When,
    Then,
    Otherwise,
    While,
    ForEach,
    In,
    Action,
    Task,
    With,
    Gives,
    Give,
    Run,
    Module,
    Data,
    Serve,
    Respond,
    Call,
    Method,
    Using,
    Headers,
    Into,
    Db,
    Where,
    Format,
    As,
    Include,
    Fragment,
    Screen,
    Slot,
    Layout,

    // Block terminators (scanned as single tokens)
    EndWhen,
    EndWhile,
    EndFor,
    EndAction,
    EndTask,
    EndData,
    EndModule,
    EndServe,
    EndHeaders,
    EndFragment,
    EndScreen,
    EndSlot,
    EndLayout,

    // Word operators
    Plus,
    Minus,
    Times,
    DividedBy,
    Equals,
    DoesNotEqual,
    IsNot,
    IsGreaterThan,
    IsLessThan,
    IsGreaterThanOrEqualTo,
    IsLessThanOrEqualTo,
    And,
    Or,
    Not,

    // Punctuation
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Dot,
    At,
    /// `=`: only used by `default=<literal>` field annotations.
    AssignEq,

    // Special
    Newline,
    Eof,
}

/// One chunk of a string literal.
#[derive(Debug, Clone, PartialEq)]
pub enum StrPart {
    Lit(String),
    /// Raw source of an `[expr]` interpolation, with the position of its
    /// first character for sub-parsing.
    Interp { src: String, pos: Pos },
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

pub fn lex(source: &str, file: FileId) -> Result<Vec<Token>, Vec<CompileError>> {
    let mut lexer = Lexer::new(source, file);
    lexer.tokenize()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    file: FileId,
    tokens: Vec<Token>,
    errors: Vec<CompileError>,
}

impl Lexer {
    fn new(source: &str, file: FileId) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            file,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn tokenize(&mut self) -> Result<Vec<Token>, Vec<CompileError>> {
        while self.pos < self.chars.len() {
            self.skip_blanks_and_comments();
            if self.pos >= self.chars.len() {
                break;
            }

            let start = self.here();
            let c = self.advance();

            match c {
                '\n' => {
                    // Collapse newline runs into one terminator token.
                    while self.peek() == Some('\n') || self.peek_is_blank() {
                        self.advance();
                    }
                    if !matches!(self.tokens.last().map(|t| &t.kind), Some(TokenKind::Newline) | None) {
                        self.push(TokenKind::Newline, start);
                    }
                }
                '[' => self.push(TokenKind::LBracket, start),
                ']' => self.push(TokenKind::RBracket, start),
                '(' => self.push(TokenKind::LParen, start),
                ')' => self.push(TokenKind::RParen, start),
                ',' => self.push(TokenKind::Comma, start),
                '.' => self.push(TokenKind::Dot, start),
                '@' => self.push(TokenKind::At, start),
                '=' => self.push(TokenKind::AssignEq, start),
                '"' | '\'' => self.string_literal(c, start),
                '/' => self.path_literal(start),
                '-' => {
                    if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                        self.number_literal(start, true);
                    } else {
                        self.errors.push(CompileError::lex(
                            "invalid_char",
                            "stray '-': use the 'minus' keyword for subtraction",
                            Span::point(start),
                        ));
                    }
                }
                _ if c.is_ascii_digit() => {
                    self.pos -= 1;
                    self.column -= 1;
                    self.number_literal(start, false);
                }
                _ if c.is_ascii_alphabetic() || c == '_' => {
                    self.pos -= 1;
                    self.column -= 1;
                    self.word(start);
                }
                _ => {
                    self.errors.push(CompileError::lex(
                        "invalid_char",
                        format!("unexpected character '{c}'"),
                        Span::point(start),
                    ));
                }
            }
        }

        // Drop a trailing terminator so EOF follows the last statement.
        if matches!(self.tokens.last().map(|t| &t.kind), Some(TokenKind::Newline)) {
            self.tokens.pop();
        }
        let end = self.here();
        self.tokens.push(Token { kind: TokenKind::Eof, span: Span::point(end) });

        if self.errors.is_empty() {
            Ok(std::mem::take(&mut self.tokens))
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    // ── Cursor helpers ───────────────────────────────────────────

    fn here(&self) -> Pos {
        Pos { file: self.file, line: self.line, column: self.column }
    }

    fn advance(&mut self) -> char {
        let c = self.chars[self.pos];
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        c
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn peek_is_blank(&self) -> bool {
        matches!(self.peek(), Some(' ' | '\t' | '\r'))
    }

    fn push(&mut self, kind: TokenKind, start: Pos) {
        let end = self.here();
        self.tokens.push(Token { kind, span: Span::new(start, end) });
    }

    fn skip_blanks_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r') => {
                    self.advance();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.advance();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let open = self.here();
                    self.advance();
                    self.advance();
                    loop {
                        match self.peek() {
                            Some('*') if self.peek_at(1) == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(_) => {
                                self.advance();
                            }
                            None => {
                                self.errors.push(CompileError::lex(
                                    "unterminated_comment",
                                    "block comment is never closed",
                                    Span::point(open),
                                ));
                                break;
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }

    // ── Literals ─────────────────────────────────────────────────

    fn string_literal(&mut self, quote: char, start: Pos) {
        let mut parts: Vec<StrPart> = Vec::new();
        let mut lit = String::new();

        loop {
            match self.peek() {
                None | Some('\n') => {
                    self.errors.push(CompileError::lex(
                        "unterminated_string",
                        "string literal is never closed",
                        Span::new(start, self.here()),
                    ));
                    break;
                }
                Some(c) if c == quote => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    let esc_pos = self.here();
                    match self.peek() {
                        Some('n') => {
                            lit.push('\n');
                            self.advance();
                        }
                        Some('t') => {
                            lit.push('\t');
                            self.advance();
                        }
                        Some('\\') => {
                            lit.push('\\');
                            self.advance();
                        }
                        Some('"') => {
                            lit.push('"');
                            self.advance();
                        }
                        Some('\'') => {
                            lit.push('\'');
                            self.advance();
                        }
                        other => {
                            self.errors.push(CompileError::lex(
                                "bad_escape",
                                format!(
                                    "unknown escape '\\{}'",
                                    other.map_or(String::new(), |c| c.to_string())
                                ),
                                Span::point(esc_pos),
                            ));
                            if other.is_some() {
                                self.advance();
                            }
                        }
                    }
                }
                Some('[') => {
                    self.advance();
                    if !lit.is_empty() {
                        parts.push(StrPart::Lit(std::mem::take(&mut lit)));
                    }
                    let interp_pos = self.here();
                    let mut depth = 1usize;
                    let mut src = String::new();
                    loop {
                        match self.peek() {
                            None | Some('\n') => {
                                self.errors.push(CompileError::lex(
                                    "unterminated_string",
                                    "interpolation is never closed",
                                    Span::new(interp_pos, self.here()),
                                ));
                                break;
                            }
                            Some('[') => {
                                depth += 1;
                                src.push(self.advance());
                            }
                            Some(']') => {
                                depth -= 1;
                                self.advance();
                                if depth == 0 {
                                    break;
                                }
                                src.push(']');
                            }
                            Some(_) => src.push(self.advance()),
                        }
                    }
                    parts.push(StrPart::Interp { src, pos: interp_pos });
                }
                Some(_) => lit.push(self.advance()),
            }
        }

        if !lit.is_empty() || parts.is_empty() {
            parts.push(StrPart::Lit(lit));
        }
        self.push(TokenKind::Str(parts), start);
    }

    fn number_literal(&mut self, start: Pos, negative: bool) {
        let mut digits = String::new();
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            digits.push(self.advance());
        }

        // A decimal token contains exactly one '.' with digits on both sides.
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            let mut frac = String::new();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                frac.push(self.advance());
            }
            let span = Span::new(start, self.here());
            if frac.len() > 2 {
                self.errors.push(CompileError::lex(
                    "overflow",
                    format!("decimal literal {digits}.{frac} does not fit scale 100"),
                    span,
                ));
                return;
            }
            let int_part: i64 = match digits.parse() {
                Ok(v) => v,
                Err(_) => {
                    self.errors.push(CompileError::lex(
                        "overflow",
                        format!("decimal literal {digits}.{frac} is out of range"),
                        span,
                    ));
                    return;
                }
            };
            let frac_scaled: i64 = match frac.len() {
                1 => frac.parse::<i64>().unwrap_or(0) * 10,
                _ => frac.parse::<i64>().unwrap_or(0),
            };
            let magnitude = (int_part as i128) * 100 + i128::from(frac_scaled);
            let scaled = if negative { -magnitude } else { magnitude };
            match i64::try_from(scaled) {
                Ok(v) => self.push(TokenKind::Decimal(v), start),
                Err(_) => self.errors.push(CompileError::lex(
                    "overflow",
                    format!("decimal literal {digits}.{frac} is out of range"),
                    span,
                )),
            }
        } else {
            let span = Span::new(start, self.here());
            let value: i64 = match digits.parse() {
                Ok(v) => v,
                Err(_) => {
                    self.errors.push(CompileError::lex(
                        "overflow",
                        format!("integer literal {digits} is out of range for int"),
                        span,
                    ));
                    return;
                }
            };
            let signed = if negative { -value } else { value };
            match i32::try_from(signed) {
                Ok(v) => self.push(TokenKind::Int(v), start),
                Err(_) => self.errors.push(CompileError::lex(
                    "overflow",
                    format!("integer literal {digits} is out of range for int"),
                    span,
                )),
            }
        }
    }

    /// `/users/:id`: a run of non-whitespace after `/`. The slash has no
    /// other meaning outside comments (division is `divided by`).
    fn path_literal(&mut self, start: Pos) {
        let mut path = String::from("/");
        while self.peek().is_some_and(|c| !c.is_whitespace()) {
            path.push(self.advance());
        }
        self.push(TokenKind::Path(path), start);
    }

    // ── Words ────────────────────────────────────────────────────

    fn word(&mut self, start: Pos) {
        let mut lexeme = String::new();
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            lexeme.push(self.advance());
        }

        let kind = match lexeme.as_str() {
            "set" => TokenKind::Set,
            "which" => TokenKind::Which,
            "are" => TokenKind::Are,
            "to" => TokenKind::To,
            "from" => TokenKind::From,
            "display" => TokenKind::Display,
            "when" => TokenKind::When,
            "then" => TokenKind::Then,
            "otherwise" => TokenKind::Otherwise,
            "while" => TokenKind::While,
            "in" => TokenKind::In,
            "action" => TokenKind::Action,
            "task" => TokenKind::Task,
            "with" => TokenKind::With,
            "gives" => TokenKind::Gives,
            "give" => TokenKind::Give,
            "run" => TokenKind::Run,
            "module" => TokenKind::Module,
            "data" => TokenKind::Data,
            "serve" => TokenKind::Serve,
            "respond" => TokenKind::Respond,
            "call" => TokenKind::Call,
            "method" => TokenKind::Method,
            "using" => TokenKind::Using,
            "headers" => TokenKind::Headers,
            "into" => TokenKind::Into,
            "db" => TokenKind::Db,
            "where" => TokenKind::Where,
            "format" => TokenKind::Format,
            "as" => TokenKind::As,
            "include" => TokenKind::Include,
            "fragment" => TokenKind::Fragment,
            "screen" => TokenKind::Screen,
            "slot" => TokenKind::Slot,
            "layout" => TokenKind::Layout,
            "plus" => TokenKind::Plus,
            "minus" => TokenKind::Minus,
            "times" => TokenKind::Times,
            "equals" => TokenKind::Equals,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "true" => TokenKind::Flag(true),
            "false" => TokenKind::Flag(false),
            "is" => self.is_operator(),
            "does" => {
                if self.match_words(&["not", "equal"]) {
                    TokenKind::DoesNotEqual
                } else {
                    TokenKind::Ident(lexeme.clone())
                }
            }
            "divided" => {
                if self.match_words(&["by"]) {
                    TokenKind::DividedBy
                } else {
                    TokenKind::Ident(lexeme.clone())
                }
            }
            "for" => {
                if self.match_words(&["each"]) {
                    TokenKind::ForEach
                } else {
                    TokenKind::Ident(lexeme.clone())
                }
            }
            "end" => self.end_block(&lexeme),
            _ => TokenKind::Ident(lexeme.clone()),
        };
        self.push(kind, start);
    }

    /// Longest-match scan after the word `is`.
    fn is_operator(&mut self) -> TokenKind {
        if self.match_words(&["greater", "than", "or", "equal", "to"]) {
            TokenKind::IsGreaterThanOrEqualTo
        } else if self.match_words(&["greater", "than"]) {
            TokenKind::IsGreaterThan
        } else if self.match_words(&["less", "than", "or", "equal", "to"]) {
            TokenKind::IsLessThanOrEqualTo
        } else if self.match_words(&["less", "than"]) {
            TokenKind::IsLessThan
        } else if self.match_words(&["not"]) {
            TokenKind::IsNot
        } else {
            TokenKind::Is
        }
    }

    fn end_block(&mut self, lexeme: &str) -> TokenKind {
        const BLOCKS: &[(&str, TokenKind)] = &[
            ("when", TokenKind::EndWhen),
            ("while", TokenKind::EndWhile),
            ("for", TokenKind::EndFor),
            ("action", TokenKind::EndAction),
            ("task", TokenKind::EndTask),
            ("data", TokenKind::EndData),
            ("module", TokenKind::EndModule),
            ("serve", TokenKind::EndServe),
            ("headers", TokenKind::EndHeaders),
            ("fragment", TokenKind::EndFragment),
            ("screen", TokenKind::EndScreen),
            ("slot", TokenKind::EndSlot),
            ("layout", TokenKind::EndLayout),
        ];
        for (word, kind) in BLOCKS {
            if self.match_words(&[word]) {
                return kind.clone();
            }
        }
        TokenKind::Ident(lexeme.to_string())
    }

    /// Try to consume a sequence of whole words separated by blanks.
    /// Restores the cursor on any mismatch.
    fn match_words(&mut self, words: &[&str]) -> bool {
        let saved = (self.pos, self.line, self.column);
        for word in words {
            while self.peek_is_blank() {
                self.advance();
            }
            for expected in word.chars() {
                if self.peek() != Some(expected) {
                    (self.pos, self.line, self.column) = saved;
                    return false;
                }
                self.advance();
            }
            // Word boundary check so `equalto` does not match `equal`.
            if self
                .peek()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                (self.pos, self.line, self.column) = saved;
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn kinds(s: &str) -> Vec<TokenKind> {
        lex(s, 0).unwrap().into_iter().map(|t| t.kind).collect()
    }

    fn text(parts: &[StrPart]) -> TokenKind {
        TokenKind::Str(parts.to_vec())
    }

    #[test]
    fn simple_statement() {
        assert_eq!(
            kinds("set counter to 1"),
            vec![
                TokenKind::Set,
                TokenKind::Ident("counter".into()),
                TokenKind::To,
                TokenKind::Int(1),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn longest_match_comparison() {
        assert_eq!(
            kinds("a is greater than or equal to b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::IsGreaterThanOrEqualTo,
                TokenKind::Ident("b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn shorter_is_forms() {
        assert_eq!(
            kinds("a is less than b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::IsLessThan,
                TokenKind::Ident("b".into()),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("a is not b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::IsNot,
                TokenKind::Ident("b".into()),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("x is text"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Is,
                TokenKind::Ident("text".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn does_not_equal_and_divided_by() {
        assert_eq!(
            kinds("a does not equal b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::DoesNotEqual,
                TokenKind::Ident("b".into()),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("a divided by b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::DividedBy,
                TokenKind::Ident("b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn word_boundary_guard() {
        // `doesnt` must not partially match `does not equal`.
        assert_eq!(
            kinds("does nothing"),
            vec![
                TokenKind::Ident("does".into()),
                TokenKind::Ident("nothing".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn end_blocks_are_single_tokens() {
        assert_eq!(
            kinds("end when\nend while\nend action"),
            vec![
                TokenKind::EndWhen,
                TokenKind::Newline,
                TokenKind::EndWhile,
                TokenKind::Newline,
                TokenKind::EndAction,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn for_each_is_one_token() {
        assert_eq!(
            kinds("for each item in items"),
            vec![
                TokenKind::ForEach,
                TokenKind::Ident("item".into()),
                TokenKind::In,
                TokenKind::Ident("items".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn decimal_scaling() {
        assert_eq!(kinds("1234.56"), vec![TokenKind::Decimal(123_456), TokenKind::Eof]);
        assert_eq!(kinds("3.1"), vec![TokenKind::Decimal(310), TokenKind::Eof]);
        assert_eq!(kinds("-2.50"), vec![TokenKind::Decimal(-250), TokenKind::Eof]);
    }

    #[test]
    fn int_range_checked() {
        assert_eq!(kinds("2147483647"), vec![TokenKind::Int(i32::MAX), TokenKind::Eof]);
        assert_eq!(kinds("-2147483648"), vec![TokenKind::Int(i32::MIN), TokenKind::Eof]);
        let errs = lex("2147483648", 0).unwrap_err();
        assert_eq!(errs[0].kind(), "lex.overflow");
    }

    #[test]
    fn decimal_scale_overflow() {
        let errs = lex("1.234", 0).unwrap_err();
        assert_eq!(errs[0].kind(), "lex.overflow");
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds(r#""a\nb\t\"c\"""#),
            vec![text(&[StrPart::Lit("a\nb\t\"c\"".into())]), TokenKind::Eof]
        );
    }

    #[test]
    fn single_quoted_string() {
        assert_eq!(
            kinds("'hello'"),
            vec![text(&[StrPart::Lit("hello".into())]), TokenKind::Eof]
        );
    }

    #[test]
    fn interpolation_parts() {
        let tokens = lex("\"Hello [name]!\"", 0).unwrap();
        let TokenKind::Str(parts) = &tokens[0].kind else {
            panic!("expected string token");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], StrPart::Lit("Hello ".into()));
        assert!(matches!(&parts[1], StrPart::Interp { src, .. } if src == "name"));
        assert_eq!(parts[2], StrPart::Lit("!".into()));
    }

    #[test]
    fn unterminated_string_reported() {
        let errs = lex("\"oops", 0).unwrap_err();
        assert_eq!(errs[0].kind(), "lex.unterminated_string");
    }

    #[test]
    fn comments_stripped() {
        assert_eq!(
            kinds("set x to 1 // trailing\nset y to 2"),
            vec![
                TokenKind::Set,
                TokenKind::Ident("x".into()),
                TokenKind::To,
                TokenKind::Int(1),
                TokenKind::Newline,
                TokenKind::Set,
                TokenKind::Ident("y".into()),
                TokenKind::To,
                TokenKind::Int(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn block_comment_stripped() {
        assert_eq!(
            kinds("set /* not here */ x to 1"),
            vec![
                TokenKind::Set,
                TokenKind::Ident("x".into()),
                TokenKind::To,
                TokenKind::Int(1),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn path_literal() {
        assert_eq!(
            kinds("serve get /users/:id"),
            vec![
                TokenKind::Serve,
                TokenKind::Ident("get".into()),
                TokenKind::Path("/users/:id".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn newline_runs_collapse() {
        assert_eq!(
            kinds("display 1\n\n\ndisplay 2"),
            vec![
                TokenKind::Display,
                TokenKind::Int(1),
                TokenKind::Newline,
                TokenKind::Display,
                TokenKind::Int(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn metadata_tokens() {
        assert_eq!(
            kinds("@target web"),
            vec![
                TokenKind::At,
                TokenKind::Ident("target".into()),
                TokenKind::Ident("web".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn positions_are_one_based() {
        let tokens = lex("set x to 1\nset y to 2", 3).unwrap();
        assert_eq!(tokens[0].span.start, Pos { file: 3, line: 1, column: 1 });
        // `y` on line 2, after `set `.
        let y = tokens
            .iter()
            .find(|t| matches!(&t.kind, TokenKind::Ident(n) if n == "y"))
            .unwrap();
        assert_eq!(y.span.start.line, 2);
        assert_eq!(y.span.start.column, 5);
    }
}
