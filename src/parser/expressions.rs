//! Expression parsing: precedence climbing over the word operators.
//!
//! Lowest to highest: `or` < `and` < `not` < comparison < `plus`/`minus`
//! < `times`/`divided by` < unary minus < postfix `.field`. Parentheses
//! override.

use super::{describe, Parser};
use crate::ast::{BinOp, Expr, ExprKind, InterpPart, Pos, UnOp};
use crate::error::CompileError;
use crate::lexer::{self, StrPart, TokenKind};

impl Parser {
    pub(crate) fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            let right = self.parse_and()?;
            left = binary(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_not()?;
        while self.eat(&TokenKind::And) {
            let right = self.parse_not()?;
            left = binary(BinOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, CompileError> {
        if self.check(&TokenKind::Not) {
            let start = self.span();
            self.advance();
            let operand = self.parse_not()?;
            let span = start.merge(operand.span);
            Ok(Expr {
                kind: ExprKind::Unary { op: UnOp::Not, operand: Box::new(operand) },
                span,
            })
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            TokenKind::Equals => BinOp::Eq,
            TokenKind::DoesNotEqual => BinOp::Ne,
            TokenKind::IsGreaterThan => BinOp::Gt,
            TokenKind::IsLessThan => BinOp::Lt,
            TokenKind::IsGreaterThanOrEqualTo => BinOp::Ge,
            TokenKind::IsLessThanOrEqualTo => BinOp::Le,
            TokenKind::Is => {
                self.advance();
                if self.eat_word("empty") {
                    let span = left.span.merge(self.span());
                    return Ok(Expr {
                        kind: ExprKind::IsEmpty { operand: Box::new(left), negated: false },
                        span,
                    });
                }
                let right = self.parse_additive()?;
                return Ok(binary(BinOp::Eq, left, right));
            }
            TokenKind::IsNot => {
                self.advance();
                if self.eat_word("empty") {
                    let span = left.span.merge(self.span());
                    return Ok(Expr {
                        kind: ExprKind::IsEmpty { operand: Box::new(left), negated: true },
                        span,
                    });
                }
                let right = self.parse_additive()?;
                return Ok(binary(BinOp::Ne, left, right));
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(binary(op, left, right))
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Times => BinOp::Mul,
                TokenKind::DividedBy => BinOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        if self.check(&TokenKind::Minus) {
            let start = self.span();
            self.advance();
            let operand = self.parse_unary()?;
            let span = start.merge(operand.span);
            Ok(Expr {
                kind: ExprKind::Unary { op: UnOp::Neg, operand: Box::new(operand) },
                span,
            })
        } else {
            self.parse_postfix()
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;
        while self.check(&TokenKind::Dot) {
            self.advance();
            let (field, field_span) = self.expect_ident()?;
            let span = expr.span.merge(field_span);
            expr = Expr {
                kind: ExprKind::Property { object: Box::new(expr), field },
                span,
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let span = self.span();
        match self.peek().clone() {
            TokenKind::Int(v) => {
                self.advance();
                Ok(Expr { kind: ExprKind::IntLit(v), span })
            }
            TokenKind::Decimal(v) => {
                self.advance();
                Ok(Expr { kind: ExprKind::DecimalLit(v), span })
            }
            TokenKind::Flag(b) => {
                self.advance();
                Ok(Expr { kind: ExprKind::FlagLit(b), span })
            }
            TokenKind::Str(parts) => {
                self.advance();
                self.string_expr(parts, span)
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Ident(name), span })
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    elements.push(self.parse_expr()?);
                    while self.eat(&TokenKind::Comma) {
                        elements.push(self.parse_expr()?);
                    }
                }
                let end = self.expect(&TokenKind::RBracket)?;
                Ok(Expr { kind: ExprKind::ListLit(elements), span: span.merge(end) })
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::Format => {
                self.advance();
                let value = self.parse_additive()?;
                self.expect(&TokenKind::As)?;
                let (pattern, end) = self.expect_text_literal()?;
                Ok(Expr {
                    kind: ExprKind::Format { value: Box::new(value), pattern },
                    span: span.merge(end),
                })
            }
            other => Err(CompileError::parse(
                "unexpected_token",
                format!("expected expression, found {}", describe(&other)),
                span,
            )),
        }
    }

    /// Assemble a string token into a text literal or an interpolation.
    fn string_expr(
        &mut self,
        parts: Vec<StrPart>,
        span: crate::ast::Span,
    ) -> Result<Expr, CompileError> {
        if parts.len() == 1 {
            if let StrPart::Lit(text) = &parts[0] {
                return Ok(Expr { kind: ExprKind::TextLit(text.clone()), span });
            }
        }
        let mut interp = Vec::new();
        for part in parts {
            match part {
                StrPart::Lit(text) => interp.push(InterpPart::Lit(text)),
                StrPart::Interp { src, pos } => {
                    let expr = parse_interp_expr(&src, pos)?;
                    interp.push(InterpPart::Expr(Box::new(expr)));
                }
            }
        }
        Ok(Expr { kind: ExprKind::Interp(interp), span })
    }

    /// `<action> [with a, b]` or `<module>.<action> [with a, b]`: the
    /// call form used by `set ... from` and `run`.
    pub(crate) fn parse_action_call(&mut self) -> Result<Expr, CompileError> {
        let start = self.span();
        let (first, _) = self.expect_ident()?;
        let (module, action) = if self.eat(&TokenKind::Dot) {
            let (action, _) = self.expect_ident()?;
            (Some(first), action)
        } else {
            (None, first)
        };

        let mut args = Vec::new();
        let mut end = self.span();
        if self.eat(&TokenKind::With) {
            args.push(self.parse_expr()?);
            while self.eat(&TokenKind::Comma) {
                args.push(self.parse_expr()?);
            }
            end = args.last().map_or(end, |a| a.span);
        }

        Ok(Expr {
            kind: ExprKind::ActionCall { module, action, args },
            span: start.merge(end),
        })
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    let span = left.span.merge(right.span);
    Expr {
        kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) },
        span,
    }
}

/// Parse the expression inside an `[...]` interpolation marker. The chunk
/// was captured raw by the lexer; re-lex it at its original position so
/// diagnostics land on the right column.
fn parse_interp_expr(src: &str, pos: Pos) -> Result<Expr, CompileError> {
    let err_span = crate::ast::Span::point(pos);
    let mut tokens = lexer::lex(src, pos.file).map_err(|mut errs| {
        let mut e = errs.remove(0);
        e.span = err_span;
        e
    })?;
    // Shift spans onto the interpolation's line and column.
    for token in &mut tokens {
        for p in [&mut token.span.start, &mut token.span.end] {
            if p.line == 1 {
                p.column += pos.column - 1;
            }
            p.line = pos.line + (p.line - 1);
        }
    }

    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    if !parser.at_eof() {
        return Err(CompileError::parse(
            "trailing_content",
            "unexpected content after interpolated expression",
            parser.span(),
        ));
    }
    Ok(expr)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ast::StmtKind;
    use crate::lexer::lex;

    fn expr(source: &str) -> Expr {
        let program =
            super::super::parse(lex(&format!("display {source}"), 0).unwrap()).unwrap();
        match program.items.into_iter().next().unwrap().kind {
            StmtKind::Display(e) => e,
            other => panic!("expected display statement, got {other:?}"),
        }
    }

    #[test]
    fn precedence_and_over_or() {
        // a or b and c → a or (b and c)
        let e = expr("a or b and c");
        let ExprKind::Binary { op: BinOp::Or, right, .. } = e.kind else {
            panic!("top level should be or");
        };
        assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::And, .. }));
    }

    #[test]
    fn precedence_arithmetic_over_comparison() {
        // total is greater than a plus b → total > (a + b)
        let e = expr("total is greater than a plus b");
        let ExprKind::Binary { op: BinOp::Gt, right, .. } = e.kind else {
            panic!("top level should be >");
        };
        assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Add, .. }));
    }

    #[test]
    fn precedence_times_over_plus() {
        let e = expr("a plus b times c");
        let ExprKind::Binary { op: BinOp::Add, right, .. } = e.kind else {
            panic!("top level should be +");
        };
        assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn parens_override() {
        let e = expr("(a plus b) times c");
        let ExprKind::Binary { op: BinOp::Mul, left, .. } = e.kind else {
            panic!("top level should be *");
        };
        assert!(matches!(left.kind, ExprKind::Binary { op: BinOp::Add, .. }));
    }

    #[test]
    fn is_parses_as_equality() {
        let e = expr("status is \"open\"");
        assert!(matches!(e.kind, ExprKind::Binary { op: BinOp::Eq, .. }));
        let e = expr("status is not \"open\"");
        assert!(matches!(e.kind, ExprKind::Binary { op: BinOp::Ne, .. }));
    }

    #[test]
    fn is_empty_forms() {
        let e = expr("items is empty");
        assert!(matches!(e.kind, ExprKind::IsEmpty { negated: false, .. }));
        let e = expr("items is not empty");
        assert!(matches!(e.kind, ExprKind::IsEmpty { negated: true, .. }));
    }

    #[test]
    fn not_binds_looser_than_comparison() {
        // not a equals b → not (a equals b)
        let e = expr("not a equals b");
        let ExprKind::Unary { op: UnOp::Not, operand } = e.kind else {
            panic!("top level should be not");
        };
        assert!(matches!(operand.kind, ExprKind::Binary { op: BinOp::Eq, .. }));
    }

    #[test]
    fn property_access_chain() {
        let e = expr("order.customer.name");
        let ExprKind::Property { object, field } = e.kind else {
            panic!("expected property access");
        };
        assert_eq!(field, "name");
        assert!(matches!(object.kind, ExprKind::Property { .. }));
    }

    #[test]
    fn list_literal() {
        let e = expr("[1, 2, 3]");
        let ExprKind::ListLit(elements) = e.kind else {
            panic!("expected list literal");
        };
        assert_eq!(elements.len(), 3);
    }

    #[test]
    fn empty_list_literal() {
        let e = expr("[]");
        assert!(matches!(e.kind, ExprKind::ListLit(ref v) if v.is_empty()));
    }

    #[test]
    fn format_expression() {
        let e = expr("format price as \"#,##0.00\"");
        let ExprKind::Format { pattern, .. } = e.kind else {
            panic!("expected format expression");
        };
        assert_eq!(pattern, "#,##0.00");
    }

    #[test]
    fn interpolated_string() {
        let e = expr("\"Hello [name], you are [age plus 1]\"");
        let ExprKind::Interp(parts) = e.kind else {
            panic!("expected interpolation");
        };
        assert_eq!(parts.len(), 4);
        assert!(matches!(&parts[1], InterpPart::Expr(e)
            if matches!(e.kind, ExprKind::Ident(ref n) if n == "name")));
        assert!(matches!(&parts[3], InterpPart::Expr(e)
            if matches!(e.kind, ExprKind::Binary { op: BinOp::Add, .. })));
    }

    #[test]
    fn plain_string_is_text_literal() {
        let e = expr("\"just text\"");
        assert!(matches!(e.kind, ExprKind::TextLit(ref s) if s == "just text"));
    }

    #[test]
    fn unary_minus() {
        let e = expr("minus x");
        assert!(matches!(e.kind, ExprKind::Unary { op: UnOp::Neg, .. }));
    }
}
