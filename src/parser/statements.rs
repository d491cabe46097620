//! Statement parsing: everything that can appear on its own line.

use super::{describe, Parser};
use crate::ast::{Stmt, StmtKind, UiElement, WhenArm};
use crate::error::CompileError;
use crate::lexer::TokenKind;
use crate::types::Ty;

impl Parser {
    pub(crate) fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        match self.peek() {
            TokenKind::Display => self.parse_display(),
            TokenKind::Set => self.parse_set(),
            TokenKind::When => self.parse_when(),
            TokenKind::While => self.parse_while(),
            TokenKind::ForEach => self.parse_for_each(),
            TokenKind::Give => self.parse_give(),
            TokenKind::Run => self.parse_run(),
            TokenKind::Action | TokenKind::Task => self.parse_action_def(),
            TokenKind::Module => self.parse_module(),
            TokenKind::Data => self.parse_data(),
            TokenKind::Db => self.parse_db(),
            TokenKind::Serve => self.parse_serve(),
            TokenKind::Respond => self.parse_respond(),
            TokenKind::Call => self.parse_http_call(),
            TokenKind::Fragment => {
                let fragment = self.parse_fragment_def()?;
                let span = fragment.span;
                Ok(Stmt { kind: StmtKind::Ui(UiElement::Fragment(fragment)), span })
            }
            TokenKind::Screen => {
                let screen = self.parse_screen_def()?;
                let span = screen.span;
                Ok(Stmt { kind: StmtKind::Ui(UiElement::Screen(screen)), span })
            }
            other => Err(CompileError::parse(
                "unexpected_token",
                format!("expected a statement, found {}", describe(other)),
                self.span(),
            )),
        }
    }

    fn parse_display(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Display)?;
        let expr = self.parse_expr()?;
        let span = start.merge(expr.span);
        Ok(Stmt { kind: StmtKind::Display(expr), span })
    }

    /// `set x [which is int | which are list of int] to <expr>`, or
    /// `set x [which is int] from <action> with <args>`.
    fn parse_set(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Set)?;
        let (name, _) = self.expect_ident()?;

        let declared = if self.eat(&TokenKind::Which) {
            if self.eat(&TokenKind::Are) {
                Some(self.parse_collection_type()?)
            } else {
                self.expect(&TokenKind::Is)?;
                Some(self.parse_type()?)
            }
        } else {
            None
        };

        if self.eat(&TokenKind::From) {
            let call = self.parse_action_call()?;
            let span = start.merge(call.span);
            return Ok(Stmt { kind: StmtKind::SetFrom { name, declared, call }, span });
        }

        self.expect(&TokenKind::To)?;
        let value = self.parse_expr()?;
        let span = start.merge(value.span);
        Ok(Stmt { kind: StmtKind::Set { name, declared, value }, span })
    }

    pub(crate) fn parse_type(&mut self) -> Result<Ty, CompileError> {
        let span = self.span();
        let (name, _) = self.expect_ident()?;
        if (name == "list" || name == "group") && self.eat_word("of") {
            let element = self.parse_type()?;
            return Ok(if name == "list" {
                Ty::List(Box::new(element))
            } else {
                Ty::Group(Box::new(element))
            });
        }
        if let Some(ty) = Ty::parse_name(&name) {
            return Ok(ty);
        }
        // Record types may be referenced before their definition; anything
        // unknown here resolves (or errors) during the check phase.
        if name.chars().next().is_some_and(char::is_uppercase) {
            Ok(Ty::Record(name))
        } else {
            Err(CompileError::parse(
                "unexpected_token",
                format!("unknown type name `{name}`"),
                span,
            ))
        }
    }

    /// After `which are`: a collection type is required.
    fn parse_collection_type(&mut self) -> Result<Ty, CompileError> {
        let span = self.span();
        let ty = self.parse_type()?;
        if ty.is_collection() {
            Ok(ty)
        } else {
            Err(CompileError::parse(
                "unexpected_token",
                format!("`which are` takes a collection type, found `{ty}`"),
                span,
            ))
        }
    }

    /// `when c then <stmt>` single-line, or the block chain
    /// `when c then ... otherwise when c2 then ... otherwise ... end when`.
    fn parse_when(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::When)?;
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::Then)?;

        // Single-line form: a statement follows on the same line.
        if !matches!(self.peek(), TokenKind::Newline) {
            let stmt = self.parse_stmt()?;
            let span = start.merge(stmt.span);
            return Ok(Stmt {
                kind: StmtKind::When {
                    arms: vec![WhenArm { cond, body: vec![stmt] }],
                    otherwise: None,
                },
                span,
            });
        }

        let mut arms = Vec::new();
        let mut otherwise = None;
        let body = self.parse_block(&[TokenKind::Otherwise, TokenKind::EndWhen]);
        arms.push(WhenArm { cond, body });

        while self.eat(&TokenKind::Otherwise) {
            if self.eat(&TokenKind::When) {
                let cond = self.parse_expr()?;
                self.expect(&TokenKind::Then)?;
                let body = self.parse_block(&[TokenKind::Otherwise, TokenKind::EndWhen]);
                arms.push(WhenArm { cond, body });
            } else {
                otherwise = Some(self.parse_block(&[TokenKind::EndWhen]));
                break;
            }
        }

        let end = self
            .expect(&TokenKind::EndWhen)
            .map_err(|_| self.missing_end("when", start))?;
        Ok(Stmt {
            kind: StmtKind::When { arms, otherwise },
            span: start.merge(end),
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::While)?;
        let cond = self.parse_expr()?;
        let body = self.parse_block(&[TokenKind::EndWhile]);
        let end = self
            .expect(&TokenKind::EndWhile)
            .map_err(|_| self.missing_end("while", start))?;
        Ok(Stmt {
            kind: StmtKind::While { cond, body },
            span: start.merge(end),
        })
    }

    fn parse_for_each(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::ForEach)?;
        let (var, _) = self.expect_ident()?;
        self.expect(&TokenKind::In)?;
        let iterable = self.parse_expr()?;
        let body = self.parse_block(&[TokenKind::EndFor]);
        let end = self
            .expect(&TokenKind::EndFor)
            .map_err(|_| self.missing_end("for", start))?;
        Ok(Stmt {
            kind: StmtKind::ForEach { var, iterable, body },
            span: start.merge(end),
        })
    }

    fn parse_give(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Give)?;
        if matches!(self.peek(), TokenKind::Newline | TokenKind::Eof) {
            return Ok(Stmt { kind: StmtKind::Give(None), span: start });
        }
        let value = self.parse_expr()?;
        let span = start.merge(value.span);
        Ok(Stmt { kind: StmtKind::Give(Some(value)), span })
    }

    fn parse_run(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Run)?;
        let call = self.parse_action_call()?;
        let span = start.merge(call.span);
        Ok(Stmt { kind: StmtKind::Run(call), span })
    }

    fn parse_respond(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Respond)?;
        let status = self.parse_expr()?;
        let mut span = start.merge(status.span);
        let body = if self.eat(&TokenKind::With) {
            let body = self.parse_expr()?;
            span = span.merge(body.span);
            Some(body)
        } else {
            None
        };
        Ok(Stmt { kind: StmtKind::Respond { status, body }, span })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ast::{ExprKind, Program};
    use crate::lexer::lex;

    fn parse_str(source: &str) -> Program {
        super::super::parse(lex(source, 0).unwrap()).unwrap()
    }

    #[test]
    fn set_with_declared_type() {
        let p = parse_str("set price which is decimal to 1234.56");
        let StmtKind::Set { ref name, ref declared, ref value } = p.items[0].kind else {
            panic!("expected set");
        };
        assert_eq!(name, "price");
        assert_eq!(*declared, Some(Ty::Decimal));
        assert!(matches!(value.kind, ExprKind::DecimalLit(123_456)));
    }

    #[test]
    fn set_with_collection_type() {
        let p = parse_str("set names which are list of text to [\"a\", \"b\"]");
        let StmtKind::Set { ref declared, .. } = p.items[0].kind else {
            panic!("expected set");
        };
        assert_eq!(*declared, Some(Ty::List(Box::new(Ty::Text))));
    }

    #[test]
    fn set_without_annotation_infers() {
        let p = parse_str("set counter to 1");
        let StmtKind::Set { ref declared, .. } = p.items[0].kind else {
            panic!("expected set");
        };
        assert!(declared.is_none());
    }

    #[test]
    fn set_from_action_call() {
        let p = parse_str("set s which is int from add with 10, 5");
        let StmtKind::SetFrom { ref name, ref call, .. } = p.items[0].kind else {
            panic!("expected set-from");
        };
        assert_eq!(name, "s");
        let ExprKind::ActionCall { ref action, ref args, .. } = call.kind else {
            panic!("expected action call");
        };
        assert_eq!(action, "add");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn set_from_module_action() {
        let p = parse_str("set s from math.square with 4");
        let StmtKind::SetFrom { ref call, .. } = p.items[0].kind else {
            panic!("expected set-from");
        };
        let ExprKind::ActionCall { ref module, ref action, .. } = call.kind else {
            panic!("expected action call");
        };
        assert_eq!(module.as_deref(), Some("math"));
        assert_eq!(action, "square");
    }

    #[test]
    fn single_line_when() {
        let p = parse_str("when x is greater than 3 then display \"big\"");
        let StmtKind::When { ref arms, ref otherwise } = p.items[0].kind else {
            panic!("expected when");
        };
        assert_eq!(arms.len(), 1);
        assert_eq!(arms[0].body.len(), 1);
        assert!(otherwise.is_none());
    }

    #[test]
    fn when_chain() {
        let source = "\
when score is greater than or equal to 90 then
    display \"A\"
otherwise when score is greater than or equal to 80 then
    display \"B\"
    display \"keep it up\"
otherwise
    display \"try again\"
end when";
        let p = parse_str(source);
        let StmtKind::When { ref arms, ref otherwise } = p.items[0].kind else {
            panic!("expected when");
        };
        assert_eq!(arms.len(), 2);
        assert_eq!(arms[1].body.len(), 2);
        assert_eq!(otherwise.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn while_loop() {
        let p = parse_str("while counter is less than or equal to 3\n  display counter\n  set counter to counter plus 1\nend while");
        let StmtKind::While { ref body, .. } = p.items[0].kind else {
            panic!("expected while");
        };
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn for_each_loop() {
        let p = parse_str("for each item in items\n  display item\nend for");
        let StmtKind::ForEach { ref var, ref body, .. } = p.items[0].kind else {
            panic!("expected for each");
        };
        assert_eq!(var, "item");
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn give_with_and_without_value() {
        let p = parse_str("action f gives int\n  give 1\nend action");
        let StmtKind::Action(ref def) = p.items[0].kind else {
            panic!("expected action");
        };
        assert!(matches!(def.body[0].kind, StmtKind::Give(Some(_))));
    }

    #[test]
    fn run_statement() {
        let p = parse_str("run greet with \"ada\"");
        let StmtKind::Run(ref call) = p.items[0].kind else {
            panic!("expected run");
        };
        assert!(matches!(call.kind, ExprKind::ActionCall { .. }));
    }

    #[test]
    fn missing_end_while_reported() {
        let errors = super::super::parse(
            lex("while x is less than 3\n  display x", 0).unwrap(),
        )
        .unwrap_err();
        assert!(errors.iter().any(|e| e.kind() == "parse.missing_end"), "{errors:?}");
    }
}
