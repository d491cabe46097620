//! UI declaration parsing: fragments, screens, layouts, slots, and the
//! leaf components (`title`, `text`, `input`, `button`).

use super::{describe, Parser};
use crate::ast::{FragmentDef, ScreenDef, SlotFill, UiAttr, UiNode};
use crate::error::CompileError;
use crate::lexer::TokenKind;

/// Whether we are parsing a fragment body (slots are declarations) or a
/// screen body (fragments are instantiated and their slots filled).
#[derive(Clone, Copy, PartialEq)]
enum UiCtx {
    Fragment,
    Screen,
}

impl Parser {
    pub(crate) fn parse_fragment_def(&mut self) -> Result<FragmentDef, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Fragment)?;
        let (name, _) = self.expect_ident()?;
        let body = self.parse_ui_nodes(&[TokenKind::EndFragment], UiCtx::Fragment)?;
        let end = self
            .expect(&TokenKind::EndFragment)
            .map_err(|_| self.missing_end("fragment", start))?;
        Ok(FragmentDef { name, body, span: start.merge(end) })
    }

    pub(crate) fn parse_screen_def(&mut self) -> Result<ScreenDef, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Screen)?;
        let (name, _) = self.expect_ident()?;
        let body = self.parse_ui_nodes(&[TokenKind::EndScreen], UiCtx::Screen)?;
        let end = self
            .expect(&TokenKind::EndScreen)
            .map_err(|_| self.missing_end("screen", start))?;
        Ok(ScreenDef { name, body, span: start.merge(end) })
    }

    fn parse_ui_nodes(
        &mut self,
        closers: &[TokenKind],
        ctx: UiCtx,
    ) -> Result<Vec<UiNode>, CompileError> {
        let mut nodes = Vec::new();
        self.skip_newlines();
        while !self.at_eof() && !closers.iter().any(|c| self.check(c)) {
            nodes.push(self.parse_ui_node(ctx)?);
            self.expect_terminator()?;
            self.skip_newlines();
        }
        Ok(nodes)
    }

    fn parse_ui_node(&mut self, ctx: UiCtx) -> Result<UiNode, CompileError> {
        let span = self.span();
        match self.peek().clone() {
            TokenKind::Ident(word) => match word.as_str() {
                "title" => {
                    self.advance();
                    let (text, end) = self.expect_text_literal()?;
                    let attrs = self.parse_ui_attrs()?;
                    Ok(UiNode::Title { text, attrs, span: span.merge(end) })
                }
                "text" => {
                    self.advance();
                    let (text, end) = self.expect_text_literal()?;
                    let attrs = self.parse_ui_attrs()?;
                    Ok(UiNode::Text { text, attrs, span: span.merge(end) })
                }
                "input" => {
                    self.advance();
                    // Optional input kind, e.g. `input password`, before any
                    // attribute pairs.
                    let input_type = match self.peek() {
                        TokenKind::Ident(w) if !is_attr_name(w) => {
                            let w = w.clone();
                            self.advance();
                            w
                        }
                        _ => "text".to_string(),
                    };
                    let attrs = self.parse_ui_attrs()?;
                    Ok(UiNode::Input { input_type, attrs, span })
                }
                "button" => {
                    self.advance();
                    let (label, end) = self.expect_text_literal()?;
                    let attrs = self.parse_ui_attrs()?;
                    Ok(UiNode::Button { label, attrs, span: span.merge(end) })
                }
                other => Err(CompileError::parse(
                    "unexpected_token",
                    format!("unknown UI component `{other}`"),
                    span,
                )),
            },
            TokenKind::Slot => {
                if ctx != UiCtx::Fragment {
                    return Err(CompileError::parse(
                        "unexpected_token",
                        "slots can only be declared inside a fragment; screens fill them through `fragment ... end fragment`",
                        span,
                    ));
                }
                self.advance();
                let (name, end) = self.expect_text_literal()?;
                Ok(UiNode::Slot { name, span: span.merge(end) })
            }
            TokenKind::Fragment => {
                if ctx != UiCtx::Screen {
                    return Err(CompileError::parse(
                        "unexpected_token",
                        "fragments cannot be nested inside fragments",
                        span,
                    ));
                }
                self.parse_use_fragment(span)
            }
            TokenKind::Layout => {
                self.advance();
                let name = match self.peek() {
                    TokenKind::Ident(n) => {
                        let n = n.clone();
                        self.advance();
                        Some(n)
                    }
                    _ => None,
                };
                let children = self.parse_ui_nodes(&[TokenKind::EndLayout], ctx)?;
                let end = self
                    .expect(&TokenKind::EndLayout)
                    .map_err(|_| self.missing_end("layout", span))?;
                Ok(UiNode::Layout { name, children, span: span.merge(end) })
            }
            other => Err(CompileError::parse(
                "unexpected_token",
                format!("expected a UI component, found {}", describe(&other)),
                span,
            )),
        }
    }

    /// `fragment card slot "header" ... end slot ... end fragment` inside a
    /// screen body: instantiates a fragment, filling its slots by name.
    fn parse_use_fragment(&mut self, start: crate::ast::Span) -> Result<UiNode, CompileError> {
        self.expect(&TokenKind::Fragment)?;
        let (fragment, _) = self.expect_ident()?;

        let mut fills = Vec::new();
        self.skip_newlines();
        while self.check(&TokenKind::Slot) {
            let fill_span = self.span();
            self.advance();
            let (slot, _) = self.expect_text_literal()?;
            let content = self.parse_ui_nodes(&[TokenKind::EndSlot], UiCtx::Screen)?;
            let end = self
                .expect(&TokenKind::EndSlot)
                .map_err(|_| self.missing_end("slot", fill_span))?;
            fills.push(SlotFill { slot, content, span: fill_span.merge(end) });
            self.skip_newlines();
        }

        let end = self
            .expect(&TokenKind::EndFragment)
            .map_err(|_| self.missing_end("fragment", start))?;
        Ok(UiNode::UseFragment { fragment, fills, span: start.merge(end) })
    }

    /// Attribute pairs trailing a component: `id login`, `class "primary"`,
    /// `bind LoginForm.email`, `action submit`.
    fn parse_ui_attrs(&mut self) -> Result<Vec<UiAttr>, CompileError> {
        let mut attrs = Vec::new();
        loop {
            // `action` lexes as a keyword, so it needs its own arm here.
            let name = match self.peek().clone() {
                TokenKind::Ident(name) if is_attr_name(&name) => {
                    self.advance();
                    name
                }
                TokenKind::Action => {
                    self.advance();
                    "action".to_string()
                }
                _ => break,
            };
            let value = match self.peek().clone() {
                TokenKind::Str(_) => self.expect_text_literal()?.0,
                TokenKind::Ident(_) => {
                    let (mut value, _) = self.expect_ident()?;
                    while self.eat(&TokenKind::Dot) {
                        let (part, _) = self.expect_ident()?;
                        value.push('.');
                        value.push_str(&part);
                    }
                    value
                }
                other => {
                    return Err(CompileError::parse(
                        "unexpected_token",
                        format!("expected attribute value, found {}", describe(&other)),
                        self.span(),
                    ));
                }
            };
            attrs.push(UiAttr { name, value });
        }
        Ok(attrs)
    }
}

fn is_attr_name(word: &str) -> bool {
    matches!(word, "id" | "class" | "bind" | "action" | "placeholder")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ast::{Program, StmtKind, UiElement};
    use crate::lexer::lex;

    fn parse_str(source: &str) -> Program {
        super::super::parse(lex(source, 0).unwrap()).unwrap()
    }

    #[test]
    fn fragment_with_slots() {
        let source = "\
fragment card
    title \"Card\"
    slot \"header\"
    slot \"body\"
end fragment";
        let p = parse_str(source);
        let StmtKind::Ui(UiElement::Fragment(ref def)) = p.items[0].kind else {
            panic!("expected fragment");
        };
        assert_eq!(def.name, "card");
        assert_eq!(def.body.len(), 3);
        assert!(matches!(def.body[1], UiNode::Slot { ref name, .. } if name == "header"));
    }

    #[test]
    fn screen_fills_slots() {
        let source = "\
screen home
    fragment card
        slot \"header\"
            title \"Welcome\"
        end slot
        slot \"body\"
            text \"Hello there\"
            button \"Continue\" action next_page
        end slot
    end fragment
end screen";
        let p = parse_str(source);
        let StmtKind::Ui(UiElement::Screen(ref def)) = p.items[0].kind else {
            panic!("expected screen");
        };
        let UiNode::UseFragment { ref fragment, ref fills, .. } = def.body[0] else {
            panic!("expected fragment use");
        };
        assert_eq!(fragment, "card");
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[1].slot, "body");
        assert_eq!(fills[1].content.len(), 2);
    }

    #[test]
    fn input_with_type_and_binding() {
        let source = "\
screen login
    input password bind LoginForm.password id pw_field
    button \"Log in\" action submit_login
end screen";
        let p = parse_str(source);
        let StmtKind::Ui(UiElement::Screen(ref def)) = p.items[0].kind else {
            panic!("expected screen");
        };
        let UiNode::Input { ref input_type, ref attrs, .. } = def.body[0] else {
            panic!("expected input");
        };
        assert_eq!(input_type, "password");
        assert_eq!(attrs[0].name, "bind");
        assert_eq!(attrs[0].value, "LoginForm.password");
    }

    #[test]
    fn layout_groups_children() {
        let source = "\
fragment shell
    layout sidebar
        text \"nav\"
    end layout
end fragment";
        let p = parse_str(source);
        let StmtKind::Ui(UiElement::Fragment(ref def)) = p.items[0].kind else {
            panic!("expected fragment");
        };
        let UiNode::Layout { ref name, ref children, .. } = def.body[0] else {
            panic!("expected layout");
        };
        assert_eq!(name.as_deref(), Some("sidebar"));
        assert_eq!(children.len(), 1);
    }

    #[test]
    fn slot_outside_fragment_is_an_error() {
        let errors = super::super::parse(
            lex("screen s\n    slot \"x\"\nend screen", 0).unwrap(),
        )
        .unwrap_err();
        assert!(!errors.is_empty());
    }
}
