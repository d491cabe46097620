//! Declaration parsing: actions, modules, data records, database
//! operations, endpoints, and outbound HTTP calls.

use super::{describe, Parser};
use crate::ast::{
    ActionDef, DataDef, DataField, DbOp, DbStmt, FieldAnnotation, HttpCallStmt, HttpMethod,
    ModuleDef, Param, ServeDef, Stmt, StmtKind,
};
use crate::error::CompileError;
use crate::lexer::TokenKind;

impl Parser {
    /// `action add with a which is int, b which is int gives int ... end action`
    /// A `task` is the same production without `gives`.
    pub(crate) fn parse_action_def(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        let is_task = matches!(self.peek(), TokenKind::Task);
        self.advance();
        let (name, _) = self.expect_ident()?;

        let mut params = Vec::new();
        if self.eat(&TokenKind::With) {
            loop {
                let (pname, pspan) = self.expect_ident()?;
                self.expect(&TokenKind::Which)?;
                self.expect(&TokenKind::Is)?;
                let ty = self.parse_type()?;
                params.push(Param { name: pname, ty, span: pspan });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let gives = if self.eat(&TokenKind::Gives) {
            let ty = self.parse_type()?;
            if is_task {
                return Err(CompileError::parse(
                    "unexpected_token",
                    "a task cannot declare `gives`; use `action` instead",
                    start,
                ));
            }
            Some(ty)
        } else {
            None
        };

        let body = self.parse_block(&[TokenKind::EndAction, TokenKind::EndTask]);
        let end = self.span();
        if !(self.eat(&TokenKind::EndAction) || self.eat(&TokenKind::EndTask)) {
            return Err(self.missing_end(if is_task { "task" } else { "action" }, start));
        }

        Ok(Stmt {
            kind: StmtKind::Action(ActionDef {
                name,
                params,
                gives,
                body,
                is_task,
                span: start.merge(end),
            }),
            span: start.merge(end),
        })
    }

    pub(crate) fn parse_module(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Module)?;
        let (name, _) = self.expect_ident()?;
        let body = self.parse_block(&[TokenKind::EndModule]);
        let end = self
            .expect(&TokenKind::EndModule)
            .map_err(|_| self.missing_end("module", start))?;
        Ok(Stmt {
            kind: StmtKind::Module(ModuleDef { name, body, span: start.merge(end) }),
            span: start.merge(end),
        })
    }

    /// `data User ... end data`: each field is
    /// `<name> is <type> [annotation]*`.
    pub(crate) fn parse_data(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Data)?;
        let (name, _) = self.expect_ident()?;

        let mut fields = Vec::new();
        self.skip_newlines();
        while !self.at_eof() && !self.check(&TokenKind::EndData) {
            match self.parse_data_field() {
                Ok(field) => {
                    fields.push(field);
                    if let Err(e) = self.expect_terminator() {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
            self.skip_newlines();
        }
        let end = self
            .expect(&TokenKind::EndData)
            .map_err(|_| self.missing_end("data", start))?;

        Ok(Stmt {
            kind: StmtKind::Data(DataDef { name, fields, span: start.merge(end) }),
            span: start.merge(end),
        })
    }

    fn parse_data_field(&mut self) -> Result<DataField, CompileError> {
        let (name, span) = self.expect_ident()?;
        self.expect(&TokenKind::Is)?;
        let ty = self.parse_type()?;

        let mut annotations = Vec::new();
        while let TokenKind::Ident(word) = self.peek().clone() {
            let word_span = self.span();
            self.advance();
            let annotation = match word.as_str() {
                "key" => FieldAnnotation::Key,
                "auto" => FieldAnnotation::Auto,
                "required" => FieldAnnotation::Required,
                "optional" => FieldAnnotation::Optional,
                "unique" => FieldAnnotation::Unique,
                "default" => {
                    self.expect(&TokenKind::AssignEq)?;
                    FieldAnnotation::Default(self.parse_expr()?)
                }
                other => {
                    return Err(CompileError::parse(
                        "unexpected_token",
                        format!("unknown field annotation `{other}`"),
                        word_span,
                    ));
                }
            };
            annotations.push(annotation);
        }

        Ok(DataField { name, ty, annotations, span })
    }

    /// `db find all User where age is greater than 30 into adults`
    pub(crate) fn parse_db(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Db)?;

        let (op_word, op_span) = self.expect_ident()?;
        let op = match op_word.as_str() {
            "create" => DbOp::Create,
            "find" => {
                if self.eat_word("all") {
                    DbOp::FindAll
                } else {
                    DbOp::Find
                }
            }
            "update" => DbOp::Update,
            "delete" => DbOp::Delete,
            other => {
                return Err(CompileError::parse(
                    "unexpected_token",
                    format!(
                        "unknown database operation `{other}` (expected create, find, find all, update or delete)"
                    ),
                    op_span,
                ));
            }
        };

        let (entity, _) = self.expect_ident()?;

        let with = if self.eat(&TokenKind::With) {
            self.parse_field_assignments()?
        } else {
            Vec::new()
        };
        let where_cond = if self.eat(&TokenKind::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let set = if self.eat(&TokenKind::Set) {
            self.parse_field_assignments()?
        } else {
            Vec::new()
        };
        let into = if self.eat(&TokenKind::Into) {
            Some(self.expect_ident()?.0)
        } else {
            None
        };

        let span = start.merge(self.span());
        Ok(Stmt {
            kind: StmtKind::Database(DbStmt { op, entity, with, where_cond, set, into, span }),
            span,
        })
    }

    /// `<field> is <expr>, <field> is <expr>, ...`
    fn parse_field_assignments(
        &mut self,
    ) -> Result<Vec<(String, crate::ast::Expr)>, CompileError> {
        let mut assignments = Vec::new();
        loop {
            let (field, _) = self.expect_ident()?;
            self.expect(&TokenKind::Is)?;
            let value = self.parse_expr()?;
            assignments.push((field, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(assignments)
    }

    /// `serve get /users/:id ... end serve`
    pub(crate) fn parse_serve(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Serve)?;

        let (method_word, method_span) = self.expect_ident()?;
        let method = HttpMethod::parse(&method_word).ok_or_else(|| {
            CompileError::parse(
                "unexpected_token",
                format!("unknown HTTP method `{method_word}`"),
                method_span,
            )
        })?;

        let path_span = self.span();
        let path = match self.peek().clone() {
            TokenKind::Path(p) => {
                self.advance();
                p
            }
            other => {
                return Err(CompileError::parse(
                    "unexpected_token",
                    format!("expected endpoint path, found {}", describe(&other)),
                    path_span,
                ));
            }
        };
        let path_params = path
            .split('/')
            .filter_map(|segment| segment.strip_prefix(':'))
            .map(str::to_string)
            .collect();

        let body = self.parse_block(&[TokenKind::EndServe]);
        let end = self
            .expect(&TokenKind::EndServe)
            .map_err(|_| self.missing_end("serve", start))?;

        Ok(Stmt {
            kind: StmtKind::Serve(ServeDef {
                method,
                path,
                path_params,
                body,
                span: start.merge(end),
            }),
            span: start.merge(end),
        })
    }

    /// `call <url> method POST with payload using headers ... end headers into resp`
    pub(crate) fn parse_http_call(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        self.expect(&TokenKind::Call)?;
        let url = self.parse_expr()?;
        self.expect(&TokenKind::Method)?;

        let (method_word, method_span) = self.expect_ident()?;
        let method = HttpMethod::parse(&method_word).ok_or_else(|| {
            CompileError::parse(
                "unexpected_token",
                format!("unknown HTTP method `{method_word}`"),
                method_span,
            )
        })?;

        let body = if self.eat(&TokenKind::With) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let mut headers = Vec::new();
        if self.eat(&TokenKind::Using) {
            self.expect(&TokenKind::Headers)?;
            self.skip_newlines();
            while !self.at_eof() && !self.check(&TokenKind::EndHeaders) {
                let (name, _) = self.expect_text_literal()?;
                self.expect(&TokenKind::Is)?;
                let value = self.parse_expr()?;
                headers.push((name, value));
                self.expect_terminator()?;
                self.skip_newlines();
            }
            self.expect(&TokenKind::EndHeaders)
                .map_err(|_| self.missing_end("headers", start))?;
        }

        self.expect(&TokenKind::Into)?;
        let (into, end_span) = self.expect_ident()?;

        Ok(Stmt {
            kind: StmtKind::HttpCall(HttpCallStmt {
                url,
                method,
                body,
                headers,
                into,
                span: start.merge(end_span),
            }),
            span: start.merge(end_span),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ast::Program;
    use crate::lexer::lex;
    use crate::types::Ty;

    fn parse_str(source: &str) -> Program {
        super::super::parse(lex(source, 0).unwrap()).unwrap()
    }

    #[test]
    fn action_with_params_and_gives() {
        let p = parse_str("action add with a which is int, b which is int gives int\n  give a plus b\nend action");
        let StmtKind::Action(ref def) = p.items[0].kind else {
            panic!("expected action");
        };
        assert_eq!(def.name, "add");
        assert_eq!(def.params.len(), 2);
        assert_eq!(def.params[1].ty, Ty::Int);
        assert_eq!(def.gives, Some(Ty::Int));
        assert!(!def.is_task);
    }

    #[test]
    fn task_has_no_gives() {
        let p = parse_str("task log_it with message which is text\n  display message\nend task");
        let StmtKind::Action(ref def) = p.items[0].kind else {
            panic!("expected task");
        };
        assert!(def.is_task);
        assert!(def.gives.is_none());
    }

    #[test]
    fn task_with_gives_is_an_error() {
        let errors =
            super::super::parse(lex("task t gives int\n  give 1\nend task", 0).unwrap())
                .unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn module_with_nested_action() {
        let p = parse_str("module math\n  action square with n which is int gives int\n    give n times n\n  end action\nend module");
        let StmtKind::Module(ref def) = p.items[0].kind else {
            panic!("expected module");
        };
        assert_eq!(def.name, "math");
        assert_eq!(def.body.len(), 1);
    }

    #[test]
    fn data_with_annotations() {
        let source = "\
data User
    id is text key auto
    name is text required
    age is int default=0
    email is text unique optional
end data";
        let p = parse_str(source);
        let StmtKind::Data(ref def) = p.items[0].kind else {
            panic!("expected data");
        };
        assert_eq!(def.name, "User");
        assert_eq!(def.fields.len(), 4);
        assert_eq!(def.fields[0].annotations, vec![FieldAnnotation::Key, FieldAnnotation::Auto]);
        assert!(matches!(def.fields[2].annotations[0], FieldAnnotation::Default(_)));
    }

    #[test]
    fn db_find_all_with_where_and_into() {
        let p = parse_str("db find all User where age is greater than 30 into adults");
        let StmtKind::Database(ref db) = p.items[0].kind else {
            panic!("expected db statement");
        };
        assert_eq!(db.op, DbOp::FindAll);
        assert_eq!(db.entity, "User");
        assert!(db.where_cond.is_some());
        assert_eq!(db.into.as_deref(), Some("adults"));
    }

    #[test]
    fn db_create_with_fields() {
        let p = parse_str("db create User with name is \"ada\", age is 36 into created");
        let StmtKind::Database(ref db) = p.items[0].kind else {
            panic!("expected db statement");
        };
        assert_eq!(db.op, DbOp::Create);
        assert_eq!(db.with.len(), 2);
    }

    #[test]
    fn db_update_with_set() {
        let p = parse_str("db update User where name equals \"ada\" set age is 37");
        let StmtKind::Database(ref db) = p.items[0].kind else {
            panic!("expected db statement");
        };
        assert_eq!(db.op, DbOp::Update);
        assert_eq!(db.set.len(), 1);
    }

    #[test]
    fn serve_with_path_params() {
        let p = parse_str("serve get /users/:id\n  respond 200 with \"ok\"\nend serve");
        let StmtKind::Serve(ref def) = p.items[0].kind else {
            panic!("expected serve");
        };
        assert_eq!(def.method, HttpMethod::Get);
        assert_eq!(def.path, "/users/:id");
        assert_eq!(def.path_params, vec!["id".to_string()]);
        assert_eq!(def.body.len(), 1);
    }

    #[test]
    fn http_call_with_headers() {
        let source = "\
call \"https://api.example.com/login\" method POST with payload using headers
    \"Content-Type\" is \"application/json\"
    \"Authorization\" is token
end headers into response";
        let p = parse_str(source);
        let StmtKind::HttpCall(ref call) = p.items[0].kind else {
            panic!("expected call");
        };
        assert_eq!(call.method, HttpMethod::Post);
        assert!(call.body.is_some());
        assert_eq!(call.headers.len(), 2);
        assert_eq!(call.headers[0].0, "Content-Type");
        assert_eq!(call.into, "response");
    }

    #[test]
    fn http_call_minimal() {
        let p = parse_str("call \"https://api.example.com/users\" method GET into users");
        let StmtKind::HttpCall(ref call) = p.items[0].kind else {
            panic!("expected call");
        };
        assert!(call.body.is_none());
        assert!(call.headers.is_empty());
    }
}
