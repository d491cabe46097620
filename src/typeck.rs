//! Symbol resolution and type checking.
//!
//! Two passes per program: first collect every top-level name (records,
//! modules, actions, endpoints, UI components), then visit bodies with a
//! scoped symbol table. The output mirrors the AST with every expression
//! typed, every variable resolved to a frame or global slot, and every
//! action call resolved to `(module index, action index)`.

use std::collections::{HashMap, HashSet};

use crate::ast::{
    BinOp, DataDef, DbOp, Expr, ExprKind, FieldAnnotation, HttpMethod, InterpPart, Metadata,
    Program, ServeDef, Span, Stmt, StmtKind, UiElement, UiNode, UnOp,
};
use crate::error::CompileError;
use crate::format;
use crate::types::Ty;

// ── Typed program ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TypedProgram {
    pub metadata: Vec<Metadata>,
    pub records: Vec<TypedRecord>,
    /// Module 0 is the implicit top-level module.
    pub modules: Vec<TypedModule>,
    pub endpoints: Vec<TypedEndpoint>,
    pub uis: Vec<UiComponent>,
    pub main: Vec<TypedStmt>,
    pub globals: u16,
}

#[derive(Debug, Clone)]
pub struct TypedRecord {
    pub name: String,
    pub fields: Vec<TypedField>,
    /// Compiler-generated (request/response shapes); not surfaced through
    /// `DefineData`.
    pub internal: bool,
}

impl TypedRecord {
    pub fn field_index(&self, name: &str) -> Option<u16> {
        self.fields.iter().position(|f| f.name == name).map(|i| i as u16)
    }
}

#[derive(Debug, Clone)]
pub struct TypedField {
    pub name: String,
    pub ty: Ty,
    pub key: bool,
    pub auto: bool,
    pub required: bool,
    pub optional: bool,
    pub unique: bool,
    pub default: Option<Lit>,
}

/// A literal constant, as used by field defaults.
#[derive(Debug, Clone, PartialEq)]
pub enum Lit {
    Int(i32),
    Decimal(i64),
    Text(String),
    Flag(bool),
}

#[derive(Debug, Clone)]
pub struct TypedModule {
    pub name: String,
    pub actions: Vec<TypedAction>,
}

#[derive(Debug, Clone)]
pub struct TypedAction {
    pub name: String,
    pub params: Vec<(String, Ty)>,
    pub gives: Option<Ty>,
    pub is_task: bool,
    pub locals: u16,
    pub body: Vec<TypedStmt>,
}

#[derive(Debug, Clone)]
pub struct TypedEndpoint {
    pub method: HttpMethod,
    pub path: String,
    pub path_params: Vec<String>,
    /// Index of the generated request record schema.
    pub request_record: u16,
    pub locals: u16,
    pub body: Vec<TypedStmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiKind {
    Fragment,
    Screen,
}

/// A validated UI tree, registered as an opaque record value at load time.
#[derive(Debug, Clone)]
pub struct UiComponent {
    pub name: String,
    pub kind: UiKind,
    pub nodes: Vec<UiNode>,
}

// ── Typed statements and expressions ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarSlot {
    Local(u16),
    Global(u16),
}

#[derive(Debug, Clone)]
pub struct TypedStmt {
    pub kind: TypedStmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum TypedStmtKind {
    Display(TypedExpr),
    Store { slot: VarSlot, value: TypedExpr },
    When {
        arms: Vec<(TypedExpr, Vec<TypedStmt>)>,
        otherwise: Option<Vec<TypedStmt>>,
    },
    While { cond: TypedExpr, body: Vec<TypedStmt> },
    ForEach { slot: VarSlot, iterable: TypedExpr, body: Vec<TypedStmt> },
    Give(Option<TypedExpr>),
    /// `run`: call for effect; `discard` pops an unused return value.
    CallStmt { call: TypedExpr, discard: bool },
    Database(TypedDb),
    Respond { status: TypedExpr, body: Option<TypedExpr> },
    HttpCall {
        url: TypedExpr,
        method: HttpMethod,
        body: Option<TypedExpr>,
        headers: Vec<(String, TypedExpr)>,
        into: VarSlot,
    },
}

#[derive(Debug, Clone)]
pub struct TypedDb {
    pub op: DbOp,
    pub entity: u16,
    /// Create: one initializer per schema field, in field order.
    pub create: Vec<FieldInit>,
    /// Find / update / delete predicate: `(field, cmp, value)` triples,
    /// and-joined.
    pub predicate: Vec<(String, &'static str, TypedExpr)>,
    /// Update field set.
    pub set: Vec<(String, TypedExpr)>,
    pub into: Option<VarSlot>,
}

#[derive(Debug, Clone)]
pub enum FieldInit {
    Value(TypedExpr),
    AutoUuid,
    AutoNow,
    Default(Lit),
}

#[derive(Debug, Clone)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    pub ty: Ty,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum TypedExprKind {
    Int(i32),
    Decimal(i64),
    Text(String),
    Flag(bool),
    Load(VarSlot),
    Binary {
        op: BinOp,
        /// The promoted operand type the VM dispatches on.
        operand_ty: Ty,
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Concat { left: Box<TypedExpr>, right: Box<TypedExpr> },
    Unary { op: UnOp, operand: Box<TypedExpr> },
    Interp(Vec<TypedInterpPart>),
    MakeCollection { kind: CollKind, elements: Vec<TypedExpr> },
    Call {
        module: u16,
        action: u16,
        args: Vec<TypedExpr>,
        returns: Option<Ty>,
    },
    GetField { object: Box<TypedExpr>, record: u16, field: u16 },
    Format { value: Box<TypedExpr>, pattern: String },
    IsEmpty { operand: Box<TypedExpr>, negated: bool },
}

#[derive(Debug, Clone)]
pub enum TypedInterpPart {
    Lit(String),
    Expr(TypedExpr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollKind {
    List,
    Group,
}

// ── Checker ──────────────────────────────────────────────────────

pub fn check(program: &Program) -> Result<TypedProgram, Vec<CompileError>> {
    let mut checker = Checker::new();
    checker.run(program)
}

struct ActionSig {
    name: String,
    params: Vec<(String, Ty)>,
    gives: Option<Ty>,
    is_task: bool,
}

struct ModuleSig {
    name: String,
    actions: Vec<ActionSig>,
}

struct Checker {
    errors: Vec<CompileError>,
    records: Vec<TypedRecord>,
    record_index: HashMap<String, u16>,
    modules: Vec<ModuleSig>,
    module_index: HashMap<String, u16>,
    fragments: HashMap<String, Vec<String>>,
    /// Module whose action bodies are currently being checked; unqualified
    /// calls resolve here first, then in the top-level module.
    current_module: u16,
}

/// What kind of body is being checked; governs `give` and `respond`.
#[derive(Clone, Copy)]
enum BodyCtx<'a> {
    Main,
    Action { gives: Option<&'a Ty>, is_task: bool },
    Endpoint,
}

/// Scoped symbol table. Slots are never reused; the high-water mark is the
/// frame's locals count.
struct Scope {
    frames: Vec<HashMap<String, (Ty, u16)>>,
    next: u16,
    global: bool,
}

impl Scope {
    fn new(global: bool) -> Self {
        Self { frames: vec![HashMap::new()], next: 0, global }
    }

    fn push(&mut self) {
        self.frames.push(HashMap::new());
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn lookup(&self, name: &str) -> Option<(Ty, VarSlot)> {
        for frame in self.frames.iter().rev() {
            if let Some((ty, slot)) = frame.get(name) {
                return Some((ty.clone(), self.wrap(*slot)));
            }
        }
        None
    }

    fn declare(&mut self, name: &str, ty: Ty) -> VarSlot {
        let slot = self.next;
        self.next += 1;
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), (ty, slot));
        }
        self.wrap(slot)
    }

    fn wrap(&self, slot: u16) -> VarSlot {
        if self.global {
            VarSlot::Global(slot)
        } else {
            VarSlot::Local(slot)
        }
    }
}

impl Checker {
    fn new() -> Self {
        Self {
            errors: Vec::new(),
            records: Vec::new(),
            record_index: HashMap::new(),
            modules: vec![ModuleSig { name: String::new(), actions: Vec::new() }],
            module_index: HashMap::new(),
            fragments: HashMap::new(),
            current_module: 0,
        }
    }

    fn run(&mut self, program: &Program) -> Result<TypedProgram, Vec<CompileError>> {
        // Pass 1: names.
        self.collect_record_names(program);
        self.collect_records(program);
        self.collect_signatures(program);
        self.collect_fragments(program);

        // Pass 2: bodies.
        let mut endpoint_defs: Vec<(&ServeDef, u16)> = Vec::new();
        for item in &program.items {
            if let StmtKind::Serve(def) = &item.kind {
                let record = self.register_request_record(def, endpoint_defs.len());
                endpoint_defs.push((def, record));
            }
        }

        let mut globals = Scope::new(true);
        let main = self.check_body(&program.items, &mut globals, BodyCtx::Main, true);

        let mut modules = Vec::new();
        for index in 0..self.modules.len() {
            modules.push(self.check_module_bodies(program, index as u16));
        }

        let mut endpoints = Vec::new();
        for (def, record) in endpoint_defs {
            endpoints.push(self.check_endpoint(def, record));
        }

        let uis = self.check_ui(program);

        if self.errors.is_empty() {
            Ok(TypedProgram {
                metadata: program.metadata.clone(),
                records: std::mem::take(&mut self.records),
                modules,
                endpoints,
                uis,
                main,
                globals: globals.next,
            })
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    // ── Pass 1: collection ───────────────────────────────────────

    fn data_defs<'a>(program: &'a Program) -> Vec<&'a DataDef> {
        let mut defs = Vec::new();
        for item in &program.items {
            match &item.kind {
                StmtKind::Data(def) => defs.push(def),
                StmtKind::Module(module) => {
                    for inner in &module.body {
                        if let StmtKind::Data(def) = &inner.kind {
                            defs.push(def);
                        }
                    }
                }
                _ => {}
            }
        }
        defs
    }

    fn collect_record_names(&mut self, program: &Program) {
        for def in Self::data_defs(program) {
            if self.record_index.contains_key(&def.name) {
                self.errors.push(CompileError::type_error(
                    "duplicate_record",
                    format!("data type `{}` is defined more than once", def.name),
                    def.span,
                ));
                continue;
            }
            let index = self.records.len() as u16;
            self.record_index.insert(def.name.clone(), index);
            self.records.push(TypedRecord {
                name: def.name.clone(),
                fields: Vec::new(),
                internal: false,
            });
        }
    }

    fn collect_records(&mut self, program: &Program) {
        for def in Self::data_defs(program) {
            let Some(&index) = self.record_index.get(&def.name) else { continue };
            let mut fields = Vec::new();
            let mut seen = HashSet::new();
            for field in &def.fields {
                if !seen.insert(field.name.clone()) {
                    self.errors.push(CompileError::type_error(
                        "duplicate_field",
                        format!("field `{}` is declared twice", field.name),
                        field.span,
                    ));
                    continue;
                }
                self.validate_ty(&field.ty, field.span);
                let mut typed = TypedField {
                    name: field.name.clone(),
                    ty: field.ty.clone(),
                    key: false,
                    auto: false,
                    required: false,
                    optional: false,
                    unique: false,
                    default: None,
                };
                for annotation in &field.annotations {
                    match annotation {
                        FieldAnnotation::Key => typed.key = true,
                        FieldAnnotation::Auto => typed.auto = true,
                        FieldAnnotation::Required => typed.required = true,
                        FieldAnnotation::Optional => typed.optional = true,
                        FieldAnnotation::Unique => typed.unique = true,
                        FieldAnnotation::Default(expr) => {
                            typed.default = self.literal_of(expr, &field.ty, field.span);
                        }
                    }
                }
                if typed.auto && !matches!(field.ty, Ty::Text | Ty::Date) {
                    self.errors.push(CompileError::type_error(
                        "bad_annotation",
                        format!(
                            "`auto` applies to text keys and date fields, not `{}`",
                            field.ty
                        ),
                        field.span,
                    ));
                }
                fields.push(typed);
            }
            self.records[index as usize].fields = fields;
        }
    }

    fn literal_of(&mut self, expr: &Expr, ty: &Ty, span: Span) -> Option<Lit> {
        let lit = match (&expr.kind, ty) {
            (ExprKind::IntLit(v), Ty::Int) => Lit::Int(*v),
            (ExprKind::DecimalLit(v), Ty::Decimal) => Lit::Decimal(*v),
            (ExprKind::TextLit(s), Ty::Text | Ty::Date | Ty::File) => Lit::Text(s.clone()),
            (ExprKind::FlagLit(b), Ty::Flag) => Lit::Flag(*b),
            _ => {
                self.errors.push(CompileError::type_error(
                    "bad_annotation",
                    format!("default value must be a `{ty}` literal"),
                    span,
                ));
                return None;
            }
        };
        Some(lit)
    }

    fn collect_signatures(&mut self, program: &Program) {
        for item in &program.items {
            match &item.kind {
                StmtKind::Action(def) => {
                    let sig = self.action_sig(def);
                    self.add_action(0, sig, def.span);
                }
                StmtKind::Module(module) => {
                    if self.module_index.contains_key(&module.name) {
                        self.errors.push(CompileError::resolve(
                            "duplicate_module",
                            format!("module `{}` is defined more than once", module.name),
                            module.span,
                        ));
                        continue;
                    }
                    let index = self.modules.len() as u16;
                    self.module_index.insert(module.name.clone(), index);
                    self.modules.push(ModuleSig {
                        name: module.name.clone(),
                        actions: Vec::new(),
                    });
                    for inner in &module.body {
                        match &inner.kind {
                            StmtKind::Action(def) => {
                                let sig = self.action_sig(def);
                                self.add_action(index, sig, def.span);
                            }
                            StmtKind::Data(_) => {}
                            _ => self.errors.push(CompileError::type_error(
                                "misplaced_statement",
                                "only action, task and data declarations are allowed inside a module",
                                inner.span,
                            )),
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn action_sig(&mut self, def: &crate::ast::ActionDef) -> ActionSig {
        for param in &def.params {
            self.validate_ty(&param.ty, param.span);
        }
        if let Some(gives) = &def.gives {
            self.validate_ty(gives, def.span);
        }
        ActionSig {
            name: def.name.clone(),
            params: def.params.iter().map(|p| (p.name.clone(), p.ty.clone())).collect(),
            gives: def.gives.clone(),
            is_task: def.is_task,
        }
    }

    fn add_action(&mut self, module: u16, sig: ActionSig, span: Span) {
        let actions = &mut self.modules[module as usize].actions;
        if actions.iter().any(|a| a.name == sig.name) {
            self.errors.push(CompileError::type_error(
                "duplicate_action",
                format!("action `{}` is defined more than once in this module", sig.name),
                span,
            ));
            return;
        }
        actions.push(sig);
    }

    fn collect_fragments(&mut self, program: &Program) {
        for item in &program.items {
            if let StmtKind::Ui(UiElement::Fragment(def)) = &item.kind {
                let mut slots = Vec::new();
                Self::slot_names(&def.body, &mut slots);
                let mut unique = HashSet::new();
                for slot in &slots {
                    if !unique.insert(slot.clone()) {
                        self.errors.push(CompileError::type_error(
                            "duplicate_slot",
                            format!("slot `{slot}` is declared twice in fragment `{}`", def.name),
                            def.span,
                        ));
                    }
                }
                if self.fragments.insert(def.name.clone(), slots).is_some() {
                    self.errors.push(CompileError::type_error(
                        "duplicate_fragment",
                        format!("fragment `{}` is defined more than once", def.name),
                        def.span,
                    ));
                }
            }
        }
    }

    fn slot_names(nodes: &[UiNode], out: &mut Vec<String>) {
        for node in nodes {
            match node {
                UiNode::Slot { name, .. } => out.push(name.clone()),
                UiNode::Layout { children, .. } => Self::slot_names(children, out),
                _ => {}
            }
        }
    }

    fn register_request_record(&mut self, def: &ServeDef, index: usize) -> u16 {
        let mut fields: Vec<TypedField> = def
            .path_params
            .iter()
            .map(|p| TypedField {
                name: p.clone(),
                ty: Ty::Text,
                key: false,
                auto: false,
                required: true,
                optional: false,
                unique: false,
                default: None,
            })
            .collect();
        fields.push(TypedField {
            name: "body".into(),
            ty: Ty::Text,
            key: false,
            auto: false,
            required: false,
            optional: true,
            unique: false,
            default: None,
        });
        let record_index = self.records.len() as u16;
        let name = format!("$request{index}");
        self.record_index.insert(name.clone(), record_index);
        self.records.push(TypedRecord { name, fields, internal: true });
        record_index
    }

    fn response_record(&mut self) -> u16 {
        if let Some(&index) = self.record_index.get("$response") {
            return index;
        }
        let index = self.records.len() as u16;
        self.record_index.insert("$response".into(), index);
        self.records.push(TypedRecord {
            name: "$response".into(),
            fields: vec![
                TypedField {
                    name: "status".into(),
                    ty: Ty::Int,
                    key: false,
                    auto: false,
                    required: true,
                    optional: false,
                    unique: false,
                    default: None,
                },
                TypedField {
                    name: "body".into(),
                    ty: Ty::Text,
                    key: false,
                    auto: false,
                    required: false,
                    optional: true,
                    unique: false,
                    default: None,
                },
            ],
            internal: true,
        });
        index
    }

    fn validate_ty(&mut self, ty: &Ty, span: Span) {
        match ty {
            Ty::Record(name) => {
                if !self.record_index.contains_key(name) {
                    self.errors.push(CompileError::type_error(
                        "unknown_type",
                        format!("unknown data type `{name}`"),
                        span,
                    ));
                }
            }
            Ty::List(inner) | Ty::Group(inner) => self.validate_ty(inner, span),
            _ => {}
        }
    }

    // ── Pass 2: bodies ───────────────────────────────────────────

    fn check_module_bodies(&mut self, program: &Program, module: u16) -> TypedModule {
        self.current_module = module;
        let mut actions = Vec::new();

        let defs: Vec<&crate::ast::ActionDef> = if module == 0 {
            program
                .items
                .iter()
                .filter_map(|s| match &s.kind {
                    StmtKind::Action(def) => Some(def),
                    _ => None,
                })
                .collect()
        } else {
            let name = self.modules[module as usize].name.clone();
            program
                .items
                .iter()
                .find_map(|s| match &s.kind {
                    StmtKind::Module(m) if m.name == name => Some(m),
                    _ => None,
                })
                .map(|m| {
                    m.body
                        .iter()
                        .filter_map(|s| match &s.kind {
                            StmtKind::Action(def) => Some(def),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        for def in defs {
            // Skip bodies whose signature failed to register (duplicates).
            if !self.modules[module as usize].actions.iter().any(|a| a.name == def.name) {
                continue;
            }
            let mut scope = Scope::new(false);
            for param in &def.params {
                scope.declare(&param.name, param.ty.clone());
            }
            let ctx = BodyCtx::Action { gives: def.gives.as_ref(), is_task: def.is_task };
            let body = self.check_body(&def.body, &mut scope, ctx, false);

            if let Some(gives) = &def.gives {
                if !Self::always_gives(&body) {
                    self.errors.push(CompileError::type_error(
                        "missing_give",
                        format!("action `{}` must `give` a {gives} on every path", def.name),
                        def.span,
                    ));
                }
            }

            actions.push(TypedAction {
                name: def.name.clone(),
                params: def.params.iter().map(|p| (p.name.clone(), p.ty.clone())).collect(),
                gives: def.gives.clone(),
                is_task: def.is_task,
                locals: scope.next,
                body,
            });
        }

        self.current_module = 0;
        TypedModule { name: self.modules[module as usize].name.clone(), actions }
    }

    /// Conservative reachability: the body ends in a `give`, or in a
    /// `when` chain whose arms and `otherwise` all do.
    fn always_gives(body: &[TypedStmt]) -> bool {
        match body.last().map(|s| &s.kind) {
            Some(TypedStmtKind::Give(Some(_))) => true,
            Some(TypedStmtKind::When { arms, otherwise: Some(otherwise) }) => {
                arms.iter().all(|(_, b)| Self::always_gives(b)) && Self::always_gives(otherwise)
            }
            _ => false,
        }
    }

    fn check_endpoint(&mut self, def: &ServeDef, record: u16) -> TypedEndpoint {
        let mut scope = Scope::new(false);
        scope.declare("request", Ty::Record(self.records[record as usize].name.clone()));
        for param in &def.path_params {
            scope.declare(param, Ty::Text);
        }
        let body = self.check_body(&def.body, &mut scope, BodyCtx::Endpoint, false);
        TypedEndpoint {
            method: def.method,
            path: def.path.clone(),
            path_params: def.path_params.clone(),
            request_record: record,
            locals: scope.next,
            body,
        }
    }

    fn check_body(
        &mut self,
        stmts: &[Stmt],
        scope: &mut Scope,
        ctx: BodyCtx<'_>,
        top_level: bool,
    ) -> Vec<TypedStmt> {
        let mut out = Vec::new();
        for stmt in stmts {
            match self.check_stmt(stmt, scope, ctx, top_level) {
                Ok(Some(typed)) => out.push(typed),
                Ok(None) => {}
                Err(e) => self.errors.push(e),
            }
        }
        out
    }

    #[allow(clippy::too_many_lines)]
    fn check_stmt(
        &mut self,
        stmt: &Stmt,
        scope: &mut Scope,
        ctx: BodyCtx<'_>,
        top_level: bool,
    ) -> Result<Option<TypedStmt>, CompileError> {
        let span = stmt.span;
        let kind = match &stmt.kind {
            // Declarations were collected in pass 1.
            StmtKind::Action(_)
            | StmtKind::Module(_)
            | StmtKind::Data(_)
            | StmtKind::Serve(_)
            | StmtKind::Ui(_) => {
                if !top_level {
                    return Err(CompileError::type_error(
                        "misplaced_statement",
                        "declarations are only allowed at the top level",
                        span,
                    ));
                }
                return Ok(None);
            }

            StmtKind::Display(expr) => {
                let value = self.check_expr(expr, scope, None)?;
                TypedStmtKind::Display(value)
            }

            StmtKind::Set { name, declared, value } => {
                self.check_set(name, declared.as_ref(), value, scope, span)?
            }

            StmtKind::SetFrom { name, declared, call } => {
                let typed_call = self.check_action_call(call, scope)?;
                let TypedExprKind::Call { returns, .. } = &typed_call.kind else {
                    unreachable!("action call checks to a call expression");
                };
                if returns.is_none() {
                    return Err(CompileError::type_error(
                        "no_value",
                        "this task gives no value; use `run` instead of `set ... from`",
                        span,
                    ));
                }
                self.store(name, declared.as_ref(), typed_call, scope, span)?
            }

            StmtKind::When { arms, otherwise } => {
                let mut typed_arms = Vec::new();
                for arm in arms {
                    let cond = self.check_condition(&arm.cond, scope)?;
                    scope.push();
                    let body = self.check_body(&arm.body, scope, ctx, false);
                    scope.pop();
                    typed_arms.push((cond, body));
                }
                let typed_otherwise = otherwise.as_ref().map(|body| {
                    scope.push();
                    let typed = self.check_body(body, scope, ctx, false);
                    scope.pop();
                    typed
                });
                TypedStmtKind::When { arms: typed_arms, otherwise: typed_otherwise }
            }

            StmtKind::While { cond, body } => {
                let cond = self.check_condition(cond, scope)?;
                scope.push();
                let body = self.check_body(body, scope, ctx, false);
                scope.pop();
                TypedStmtKind::While { cond, body }
            }

            StmtKind::ForEach { var, iterable, body } => {
                let iterable = self.check_expr(iterable, scope, None)?;
                let element = iterable.ty.element().ok_or_else(|| {
                    CompileError::type_error(
                        "not_iterable",
                        format!("cannot iterate a value of type `{}`", iterable.ty),
                        span,
                    )
                })?;
                scope.push();
                let slot = scope.declare(var, element);
                let body = self.check_body(body, scope, ctx, false);
                scope.pop();
                TypedStmtKind::ForEach { slot, iterable, body }
            }

            StmtKind::Give(value) => match ctx {
                BodyCtx::Action { gives: Some(gives), .. } => {
                    let Some(value) = value else {
                        return Err(CompileError::type_error(
                            "missing_give",
                            format!("this action must give a {gives}"),
                            span,
                        ));
                    };
                    let typed = self.check_expr(value, scope, Some(gives))?;
                    if !typed.ty.compatible_with(gives) {
                        return Err(CompileError::type_error(
                            "incompatible_give",
                            format!("action gives {gives}, but this value is {}", typed.ty),
                            span,
                        ));
                    }
                    TypedStmtKind::Give(Some(typed))
                }
                BodyCtx::Action { gives: None, .. } => {
                    if value.is_some() {
                        return Err(CompileError::type_error(
                            "task_gives",
                            "a task gives no value; drop the expression or declare `gives`",
                            span,
                        ));
                    }
                    TypedStmtKind::Give(None)
                }
                _ => {
                    return Err(CompileError::type_error(
                        "give_outside_action",
                        "`give` is only valid inside an action or task",
                        span,
                    ));
                }
            },

            StmtKind::Run(call) => {
                let typed_call = self.check_action_call(call, scope)?;
                let discard = matches!(
                    &typed_call.kind,
                    TypedExprKind::Call { returns: Some(_), .. }
                );
                TypedStmtKind::CallStmt { call: typed_call, discard }
            }

            StmtKind::Database(db) => TypedStmtKind::Database(self.check_db(db, scope)?),

            StmtKind::Respond { status, body } => {
                if !matches!(ctx, BodyCtx::Endpoint) {
                    return Err(CompileError::type_error(
                        "respond_outside_endpoint",
                        "`respond` is only valid inside a `serve` handler",
                        span,
                    ));
                }
                let status = self.check_expr(status, scope, Some(&Ty::Int))?;
                if status.ty != Ty::Int {
                    return Err(CompileError::type_error(
                        "bad_status",
                        format!("response status must be int, found {}", status.ty),
                        span,
                    ));
                }
                let body = match body {
                    Some(expr) => {
                        let typed = self.check_expr(expr, scope, Some(&Ty::Text))?;
                        if typed.ty != Ty::Text {
                            return Err(CompileError::type_error(
                                "bad_response_body",
                                format!("response body must be text, found {}", typed.ty),
                                span,
                            ));
                        }
                        Some(typed)
                    }
                    None => None,
                };
                TypedStmtKind::Respond { status, body }
            }

            StmtKind::HttpCall(call) => {
                let url = self.check_expr(&call.url, scope, Some(&Ty::Text))?;
                if url.ty != Ty::Text {
                    return Err(CompileError::type_error(
                        "bad_url",
                        format!("call URL must be text, found {}", url.ty),
                        span,
                    ));
                }
                let body = match &call.body {
                    Some(expr) => Some(self.check_expr(expr, scope, None)?),
                    None => None,
                };
                let mut headers = Vec::new();
                for (name, value) in &call.headers {
                    let typed = self.check_expr(value, scope, Some(&Ty::Text))?;
                    if typed.ty != Ty::Text {
                        return Err(CompileError::type_error(
                            "bad_header",
                            format!("header `{name}` must be text, found {}", typed.ty),
                            span,
                        ));
                    }
                    headers.push((name.clone(), typed));
                }

                let response_record = self.response_record();
                let response_ty = Ty::Record(self.records[response_record as usize].name.clone());
                let into = self.declare_or_check(&call.into, response_ty, scope, span)?;
                TypedStmtKind::HttpCall { url, method: call.method, body, headers, into }
            }
        };
        Ok(Some(TypedStmt { kind, span }))
    }

    fn check_set(
        &mut self,
        name: &str,
        declared: Option<&Ty>,
        value: &Expr,
        scope: &mut Scope,
        span: Span,
    ) -> Result<TypedStmtKind, CompileError> {
        let expected = declared.cloned().or_else(|| scope.lookup(name).map(|(ty, _)| ty));
        let typed = self.check_expr(value, scope, expected.as_ref())?;
        self.store(name, declared, typed, scope, span)
    }

    fn store(
        &mut self,
        name: &str,
        declared: Option<&Ty>,
        value: TypedExpr,
        scope: &mut Scope,
        span: Span,
    ) -> Result<TypedStmtKind, CompileError> {
        if let Some((existing, slot)) = scope.lookup(name) {
            if declared.is_some() {
                return Err(CompileError::type_error(
                    "duplicate_declaration",
                    format!("`{name}` is already declared; assign without `which is`"),
                    span,
                ));
            }
            if !value.ty.compatible_with(&existing) {
                return Err(CompileError::type_error(
                    "incompatible_assignment",
                    format!("`{name}` is {existing}, cannot assign {}", value.ty),
                    span,
                ));
            }
            return Ok(TypedStmtKind::Store { slot, value });
        }

        let var_ty = match declared {
            Some(ty) => {
                self.validate_ty(ty, span);
                if !value.ty.compatible_with(ty) {
                    return Err(CompileError::type_error(
                        "incompatible_assignment",
                        format!("`{name}` is declared {ty}, but the value is {}", value.ty),
                        span,
                    ));
                }
                ty.clone()
            }
            None => value.ty.clone(),
        };
        let slot = scope.declare(name, var_ty);
        Ok(TypedStmtKind::Store { slot, value })
    }

    fn declare_or_check(
        &mut self,
        name: &str,
        ty: Ty,
        scope: &mut Scope,
        span: Span,
    ) -> Result<VarSlot, CompileError> {
        if let Some((existing, slot)) = scope.lookup(name) {
            if !ty.compatible_with(&existing) {
                return Err(CompileError::type_error(
                    "incompatible_assignment",
                    format!("`{name}` is {existing}, cannot assign {ty}"),
                    span,
                ));
            }
            Ok(slot)
        } else {
            Ok(scope.declare(name, ty))
        }
    }

    fn check_condition(
        &mut self,
        expr: &Expr,
        scope: &mut Scope,
    ) -> Result<TypedExpr, CompileError> {
        let typed = self.check_expr(expr, scope, Some(&Ty::Flag))?;
        if typed.ty != Ty::Flag {
            return Err(CompileError::type_error(
                "condition_not_flag",
                format!("condition must be a flag, found {}", typed.ty),
                typed.span,
            ));
        }
        Ok(typed)
    }

    // ── Expressions ──────────────────────────────────────────────

    #[allow(clippy::too_many_lines)]
    fn check_expr(
        &mut self,
        expr: &Expr,
        scope: &mut Scope,
        expected: Option<&Ty>,
    ) -> Result<TypedExpr, CompileError> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::IntLit(v) => {
                Ok(TypedExpr { kind: TypedExprKind::Int(*v), ty: Ty::Int, span })
            }
            ExprKind::DecimalLit(v) => {
                Ok(TypedExpr { kind: TypedExprKind::Decimal(*v), ty: Ty::Decimal, span })
            }
            ExprKind::TextLit(s) => {
                // Date and file literals are text in date/file positions.
                let ty = match expected {
                    Some(Ty::Date) => Ty::Date,
                    Some(Ty::File) => Ty::File,
                    _ => Ty::Text,
                };
                Ok(TypedExpr { kind: TypedExprKind::Text(s.clone()), ty, span })
            }
            ExprKind::FlagLit(b) => {
                Ok(TypedExpr { kind: TypedExprKind::Flag(*b), ty: Ty::Flag, span })
            }

            ExprKind::Interp(parts) => {
                let mut typed_parts = Vec::new();
                for part in parts {
                    match part {
                        InterpPart::Lit(text) => typed_parts.push(TypedInterpPart::Lit(text.clone())),
                        InterpPart::Expr(inner) => {
                            let typed = self.check_expr(inner, scope, None)?;
                            typed_parts.push(TypedInterpPart::Expr(typed));
                        }
                    }
                }
                Ok(TypedExpr { kind: TypedExprKind::Interp(typed_parts), ty: Ty::Text, span })
            }

            ExprKind::ListLit(elements) => {
                let (kind, expected_elem) = match expected {
                    Some(Ty::Group(elem)) => (CollKind::Group, Some((**elem).clone())),
                    Some(Ty::List(elem)) => (CollKind::List, Some((**elem).clone())),
                    _ => (CollKind::List, None),
                };
                let mut typed_elements = Vec::new();
                let mut elem_ty = expected_elem;
                for element in elements {
                    let typed = self.check_expr(element, scope, elem_ty.as_ref())?;
                    match &elem_ty {
                        Some(t) if !typed.ty.compatible_with(t) => {
                            return Err(CompileError::type_error(
                                "mixed_collection",
                                format!("collection of {t} cannot hold {}", typed.ty),
                                typed.span,
                            ));
                        }
                        None => elem_ty = Some(typed.ty.clone()),
                        _ => {}
                    }
                    typed_elements.push(typed);
                }
                let Some(elem_ty) = elem_ty else {
                    return Err(CompileError::type_error(
                        "cannot_infer",
                        "empty collection needs a declared type (`which are list of ...`)",
                        span,
                    ));
                };
                let ty = match kind {
                    CollKind::List => Ty::List(Box::new(elem_ty)),
                    CollKind::Group => Ty::Group(Box::new(elem_ty)),
                };
                Ok(TypedExpr {
                    kind: TypedExprKind::MakeCollection { kind, elements: typed_elements },
                    ty,
                    span,
                })
            }

            ExprKind::Ident(name) => {
                let (ty, slot) = scope.lookup(name).ok_or_else(|| {
                    CompileError::type_error(
                        "unknown_identifier",
                        format!("`{name}` is not declared"),
                        span,
                    )
                })?;
                Ok(TypedExpr { kind: TypedExprKind::Load(slot), ty, span })
            }

            ExprKind::Property { object, field } => {
                let typed_obj = self.check_expr(object, scope, None)?;
                let Ty::Record(record_name) = &typed_obj.ty else {
                    return Err(CompileError::type_error(
                        "no_fields",
                        format!("values of type `{}` have no fields", typed_obj.ty),
                        span,
                    ));
                };
                let &record = self.record_index.get(record_name).ok_or_else(|| {
                    CompileError::type_error(
                        "unknown_type",
                        format!("unknown data type `{record_name}`"),
                        span,
                    )
                })?;
                let schema = &self.records[record as usize];
                let field_index = schema.field_index(field).ok_or_else(|| {
                    CompileError::type_error(
                        "unknown_field",
                        format!("`{record_name}` has no field `{field}`"),
                        span,
                    )
                })?;
                let ty = schema.fields[field_index as usize].ty.clone();
                Ok(TypedExpr {
                    kind: TypedExprKind::GetField {
                        object: Box::new(typed_obj),
                        record,
                        field: field_index,
                    },
                    ty,
                    span,
                })
            }

            ExprKind::Binary { op, left, right } => self.check_binary(*op, left, right, scope, span),

            ExprKind::Unary { op, operand } => {
                let typed = self.check_expr(operand, scope, None)?;
                match op {
                    UnOp::Neg if !typed.ty.is_numeric() => Err(CompileError::type_error(
                        "bad_operand",
                        format!("cannot negate a value of type `{}`", typed.ty),
                        span,
                    )),
                    UnOp::Not if typed.ty != Ty::Flag => Err(CompileError::type_error(
                        "bad_operand",
                        format!("`not` needs a flag, found `{}`", typed.ty),
                        span,
                    )),
                    _ => {
                        let ty = typed.ty.clone();
                        Ok(TypedExpr {
                            kind: TypedExprKind::Unary { op: *op, operand: Box::new(typed) },
                            ty,
                            span,
                        })
                    }
                }
            }

            ExprKind::Format { value, pattern } => {
                let typed = self.check_expr(value, scope, None)?;
                if !format::validate(&typed.ty, pattern) {
                    return Err(CompileError::type_error(
                        "bad_format",
                        format!("pattern \"{pattern}\" does not apply to `{}` values", typed.ty),
                        span,
                    ));
                }
                Ok(TypedExpr {
                    kind: TypedExprKind::Format {
                        value: Box::new(typed),
                        pattern: pattern.clone(),
                    },
                    ty: Ty::Text,
                    span,
                })
            }

            ExprKind::ActionCall { .. } => self.check_action_call(expr, scope),

            ExprKind::IsEmpty { operand, negated } => {
                let typed = self.check_expr(operand, scope, None)?;
                if !typed.ty.is_collection() && typed.ty != Ty::Text {
                    return Err(CompileError::type_error(
                        "bad_operand",
                        format!("`is empty` applies to collections and text, found `{}`", typed.ty),
                        span,
                    ));
                }
                Ok(TypedExpr {
                    kind: TypedExprKind::IsEmpty { operand: Box::new(typed), negated: *negated },
                    ty: Ty::Flag,
                    span,
                })
            }
        }
    }

    fn check_binary(
        &mut self,
        op: BinOp,
        left: &Expr,
        right: &Expr,
        scope: &mut Scope,
        span: Span,
    ) -> Result<TypedExpr, CompileError> {
        let left = self.check_expr(left, scope, None)?;
        let right = self.check_expr(right, scope, None)?;

        match op {
            BinOp::Add if left.ty == Ty::Text && right.ty == Ty::Text => Ok(TypedExpr {
                kind: TypedExprKind::Concat { left: Box::new(left), right: Box::new(right) },
                ty: Ty::Text,
                span,
            }),

            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                let operand_ty = self.numeric_operands(&left, &right, span)?;
                Ok(TypedExpr {
                    kind: TypedExprKind::Binary {
                        op,
                        operand_ty: operand_ty.clone(),
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    ty: operand_ty,
                    span,
                })
            }

            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let operand_ty = self.numeric_operands(&left, &right, span)?;
                Ok(TypedExpr {
                    kind: TypedExprKind::Binary {
                        op,
                        operand_ty,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    ty: Ty::Flag,
                    span,
                })
            }

            BinOp::Eq | BinOp::Ne => {
                let operand_ty = if left.ty.is_numeric() && right.ty.is_numeric() {
                    if left.ty == Ty::Decimal || right.ty == Ty::Decimal {
                        Ty::Decimal
                    } else {
                        Ty::Int
                    }
                } else if left.ty == right.ty {
                    left.ty.clone()
                } else {
                    return Err(CompileError::type_error(
                        "bad_operand",
                        format!("cannot compare `{}` with `{}`", left.ty, right.ty),
                        span,
                    ));
                };
                Ok(TypedExpr {
                    kind: TypedExprKind::Binary {
                        op,
                        operand_ty,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    ty: Ty::Flag,
                    span,
                })
            }

            BinOp::And | BinOp::Or => {
                if left.ty != Ty::Flag || right.ty != Ty::Flag {
                    return Err(CompileError::type_error(
                        "bad_operand",
                        format!(
                            "`{}` needs flag operands, found `{}` and `{}`",
                            if op == BinOp::And { "and" } else { "or" },
                            left.ty,
                            right.ty
                        ),
                        span,
                    ));
                }
                Ok(TypedExpr {
                    kind: TypedExprKind::Binary {
                        op,
                        operand_ty: Ty::Flag,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    ty: Ty::Flag,
                    span,
                })
            }
        }
    }

    /// Arithmetic is closed over int; mixed int/decimal promotes to
    /// decimal (the VM multiplies the int operand by 100).
    fn numeric_operands(
        &mut self,
        left: &TypedExpr,
        right: &TypedExpr,
        span: Span,
    ) -> Result<Ty, CompileError> {
        if !left.ty.is_numeric() || !right.ty.is_numeric() {
            return Err(CompileError::type_error(
                "bad_operand",
                format!("arithmetic needs numbers, found `{}` and `{}`", left.ty, right.ty),
                span,
            ));
        }
        if left.ty == Ty::Decimal || right.ty == Ty::Decimal {
            Ok(Ty::Decimal)
        } else {
            Ok(Ty::Int)
        }
    }

    fn check_action_call(
        &mut self,
        expr: &Expr,
        scope: &mut Scope,
    ) -> Result<TypedExpr, CompileError> {
        let span = expr.span;
        let ExprKind::ActionCall { module, action, args } = &expr.kind else {
            return Err(CompileError::type_error(
                "not_callable",
                "expected an action call",
                span,
            ));
        };

        let (module_index, action_index) = self.resolve_action(module.as_deref(), action, span)?;
        let sig = &self.modules[module_index as usize].actions[action_index as usize];
        let params = sig.params.clone();
        let returns = sig.gives.clone();

        if args.len() != params.len() {
            return Err(CompileError::type_error(
                "arity",
                format!(
                    "`{action}` expects {} argument{}, found {}",
                    params.len(),
                    if params.len() == 1 { "" } else { "s" },
                    args.len()
                ),
                span,
            ));
        }

        let mut typed_args = Vec::new();
        for (arg, (pname, pty)) in args.iter().zip(&params) {
            let typed = self.check_expr(arg, scope, Some(pty))?;
            if !typed.ty.compatible_with(pty) {
                return Err(CompileError::type_error(
                    "incompatible_argument",
                    format!("parameter `{pname}` is {pty}, found {}", typed.ty),
                    typed.span,
                ));
            }
            typed_args.push(typed);
        }

        let ty = returns.clone().unwrap_or(Ty::Flag);
        Ok(TypedExpr {
            kind: TypedExprKind::Call {
                module: module_index,
                action: action_index,
                args: typed_args,
                returns,
            },
            ty,
            span,
        })
    }

    fn resolve_action(
        &self,
        module: Option<&str>,
        action: &str,
        span: Span,
    ) -> Result<(u16, u16), CompileError> {
        let search: Vec<u16> = match module {
            Some(name) => {
                let &index = self.module_index.get(name).ok_or_else(|| {
                    CompileError::type_error(
                        "unknown_module",
                        format!("unknown module `{name}`"),
                        span,
                    )
                })?;
                vec![index]
            }
            None => {
                if self.current_module != 0 {
                    vec![self.current_module, 0]
                } else {
                    vec![0]
                }
            }
        };

        for module_index in search {
            if let Some(pos) = self.modules[module_index as usize]
                .actions
                .iter()
                .position(|a| a.name == action)
            {
                return Ok((module_index, pos as u16));
            }
        }
        Err(CompileError::type_error(
            "unknown_action",
            format!("unknown action `{action}`"),
            span,
        ))
    }

    // ── Database statements ──────────────────────────────────────

    fn check_db(
        &mut self,
        db: &crate::ast::DbStmt,
        scope: &mut Scope,
    ) -> Result<TypedDb, CompileError> {
        let span = db.span;
        let entity = match self.record_index.get(&db.entity) {
            Some(&index) if !self.records[index as usize].internal => index,
            _ => {
                return Err(CompileError::type_error(
                    "unknown_type",
                    format!("unknown data type `{}`", db.entity),
                    span,
                ));
            }
        };

        if db.op != DbOp::Create && !db.with.is_empty() {
            return Err(CompileError::type_error(
                "bad_database_op",
                "`with` field values only apply to `db create`",
                span,
            ));
        }
        if db.op == DbOp::Create && db.where_cond.is_some() {
            return Err(CompileError::type_error(
                "bad_database_op",
                "`where` does not apply to `db create`",
                span,
            ));
        }
        if db.op != DbOp::Update && !db.set.is_empty() {
            return Err(CompileError::type_error(
                "bad_database_op",
                "`set` field values only apply to `db update`",
                span,
            ));
        }

        let create = if db.op == DbOp::Create {
            self.check_create_fields(entity, &db.with, scope, span)?
        } else {
            Vec::new()
        };

        let predicate = match &db.where_cond {
            Some(cond) => self.flatten_predicate(entity, cond, scope)?,
            None => Vec::new(),
        };

        let mut set = Vec::new();
        for (field, value) in &db.set {
            let field_ty = self.entity_field_ty(entity, field, span)?;
            let typed = self.check_expr(value, scope, Some(&field_ty))?;
            if !typed.ty.compatible_with(&field_ty) {
                return Err(CompileError::type_error(
                    "incompatible_assignment",
                    format!("field `{field}` is {field_ty}, found {}", typed.ty),
                    typed.span,
                ));
            }
            set.push((field.clone(), typed));
        }

        let into = match &db.into {
            Some(name) => {
                let entity_name = self.records[entity as usize].name.clone();
                let result_ty = match db.op {
                    DbOp::Create | DbOp::Find => Ty::Record(entity_name),
                    DbOp::FindAll => Ty::List(Box::new(Ty::Record(entity_name))),
                    DbOp::Update | DbOp::Delete => Ty::Int,
                };
                Some(self.declare_or_check(name, result_ty, scope, span)?)
            }
            None => None,
        };

        Ok(TypedDb { op: db.op, entity, create, predicate, set, into })
    }

    fn entity_field_ty(&self, entity: u16, field: &str, span: Span) -> Result<Ty, CompileError> {
        let schema = &self.records[entity as usize];
        schema
            .fields
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.ty.clone())
            .ok_or_else(|| {
                CompileError::type_error(
                    "unknown_field",
                    format!("`{}` has no field `{field}`", schema.name),
                    span,
                )
            })
    }

    /// Build the full field-initializer list for `db create`, in schema
    /// order: explicit value, `auto` fill, declared default, or an error.
    fn check_create_fields(
        &mut self,
        entity: u16,
        with: &[(String, Expr)],
        scope: &mut Scope,
        span: Span,
    ) -> Result<Vec<FieldInit>, CompileError> {
        let schema_fields = self.records[entity as usize].fields.clone();
        let entity_name = self.records[entity as usize].name.clone();

        let mut provided: HashMap<&str, &Expr> = HashMap::new();
        for (field, value) in with {
            if !schema_fields.iter().any(|f| f.name == *field) {
                return Err(CompileError::type_error(
                    "unknown_field",
                    format!("`{entity_name}` has no field `{field}`"),
                    span,
                ));
            }
            provided.insert(field.as_str(), value);
        }

        let mut inits = Vec::new();
        for field in &schema_fields {
            if let Some(value) = provided.get(field.name.as_str()) {
                let typed = self.check_expr(value, scope, Some(&field.ty))?;
                if !typed.ty.compatible_with(&field.ty) {
                    return Err(CompileError::type_error(
                        "incompatible_assignment",
                        format!("field `{}` is {}, found {}", field.name, field.ty, typed.ty),
                        typed.span,
                    ));
                }
                inits.push(FieldInit::Value(typed));
            } else if field.auto {
                inits.push(match field.ty {
                    Ty::Date => FieldInit::AutoNow,
                    _ => FieldInit::AutoUuid,
                });
            } else if let Some(default) = &field.default {
                inits.push(FieldInit::Default(default.clone()));
            } else if field.optional {
                let zero = Self::zero_lit(&field.ty).ok_or_else(|| {
                    CompileError::type_error(
                        "missing_field",
                        format!(
                            "optional field `{}` of type {} needs an explicit value or default",
                            field.name, field.ty
                        ),
                        span,
                    )
                })?;
                inits.push(FieldInit::Default(zero));
            } else {
                return Err(CompileError::type_error(
                    "missing_field",
                    format!("`db create {entity_name}` is missing field `{}`", field.name),
                    span,
                ));
            }
        }
        Ok(inits)
    }

    fn zero_lit(ty: &Ty) -> Option<Lit> {
        match ty {
            Ty::Int => Some(Lit::Int(0)),
            Ty::Decimal => Some(Lit::Decimal(0)),
            Ty::Text | Ty::Date | Ty::File => Some(Lit::Text(String::new())),
            Ty::Flag => Some(Lit::Flag(false)),
            _ => None,
        }
    }

    /// A predicate is comparisons over entity fields joined by `and`.
    fn flatten_predicate(
        &mut self,
        entity: u16,
        cond: &Expr,
        scope: &mut Scope,
    ) -> Result<Vec<(String, &'static str, TypedExpr)>, CompileError> {
        match &cond.kind {
            ExprKind::Binary { op: BinOp::And, left, right } => {
                let mut out = self.flatten_predicate(entity, left, scope)?;
                out.extend(self.flatten_predicate(entity, right, scope)?);
                Ok(out)
            }
            ExprKind::Binary { op, left, right } => {
                let cmp = match op {
                    BinOp::Eq => "eq",
                    BinOp::Ne => "ne",
                    BinOp::Lt => "lt",
                    BinOp::Le => "le",
                    BinOp::Gt => "gt",
                    BinOp::Ge => "ge",
                    _ => {
                        return Err(CompileError::type_error(
                            "bad_predicate",
                            "a `where` clause is field comparisons joined by `and`",
                            cond.span,
                        ));
                    }
                };
                let ExprKind::Ident(field) = &left.kind else {
                    return Err(CompileError::type_error(
                        "bad_predicate",
                        "the left side of a `where` comparison must be a field name",
                        left.span,
                    ));
                };
                let field_ty = self.entity_field_ty(entity, field, left.span)?;
                let typed = self.check_expr(right, scope, Some(&field_ty))?;
                if !typed.ty.compatible_with(&field_ty) {
                    return Err(CompileError::type_error(
                        "bad_predicate",
                        format!("field `{field}` is {field_ty}, found {}", typed.ty),
                        typed.span,
                    ));
                }
                Ok(vec![(field.clone(), cmp, typed)])
            }
            _ => Err(CompileError::type_error(
                "bad_predicate",
                "a `where` clause is field comparisons joined by `and`",
                cond.span,
            )),
        }
    }

    // ── UI ───────────────────────────────────────────────────────

    fn check_ui(&mut self, program: &Program) -> Vec<UiComponent> {
        let mut components = Vec::new();
        for item in &program.items {
            match &item.kind {
                StmtKind::Ui(UiElement::Fragment(def)) => {
                    components.push(UiComponent {
                        name: def.name.clone(),
                        kind: UiKind::Fragment,
                        nodes: def.body.clone(),
                    });
                }
                StmtKind::Ui(UiElement::Screen(def)) => {
                    self.check_screen_nodes(&def.body);
                    components.push(UiComponent {
                        name: def.name.clone(),
                        kind: UiKind::Screen,
                        nodes: def.body.clone(),
                    });
                }
                _ => {}
            }
        }
        components
    }

    fn check_screen_nodes(&mut self, nodes: &[UiNode]) {
        for node in nodes {
            match node {
                UiNode::UseFragment { fragment, fills, span } => {
                    let Some(slots) = self.fragments.get(fragment).cloned() else {
                        self.errors.push(CompileError::type_error(
                            "unknown_fragment",
                            format!("unknown fragment `{fragment}`"),
                            *span,
                        ));
                        continue;
                    };
                    let mut filled = HashSet::new();
                    for fill in fills {
                        if !slots.contains(&fill.slot) {
                            self.errors.push(CompileError::type_error(
                                "unknown_slot",
                                format!("fragment `{fragment}` has no slot `{}`", fill.slot),
                                fill.span,
                            ));
                        }
                        if !filled.insert(fill.slot.clone()) {
                            self.errors.push(CompileError::type_error(
                                "duplicate_slot",
                                format!("slot `{}` is filled twice", fill.slot),
                                fill.span,
                            ));
                        }
                        self.check_screen_nodes(&fill.content);
                    }
                }
                UiNode::Layout { children, .. } => self.check_screen_nodes(children),
                _ => {}
            }
        }
    }
}
