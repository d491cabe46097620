//! Bytecode emitter: lowers a checked program to a linear instruction
//! stream plus a constant pool and the artifact tables.
//!
//! Layout of the emitted stream: a load-time prologue of `DefineData` /
//! `DefineEndpoint` registrations, then the top-level statements, `Halt`,
//! then action bodies, then endpoint handler bodies. All jump operands are
//! absolute instruction indices.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::artifact::{
    ActionEntry, Artifact, ArtifactMetadata, EndpointEntry, FieldSchema, ModuleEntry, ParamEntry,
    RecordSchema,
};
use crate::ast::{BinOp, DbOp, Span, UiAttr, UiNode, UnOp};
use crate::error::CompileError;
use crate::host::HostFn;
use crate::typeck::{
    CollKind, FieldInit, Lit, TypedDb, TypedExpr, TypedExprKind, TypedInterpPart, TypedProgram,
    TypedStmt, TypedStmtKind, UiComponent, UiKind, VarSlot,
};
use crate::types::Ty;

/// The complete instruction set. Jump targets are instruction indices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // Stack
    PushConst(u16),
    Pop,
    Dup,

    // Variables
    LoadLocal(u16),
    StoreLocal(u16),
    LoadGlobal(u16),
    StoreGlobal(u16),

    // Arithmetic: integer and decimal variants. The decimal ops apply the
    // scale-100 rules and promote an int operand on the fly.
    AddI,
    SubI,
    MulI,
    DivI,
    AddD,
    SubD,
    MulD,
    DivD,
    Neg,

    // Comparison (polymorphic; the emitter knows the operand types)
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Logic (flag operands)
    And,
    Or,
    Not,

    // Control
    Jump(u32),
    JumpIfFalse(u32),
    JumpIfTrue(u32),

    // Strings
    Concat,
    /// Build a string from n stack values using their display rules.
    Interp(u8),
    /// Apply the format pattern at the given constant-pool index.
    Format(u16),

    // Collections
    MakeList(u16),
    MakeGroup(u16),
    IterBegin,
    /// Push the next element and continue, or jump to the operand when
    /// exhausted.
    IterNext(u32),
    Index,

    // Records
    MakeRecord(u16, u16),
    GetField(u16),
    SetField(u16),

    // Functions
    Call(u16, u16, u8),
    Return,
    EnterFrame(u16),
    LeaveFrame,

    // Display and host
    Display,
    HostCall(u8, u8),

    // Load-time registrations
    DefineData(u16),
    DefineEndpoint(u16),
    EndHandler,

    /// `(op code, entity schema index)`; predicate and field-set operands
    /// come from the stack.
    DatabaseOp(u8, u16),

    Halt,
}

/// A tagged constant-pool value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constant {
    Int(i32),
    Decimal(i64),
    Text(String),
    Flag(bool),
    Date(String),
    Pattern(String),
}

/// Non-source metadata the emitter stamps into the artifact.
pub struct EmitMeta {
    pub source_file: String,
    pub created_at: i64,
}

pub fn emit(program: &TypedProgram, meta: &EmitMeta) -> Result<Artifact, CompileError> {
    let mut emitter = Emitter::new();

    // Schema table: every record (internal ones included, so runtime
    // indices line up), then UI trees flattened to opaque schemas.
    let mut record_schemas: Vec<RecordSchema> = program
        .records
        .iter()
        .map(|record| RecordSchema {
            name: record.name.clone(),
            fields: record
                .fields
                .iter()
                .map(|field| FieldSchema {
                    name: field.name.clone(),
                    ty: field.ty.clone(),
                    annotations: field_annotations(field, record.internal),
                })
                .collect(),
        })
        .collect();
    let ui_base = record_schemas.len() as u16;
    for component in &program.uis {
        record_schemas.push(ui_schema(component));
    }

    // Load-time prologue: register data models and endpoints.
    for (index, record) in program.records.iter().enumerate() {
        if !record.internal {
            emitter.push(Op::DefineData(index as u16));
        }
    }
    for offset in 0..program.uis.len() {
        emitter.push(Op::DefineData(ui_base + offset as u16));
    }
    for index in 0..program.endpoints.len() {
        emitter.push(Op::DefineEndpoint(index as u16));
    }

    // Top-level statements.
    for stmt in &program.main {
        emitter.emit_stmt(stmt)?;
    }
    emitter.push(Op::Halt);

    // Action bodies.
    let mut modules = Vec::new();
    for module in &program.modules {
        let mut actions = Vec::new();
        for action in &module.actions {
            let entry = emitter.here();
            emitter.push(Op::EnterFrame(action.locals));
            for stmt in &action.body {
                emitter.emit_stmt(stmt)?;
            }
            if action.gives.is_none() {
                emitter.push(Op::LeaveFrame);
            }
            actions.push(ActionEntry {
                name: action.name.clone(),
                params: action
                    .params
                    .iter()
                    .map(|(name, ty)| ParamEntry { name: name.clone(), ty: ty.clone() })
                    .collect(),
                returns: action.gives.clone(),
                entry,
                locals: action.locals,
            });
        }
        modules.push(ModuleEntry { name: module.name.clone(), actions });
    }

    // Endpoint handler bodies. Slot 0 holds the request record; path
    // parameters are unpacked into slots 1..=n before the body runs.
    let mut endpoints = Vec::new();
    for endpoint in &program.endpoints {
        let entry = emitter.here();
        emitter.push(Op::EnterFrame(endpoint.locals));
        for index in 0..endpoint.path_params.len() {
            emitter.push(Op::LoadLocal(0));
            emitter.push(Op::GetField(index as u16));
            emitter.push(Op::StoreLocal((1 + index) as u16));
        }
        for stmt in &endpoint.body {
            emitter.emit_stmt(stmt)?;
        }
        emitter.push(Op::EndHandler);
        endpoints.push(EndpointEntry {
            method: endpoint.method.as_str().to_string(),
            path_template: endpoint.path.clone(),
            path_params: endpoint.path_params.clone(),
            handler_entry: entry,
        });
    }

    Ok(Artifact {
        format_version: crate::artifact::FORMAT_VERSION,
        metadata: ArtifactMetadata {
            source_file: meta.source_file.clone(),
            compiler_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: meta.created_at,
        },
        constants: emitter.constants,
        record_schemas,
        modules,
        endpoints,
        instructions: emitter.ops,
    })
}

fn field_annotations(field: &crate::typeck::TypedField, internal: bool) -> Vec<String> {
    let mut out = Vec::new();
    if internal {
        out.push("internal".to_string());
    }
    if field.key {
        out.push("key".to_string());
    }
    if field.auto {
        out.push("auto".to_string());
    }
    if field.required {
        out.push("required".to_string());
    }
    if field.optional {
        out.push("optional".to_string());
    }
    if field.unique {
        out.push("unique".to_string());
    }
    if let Some(default) = &field.default {
        out.push(match default {
            Lit::Int(v) => format!("default={v}"),
            Lit::Decimal(v) => format!("default={}", crate::format::display_decimal(*v)),
            Lit::Text(s) => format!("default={s}"),
            Lit::Flag(b) => format!("default={b}"),
        });
    }
    out
}

// ── UI trees as opaque record schemas ────────────────────────────
//
// Fragments and screens register through `DefineData` like any data
// model. Each node becomes a field whose dotted name is its path in the
// tree and whose annotations carry the node kind and payload; a renderer
// on the host side reads them back without the VM ever interpreting UI.

fn ui_schema(component: &UiComponent) -> RecordSchema {
    let mut fields = vec![FieldSchema {
        name: "ui".into(),
        ty: Ty::Text,
        annotations: vec![match component.kind {
            UiKind::Fragment => "ui:fragment".to_string(),
            UiKind::Screen => "ui:screen".to_string(),
        }],
    }];
    flatten_ui(&component.nodes, "", &mut fields);
    RecordSchema { name: component.name.clone(), fields }
}

fn flatten_ui(nodes: &[UiNode], prefix: &str, out: &mut Vec<FieldSchema>) {
    for (index, node) in nodes.iter().enumerate() {
        let path = if prefix.is_empty() {
            index.to_string()
        } else {
            format!("{prefix}.{index}")
        };
        match node {
            UiNode::Title { text, attrs, .. } => {
                out.push(ui_field(&path, "ui:title", &[("text", text)], attrs));
            }
            UiNode::Text { text, attrs, .. } => {
                out.push(ui_field(&path, "ui:text", &[("text", text)], attrs));
            }
            UiNode::Input { input_type, attrs, .. } => {
                out.push(ui_field(&path, "ui:input", &[("type", input_type)], attrs));
            }
            UiNode::Button { label, attrs, .. } => {
                out.push(ui_field(&path, "ui:button", &[("label", label)], attrs));
            }
            UiNode::Slot { name, .. } => {
                out.push(ui_field(&path, "ui:slot", &[("name", name)], &[]));
            }
            UiNode::UseFragment { fragment, fills, .. } => {
                out.push(ui_field(&path, "ui:fragment_ref", &[("fragment", fragment)], &[]));
                for (fill_index, fill) in fills.iter().enumerate() {
                    let fill_path = format!("{path}.{fill_index}");
                    out.push(ui_field(&fill_path, "ui:fill", &[("slot", &fill.slot)], &[]));
                    flatten_ui(&fill.content, &fill_path, out);
                }
            }
            UiNode::Layout { name, children, .. } => {
                let pairs: Vec<(&str, &String)> =
                    name.as_ref().map(|n| ("name", n)).into_iter().collect();
                out.push(ui_field(&path, "ui:layout", &pairs, &[]));
                flatten_ui(children, &path, out);
            }
        }
    }
}

fn ui_field(
    path: &str,
    kind: &str,
    pairs: &[(&str, &String)],
    attrs: &[UiAttr],
) -> FieldSchema {
    let mut annotations = vec![kind.to_string()];
    for (key, value) in pairs {
        annotations.push(format!("{key}:{value}"));
    }
    for attr in attrs {
        annotations.push(format!("attr:{}={}", attr.name, attr.value));
    }
    FieldSchema { name: path.to_string(), ty: Ty::Text, annotations }
}

// ── Emitter ──────────────────────────────────────────────────────

struct Emitter {
    ops: Vec<Op>,
    constants: Vec<Constant>,
    const_map: HashMap<Constant, u16>,
}

impl Emitter {
    fn new() -> Self {
        Self { ops: Vec::new(), constants: Vec::new(), const_map: HashMap::new() }
    }

    fn here(&self) -> u32 {
        self.ops.len() as u32
    }

    fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    fn constant(&mut self, constant: Constant, span: Span) -> Result<u16, CompileError> {
        if let Some(&index) = self.const_map.get(&constant) {
            return Ok(index);
        }
        let index = u16::try_from(self.constants.len()).map_err(|_| {
            CompileError::codegen("const_pool_overflow", "constant pool exceeds 65535 entries", span)
        })?;
        self.constants.push(constant.clone());
        self.const_map.insert(constant, index);
        Ok(index)
    }

    fn push_const(&mut self, constant: Constant, span: Span) -> Result<(), CompileError> {
        let index = self.constant(constant, span)?;
        self.push(Op::PushConst(index));
        Ok(())
    }

    fn patch(&mut self, at: usize, target: u32) {
        match &mut self.ops[at] {
            Op::Jump(t) | Op::JumpIfFalse(t) | Op::JumpIfTrue(t) | Op::IterNext(t) => *t = target,
            _ => {}
        }
    }

    fn store(&mut self, slot: VarSlot) {
        self.push(match slot {
            VarSlot::Local(i) => Op::StoreLocal(i),
            VarSlot::Global(i) => Op::StoreGlobal(i),
        });
    }

    // ── Statements ───────────────────────────────────────────────

    fn emit_stmt(&mut self, stmt: &TypedStmt) -> Result<(), CompileError> {
        let span = stmt.span;
        match &stmt.kind {
            TypedStmtKind::Display(value) => {
                self.emit_expr(value)?;
                self.push(Op::Display);
            }

            TypedStmtKind::Store { slot, value } => {
                self.emit_expr(value)?;
                self.store(*slot);
            }

            TypedStmtKind::When { arms, otherwise } => {
                let mut exits = Vec::new();
                for (index, (cond, body)) in arms.iter().enumerate() {
                    self.emit_expr(cond)?;
                    let skip = self.ops.len();
                    self.push(Op::JumpIfFalse(0));
                    for stmt in body {
                        self.emit_stmt(stmt)?;
                    }
                    let is_last = index == arms.len() - 1 && otherwise.is_none();
                    if !is_last {
                        exits.push(self.ops.len());
                        self.push(Op::Jump(0));
                    }
                    let next = self.here();
                    self.patch(skip, next);
                }
                if let Some(body) = otherwise {
                    for stmt in body {
                        self.emit_stmt(stmt)?;
                    }
                }
                let end = self.here();
                for exit in exits {
                    self.patch(exit, end);
                }
            }

            TypedStmtKind::While { cond, body } => {
                let top = self.here();
                self.emit_expr(cond)?;
                let exit = self.ops.len();
                self.push(Op::JumpIfFalse(0));
                for stmt in body {
                    self.emit_stmt(stmt)?;
                }
                self.push(Op::Jump(top));
                let end = self.here();
                self.patch(exit, end);
            }

            TypedStmtKind::ForEach { slot, iterable, body } => {
                self.emit_expr(iterable)?;
                self.push(Op::IterBegin);
                let top = self.here();
                let next = self.ops.len();
                self.push(Op::IterNext(0));
                self.store(*slot);
                for stmt in body {
                    self.emit_stmt(stmt)?;
                }
                self.push(Op::Jump(top));
                let end = self.here();
                self.patch(next, end);
            }

            TypedStmtKind::Give(value) => match value {
                Some(value) => {
                    self.emit_expr(value)?;
                    self.push(Op::Return);
                }
                None => self.push(Op::LeaveFrame),
            },

            TypedStmtKind::CallStmt { call, discard } => {
                self.emit_expr(call)?;
                if *discard {
                    self.push(Op::Pop);
                }
            }

            TypedStmtKind::Database(db) => self.emit_db(db, span)?,

            TypedStmtKind::Respond { status, body } => {
                self.emit_expr(status)?;
                match body {
                    Some(body) => self.emit_expr(body)?,
                    None => self.push_const(Constant::Text(String::new()), span)?,
                }
                self.push(Op::HostCall(HostFn::Respond as u8, 2));
            }

            TypedStmtKind::HttpCall { url, method, body, headers, into } => {
                self.emit_expr(url)?;
                self.push_const(Constant::Text(method.as_str().to_string()), span)?;
                match body {
                    Some(body) => self.emit_expr(body)?,
                    None => self.push_const(Constant::Text(String::new()), span)?,
                }
                for (name, value) in headers {
                    self.push_const(Constant::Text(name.clone()), span)?;
                    self.emit_expr(value)?;
                    self.push(Op::MakeList(2));
                }
                self.push(Op::MakeList(headers.len() as u16));
                self.push(Op::HostCall(HostFn::HttpRequest as u8, 4));
                self.store(*into);
            }
        }
        Ok(())
    }

    fn emit_db(&mut self, db: &TypedDb, span: Span) -> Result<(), CompileError> {
        match db.op {
            DbOp::Create => {
                for init in &db.create {
                    match init {
                        FieldInit::Value(value) => self.emit_expr(value)?,
                        FieldInit::AutoUuid => self.push(Op::HostCall(HostFn::Uuid as u8, 0)),
                        FieldInit::AutoNow => self.push(Op::HostCall(HostFn::Now as u8, 0)),
                        FieldInit::Default(lit) => self.push_const(lit_constant(lit), span)?,
                    }
                }
                self.push(Op::MakeRecord(db.entity, db.create.len() as u16));
            }
            DbOp::Find | DbOp::FindAll | DbOp::Delete => {
                self.emit_predicate(&db.predicate, span)?;
            }
            DbOp::Update => {
                self.emit_predicate(&db.predicate, span)?;
                for (field, value) in &db.set {
                    self.push_const(Constant::Text(field.clone()), span)?;
                    self.emit_expr(value)?;
                    self.push(Op::MakeList(2));
                }
                self.push(Op::MakeList(db.set.len() as u16));
            }
        }
        self.push(Op::DatabaseOp(db.op.code(), db.entity));
        match db.into {
            Some(slot) => self.store(slot),
            None => self.push(Op::Pop),
        }
        Ok(())
    }

    fn emit_predicate(
        &mut self,
        predicate: &[(String, &'static str, TypedExpr)],
        span: Span,
    ) -> Result<(), CompileError> {
        for (field, cmp, value) in predicate {
            self.push_const(Constant::Text(field.clone()), span)?;
            self.push_const(Constant::Text((*cmp).to_string()), span)?;
            self.emit_expr(value)?;
            self.push(Op::MakeList(3));
        }
        self.push(Op::MakeList(predicate.len() as u16));
        Ok(())
    }

    // ── Expressions ──────────────────────────────────────────────

    fn emit_expr(&mut self, expr: &TypedExpr) -> Result<(), CompileError> {
        let span = expr.span;
        match &expr.kind {
            TypedExprKind::Int(v) => self.push_const(Constant::Int(*v), span)?,
            TypedExprKind::Decimal(v) => self.push_const(Constant::Decimal(*v), span)?,
            TypedExprKind::Text(s) => {
                let constant = if expr.ty == Ty::Date {
                    Constant::Date(s.clone())
                } else {
                    Constant::Text(s.clone())
                };
                self.push_const(constant, span)?;
            }
            TypedExprKind::Flag(b) => self.push_const(Constant::Flag(*b), span)?,

            TypedExprKind::Load(slot) => self.push(match slot {
                VarSlot::Local(i) => Op::LoadLocal(*i),
                VarSlot::Global(i) => Op::LoadGlobal(*i),
            }),

            TypedExprKind::Binary { op, operand_ty, left, right } => {
                match op {
                    // Short-circuit forms leave exactly one flag value.
                    BinOp::And => {
                        self.emit_expr(left)?;
                        self.push(Op::Dup);
                        let skip = self.ops.len();
                        self.push(Op::JumpIfFalse(0));
                        self.push(Op::Pop);
                        self.emit_expr(right)?;
                        let end = self.here();
                        self.patch(skip, end);
                    }
                    BinOp::Or => {
                        self.emit_expr(left)?;
                        self.push(Op::Dup);
                        let skip = self.ops.len();
                        self.push(Op::JumpIfTrue(0));
                        self.push(Op::Pop);
                        self.emit_expr(right)?;
                        let end = self.here();
                        self.patch(skip, end);
                    }
                    _ => {
                        self.emit_expr(left)?;
                        self.emit_expr(right)?;
                        let decimal = *operand_ty == Ty::Decimal;
                        self.push(match op {
                            BinOp::Add if decimal => Op::AddD,
                            BinOp::Add => Op::AddI,
                            BinOp::Sub if decimal => Op::SubD,
                            BinOp::Sub => Op::SubI,
                            BinOp::Mul if decimal => Op::MulD,
                            BinOp::Mul => Op::MulI,
                            BinOp::Div if decimal => Op::DivD,
                            BinOp::Div => Op::DivI,
                            BinOp::Eq => Op::Eq,
                            BinOp::Ne => Op::Ne,
                            BinOp::Lt => Op::Lt,
                            BinOp::Le => Op::Le,
                            BinOp::Gt => Op::Gt,
                            BinOp::Ge => Op::Ge,
                            BinOp::And | BinOp::Or => unreachable!("handled above"),
                        });
                    }
                }
            }

            TypedExprKind::Concat { left, right } => {
                self.emit_expr(left)?;
                self.emit_expr(right)?;
                self.push(Op::Concat);
            }

            TypedExprKind::Unary { op, operand } => {
                self.emit_expr(operand)?;
                self.push(match op {
                    UnOp::Neg => Op::Neg,
                    UnOp::Not => Op::Not,
                });
            }

            TypedExprKind::Interp(parts) => {
                let count = u8::try_from(parts.len()).map_err(|_| {
                    CompileError::codegen(
                        "interp_overflow",
                        "interpolated string has more than 255 chunks",
                        span,
                    )
                })?;
                for part in parts {
                    match part {
                        TypedInterpPart::Lit(text) => {
                            self.push_const(Constant::Text(text.clone()), span)?;
                        }
                        TypedInterpPart::Expr(inner) => self.emit_expr(inner)?,
                    }
                }
                self.push(Op::Interp(count));
            }

            TypedExprKind::MakeCollection { kind, elements } => {
                for element in elements {
                    self.emit_expr(element)?;
                }
                self.push(match kind {
                    CollKind::List => Op::MakeList(elements.len() as u16),
                    CollKind::Group => Op::MakeGroup(elements.len() as u16),
                });
            }

            TypedExprKind::Call { module, action, args, .. } => {
                for arg in args {
                    self.emit_expr(arg)?;
                }
                let argc = u8::try_from(args.len()).map_err(|_| {
                    CompileError::codegen("arity_overflow", "more than 255 arguments", span)
                })?;
                self.push(Op::Call(*module, *action, argc));
            }

            TypedExprKind::GetField { object, field, .. } => {
                self.emit_expr(object)?;
                self.push(Op::GetField(*field));
            }

            TypedExprKind::Format { value, pattern } => {
                self.emit_expr(value)?;
                let index = self.constant(Constant::Pattern(pattern.clone()), span)?;
                self.push(Op::Format(index));
            }

            TypedExprKind::IsEmpty { operand, negated } => {
                self.emit_expr(operand)?;
                match &operand.ty {
                    Ty::List(_) => self.push(Op::MakeList(0)),
                    Ty::Group(_) => self.push(Op::MakeGroup(0)),
                    _ => self.push_const(Constant::Text(String::new()), span)?,
                }
                self.push(Op::Eq);
                if *negated {
                    self.push(Op::Not);
                }
            }
        }
        Ok(())
    }
}

fn lit_constant(lit: &Lit) -> Constant {
    match lit {
        Lit::Int(v) => Constant::Int(*v),
        Lit::Decimal(v) => Constant::Decimal(*v),
        Lit::Text(s) => Constant::Text(s.clone()),
        Lit::Flag(b) => Constant::Flag(*b),
    }
}
