//! Stack-based interpreter for Droe bytecode.
//!
//! One `Vm` owns one program instance: operand stack, frame stack,
//! iterator stack, global store, and the endpoint/data registries
//! populated by the `Define*` prologue. A host may run many instances in
//! parallel; sharing one across threads is not supported.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use tracing::trace;

use crate::artifact::{Artifact, EndpointEntry, RecordSchema};
use crate::ast::DbOp;
use crate::compiler::{Constant, Op};
use crate::error::{RuntimeError, VmDiagnostic};
use crate::format;
use crate::host::{Host, HostFn, HttpResponse};

/// Frame return address used for handler frames entered via `invoke`.
const FRAME_ROOT: usize = usize::MAX;

// ── Values ───────────────────────────────────────────────────────

/// A runtime value. Records and collections are reference values with
/// value-semantic equality; the VM treats them as logically immutable
/// (mutation ops build new values).
#[derive(Debug, Clone)]
pub enum Value {
    /// Uninitialized local slot; never observable from the language.
    Unit,
    Int(i32),
    /// Scaled by 100.
    Decimal(i64),
    Text(String),
    Flag(bool),
    /// ISO date carried as text.
    Date(String),
    FilePath(String),
    List(Vec<Value>),
    Group(Vec<Value>),
    Record { schema: u16, fields: Vec<Value> },
}

impl Value {
    fn as_scaled(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v) * 100),
            Value::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    fn text_like(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Date(s) | Value::FilePath(s) => Some(s),
            _ => None,
        }
    }

    /// Ordering for comparison ops and host-side predicates: numerics
    /// compare on the shared decimal scale, text-likes lexicographically.
    pub fn order(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
        if let (Some(x), Some(y)) = (a.as_scaled(), b.as_scaled()) {
            return Some(x.cmp(&y));
        }
        match (a.text_like(), b.text_like()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            // Mixed numeric equality on the shared scale.
            (Value::Int(_), Value::Decimal(_)) | (Value::Decimal(_), Value::Int(_)) => {
                self.as_scaled() == other.as_scaled()
            }
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Flag(a), Value::Flag(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::FilePath(a), Value::FilePath(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            // Groups are unordered: multiset equality on contents.
            (Value::Group(a), Value::Group(b)) => multiset_equal(a, b),
            (
                Value::Record { schema: sa, fields: fa },
                Value::Record { schema: sb, fields: fb },
            ) => sa == sb && fa == fb,
            _ => false,
        }
    }
}

fn multiset_equal(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    'outer: for item in a {
        for (index, candidate) in b.iter().enumerate() {
            if !used[index] && item == candidate {
                used[index] = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

// ── Cancellation ─────────────────────────────────────────────────

/// Shared flag the host may set between any two instructions. At the next
/// dispatch boundary the VM drops its frame stack and reports
/// `runtime.cancelled`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }
}

// ── Endpoint registry ────────────────────────────────────────────

/// Endpoints registered by the startup prologue. Written only during
/// `run`; read-only afterwards, so the host may read without locking.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    entries: Vec<(usize, EndpointEntry)>,
}

impl EndpointRegistry {
    fn register(&mut self, index: usize, entry: EndpointEntry) {
        self.entries.push((index, entry));
    }

    pub fn entries(&self) -> impl Iterator<Item = &EndpointEntry> {
        self.entries.iter().map(|(_, e)| e)
    }

    /// Match a concrete request path against the registered templates.
    /// When templates overlap (`/users/new` vs `/users/:id`) the one with
    /// the longest literal prefix wins.
    pub fn resolve(
        &self,
        method: &str,
        path: &str,
    ) -> Option<(usize, &EndpointEntry, Vec<(String, String)>)> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut best: Option<(usize, usize, usize, &EndpointEntry, Vec<(String, String)>)> = None;

        for (index, entry) in &self.entries {
            if !entry.method.eq_ignore_ascii_case(method) {
                continue;
            }
            let template: Vec<&str> =
                entry.path_template.split('/').filter(|s| !s.is_empty()).collect();
            if template.len() != segments.len() {
                continue;
            }

            let mut captures = Vec::new();
            let mut literal_prefix = 0;
            let mut literals = 0;
            let mut prefix_open = true;
            let mut matched = true;
            for (part, segment) in template.iter().zip(&segments) {
                if let Some(param) = part.strip_prefix(':') {
                    captures.push((param.to_string(), (*segment).to_string()));
                    prefix_open = false;
                } else if part == segment {
                    literals += 1;
                    if prefix_open {
                        literal_prefix += 1;
                    }
                } else {
                    matched = false;
                    break;
                }
            }
            if !matched {
                continue;
            }
            let better = match &best {
                Some((bp, bl, _, _, _)) => (literal_prefix, literals) > (*bp, *bl),
                None => true,
            };
            if better {
                best = Some((literal_prefix, literals, *index, entry, captures));
            }
        }

        best.map(|(_, _, index, entry, captures)| (index, entry, captures))
    }
}

// ── VM ───────────────────────────────────────────────────────────

struct Frame {
    return_addr: usize,
    locals: Vec<Value>,
}

enum ExecStop {
    Halt,
    Handler,
}

pub struct Vm<H: Host> {
    artifact: Artifact,
    host: H,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    iters: Vec<VecDeque<Value>>,
    globals: Vec<Value>,
    pc: usize,
    endpoints: EndpointRegistry,
    data_models: Vec<u16>,
    response: Option<HttpResponse>,
    response_schema: Option<u16>,
    cancel: CancelToken,
}

impl<H: Host> Vm<H> {
    pub fn new(artifact: Artifact, host: H) -> Self {
        let response_schema = artifact
            .record_schemas
            .iter()
            .position(|s| s.name == "$response")
            .map(|i| i as u16);
        Self {
            artifact,
            host,
            stack: Vec::new(),
            frames: Vec::new(),
            iters: Vec::new(),
            globals: Vec::new(),
            pc: 0,
            endpoints: EndpointRegistry::default(),
            data_models: Vec::new(),
            response: None,
            response_schema,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Registered endpoints; valid after `run`.
    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    /// Registered data models; valid after `run`.
    pub fn data_models(&self) -> Vec<&RecordSchema> {
        self.data_models
            .iter()
            .filter_map(|&i| self.artifact.record_schemas.get(i as usize))
            .collect()
    }

    /// Execute the program from the top: the `Define*` prologue, then the
    /// top-level statements, until `Halt`.
    pub fn run(&mut self) -> Result<(), VmDiagnostic> {
        self.pc = 0;
        self.exec().map(|_| ())
    }

    /// Run an endpoint handler with the given request record. Returns the
    /// response recorded by `respond`, if any.
    pub fn invoke(
        &mut self,
        entry: u32,
        request: Value,
    ) -> Result<Option<HttpResponse>, VmDiagnostic> {
        self.response = None;
        self.frames.push(Frame { return_addr: FRAME_ROOT, locals: vec![request] });
        self.pc = entry as usize;
        self.exec()?;
        Ok(self.response.take())
    }

    /// Convenience dispatch: resolve `method path`, bind path parameters
    /// and the request body, and invoke the handler.
    pub fn invoke_endpoint(
        &mut self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<Option<HttpResponse>, VmDiagnostic> {
        let (index, entry, captures) = match self.endpoints.resolve(method, path) {
            Some((index, entry, captures)) => (index, entry.handler_entry, captures),
            None => {
                return Err(self.diag(RuntimeError::UnknownEndpoint(format!(
                    "{method} {path}"
                ))));
            }
        };

        let schema_name = format!("$request{index}");
        let schema = self
            .artifact
            .record_schemas
            .iter()
            .position(|s| s.name == schema_name)
            .map(|i| i as u16)
            .unwrap_or_default();
        let mut fields: Vec<Value> =
            captures.into_iter().map(|(_, value)| Value::Text(value)).collect();
        fields.push(Value::Text(body.to_string()));
        self.invoke(entry, Value::Record { schema, fields })
    }

    // ── Dispatch loop ────────────────────────────────────────────

    fn exec(&mut self) -> Result<ExecStop, VmDiagnostic> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.diag(RuntimeError::Cancelled));
            }
            let Some(op) = self.artifact.instructions.get(self.pc).copied() else {
                return Ok(ExecStop::Halt);
            };
            trace!(pc = self.pc, ?op, stack = self.stack.len(), "dispatch");
            match self.step(op) {
                Ok(None) => {}
                Ok(Some(stop)) => return Ok(stop),
                Err(e) => return Err(self.diag(e)),
            }
        }
    }

    fn diag(&mut self, error: RuntimeError) -> VmDiagnostic {
        if error == RuntimeError::Cancelled {
            // Cooperative stop: drop in-flight state, report no failure.
            self.frames.clear();
            self.stack.clear();
            self.iters.clear();
        } else {
            self.host.fail(error.kind(), &error.to_string(), self.pc);
        }
        VmDiagnostic { error, at: self.pc }
    }

    #[allow(clippy::too_many_lines)]
    fn step(&mut self, op: Op) -> Result<Option<ExecStop>, RuntimeError> {
        match op {
            Op::PushConst(index) => {
                let value = match self.artifact.constants.get(index as usize) {
                    Some(Constant::Int(v)) => Value::Int(*v),
                    Some(Constant::Decimal(v)) => Value::Decimal(*v),
                    Some(Constant::Text(s)) => Value::Text(s.clone()),
                    Some(Constant::Flag(b)) => Value::Flag(*b),
                    Some(Constant::Date(s)) => Value::Date(s.clone()),
                    Some(Constant::Pattern(s)) => Value::Text(s.clone()),
                    None => return Err(bad("constant index out of range")),
                };
                self.stack.push(value);
            }
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let top = self.pop()?;
                self.stack.push(top.clone());
                self.stack.push(top);
            }

            Op::LoadLocal(index) => {
                let frame = self.frames.last().ok_or_else(|| bad("no active frame"))?;
                let value = frame
                    .locals
                    .get(index as usize)
                    .cloned()
                    .unwrap_or(Value::Unit);
                self.stack.push(value);
            }
            Op::StoreLocal(index) => {
                let value = self.pop()?;
                let frame = self.frames.last_mut().ok_or_else(|| bad("no active frame"))?;
                if frame.locals.len() <= index as usize {
                    frame.locals.resize(index as usize + 1, Value::Unit);
                }
                frame.locals[index as usize] = value;
            }
            Op::LoadGlobal(index) => {
                let value = self
                    .globals
                    .get(index as usize)
                    .cloned()
                    .unwrap_or(Value::Unit);
                self.stack.push(value);
            }
            Op::StoreGlobal(index) => {
                let value = self.pop()?;
                if self.globals.len() <= index as usize {
                    self.globals.resize(index as usize + 1, Value::Unit);
                }
                self.globals[index as usize] = value;
            }

            // Integer arithmetic: no wrap-around, overflow is an error.
            Op::AddI => self.int_binop("int add", i32::checked_add)?,
            Op::SubI => self.int_binop("int subtract", i32::checked_sub)?,
            Op::MulI => self.int_binop("int multiply", i32::checked_mul)?,
            Op::DivI => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if b == 0 {
                    return Err(RuntimeError::DivZero);
                }
                let q = a
                    .checked_div(b)
                    .ok_or_else(|| RuntimeError::Overflow("int divide overflows".into()))?;
                self.stack.push(Value::Int(q));
            }

            // Decimal arithmetic maintains the ×100 scale invariant; an
            // int operand is promoted on the fly.
            Op::AddD => self.dec_binop("decimal add", |a, b| a.checked_add(b))?,
            Op::SubD => self.dec_binop("decimal subtract", |a, b| a.checked_sub(b))?,
            Op::MulD => self.dec_binop("decimal multiply", |a, b| {
                let product = i128::from(a) * i128::from(b);
                i64::try_from(round_div(product, 100)).ok()
            })?,
            Op::DivD => {
                let b = self.pop_scaled()?;
                let a = self.pop_scaled()?;
                if b == 0 {
                    return Err(RuntimeError::DivZero);
                }
                let quotient = round_div(i128::from(a) * 100, i128::from(b));
                let value = i64::try_from(quotient)
                    .map_err(|_| RuntimeError::Overflow("decimal divide overflows".into()))?;
                self.stack.push(Value::Decimal(value));
            }

            Op::Neg => {
                let value = self.pop()?;
                let negated = match value {
                    Value::Int(v) => Value::Int(
                        v.checked_neg()
                            .ok_or_else(|| RuntimeError::Overflow("int negate overflows".into()))?,
                    ),
                    Value::Decimal(v) => Value::Decimal(v.checked_neg().ok_or_else(|| {
                        RuntimeError::Overflow("decimal negate overflows".into())
                    })?),
                    other => return Err(bad(&format!("cannot negate {}", kind_of(&other)))),
                };
                self.stack.push(negated);
            }

            Op::Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Flag(a == b));
            }
            Op::Ne => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Flag(a != b));
            }
            Op::Lt => self.cmp_binop(std::cmp::Ordering::is_lt)?,
            Op::Le => self.cmp_binop(std::cmp::Ordering::is_le)?,
            Op::Gt => self.cmp_binop(std::cmp::Ordering::is_gt)?,
            Op::Ge => self.cmp_binop(std::cmp::Ordering::is_ge)?,

            Op::And => {
                let b = self.pop_flag()?;
                let a = self.pop_flag()?;
                self.stack.push(Value::Flag(a && b));
            }
            Op::Or => {
                let b = self.pop_flag()?;
                let a = self.pop_flag()?;
                self.stack.push(Value::Flag(a || b));
            }
            Op::Not => {
                let a = self.pop_flag()?;
                self.stack.push(Value::Flag(!a));
            }

            Op::Jump(target) => {
                self.pc = target as usize;
                return Ok(None);
            }
            Op::JumpIfFalse(target) => {
                if !self.pop_flag()? {
                    self.pc = target as usize;
                    return Ok(None);
                }
            }
            Op::JumpIfTrue(target) => {
                if self.pop_flag()? {
                    self.pc = target as usize;
                    return Ok(None);
                }
            }

            Op::Concat => {
                let b = self.pop()?;
                let a = self.pop()?;
                let (Some(left), Some(right)) = (a.text_like(), b.text_like()) else {
                    return Err(bad("concat needs text operands"));
                };
                let mut out = left.to_string();
                out.push_str(right);
                self.stack.push(Value::Text(out));
            }
            Op::Interp(count) => {
                let mut parts = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    parts.push(self.pop()?);
                }
                parts.reverse();
                let mut out = String::new();
                for part in &parts {
                    out.push_str(&self.render(part));
                }
                self.stack.push(Value::Text(out));
            }
            Op::Format(index) => {
                let pattern = match self.artifact.constants.get(index as usize) {
                    Some(Constant::Pattern(p)) => p.clone(),
                    _ => return Err(bad("format pattern index out of range")),
                };
                let value = self.pop()?;
                let formatted = match &value {
                    Value::Int(v) => format::format_int(*v, &pattern),
                    Value::Decimal(v) => format::format_decimal(*v, &pattern),
                    Value::Date(s) => format::format_date(s, &pattern),
                    other => self.render(other),
                };
                self.stack.push(Value::Text(formatted));
            }

            Op::MakeList(count) => {
                let elements = self.pop_n(count as usize)?;
                self.stack.push(Value::List(elements));
            }
            Op::MakeGroup(count) => {
                let elements = self.pop_n(count as usize)?;
                self.stack.push(Value::Group(elements));
            }
            Op::IterBegin => {
                let value = self.pop()?;
                let items: VecDeque<Value> = match value {
                    Value::List(items) | Value::Group(items) => items.into(),
                    Value::Text(s) => s.chars().map(|c| Value::Text(c.to_string())).collect(),
                    other => return Err(bad(&format!("cannot iterate {}", kind_of(&other)))),
                };
                self.iters.push(items);
            }
            Op::IterNext(exit) => {
                let iter = self.iters.last_mut().ok_or_else(|| bad("no active iterator"))?;
                match iter.pop_front() {
                    Some(value) => self.stack.push(value),
                    None => {
                        self.iters.pop();
                        self.pc = exit as usize;
                        return Ok(None);
                    }
                }
            }
            Op::Index => {
                let index = self.pop_int()?;
                let value = self.pop()?;
                let element = match &value {
                    Value::List(items) | Value::Group(items) => {
                        items.get(index as usize).cloned()
                    }
                    Value::Text(s) => {
                        s.chars().nth(index as usize).map(|c| Value::Text(c.to_string()))
                    }
                    other => return Err(bad(&format!("cannot index {}", kind_of(other)))),
                };
                let element = element.ok_or_else(|| bad("index out of range"))?;
                self.stack.push(element);
            }

            Op::MakeRecord(schema, count) => {
                let fields = self.pop_n(count as usize)?;
                self.stack.push(Value::Record { schema, fields });
            }
            Op::GetField(index) => {
                let value = self.pop()?;
                let Value::Record { fields, .. } = value else {
                    return Err(bad("field access on a non-record value"));
                };
                let field = fields
                    .get(index as usize)
                    .cloned()
                    .ok_or_else(|| bad("field index out of range"))?;
                self.stack.push(field);
            }
            Op::SetField(index) => {
                let value = self.pop()?;
                let record = self.pop()?;
                let Value::Record { schema, mut fields } = record else {
                    return Err(bad("field update on a non-record value"));
                };
                if fields.len() <= index as usize {
                    return Err(bad("field index out of range"));
                }
                fields[index as usize] = value;
                self.stack.push(Value::Record { schema, fields });
            }

            Op::Call(module, action, argc) => {
                let entry = self
                    .artifact
                    .action(module, action)
                    .ok_or_else(|| bad("call target out of range"))?;
                let (target, locals_count) = (entry.entry as usize, entry.locals as usize);
                let mut locals = self.pop_n(argc as usize)?;
                locals.resize(locals_count.max(argc as usize), Value::Unit);
                self.frames.push(Frame { return_addr: self.pc + 1, locals });
                self.pc = target;
                return Ok(None);
            }
            Op::Return => {
                let value = self.pop()?;
                let frame = self.frames.pop().ok_or_else(|| bad("return outside a frame"))?;
                self.stack.push(value);
                if frame.return_addr == FRAME_ROOT {
                    return Ok(Some(ExecStop::Handler));
                }
                self.pc = frame.return_addr;
                return Ok(None);
            }
            Op::EnterFrame(locals) => {
                let frame = self.frames.last_mut().ok_or_else(|| bad("no active frame"))?;
                if frame.locals.len() < locals as usize {
                    frame.locals.resize(locals as usize, Value::Unit);
                }
            }
            Op::LeaveFrame => {
                let frame = self.frames.pop().ok_or_else(|| bad("no frame to leave"))?;
                if frame.return_addr == FRAME_ROOT {
                    return Ok(Some(ExecStop::Handler));
                }
                self.pc = frame.return_addr;
                return Ok(None);
            }

            Op::Display => {
                let value = self.pop()?;
                let text = self.render(&value);
                self.host.print_line(&text);
            }
            Op::HostCall(index, argc) => return self.host_call(index, argc),

            Op::DefineData(index) => {
                if self.artifact.record_schemas.get(index as usize).is_none() {
                    return Err(bad("data schema index out of range"));
                }
                self.data_models.push(index);
            }
            Op::DefineEndpoint(index) => {
                let entry = self
                    .artifact
                    .endpoints
                    .get(index as usize)
                    .cloned()
                    .ok_or_else(|| bad("endpoint index out of range"))?;
                self.endpoints.register(index as usize, entry);
            }
            Op::EndHandler => {
                self.frames.pop();
                return Ok(Some(ExecStop::Handler));
            }

            Op::DatabaseOp(code, entity) => {
                let op = DbOp::from_code(code).ok_or_else(|| bad("unknown database op code"))?;
                let schema = self
                    .artifact
                    .record_schemas
                    .get(entity as usize)
                    .cloned()
                    .ok_or_else(|| bad("entity index out of range"))?;
                let (predicate, fields) = match op {
                    DbOp::Create => (Value::List(Vec::new()), self.pop()?),
                    DbOp::Find | DbOp::FindAll | DbOp::Delete => {
                        (self.pop()?, Value::List(Vec::new()))
                    }
                    DbOp::Update => {
                        let set = self.pop()?;
                        (self.pop()?, set)
                    }
                };
                let result = self
                    .host
                    .db_op(op, &schema, &predicate, &fields)
                    .map_err(RuntimeError::HostError)?;
                self.stack.push(result);
            }

            Op::Halt => return Ok(Some(ExecStop::Halt)),
        }
        self.pc += 1;
        Ok(None)
    }

    fn host_call(&mut self, index: u8, _argc: u8) -> Result<Option<ExecStop>, RuntimeError> {
        let host_fn = HostFn::from_u8(index).ok_or_else(|| bad("unknown host function"))?;
        match host_fn {
            HostFn::Print => {
                let value = self.pop()?;
                let text = self.render(&value);
                self.host.print(&text);
            }
            HostFn::PrintLine => {
                let value = self.pop()?;
                let text = self.render(&value);
                self.host.print_line(&text);
            }
            HostFn::Now => {
                let now = self.host.now();
                self.stack.push(Value::Date(now));
            }
            HostFn::Uuid => {
                let id = self.host.uuid();
                self.stack.push(Value::Text(id));
            }
            HostFn::HttpRequest => {
                let headers_value = self.pop()?;
                let body = self.pop()?;
                let method = self.pop_text()?;
                let url = self.pop_text()?;

                let mut headers = Vec::new();
                if let Value::List(pairs) = &headers_value {
                    for pair in pairs {
                        if let Value::List(kv) = pair {
                            if let (Some(Value::Text(k)), Some(v)) = (kv.first(), kv.get(1)) {
                                headers.push((k.clone(), self.render(v)));
                            }
                        }
                    }
                }

                let response = self
                    .host
                    .http_request(&url, &method, &body, &headers)
                    .map_err(RuntimeError::HostError)?;
                let schema = self
                    .response_schema
                    .ok_or_else(|| bad("response schema missing from artifact"))?;
                self.stack.push(Value::Record {
                    schema,
                    fields: vec![Value::Int(response.status), Value::Text(response.body)],
                });
            }
            HostFn::DbOp => {
                // Generic form with the operation and entity on the stack;
                // compiled code uses the dedicated DatabaseOp instruction.
                let fields = self.pop()?;
                let predicate = self.pop()?;
                let entity = self.pop_text()?;
                let op_name = self.pop_text()?;
                let op = match op_name.as_str() {
                    "find" => DbOp::Find,
                    "find_all" => DbOp::FindAll,
                    "create" => DbOp::Create,
                    "update" => DbOp::Update,
                    "delete" => DbOp::Delete,
                    other => return Err(bad(&format!("unknown database op `{other}`"))),
                };
                let schema = self
                    .artifact
                    .record_schemas
                    .iter()
                    .find(|s| s.name == entity)
                    .cloned()
                    .ok_or_else(|| bad(&format!("unknown entity `{entity}`")))?;
                let result = self
                    .host
                    .db_op(op, &schema, &predicate, &fields)
                    .map_err(RuntimeError::HostError)?;
                self.stack.push(result);
            }
            HostFn::Respond => {
                let body = self.pop_text()?;
                let status = self.pop_int()?;
                self.host.respond(status, &body);
                self.response = Some(HttpResponse { status, body, headers: Vec::new() });
            }
        }
        self.pc += 1;
        Ok(None)
    }

    // ── Stack helpers ────────────────────────────────────────────

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| bad("operand stack underflow"))
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, RuntimeError> {
        if self.stack.len() < count {
            return Err(bad("operand stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn pop_int(&mut self) -> Result<i32, RuntimeError> {
        match self.pop()? {
            Value::Int(v) => Ok(v),
            other => Err(bad(&format!("expected int, found {}", kind_of(&other)))),
        }
    }

    fn pop_scaled(&mut self) -> Result<i64, RuntimeError> {
        let value = self.pop()?;
        value
            .as_scaled()
            .ok_or_else(|| bad(&format!("expected a number, found {}", kind_of(&value))))
    }

    fn pop_flag(&mut self) -> Result<bool, RuntimeError> {
        match self.pop()? {
            Value::Flag(v) => Ok(v),
            other => Err(bad(&format!("expected flag, found {}", kind_of(&other)))),
        }
    }

    fn pop_text(&mut self) -> Result<String, RuntimeError> {
        let value = self.pop()?;
        value
            .text_like()
            .map(str::to_string)
            .ok_or_else(|| bad(&format!("expected text, found {}", kind_of(&value))))
    }

    fn int_binop(
        &mut self,
        what: &str,
        f: impl Fn(i32, i32) -> Option<i32>,
    ) -> Result<(), RuntimeError> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        let result = f(a, b).ok_or_else(|| RuntimeError::Overflow(format!("{what} overflows")))?;
        self.stack.push(Value::Int(result));
        Ok(())
    }

    fn dec_binop(
        &mut self,
        what: &str,
        f: impl Fn(i64, i64) -> Option<i64>,
    ) -> Result<(), RuntimeError> {
        let b = self.pop_scaled()?;
        let a = self.pop_scaled()?;
        let result = f(a, b).ok_or_else(|| RuntimeError::Overflow(format!("{what} overflows")))?;
        self.stack.push(Value::Decimal(result));
        Ok(())
    }

    fn cmp_binop(
        &mut self,
        accept: impl Fn(std::cmp::Ordering) -> bool,
    ) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let ordering = Value::order(&a, &b).ok_or_else(|| {
            bad(&format!("cannot order {} against {}", kind_of(&a), kind_of(&b)))
        })?;
        self.stack.push(Value::Flag(accept(ordering)));
        Ok(())
    }

    // ── Display rules ────────────────────────────────────────────

    /// Fixed rendering per type: int as decimal digits, decimal with two
    /// fractional digits, flag as true/false, date and text verbatim,
    /// collections as `[e1, e2, …]`.
    fn render(&self, value: &Value) -> String {
        match value {
            Value::Unit => String::new(),
            Value::Int(v) => v.to_string(),
            Value::Decimal(v) => format::display_decimal(*v),
            Value::Text(s) | Value::Date(s) | Value::FilePath(s) => s.clone(),
            Value::Flag(b) => b.to_string(),
            Value::List(items) | Value::Group(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render(v)).collect();
                format!("[{}]", rendered.join(", "))
            }
            Value::Record { schema, fields } => {
                match self.artifact.record_schemas.get(*schema as usize) {
                    Some(entry) => {
                        let pairs: Vec<String> = entry
                            .fields
                            .iter()
                            .zip(fields)
                            .map(|(f, v)| format!("{}: {}", f.name, self.render(v)))
                            .collect();
                        format!("{} {{ {} }}", entry.name, pairs.join(", "))
                    }
                    None => "<record>".to_string(),
                }
            }
        }
    }
}

fn bad(message: &str) -> RuntimeError {
    RuntimeError::BadCast(message.to_string())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Unit => "nothing",
        Value::Int(_) => "int",
        Value::Decimal(_) => "decimal",
        Value::Text(_) => "text",
        Value::Flag(_) => "flag",
        Value::Date(_) => "date",
        Value::FilePath(_) => "file",
        Value::List(_) => "a list",
        Value::Group(_) => "a group",
        Value::Record { .. } => "a record",
    }
}

/// Rounded integer division, half away from zero.
fn round_div(numerator: i128, denominator: i128) -> i128 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder.abs() * 2 >= denominator.abs() {
        if (numerator < 0) != (denominator < 0) {
            quotient - 1
        } else {
            quotient + 1
        }
    } else {
        quotient
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::compiler::{emit, EmitMeta};
    use crate::host::RecordingHost;
    use crate::lexer::lex;
    use crate::parser::parse;
    use crate::typeck::check;

    fn compile(source: &str) -> Artifact {
        let program = check(&parse(lex(source, 0).unwrap()).unwrap()).unwrap();
        emit(&program, &EmitMeta { source_file: "test.droe".into(), created_at: 0 }).unwrap()
    }

    fn run(source: &str) -> Vm<RecordingHost> {
        let mut vm = Vm::new(compile(source), RecordingHost::new());
        vm.run().unwrap();
        vm
    }

    fn output(source: &str) -> Vec<String> {
        run(source).host.out
    }

    fn run_err(source: &str) -> VmDiagnostic {
        let mut vm = Vm::new(compile(source), RecordingHost::new());
        vm.run().unwrap_err()
    }

    // ── The reference scenarios ──────────────────────────────────

    #[test]
    fn hello_world() {
        assert_eq!(output("display \"Hello, World!\""), vec!["Hello, World!"]);
    }

    #[test]
    fn while_loop_counts() {
        let source = "\
set counter to 1
while counter is less than or equal to 3
    display counter
    set counter to counter plus 1
end while";
        assert_eq!(output(source), vec!["1", "2", "3"]);
    }

    #[test]
    fn decimal_format_with_thousands() {
        let source = "set price which is decimal to 1234.56\ndisplay format price as \"#,##0.00\"";
        assert_eq!(output(source), vec!["1,234.56"]);
    }

    #[test]
    fn action_call_returns_value() {
        let source = "\
action add with a which is int, b which is int gives int
    give a plus b
end action
set s which is int from add with 10, 5
display s";
        assert_eq!(output(source), vec!["15"]);
    }

    #[test]
    fn grade_ladder_picks_first_true_arm() {
        let source = "\
set score to 85
when score is greater than or equal to 90 then
    display \"Grade: A - Outstanding!\"
otherwise when score is greater than or equal to 80 then
    display \"Grade: B - Very Good!\"
    display \"Great work\"
otherwise
    display \"Keep trying\"
end when";
        assert_eq!(output(source), vec!["Grade: B - Very Good!", "Great work"]);
    }

    #[test]
    fn endpoint_round_trip() {
        let source = "\
serve get /users/:id
    respond 200 with \"user-\" plus id
end serve";
        let mut vm = Vm::new(compile(source), RecordingHost::new());
        vm.run().unwrap();
        let response = vm.invoke_endpoint("GET", "/users/42", "").unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "user-42");
    }

    // ── Numeric semantics ────────────────────────────────────────

    #[test]
    fn int_overflow_is_an_error() {
        let source = "set x to 2147483647\nset y to x plus 1\ndisplay y";
        let diag = run_err(source);
        assert_eq!(diag.error.kind(), "runtime.overflow");
    }

    #[test]
    fn int_division_by_zero() {
        let source = "set z to 0\ndisplay 10 divided by z";
        assert_eq!(run_err(source).error, RuntimeError::DivZero);
    }

    #[test]
    fn decimal_division_by_zero() {
        let source = "set z which is decimal to 0.00\ndisplay 10.00 divided by z";
        assert_eq!(run_err(source).error, RuntimeError::DivZero);
    }

    #[test]
    fn decimal_scale_invariant() {
        // 2.50 * 3 = 7.50 through the scaled representation.
        assert_eq!(output("display 2.50 times 3"), vec!["7.50"]);
        // 10.00 / 3.00 rounds on the scaled representation.
        assert_eq!(output("display 10.00 divided by 3.00"), vec!["3.33"]);
        // Round half away from zero.
        assert_eq!(output("display 0.25 times 0.50"), vec!["0.13"]);
    }

    #[test]
    fn mixed_int_decimal_promotes() {
        assert_eq!(output("display 3 plus 0.50"), vec!["3.50"]);
    }

    #[test]
    fn interp_keeps_trailing_decimal_zeros() {
        let source = "set price which is decimal to 3.10\ndisplay \"cost: [price]\"";
        assert_eq!(output(source), vec!["cost: 3.10"]);
    }

    #[test]
    fn runtime_failure_reported_to_host() {
        let source = "set z to 0\ndisplay 1 divided by z";
        let mut vm = Vm::new(compile(source), RecordingHost::new());
        vm.run().unwrap_err();
        assert_eq!(vm.host.failures.len(), 1);
        assert!(vm.host.failures[0].starts_with("runtime.divzero"));
    }

    // ── Control flow and collections ─────────────────────────────

    #[test]
    fn for_each_preserves_list_order() {
        let source = "for each n in [3, 1, 2]\n    display n\nend for";
        assert_eq!(output(source), vec!["3", "1", "2"]);
    }

    #[test]
    fn for_each_over_empty_runs_zero_times() {
        let source = "\
set xs which are list of int to []
for each n in xs
    display n
end for
display \"done\"";
        assert_eq!(output(source), vec!["done"]);
    }

    #[test]
    fn for_each_iterates_text_characters() {
        let source = "for each ch in \"abc\"\n    display ch\nend for";
        assert_eq!(output(source), vec!["a", "b", "c"]);
    }

    #[test]
    fn nested_loops_keep_separate_iterators() {
        let source = "\
for each a in [1, 2]
    for each b in [10, 20]
        display a plus b
    end for
end for";
        assert_eq!(output(source), vec!["11", "21", "12", "22"]);
    }

    #[test]
    fn group_equality_is_multiset() {
        let source = "\
set a which are group of int to [1, 2, 2]
set b which are group of int to [2, 1, 2]
when a equals b then display \"same\"
set c which are group of int to [1, 2, 3]
when a equals c then display \"impossible\"
display \"done\"";
        assert_eq!(output(source), vec!["same", "done"]);
    }

    #[test]
    fn list_equality_is_ordered() {
        let source = "\
set a which are list of int to [1, 2]
set b which are list of int to [2, 1]
when a equals b then display \"impossible\"
display \"done\"";
        assert_eq!(output(source), vec!["done"]);
    }

    #[test]
    fn is_empty_on_empty_and_full() {
        let source = "\
set xs which are list of int to []
when xs is empty then display \"empty\"
set ys which are list of int to [1]
when ys is not empty then display \"full\"";
        assert_eq!(output(source), vec!["empty", "full"]);
    }

    #[test]
    fn short_circuit_and_skips_rhs() {
        // A task call on the right-hand side must not run when the left
        // side is already false.
        let source = "\
action truthy gives flag
    display \"evaluated\"
    give true
end action
set f to false
set g from truthy
when f and g then display \"both\"
display \"end\"";
        let lines = output(source);
        // `truthy` ran once for the `set`, not again for the `and`.
        assert_eq!(lines.iter().filter(|l| *l == "evaluated").count(), 1);
        assert_eq!(lines.last().unwrap(), "end");
    }

    #[test]
    fn collection_display_brackets() {
        assert_eq!(output("display [1, 2, 3]"), vec!["[1, 2, 3]"]);
    }

    // ── Actions, tasks, modules ──────────────────────────────────

    #[test]
    fn recursion_through_frame_stack() {
        let source = "\
action fact with n which is int gives int
    when n is less than or equal to 1 then
        give 1
    otherwise
        set m which is int from fact with n minus 1
        give n times m
    end when
end action
set f which is int from fact with 5
display f";
        assert_eq!(output(source), vec!["120"]);
    }

    #[test]
    fn task_runs_for_effect() {
        let source = "\
task greet with name which is text
    display \"Hello, \" plus name
end task
run greet with \"Ada\"
display \"after\"";
        assert_eq!(output(source), vec!["Hello, Ada", "after"]);
    }

    #[test]
    fn module_qualified_call() {
        let source = "\
module math
    action square with n which is int gives int
        give n times n
    end action
end module
set s from math.square with 6
display s";
        assert_eq!(output(source), vec!["36"]);
    }

    #[test]
    fn action_locals_are_frame_scoped() {
        let source = "\
set x to 1
action bump with x which is int gives int
    set y to x plus 1
    give y
end action
set r which is int from bump with 41
display r
display x";
        assert_eq!(output(source), vec!["42", "1"]);
    }

    // ── Registries, endpoints, database ──────────────────────────

    #[test]
    fn registries_populated_by_prologue() {
        let source = "\
data User
    id is text key auto
    name is text required
end data
serve get /users/:id
    respond 200 with id
end serve";
        let vm = run(source);
        assert_eq!(vm.data_models().len(), 1);
        assert_eq!(vm.data_models()[0].name, "User");
        assert_eq!(vm.endpoints().entries().count(), 1);
    }

    #[test]
    fn endpoint_precedence_longest_literal_prefix() {
        let source = "\
serve get /users/:id
    respond 200 with \"param-\" plus id
end serve
serve get /users/new
    respond 200 with \"literal\"
end serve";
        let mut vm = Vm::new(compile(source), RecordingHost::new());
        vm.run().unwrap();
        let r = vm.invoke_endpoint("GET", "/users/new", "").unwrap().unwrap();
        assert_eq!(r.body, "literal");
        let r = vm.invoke_endpoint("GET", "/users/7", "").unwrap().unwrap();
        assert_eq!(r.body, "param-7");
    }

    #[test]
    fn unknown_endpoint_is_an_error() {
        let source = "serve get /ping\n    respond 200\nend serve";
        let mut vm = Vm::new(compile(source), RecordingHost::new());
        vm.run().unwrap();
        let diag = vm.invoke_endpoint("POST", "/ping", "").unwrap_err();
        assert_eq!(diag.error.kind(), "runtime.unknown_endpoint");
    }

    #[test]
    fn request_body_reaches_handler() {
        let source = "serve post /echo\n    respond 200 with request.body\nend serve";
        let mut vm = Vm::new(compile(source), RecordingHost::new());
        vm.run().unwrap();
        let r = vm.invoke_endpoint("POST", "/echo", "payload").unwrap().unwrap();
        assert_eq!(r.body, "payload");
    }

    #[test]
    fn db_create_and_find_all() {
        let source = "\
data User
    id is text key auto
    name is text required
end data
db create User with name is \"ada\" into a
db create User with name is \"grace\" into b
db find all User into users
for each u in users
    display u.name
end for";
        assert_eq!(output(source), vec!["ada", "grace"]);
    }

    #[test]
    fn db_auto_key_filled_by_host() {
        let source = "\
data User
    id is text key auto
    name is text required
end data
db create User with name is \"ada\" into u
display u.id";
        let lines = output(source);
        assert!(lines[0].ends_with("000001"), "uuid host call fills the key: {lines:?}");
    }

    #[test]
    fn db_update_and_delete_return_counts() {
        let source = "\
data User
    name is text required
    age is int
end data
db create User with name is \"ada\", age is 36 into a
db update User where name equals \"ada\" set age is 37 into changed
display changed
db delete User where name equals \"ada\" into removed
display removed
db find all User into rest
when rest is empty then display \"gone\"";
        assert_eq!(output(source), vec!["1", "1", "gone"]);
    }

    #[test]
    fn http_call_builds_response_record() {
        let source = "\
call \"https://api.example.com/users\" method GET into resp
display resp.status
display resp.body";
        let mut host = RecordingHost::new();
        host.http_responses.push(HttpResponse {
            status: 200,
            body: "ok".into(),
            headers: Vec::new(),
        });
        let mut vm = Vm::new(compile(source), host);
        vm.run().unwrap();
        assert_eq!(vm.host.out, vec!["200", "ok"]);
        assert_eq!(
            vm.host.http_calls,
            vec![("https://api.example.com/users".to_string(), "GET".to_string())]
        );
    }

    #[test]
    fn http_failure_is_host_error() {
        let source = "call \"https://api.example.com\" method GET into resp";
        let mut vm = Vm::new(compile(source), RecordingHost::new());
        let diag = vm.run().unwrap_err();
        assert_eq!(diag.error.kind(), "runtime.host_error");
    }

    // ── Cancellation ─────────────────────────────────────────────

    #[test]
    fn cancellation_stops_cooperatively() {
        let token = CancelToken::new();
        token.cancel();
        let mut vm = Vm::new(compile("display 1"), RecordingHost::new())
            .with_cancel_token(token);
        let diag = vm.run().unwrap_err();
        assert_eq!(diag.error, RuntimeError::Cancelled);
        // Not a failure: the host sees no diagnostic.
        assert!(vm.host.failures.is_empty());
        assert!(vm.host.out.is_empty());
    }

    // ── Value semantics ──────────────────────────────────────────

    #[test]
    fn assignment_copies_value_semantics() {
        let source = "\
set a which are list of int to [1, 2]
set b to a
when a equals b then display \"equal\"";
        assert_eq!(output(source), vec!["equal"]);
    }

    #[test]
    fn date_displays_verbatim() {
        let source = "set due which is date to \"2024-12-31\"\ndisplay due";
        assert_eq!(output(source), vec!["2024-12-31"]);
    }

    #[test]
    fn date_format_patterns_apply() {
        let source = "set due which is date to \"2024-12-31\"\ndisplay format due as \"MMM dd, yyyy\"";
        assert_eq!(output(source), vec!["Dec 31, 2024"]);
    }

    #[test]
    fn round_div_half_away_from_zero() {
        assert_eq!(round_div(250, 100), 3);
        assert_eq!(round_div(249, 100), 2);
        assert_eq!(round_div(-250, 100), -3);
        assert_eq!(round_div(-249, 100), -2);
    }
}
