//! The host interface: the callback table the VM invokes for I/O,
//! outbound HTTP, and storage. The VM never opens sockets or speaks SQL;
//! everything effectful lands here.

use std::collections::HashMap;

use crate::artifact::RecordSchema;
use crate::ast::DbOp;
use crate::vm::Value;

/// Host function indices, shared between the emitter and the VM's
/// `HostCall` dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostFn {
    Print = 0,
    PrintLine = 1,
    Now = 2,
    Uuid = 3,
    HttpRequest = 4,
    DbOp = 5,
    Respond = 6,
}

impl HostFn {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HostFn::Print),
            1 => Some(HostFn::PrintLine),
            2 => Some(HostFn::Now),
            3 => Some(HostFn::Uuid),
            4 => Some(HostFn::HttpRequest),
            5 => Some(HostFn::DbOp),
            6 => Some(HostFn::Respond),
            _ => None,
        }
    }
}

/// Result of an outbound `call`.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: i32,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

/// Callbacks a host supplies to a VM instance. All calls are synchronous;
/// scheduling and blocking are the host's concern.
pub trait Host {
    fn print(&mut self, text: &str);
    fn print_line(&mut self, text: &str);

    /// Current timestamp as ISO-8601 text; feeds `auto` date fields.
    fn now(&mut self) -> String;

    /// Fresh identifier; feeds `auto` text keys.
    fn uuid(&mut self) -> String;

    fn http_request(
        &mut self,
        url: &str,
        method: &str,
        body: &Value,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, String>;

    /// Storage adapter behind `DatabaseOp`. `predicate` is a list of
    /// `[field, cmp, value]` triples; `fields` is a record (create) or a
    /// list of `[field, value]` pairs (update). Returns a record, a list
    /// of records, or a status code.
    fn db_op(
        &mut self,
        op: DbOp,
        schema: &RecordSchema,
        predicate: &Value,
        fields: &Value,
    ) -> Result<Value, String>;

    /// The `respond` primitive. The VM also records the response in its
    /// own response register; this hook exists for streaming hosts.
    fn respond(&mut self, _status: i32, _body: &str) {}

    /// Runtime diagnostic notification before the error propagates.
    fn fail(&mut self, _kind: &str, _message: &str, _at: usize) {}
}

// ── Standard host ────────────────────────────────────────────────

/// Plain process host: stdout, wall clock, random UUIDs. Outbound HTTP
/// and storage are not wired; embedders override them.
#[derive(Debug, Default)]
pub struct StdHost;

impl Host for StdHost {
    fn print(&mut self, text: &str) {
        print!("{text}");
    }

    fn print_line(&mut self, text: &str) {
        println!("{text}");
    }

    fn now(&mut self) -> String {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    fn uuid(&mut self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn http_request(
        &mut self,
        url: &str,
        _method: &str,
        _body: &Value,
        _headers: &[(String, String)],
    ) -> Result<HttpResponse, String> {
        Err(format!("outbound HTTP is not available in this host (calling {url})"))
    }

    fn db_op(
        &mut self,
        op: DbOp,
        schema: &RecordSchema,
        _predicate: &Value,
        _fields: &Value,
    ) -> Result<Value, String> {
        Err(format!(
            "no storage adapter is configured (db {} {})",
            op.as_str(),
            schema.name
        ))
    }
}

// ── Recording host ───────────────────────────────────────────────

/// Deterministic host for tests and headless runs: captures output,
/// serves a fixed clock and sequential UUIDs, answers HTTP from a queue,
/// and backs `db` operations with an in-memory store.
#[derive(Debug, Default)]
pub struct RecordingHost {
    /// Completed output lines.
    pub out: Vec<String>,
    partial: String,
    uuid_counter: u32,
    /// Responses handed out FIFO to `http_request`.
    pub http_responses: Vec<HttpResponse>,
    /// `(url, method)` of every outbound call.
    pub http_calls: Vec<(String, String)>,
    /// Failures observed through `fail`.
    pub failures: Vec<String>,
    store: HashMap<String, Vec<Value>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn eval_predicate(schema: &RecordSchema, record: &Value, predicate: &Value) -> bool {
        let Value::List(triples) = predicate else { return true };
        let Value::Record { fields, .. } = record else { return false };
        triples.iter().all(|triple| {
            let Value::List(parts) = triple else { return false };
            let [Value::Text(field), Value::Text(cmp), expected] = parts.as_slice() else {
                return false;
            };
            let Some(position) = schema.fields.iter().position(|f| f.name == *field) else {
                return false;
            };
            let Some(actual) = fields.get(position) else { return false };
            match cmp.as_str() {
                "eq" => actual == expected,
                "ne" => actual != expected,
                "lt" => Value::order(actual, expected).is_some_and(std::cmp::Ordering::is_lt),
                "le" => Value::order(actual, expected).is_some_and(std::cmp::Ordering::is_le),
                "gt" => Value::order(actual, expected).is_some_and(std::cmp::Ordering::is_gt),
                "ge" => Value::order(actual, expected).is_some_and(std::cmp::Ordering::is_ge),
                _ => false,
            }
        })
    }
}

impl Host for RecordingHost {
    fn print(&mut self, text: &str) {
        self.partial.push_str(text);
    }

    fn print_line(&mut self, text: &str) {
        let mut line = std::mem::take(&mut self.partial);
        line.push_str(text);
        self.out.push(line);
    }

    fn now(&mut self) -> String {
        "2024-01-15T10:00:00Z".to_string()
    }

    fn uuid(&mut self) -> String {
        self.uuid_counter += 1;
        format!("00000000-0000-4000-8000-{:012}", self.uuid_counter)
    }

    fn http_request(
        &mut self,
        url: &str,
        method: &str,
        _body: &Value,
        _headers: &[(String, String)],
    ) -> Result<HttpResponse, String> {
        self.http_calls.push((url.to_string(), method.to_string()));
        if self.http_responses.is_empty() {
            return Err(format!("no scripted response for {method} {url}"));
        }
        Ok(self.http_responses.remove(0))
    }

    fn db_op(
        &mut self,
        op: DbOp,
        schema: &RecordSchema,
        predicate: &Value,
        fields: &Value,
    ) -> Result<Value, String> {
        let rows = self.store.entry(schema.name.clone()).or_default();
        match op {
            DbOp::Create => {
                rows.push(fields.clone());
                Ok(fields.clone())
            }
            DbOp::Find => rows
                .iter()
                .find(|row| Self::eval_predicate(schema, row, predicate))
                .cloned()
                .ok_or_else(|| format!("no {} matches the predicate", schema.name)),
            DbOp::FindAll => Ok(Value::List(
                rows.iter()
                    .filter(|row| Self::eval_predicate(schema, row, predicate))
                    .cloned()
                    .collect(),
            )),
            DbOp::Update => {
                let Value::List(pairs) = fields else {
                    return Err("malformed field set".to_string());
                };
                let mut updated = 0;
                for row in rows.iter_mut() {
                    if !Self::eval_predicate(schema, row, predicate) {
                        continue;
                    }
                    let Value::Record { fields: row_fields, .. } = row else { continue };
                    for pair in pairs {
                        let Value::List(kv) = pair else { continue };
                        let [Value::Text(field), value] = kv.as_slice() else { continue };
                        if let Some(position) =
                            schema.fields.iter().position(|f| f.name == *field)
                        {
                            row_fields[position] = value.clone();
                        }
                    }
                    updated += 1;
                }
                Ok(Value::Int(updated))
            }
            DbOp::Delete => {
                let before = rows.len();
                rows.retain(|row| !Self::eval_predicate(schema, row, predicate));
                Ok(Value::Int((before - rows.len()) as i32))
            }
        }
    }

    fn fail(&mut self, kind: &str, message: &str, _at: usize) {
        self.failures.push(format!("{kind}: {message}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_fn_round_trip() {
        for index in 0..7u8 {
            let f = HostFn::from_u8(index).expect("index maps to a host fn");
            assert_eq!(f as u8, index);
        }
        assert!(HostFn::from_u8(7).is_none());
    }

    #[test]
    fn recording_host_sequences_uuids() {
        let mut host = RecordingHost::new();
        let first = host.uuid();
        let second = host.uuid();
        assert_ne!(first, second);
        assert!(first.ends_with("000001"));
    }

    #[test]
    fn print_concatenates_until_line() {
        let mut host = RecordingHost::new();
        host.print("a");
        host.print("b");
        host.print_line("c");
        assert_eq!(host.out, vec!["abc".to_string()]);
    }
}
