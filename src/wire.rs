//! Wire data model: calls, returns, and response-queue messages.
//!
//! The JSON shapes are field-stable: `callId`, `name`, `args`,
//! `responseQueueId`, `start` on a call; tagged `kind` on returns and queue
//! messages. Transports additionally duplicate `callId` as a message
//! attribute so routing can happen before payload decode, but that attribute
//! is a driver concern and never appears in these structs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One serialized logical invocation, as published to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub call_id: String,
    pub name: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_queue_id: Option<String>,
    /// Local epoch ms at publish time.
    pub start: i64,
    /// Retry counter, bumped only by the engine. Never crosses the wire.
    #[serde(skip)]
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnKind {
    Returned,
    Error,
}

/// The error shape crossing the wire. Arbitrary own properties of the remote
/// error survive in `extra`; [`ErrorPayload::string_properties`] filters the
/// string-valued ones callers are promised.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ErrorPayload {
    /// The string-valued own properties of the remote error.
    pub fn string_properties(&self) -> BTreeMap<String, String> {
        self.extra
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
            .collect()
    }
}

/// Terminal outcome of one remote execution. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnPayload {
    pub kind: ReturnKind,
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_execution_start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_execution_end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_response_sent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl ReturnPayload {
    pub fn returned(call_id: impl Into<String>, value: Value) -> Self {
        Self {
            kind: ReturnKind::Returned,
            call_id: call_id.into(),
            value: Some(value),
            error: None,
            remote_execution_start: None,
            remote_execution_end: None,
            remote_response_sent: None,
            log_url: None,
            instance_id: None,
            execution_id: None,
        }
    }

    pub fn error(call_id: impl Into<String>, error: ErrorPayload) -> Self {
        Self {
            kind: ReturnKind::Error,
            call_id: call_id.into(),
            value: None,
            error: Some(error),
            remote_execution_start: None,
            remote_execution_end: None,
            remote_response_sent: None,
            log_url: None,
            instance_id: None,
            execution_id: None,
        }
    }
}

/// CPU usage snapshot a provider may report mid-execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub utime: f64,
    pub stime: f64,
    pub elapsed: f64,
}

/// Everything that can arrive on the response queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResponseMessage {
    #[serde(rename_all = "camelCase")]
    Response { call_id: String, body: ReturnPayload },
    #[serde(rename_all = "camelCase")]
    FunctionStarted { call_id: String },
    #[serde(rename_all = "camelCase")]
    DeadLetter {
        call_id: String,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CpuMetrics { call_id: String, metrics: CpuMetrics },
    StopQueue,
}

/// Control messages the client publishes to its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    StopQueue,
}

const ROUNDTRIP_MAX_DEPTH: usize = 64;

/// Serialize `args` to its wire text, re-parse, and structurally compare.
/// Returns the wire text plus human-readable warnings for every position
/// where the round trip lost information. Warnings never fail a call.
pub fn serialize_args_checked(args: &Value) -> Result<(String, Vec<String>), serde_json::Error> {
    let text = serde_json::to_string(args)?;
    let reparsed: Value = serde_json::from_str(&text)?;
    let mut warnings = Vec::new();
    diff_values(args, &reparsed, &mut String::from("$"), 0, &mut warnings);
    Ok((text, warnings))
}

fn diff_values(a: &Value, b: &Value, path: &mut String, depth: usize, out: &mut Vec<String>) {
    if depth > ROUNDTRIP_MAX_DEPTH {
        out.push(format!("{}: exceeded depth {}, not compared", path, ROUNDTRIP_MAX_DEPTH));
        return;
    }
    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => {
            if xs.len() != ys.len() {
                out.push(format!("{}: array length {} became {}", path, xs.len(), ys.len()));
                return;
            }
            for (i, (x, y)) in xs.iter().zip(ys).enumerate() {
                let len = path.len();
                path.push_str(&format!("[{}]", i));
                diff_values(x, y, path, depth + 1, out);
                path.truncate(len);
            }
        }
        (Value::Object(xs), Value::Object(ys)) => {
            for (key, x) in xs {
                let len = path.len();
                path.push('.');
                path.push_str(key);
                match ys.get(key) {
                    Some(y) => diff_values(x, y, path, depth + 1, out),
                    None => out.push(format!("{}: dropped by serialization", path)),
                }
                path.truncate(len);
            }
            for key in ys.keys() {
                if !xs.contains_key(key) {
                    out.push(format!("{}.{}: introduced by serialization", path, key));
                }
            }
        }
        (x, y) if x == y => {}
        (x, y) => out.push(format!("{}: {} became {}", path, x, y)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_wire_shape_is_field_stable() {
        let call = Call {
            call_id: "c-1".into(),
            name: "hello".into(),
            args: json!(["world"]),
            response_queue_id: Some("q-1".into()),
            start: 1_700_000_000_000,
            attempt: 0,
        };
        let text = serde_json::to_string(&call).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["callId"], "c-1");
        assert_eq!(v["name"], "hello");
        assert_eq!(v["args"][0], "world");
        assert_eq!(v["responseQueueId"], "q-1");
        assert_eq!(v["start"], 1_700_000_000_000i64);

        let back: Call = serde_json::from_str(&text).unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn queue_message_kinds_decode() {
        let msg: ResponseMessage = serde_json::from_value(json!({
            "kind": "response",
            "callId": "c-2",
            "body": { "kind": "returned", "callId": "c-2", "value": 42 }
        }))
        .unwrap();
        match msg {
            ResponseMessage::Response { call_id, body } => {
                assert_eq!(call_id, "c-2");
                assert_eq!(body.kind, ReturnKind::Returned);
                assert_eq!(body.value, Some(json!(42)));
            }
            other => panic!("expected response, got {:?}", other),
        }

        let msg: ResponseMessage =
            serde_json::from_value(json!({ "kind": "functionstarted", "callId": "c-3" })).unwrap();
        assert_eq!(msg, ResponseMessage::FunctionStarted { call_id: "c-3".into() });

        let msg: ResponseMessage =
            serde_json::from_value(json!({ "kind": "stopqueue" })).unwrap();
        assert_eq!(msg, ResponseMessage::StopQueue);

        let msg: ResponseMessage = serde_json::from_value(json!({
            "kind": "deadletter", "callId": "c-4", "message": "delivery failed"
        }))
        .unwrap();
        assert_eq!(
            msg,
            ResponseMessage::DeadLetter {
                call_id: "c-4".into(),
                message: Some("delivery failed".into())
            }
        );
    }

    #[test]
    fn error_payload_preserves_extra_string_properties() {
        let payload: ErrorPayload = serde_json::from_value(json!({
            "name": "TypeError",
            "message": "boom",
            "stack": "at line 1",
            "code": "E_BOOM",
            "requestId": "r-9",
            "attempts": 3
        }))
        .unwrap();
        assert_eq!(payload.name, "TypeError");
        let strings = payload.string_properties();
        assert_eq!(strings.get("code").map(String::as_str), Some("E_BOOM"));
        assert_eq!(strings.get("requestId").map(String::as_str), Some("r-9"));
        assert!(!strings.contains_key("attempts"), "non-string properties filtered");

        let round: ErrorPayload =
            serde_json::from_value(serde_json::to_value(&payload).unwrap()).unwrap();
        assert_eq!(round, payload);
    }

    #[test]
    fn clean_args_round_trip_without_warnings() {
        let (text, warnings) =
            serialize_args_checked(&json!([1, "two", { "three": [3.5, null] }])).unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        assert!(text.contains("two"));
    }

    #[test]
    fn structural_differences_produce_path_warnings() {
        // Simulate a lossy conversion by diffing two different trees directly.
        let mut warnings = Vec::new();
        diff_values(
            &json!({ "a": 1, "b": { "c": [1, 2] } }),
            &json!({ "a": 1, "b": { "c": [1, null] } }),
            &mut String::from("$"),
            0,
            &mut warnings,
        );
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("$.b.c[1]"), "got {:?}", warnings);
    }

    #[test]
    fn dropped_keys_reported() {
        let mut warnings = Vec::new();
        diff_values(
            &json!({ "keep": 1, "lost": 2 }),
            &json!({ "keep": 1 }),
            &mut String::from("$"),
            0,
            &mut warnings,
        );
        assert_eq!(warnings, vec!["$.lost: dropped by serialization".to_owned()]);
    }
}
