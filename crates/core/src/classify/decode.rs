use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::normalize::{self, MAX_STACK_CHARS};
use crate::types::{ErrorKind, NetworkDetail, Origin, PreviewError, Severity};

/// Decode an untrusted payload into a canonical record.
///
/// Every field is type-checked before use. Returns `None` for an unknown
/// kind or a message that is missing, not a string, or empty once cleaned.
pub fn decode(payload: &Map<String, Value>, received_at: DateTime<Utc>) -> Option<PreviewError> {
    let kind = ErrorKind::parse(payload.get("kind")?.as_str()?)?;
    let message = normalize::normalize_message(payload.get("message")?.as_str()?);
    if message.is_empty() {
        return None;
    }

    let severity = str_field(payload, "severity")
        .and_then(Severity::parse)
        .unwrap_or_else(|| kind.default_severity());
    let progress = normalize::extract_progress(&message);

    Some(PreviewError {
        id: Uuid::new_v4(),
        kind,
        source: owned(payload, "source", 1024),
        line: u32_field(payload, "line"),
        column: u32_field(payload, "column"),
        stack: owned(payload, "stack", MAX_STACK_CHARS),
        severity,
        timestamp: timestamp(payload.get("timestamp")).unwrap_or(received_at),
        origin: origin(payload.get("origin")),
        network: network(payload),
        component_stack: owned(payload, "componentStack", MAX_STACK_CHARS),
        progress,
        message,
    })
}

fn str_field<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key)?.as_str()
}

fn owned(payload: &Map<String, Value>, key: &str, max: usize) -> Option<String> {
    str_field(payload, key)
        .filter(|s| !s.trim().is_empty())
        .map(|s| normalize::truncate_chars(s, max))
}

fn u32_field(payload: &Map<String, Value>, key: &str) -> Option<u32> {
    payload.get(key)?.as_u64().and_then(|v| u32::try_from(v).ok())
}

/// Epoch milliseconds (integer or float) or an RFC 3339 string.
fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            DateTime::from_timestamp_millis(millis)
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

fn origin(value: Option<&Value>) -> Origin {
    let Some(obj) = value.and_then(Value::as_object) else {
        return Origin::default();
    };
    Origin {
        url: owned(obj, "url", 2048),
        user_agent: owned(obj, "userAgent", 512),
    }
}

fn network(payload: &Map<String, Value>) -> Option<NetworkDetail> {
    let method = str_field(payload, "method")?;
    let url = str_field(payload, "url")?;
    Some(NetworkDetail {
        method: normalize::truncate_chars(method, 16).to_uppercase(),
        url: normalize::truncate_chars(url, 2048),
        status: payload
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn decodes_full_script_report() {
        let p = obj(json!({
            "kind": "script",
            "message": "[preview] Uncaught TypeError: a is undefined",
            "severity": "error",
            "timestamp": 1_714_557_733_120_i64,
            "source": "src/app.js",
            "line": 12,
            "column": 5,
            "stack": "at render (src/app.js:12:5)",
            "origin": { "url": "http://preview.local/", "userAgent": "sandbox" }
        }));
        let e = decode(&p, Utc::now()).unwrap();
        assert_eq!(e.kind, ErrorKind::Script);
        assert_eq!(e.message, "TypeError: a is undefined");
        assert_eq!(e.line, Some(12));
        assert_eq!(e.timestamp.timestamp_millis(), 1_714_557_733_120);
        assert_eq!(e.origin.user_agent.as_deref(), Some("sandbox"));
    }

    #[test]
    fn drops_unclassifiable_reports() {
        let now = Utc::now();
        assert!(decode(&obj(json!({ "kind": "mystery", "message": "x" })), now).is_none());
        assert!(decode(&obj(json!({ "kind": "script" })), now).is_none());
        assert!(decode(&obj(json!({ "kind": "script", "message": 42 })), now).is_none());
        assert!(decode(&obj(json!({ "kind": "script", "message": "  " })), now).is_none());
        assert!(decode(&obj(json!({ "kind": ["script"], "message": "x" })), now).is_none());
    }

    #[test]
    fn ill_typed_optional_fields_are_ignored() {
        let now = Utc::now();
        let p = obj(json!({
            "kind": "consoleWarning",
            "message": "deprecated api",
            "severity": 3,
            "line": "12",
            "column": -1,
            "timestamp": "yesterday",
            "origin": "http://evil/"
        }));
        let e = decode(&p, now).unwrap();
        assert_eq!(e.severity, Severity::Warning);
        assert_eq!(e.line, None);
        assert_eq!(e.column, None);
        assert_eq!(e.timestamp, now);
        assert_eq!(e.origin, Origin::default());
    }

    #[test]
    fn network_detail_requires_method_and_url() {
        let now = Utc::now();
        let p = obj(json!({
            "kind": "networkFailure",
            "message": "GET /api failed: 500",
            "method": "get",
            "url": "/api",
            "status": 500
        }));
        let e = decode(&p, now).unwrap();
        let n = e.network.unwrap();
        assert_eq!(n.method, "GET");
        assert_eq!(n.status, Some(500));

        let p = obj(json!({ "kind": "networkFailure", "message": "x", "url": "/api" }));
        assert!(decode(&p, now).unwrap().network.is_none());
    }

    #[test]
    fn rfc3339_timestamps_and_progress() {
        let p = obj(json!({
            "kind": "system",
            "message": "building 37%",
            "timestamp": "2024-05-01T10:00:00Z"
        }));
        let e = decode(&p, Utc::now()).unwrap();
        assert_eq!(e.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(e.progress, Some(37));
        assert_eq!(e.severity, Severity::Info);
    }
}
