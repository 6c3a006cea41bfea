use serde_json::{Map, Value};

/// Fixed tag carried by every report envelope.
pub const ENVELOPE_TYPE: &str = "mender:preview-error";

/// Wrap a report payload in the envelope.
pub fn seal(payload: Value) -> Value {
    let mut envelope = Map::with_capacity(2);
    envelope.insert("type".into(), Value::String(ENVELOPE_TYPE.into()));
    envelope.insert("payload".into(), payload);
    Value::Object(envelope)
}

/// Validate the envelope and return its payload object.
/// Anything that is not `{ type: ENVELOPE_TYPE, payload: {..} }` yields `None`.
pub fn open(message: &Value) -> Option<&Map<String, Value>> {
    let envelope = message.as_object()?;
    if envelope.get("type")?.as_str()? != ENVELOPE_TYPE {
        return None;
    }
    envelope.get("payload")?.as_object()
}
