use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

/// One argument passed to a console call by hosted code.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleArg {
    Str(String),
    Number(f64),
    Bool(bool),
    Null,
    Undefined,
    Error {
        name: String,
        message: String,
        stack: Option<String>,
    },
    Object(Value),
}

impl ConsoleArg {
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        ConsoleArg::Error {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Readable text for this argument. Objects and arrays are pretty-printed JSON.
    pub fn serialize(&self) -> String {
        match self {
            ConsoleArg::Str(s) => s.clone(),
            ConsoleArg::Number(n) => n.to_string(),
            ConsoleArg::Bool(b) => b.to_string(),
            ConsoleArg::Null => "null".into(),
            ConsoleArg::Undefined => "undefined".into(),
            ConsoleArg::Error { name, message, .. } => format!("{name}: {message}"),
            ConsoleArg::Object(v) => match v {
                Value::String(s) => s.clone(),
                Value::Object(_) | Value::Array(_) => {
                    serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
                }
                other => other.to_string(),
            },
        }
    }

    /// Stack of the first error-typed argument, if any.
    fn stack(&self) -> Option<&str> {
        match self {
            ConsoleArg::Error { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

impl From<&str> for ConsoleArg {
    fn from(s: &str) -> Self {
        ConsoleArg::Str(s.to_string())
    }
}

impl From<String> for ConsoleArg {
    fn from(s: String) -> Self {
        ConsoleArg::Str(s)
    }
}

impl From<f64> for ConsoleArg {
    fn from(n: f64) -> Self {
        ConsoleArg::Number(n)
    }
}

impl From<bool> for ConsoleArg {
    fn from(b: bool) -> Self {
        ConsoleArg::Bool(b)
    }
}

impl From<Value> for ConsoleArg {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => ConsoleArg::Null,
            Value::Bool(b) => ConsoleArg::Bool(b),
            Value::String(s) => ConsoleArg::Str(s),
            Value::Number(n) => n.as_f64().map_or(ConsoleArg::Object(Value::Number(n)), ConsoleArg::Number),
            other => ConsoleArg::Object(other),
        }
    }
}

impl fmt::Display for ConsoleArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

/// Join serialized arguments with spaces, as a console would print them.
pub fn join_args(args: &[ConsoleArg]) -> String {
    args.iter()
        .map(ConsoleArg::serialize)
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn first_stack(args: &[ConsoleArg]) -> Option<String> {
    args.iter().find_map(ConsoleArg::stack).map(str::to_string)
}

/// The sandbox's original console. Interceptors observe calls and then
/// forward them here unchanged.
pub trait ConsoleSink: Send + Sync {
    fn write(&self, level: ConsoleLevel, args: &[ConsoleArg]);
}

/// Console that forwards hosted output to `tracing`.
#[derive(Debug, Default)]
pub struct TracingConsole;

impl ConsoleSink for TracingConsole {
    fn write(&self, level: ConsoleLevel, args: &[ConsoleArg]) {
        let line = join_args(args);
        match level {
            ConsoleLevel::Log => tracing::info!(target: "sandbox.console", "{line}"),
            ConsoleLevel::Warn => tracing::warn!(target: "sandbox.console", "{line}"),
            ConsoleLevel::Error => tracing::error!(target: "sandbox.console", "{line}"),
        }
    }
}

/// Console that keeps every line; lets callers verify pass-through.
#[derive(Debug, Default)]
pub struct RecordingConsole {
    lines: Mutex<Vec<(ConsoleLevel, String)>>,
}

impl RecordingConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(ConsoleLevel, String)> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConsoleSink for RecordingConsole {
    fn write(&self, level: ConsoleLevel, args: &[ConsoleArg]) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, join_args(args)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitives_serialize_plainly() {
        let args = vec![
            ConsoleArg::from("count"),
            ConsoleArg::from(3.0),
            ConsoleArg::from(true),
            ConsoleArg::Null,
            ConsoleArg::Undefined,
        ];
        assert_eq!(join_args(&args), "count 3 true null undefined");
    }

    #[test]
    fn objects_serialize_readably() {
        let arg = ConsoleArg::from(json!({ "user": { "id": 7 } }));
        let text = arg.serialize();
        assert!(text.contains("\"user\""));
        assert!(text.contains('\n'), "objects are pretty-printed");
    }

    #[test]
    fn errors_serialize_as_name_and_message() {
        let arg = ConsoleArg::Error {
            name: "TypeError".into(),
            message: "x is undefined".into(),
            stack: Some("at f (app.js:1:1)".into()),
        };
        assert_eq!(arg.serialize(), "TypeError: x is undefined");
        assert_eq!(first_stack(&[ConsoleArg::from("a"), arg]).as_deref(), Some("at f (app.js:1:1)"));
    }

    #[test]
    fn recording_console_keeps_lines() {
        let c = RecordingConsole::new();
        c.write(ConsoleLevel::Warn, &[ConsoleArg::from("careful")]);
        assert_eq!(c.lines(), vec![(ConsoleLevel::Warn, "careful".to_string())]);
    }
}
