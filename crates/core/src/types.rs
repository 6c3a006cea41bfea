use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Fault records ──────────────────────────────────────────────

/// Category of a runtime fault observed inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Uncaught synchronous error.
    Script,
    UnhandledRejection,
    ConsoleError,
    ConsoleWarning,
    NetworkFailure,
    /// Abnormally slow page load.
    Performance,
    /// Instrumentation lifecycle report.
    System,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Script,
        ErrorKind::UnhandledRejection,
        ErrorKind::ConsoleError,
        ErrorKind::ConsoleWarning,
        ErrorKind::NetworkFailure,
        ErrorKind::Performance,
        ErrorKind::System,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Script => "script",
            ErrorKind::UnhandledRejection => "unhandledRejection",
            ErrorKind::ConsoleError => "consoleError",
            ErrorKind::ConsoleWarning => "consoleWarning",
            ErrorKind::NetworkFailure => "networkFailure",
            ErrorKind::Performance => "performance",
            ErrorKind::System => "system",
        }
    }

    /// Parse the wire tag. Unknown tags yield `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }

    /// Severity assumed when a report omits one.
    pub fn default_severity(self) -> Severity {
        match self {
            ErrorKind::Script
            | ErrorKind::UnhandledRejection
            | ErrorKind::ConsoleError
            | ErrorKind::NetworkFailure => Severity::Error,
            ErrorKind::ConsoleWarning | ErrorKind::Performance => Severity::Warning,
            ErrorKind::System => Severity::Info,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "info" => Some(Severity::Info),
            "warning" | "warn" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// Diagnostic metadata about the reporting context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub url: Option<String>,
    pub user_agent: Option<String>,
}

/// Request details attached to `networkFailure` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDetail {
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
}

/// Canonical fault record produced by the classifier.
/// `message` is never empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewError {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    pub source: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub stack: Option<String>,
    pub severity: Severity,
    /// Emission time in the sandbox's clock (host arrival time when absent).
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    pub network: Option<NetworkDetail>,
    pub component_stack: Option<String>,
    /// Progress percentage found in the message text, if any.
    pub progress: Option<u8>,
}

impl PreviewError {
    /// Minimal record, mostly for tests and operator-injected faults.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            source: None,
            line: None,
            column: None,
            stack: None,
            severity: kind.default_severity(),
            timestamp: Utc::now(),
            origin: Origin::default(),
            network: None,
            component_stack: None,
            progress: None,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            kind: self.kind,
            message: self.message.clone(),
        }
    }

    /// Short location suffix for logs and prompts, e.g. `app.js:12:4`.
    pub fn location(&self) -> Option<String> {
        let source = self.source.as_deref()?;
        Some(match (self.line, self.column) {
            (Some(l), Some(c)) => format!("{source}:{l}:{c}"),
            (Some(l), None) => format!("{source}:{l}"),
            _ => source.to_string(),
        })
    }
}

/// Identity of a fault for dedup and recurrence: kind plus normalized message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ── Repair attempts ────────────────────────────────────────────

/// One replacement produced by the patch-generation capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePatch {
    pub path: String,
    pub new_content: String,
}

/// File-set snapshot handed to the patch generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairContext {
    pub files: BTreeMap<String, String>,
    pub active_file: Option<String>,
    /// Short description of the operation that preceded the fault.
    pub last_operation: Option<String>,
    /// Failure reasons of earlier attempts on the same fault.
    pub prior_failures: Vec<String>,
    /// Per-file revision at snapshot time, used to detect concurrent edits.
    #[serde(skip)]
    pub revisions: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairStatus {
    Pending,
    Succeeded,
    Failed,
}

impl RepairStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RepairStatus::Pending)
    }
}

/// One attempt to fix one error. Immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeRepairRequest {
    pub attempt_id: u64,
    pub error: PreviewError,
    pub context: RepairContext,
    pub status: RepairStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure reason for `failed` attempts.
    pub failure: Option<String>,
    /// Paths rewritten by a `succeeded` attempt.
    pub patched_paths: Vec<String>,
}

// ── Breaker state ──────────────────────────────────────────────

/// Per-session circuit breaker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub tripped: bool,
    pub tripped_reason: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_round_trip() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::Value::String(kind.as_str().into()));
        }
        assert_eq!(ErrorKind::parse("segfault"), None);
    }

    #[test]
    fn default_severity_by_kind() {
        assert_eq!(ErrorKind::Script.default_severity(), Severity::Error);
        assert_eq!(ErrorKind::Performance.default_severity(), Severity::Warning);
        assert_eq!(ErrorKind::System.default_severity(), Severity::Info);
        assert!(Severity::Error > Severity::Warning);
    }

    #[test]
    fn location_formats() {
        let mut e = PreviewError::new(ErrorKind::Script, "boom");
        assert_eq!(e.location(), None);
        e.source = Some("app.js".into());
        e.line = Some(12);
        assert_eq!(e.location().as_deref(), Some("app.js:12"));
        e.column = Some(4);
        assert_eq!(e.location().as_deref(), Some("app.js:12:4"));
    }

    #[test]
    fn patch_uses_camel_case_on_the_wire() {
        let p: FilePatch =
            serde_json::from_str(r#"{"path":"a.js","newContent":"x"}"#).unwrap();
        assert_eq!(p.new_content, "x");
    }
}
