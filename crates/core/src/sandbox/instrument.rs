use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::console::{ConsoleLevel, first_stack, join_args};
use super::context::{Interceptor, SandboxContext, Signal, SignalCategory};
use crate::channel::{ReportTransport, seal};
use crate::config::InstrumentationConfig;
use crate::types::{ErrorKind, Origin, Severity};

/// Message of the one-time initialization report.
pub const INIT_MESSAGE: &str = "runtime error capture initialized";

/// Wire shape of one report, as emitted by the sandbox.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub kind: ErrorKind,
    pub message: String,
    pub severity: Severity,
    /// Sandbox clock, epoch milliseconds.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_stack: Option<String>,
    pub origin: Origin,
}

impl Report {
    fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            severity,
            timestamp: Utc::now().timestamp_millis(),
            source: None,
            line: None,
            column: None,
            stack: None,
            method: None,
            url: None,
            status: None,
            component_stack: None,
            origin: Origin::default(),
        }
    }
}

/// Builds envelopes and posts them. Never fails outward.
#[derive(Clone)]
pub struct Reporter {
    transport: Arc<dyn ReportTransport>,
    origin: Origin,
}

impl Reporter {
    pub fn new(transport: Arc<dyn ReportTransport>, origin: Origin) -> Self {
        Self { transport, origin }
    }

    pub fn emit(&self, mut report: Report) {
        report.origin = self.origin.clone();
        let kind = report.kind;
        let payload = match serde_json::to_value(report) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, %kind, "report serialization failed, dropped");
                return;
            }
        };
        if let Err(e) = self.transport.post(seal(payload)) {
            tracing::debug!(error = %e, %kind, "report transport failed, dropped");
        }
    }
}

/// Instrument `ctx`. Only the first call per context installs interceptors;
/// later calls return false and change nothing.
pub fn install(
    ctx: &SandboxContext,
    cfg: InstrumentationConfig,
    transport: Arc<dyn ReportTransport>,
) -> bool {
    if !ctx.claim_install() {
        tracing::debug!(url = ?ctx.origin().url, "instrumentation already installed");
        return false;
    }
    let reporter = Reporter::new(transport, ctx.origin().clone());

    ctx.attach(SignalCategory::Uncaught, interceptor(&reporter, |signal| match signal {
        Signal::Uncaught(fault) => {
            let mut r = Report::new(ErrorKind::Script, Severity::Error, fault.message.clone());
            r.source = fault.source.clone();
            r.line = fault.line;
            r.column = fault.column;
            r.stack = fault.stack.clone();
            Some(r)
        }
        _ => None,
    }));

    ctx.attach(SignalCategory::Rejection, interceptor(&reporter, |signal| match signal {
        Signal::Rejection(rejection) => {
            let mut r = Report::new(
                ErrorKind::UnhandledRejection,
                Severity::Error,
                format!("Unhandled Promise Rejection: {}", rejection.message),
            );
            r.stack = rejection.stack.clone();
            Some(r)
        }
        _ => None,
    }));

    if cfg.enable_console_capture {
        ctx.attach(SignalCategory::Console, interceptor(&reporter, |signal| match signal {
            Signal::Console(level, args) => {
                let (kind, severity) = match level {
                    ConsoleLevel::Error => (ErrorKind::ConsoleError, Severity::Error),
                    ConsoleLevel::Warn => (ErrorKind::ConsoleWarning, Severity::Warning),
                    ConsoleLevel::Log => return None,
                };
                let mut r = Report::new(kind, severity, join_args(args));
                r.stack = first_stack(args);
                Some(r)
            }
            _ => None,
        }));
    }

    if cfg.enable_network_error_capture {
        ctx.attach(SignalCategory::Network, interceptor(&reporter, |signal| match signal {
            Signal::NetworkFailure(failure) => {
                let mut r = Report::new(
                    ErrorKind::NetworkFailure,
                    Severity::Error,
                    format!("{} {} failed: {}", failure.method, failure.url, failure.reason),
                );
                r.method = Some(failure.method.clone());
                r.url = Some(failure.url.clone());
                r.status = failure.status;
                Some(r)
            }
            _ => None,
        }));
    }

    if cfg.enable_performance_monitoring {
        let threshold = cfg.slow_load_threshold;
        ctx.attach(SignalCategory::PageLoad, interceptor(&reporter, move |signal| match signal {
            Signal::PageLoad(elapsed) if *elapsed > threshold => Some(Report::new(
                ErrorKind::Performance,
                Severity::Warning,
                format!(
                    "Slow page load: {}ms (threshold {}ms)",
                    elapsed.as_millis(),
                    threshold.as_millis()
                ),
            )),
            _ => None,
        }));
    }

    reporter.emit(Report::new(ErrorKind::System, Severity::Info, INIT_MESSAGE));
    ctx.set_reporter(reporter);
    tracing::info!(
        url = ?ctx.origin().url,
        console = cfg.enable_console_capture,
        network = cfg.enable_network_error_capture,
        performance = cfg.enable_performance_monitoring,
        "sandbox instrumentation installed"
    );
    true
}

fn interceptor<F>(reporter: &Reporter, to_report: F) -> Interceptor
where
    F: Fn(&Signal<'_>) -> Option<Report> + Send + Sync + 'static,
{
    let reporter = reporter.clone();
    Arc::new(move |signal: &Signal<'_>| {
        if let Some(report) = to_report(signal) {
            reporter.emit(report);
        }
    })
}

impl SandboxContext {
    /// Entry point for error-boundary constructs in hosted code: forwards an
    /// error together with its component stack. Returns false when the
    /// context is not instrumented.
    pub fn report_boundary_error(
        &self,
        message: &str,
        stack: Option<&str>,
        component_stack: Option<&str>,
    ) -> bool {
        let Some(reporter) = self.reporter() else {
            return false;
        };
        let mut r = Report::new(ErrorKind::Script, Severity::Error, message);
        r.stack = stack.map(str::to_string);
        r.component_stack = component_stack.map(str::to_string);
        reporter.emit(r);
        true
    }

    /// Entry point for framework-level reports tagged with an explicit kind.
    pub fn report_framework_error(
        &self,
        kind: ErrorKind,
        severity: Severity,
        message: &str,
        stack: Option<&str>,
    ) -> bool {
        let Some(reporter) = self.reporter() else {
            return false;
        };
        let mut r = Report::new(kind, severity, message);
        r.stack = stack.map(str::to_string);
        reporter.emit(r);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{TransportError, channel, open};
    use crate::sandbox::console::ConsoleArg;
    use crate::sandbox::context::ScriptFault;
    use std::time::Duration;

    struct BrokenTransport;

    impl ReportTransport for BrokenTransport {
        fn post(&self, _message: serde_json::Value) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }
    }

    fn drain(rx: &mut crate::channel::InboundReceiver) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(open(&msg).unwrap().clone().into());
        }
        out
    }

    #[test]
    fn install_emits_one_init_report() {
        let ctx = SandboxContext::offline("http://preview.local/");
        let (tx, mut rx) = channel(16);
        assert!(install(&ctx, InstrumentationConfig::default(), Arc::new(tx.clone())));
        assert!(!install(&ctx, InstrumentationConfig::default(), Arc::new(tx)));
        let reports = drain(&mut rx);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0]["kind"], "system");
        assert_eq!(reports[0]["severity"], "info");
        assert_eq!(reports[0]["origin"]["url"], "http://preview.local/");
    }

    #[test]
    fn double_install_does_not_double_report() {
        let ctx = SandboxContext::offline("http://preview.local/");
        let (tx, mut rx) = channel(16);
        install(&ctx, InstrumentationConfig::default(), Arc::new(tx.clone()));
        install(&ctx, InstrumentationConfig::default(), Arc::new(tx));
        let _ = ctx.raise(ScriptFault::new("TypeError: x is undefined").at("app.js", 4, 2));
        let reports = drain(&mut rx);
        let scripts: Vec<_> = reports.iter().filter(|r| r["kind"] == "script").collect();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0]["line"], 4);
    }

    #[test]
    fn console_warnings_and_errors_are_captured_logs_are_not() {
        let ctx = SandboxContext::offline("http://preview.local/");
        let (tx, mut rx) = channel(16);
        install(&ctx, InstrumentationConfig::default(), Arc::new(tx));
        ctx.console_log(&[ConsoleArg::from("hello")]);
        ctx.console_warn(&[ConsoleArg::from("deprecated")]);
        ctx.console_error(&[ConsoleArg::from("failed:"), ConsoleArg::from(serde_json::json!({"a": 1}))]);
        let reports = drain(&mut rx);
        let kinds: Vec<_> = reports.iter().map(|r| r["kind"].as_str().unwrap().to_string()).collect();
        assert_eq!(kinds, vec!["system", "consoleWarning", "consoleError"]);
        assert!(reports[2]["message"].as_str().unwrap().starts_with("failed: {"));
    }

    #[test]
    fn disabled_console_capture_installs_no_console_interceptor() {
        let ctx = SandboxContext::offline("http://preview.local/");
        let (tx, mut rx) = channel(16);
        let cfg = InstrumentationConfig { enable_console_capture: false, ..Default::default() };
        install(&ctx, cfg, Arc::new(tx));
        ctx.console_error(&[ConsoleArg::from("quiet")]);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn slow_load_reported_only_when_enabled_and_over_threshold() {
        let ctx = SandboxContext::offline("http://preview.local/");
        let (tx, mut rx) = channel(16);
        let cfg = InstrumentationConfig {
            enable_performance_monitoring: true,
            slow_load_threshold: Duration::from_millis(3000),
            ..Default::default()
        };
        install(&ctx, cfg, Arc::new(tx));
        ctx.finish_load(Duration::from_millis(1200));
        ctx.finish_load(Duration::from_millis(4500));
        let reports = drain(&mut rx);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1]["kind"], "performance");
        assert_eq!(reports[1]["severity"], "warning");
    }

    #[test]
    fn broken_transport_never_breaks_hosted_code() {
        let ctx = SandboxContext::offline("http://preview.local/");
        assert!(install(&ctx, InstrumentationConfig::default(), Arc::new(BrokenTransport)));
        let fault = ScriptFault::new("boom");
        assert_eq!(ctx.raise(fault.clone()), Err(fault));
        ctx.console_error(&[ConsoleArg::from("still fine")]);
    }

    #[test]
    fn helper_entry_points_require_installation() {
        let ctx = SandboxContext::offline("http://preview.local/");
        assert!(!ctx.report_boundary_error("render failed", None, Some("in <App>")));

        let (tx, mut rx) = channel(16);
        install(&ctx, InstrumentationConfig::default(), Arc::new(tx));
        assert!(ctx.report_boundary_error("render failed", Some("at App"), Some("in <App>")));
        assert!(ctx.report_framework_error(ErrorKind::ConsoleWarning, Severity::Warning, "slow watcher", None));
        let reports = drain(&mut rx);
        assert_eq!(reports[1]["componentStack"], "in <App>");
        assert_eq!(reports[2]["kind"], "consoleWarning");
    }
}
