//! Sandbox instrumentation through the channel into the classifier, without
//! a session: what crosses the boundary and what the host keeps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mender_core::channel::{self, InboundReceiver, ReportTransport};
use mender_core::classify::Classifier;
use mender_core::config::MenderCfg;
use mender_core::sandbox::{
    ConsoleArg, ConsoleLevel, INIT_MESSAGE, NetworkError, NetworkRequest, NetworkResponse,
    RecordingConsole, Rejection, SandboxContext, ScriptFault, ScriptedNetwork, install,
};
use mender_core::types::{ErrorKind, Origin, PreviewError, Severity};
use serde_json::{Value, json};

fn sandbox(console: Arc<RecordingConsole>) -> SandboxContext {
    let network = ScriptedNetwork::new()
        .route("http://preview.local/api/ok", Ok(NetworkResponse::ok("{}")))
        .route(
            "http://preview.local/api/broken",
            Ok(NetworkResponse::status(500, "Internal Server Error")),
        )
        .route("http://preview.local/api/slow", Err(NetworkError::Timeout));
    SandboxContext::new(
        Origin {
            url: Some("http://preview.local/".into()),
            user_agent: Some("test-sandbox".into()),
        },
        console,
        Arc::new(network),
    )
}

fn drain(rx: &mut InboundReceiver) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(v) = rx.try_recv() {
        out.push(v);
    }
    out
}

fn classify(messages: &[Value], window: Duration) -> Vec<PreviewError> {
    let mut classifier = Classifier::new(window);
    let now = Instant::now();
    messages
        .iter()
        .filter_map(|m| classifier.ingest(m, now))
        .collect()
}

#[test]
fn installing_twice_reports_initialisation_once() {
    let ctx = sandbox(Arc::new(RecordingConsole::new()));
    let (tx, mut rx) = channel::channel(64);
    let cfg = MenderCfg::default();

    assert!(install(&ctx, cfg.instrumentation(), Arc::new(tx.clone())));
    assert!(!install(&ctx, cfg.instrumentation(), Arc::new(tx)));

    let _ = ctx.raise(ScriptFault::new("TypeError: a is undefined"));
    let errors = classify(&drain(&mut rx), Duration::from_secs(3));

    let inits: Vec<_> = errors.iter().filter(|e| e.kind == ErrorKind::System).collect();
    assert_eq!(inits.len(), 1);
    assert_eq!(inits[0].severity, Severity::Info);
    assert_eq!(inits[0].message, INIT_MESSAGE);
    // One interceptor per category, so the fault is reported once.
    assert_eq!(errors.iter().filter(|e| e.kind == ErrorKind::Script).count(), 1);
}

#[tokio::test]
async fn disabled_network_capture_reports_no_network_failures() {
    let ctx = sandbox(Arc::new(RecordingConsole::new()));
    let (tx, mut rx) = channel::channel(64);
    let cfg = MenderCfg {
        enable_network_error_capture: false,
        ..MenderCfg::default()
    };
    install(&ctx, cfg.instrumentation(), Arc::new(tx));

    let resp = ctx.fetch(NetworkRequest::get("http://preview.local/api/broken")).await;
    assert_eq!(resp.unwrap().status, 500);
    assert!(ctx.fetch(NetworkRequest::get("http://nowhere.invalid/")).await.is_err());
    let xhr = ctx.open_request("post", "http://preview.local/api/slow").send(None).await;
    assert_eq!(xhr, Err(NetworkError::Timeout));

    let errors = classify(&drain(&mut rx), Duration::from_secs(3));
    assert!(errors.iter().all(|e| e.kind != ErrorKind::NetworkFailure));
    assert_eq!(errors.len(), 1, "only the init report: {errors:?}");
}

#[tokio::test]
async fn network_failures_from_both_apis_carry_request_detail() {
    let ctx = sandbox(Arc::new(RecordingConsole::new()));
    let (tx, mut rx) = channel::channel(64);
    install(&ctx, MenderCfg::default().instrumentation(), Arc::new(tx));

    ctx.fetch(NetworkRequest::get("http://preview.local/api/ok")).await.unwrap();
    let _ = ctx.fetch(NetworkRequest::get("http://preview.local/api/broken")).await;
    let _ = ctx.open_request("put", "http://preview.local/api/slow").send(Some("{}".into())).await;

    let failures: Vec<_> = classify(&drain(&mut rx), Duration::from_secs(3))
        .into_iter()
        .filter(|e| e.kind == ErrorKind::NetworkFailure)
        .collect();
    assert_eq!(failures.len(), 2);

    let broken = failures[0].network.as_ref().unwrap();
    assert_eq!(broken.method, "GET");
    assert_eq!(broken.status, Some(500));
    assert!(failures[0].message.contains("500 Internal Server Error"));

    let slow = failures[1].network.as_ref().unwrap();
    assert_eq!(slow.method, "PUT");
    assert_eq!(slow.url, "http://preview.local/api/slow");
    assert_eq!(slow.status, None);
    assert!(failures[1].message.contains("timed out"));
}

#[test]
fn hosted_code_behaviour_is_unchanged() {
    let console = Arc::new(RecordingConsole::new());
    let ctx = sandbox(Arc::clone(&console));
    let (tx, mut rx) = channel::channel(64);
    install(&ctx, MenderCfg::default().instrumentation(), Arc::new(tx));

    let fault = ScriptFault::new("ReferenceError: x is not defined").at("src/app.js", 4, 9);
    assert_eq!(ctx.raise(fault.clone()), Err(fault));
    let rejection = Rejection::from_value(&json!({ "code": 401 }));
    assert_eq!(ctx.reject(rejection.clone()), Err(rejection));

    ctx.console_log(&["ready".into()]);
    ctx.console_warn(&["deprecated".into(), ConsoleArg::from(json!({ "since": "2.0" }))]);
    ctx.console_error(&[ConsoleArg::error("TypeError", "bad prop")]);

    let lines = console.lines();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], (ConsoleLevel::Log, "ready".to_string()));
    assert_eq!(lines[2], (ConsoleLevel::Error, "TypeError: bad prop".to_string()));

    let errors = classify(&drain(&mut rx), Duration::from_secs(3));
    let kinds: Vec<_> = errors.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ErrorKind::System,
            ErrorKind::Script,
            ErrorKind::UnhandledRejection,
            ErrorKind::ConsoleWarning,
            ErrorKind::ConsoleError,
        ]
    );
    assert_eq!(errors[1].location().as_deref(), Some("src/app.js:4:9"));
    assert!(errors[3].message.contains("\"since\": \"2.0\""));
}

#[test]
fn dedup_collapses_repeats_and_ignores_foreign_messages() {
    let ctx = sandbox(Arc::new(RecordingConsole::new()));
    let (tx, mut rx) = channel::channel(64);
    install(&ctx, MenderCfg::default().instrumentation(), Arc::new(tx.clone()));

    for _ in 0..3 {
        let _ = ctx.raise(ScriptFault::new("TypeError: a is undefined"));
    }
    // Something else on the same transport.
    tx.post(json!({ "type": "hmr:update", "payload": { "kind": "script", "message": "x" } }))
        .unwrap();
    tx.post(json!({ "payload": { "kind": "script", "message": "y" } })).unwrap();
    tx.post(json!("mender:preview-error")).unwrap();

    let errors = classify(&drain(&mut rx), Duration::from_secs(3));
    let scripts: Vec<_> = errors.iter().filter(|e| e.kind == ErrorKind::Script).collect();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].message, "TypeError: a is undefined");
}

#[test]
fn slow_load_is_a_warning_only_when_monitoring() {
    let (tx, mut rx) = channel::channel(64);
    let quiet = sandbox(Arc::new(RecordingConsole::new()));
    install(&quiet, MenderCfg::default().instrumentation(), Arc::new(tx.clone()));
    quiet.finish_load(Duration::from_secs(10));

    let watched = sandbox(Arc::new(RecordingConsole::new()));
    let cfg = MenderCfg {
        enable_performance_monitoring: true,
        slow_load_threshold_ms: 1000,
        ..MenderCfg::default()
    };
    install(&watched, cfg.instrumentation(), Arc::new(tx));
    watched.finish_load(Duration::from_millis(500));
    watched.finish_load(Duration::from_millis(2500));

    let perf: Vec<_> = classify(&drain(&mut rx), Duration::ZERO)
        .into_iter()
        .filter(|e| e.kind == ErrorKind::Performance)
        .collect();
    assert_eq!(perf.len(), 1);
    assert_eq!(perf[0].severity, Severity::Warning);
    assert!(perf[0].message.contains("2500ms"));
}
