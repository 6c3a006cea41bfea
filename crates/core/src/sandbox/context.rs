use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use super::console::{ConsoleArg, ConsoleLevel, ConsoleSink, TracingConsole};
use super::instrument::Reporter;
use super::network::{NetworkTransport, ScriptedNetwork};
use crate::types::Origin;

/// An uncaught synchronous error thrown by hosted code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFault {
    pub message: String,
    pub source: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub stack: Option<String>,
}

impl ScriptFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            line: None,
            column: None,
            stack: None,
        }
    }

    pub fn at(mut self, source: impl Into<String>, line: u32, column: u32) -> Self {
        self.source = Some(source.into());
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// An asynchronous rejection nobody handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub message: String,
    pub stack: Option<String>,
}

impl Rejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Rejection with a non-error reason, stringified.
    pub fn from_value(reason: &serde_json::Value) -> Self {
        let message = match reason {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self::new(message)
    }
}

/// Which network API issued a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkApi {
    Fetch,
    Xhr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkFailure {
    pub api: NetworkApi,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub reason: String,
}

/// A raw fault signal observed inside the sandbox.
#[derive(Debug, Clone, Copy)]
pub enum Signal<'a> {
    Uncaught(&'a ScriptFault),
    Rejection(&'a Rejection),
    Console(ConsoleLevel, &'a [ConsoleArg]),
    NetworkFailure(&'a NetworkFailure),
    PageLoad(Duration),
}

impl Signal<'_> {
    pub fn category(&self) -> SignalCategory {
        match self {
            Signal::Uncaught(_) => SignalCategory::Uncaught,
            Signal::Rejection(_) => SignalCategory::Rejection,
            Signal::Console(..) => SignalCategory::Console,
            Signal::NetworkFailure(_) => SignalCategory::Network,
            Signal::PageLoad(_) => SignalCategory::PageLoad,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCategory {
    Uncaught,
    Rejection,
    Console,
    Network,
    PageLoad,
}

/// Observer attached to one signal category. Must not alter the signal.
pub type Interceptor = Arc<dyn Fn(&Signal<'_>) + Send + Sync>;

/// A simulated untrusted execution context hosting preview code.
///
/// Hosted code drives faults through this surface; installed interceptors
/// observe each signal before the original behavior runs unchanged.
pub struct SandboxContext {
    origin: Origin,
    console: Arc<dyn ConsoleSink>,
    network: Arc<dyn NetworkTransport>,
    installed: AtomicBool,
    interceptors: Mutex<Vec<(SignalCategory, Interceptor)>>,
    reporter: OnceLock<Reporter>,
}

impl SandboxContext {
    pub fn new(origin: Origin, console: Arc<dyn ConsoleSink>, network: Arc<dyn NetworkTransport>) -> Self {
        Self {
            origin,
            console,
            network,
            installed: AtomicBool::new(false),
            interceptors: Mutex::new(Vec::new()),
            reporter: OnceLock::new(),
        }
    }

    /// Context with a tracing console and an offline network.
    pub fn offline(url: impl Into<String>) -> Self {
        Self::new(
            Origin {
                url: Some(url.into()),
                user_agent: Some(concat!("mender-sandbox/", env!("CARGO_PKG_VERSION")).into()),
            },
            Arc::new(TracingConsole),
            Arc::new(ScriptedNetwork::new()),
        )
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn is_instrumented(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Throw an uncaught error. Interceptors observe it; it is handed back unchanged.
    pub fn raise(&self, fault: ScriptFault) -> Result<(), ScriptFault> {
        self.dispatch(&Signal::Uncaught(&fault));
        Err(fault)
    }

    /// Surface an unhandled rejection. Handed back unchanged.
    pub fn reject(&self, rejection: Rejection) -> Result<(), Rejection> {
        self.dispatch(&Signal::Rejection(&rejection));
        Err(rejection)
    }

    pub fn console_log(&self, args: &[ConsoleArg]) {
        self.console_call(ConsoleLevel::Log, args);
    }

    pub fn console_warn(&self, args: &[ConsoleArg]) {
        self.console_call(ConsoleLevel::Warn, args);
    }

    pub fn console_error(&self, args: &[ConsoleArg]) {
        self.console_call(ConsoleLevel::Error, args);
    }

    fn console_call(&self, level: ConsoleLevel, args: &[ConsoleArg]) {
        self.dispatch(&Signal::Console(level, args));
        self.console.write(level, args);
    }

    /// Page load completed after `elapsed`.
    pub fn finish_load(&self, elapsed: Duration) {
        self.dispatch(&Signal::PageLoad(elapsed));
    }

    pub(super) fn network(&self) -> &dyn NetworkTransport {
        self.network.as_ref()
    }

    /// Set the install guard. Returns false if it was already set.
    pub(super) fn claim_install(&self) -> bool {
        !self.installed.swap(true, Ordering::AcqRel)
    }

    pub(super) fn attach(&self, category: SignalCategory, interceptor: Interceptor) {
        self.interceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((category, interceptor));
    }

    pub(super) fn set_reporter(&self, reporter: Reporter) {
        let _ = self.reporter.set(reporter);
    }

    pub(super) fn reporter(&self) -> Option<&Reporter> {
        self.reporter.get()
    }

    pub(super) fn dispatch(&self, signal: &Signal<'_>) {
        let category = signal.category();
        // Clone out so interceptors run without holding the lock.
        let matching: Vec<Interceptor> = self
            .interceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(c, _)| *c == category)
            .map(|(_, i)| Arc::clone(i))
            .collect();
        for interceptor in matching {
            interceptor(signal);
        }
    }
}

impl std::fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxContext")
            .field("origin", &self.origin)
            .field("instrumented", &self.is_instrumented())
            .finish_non_exhaustive()
    }
}
