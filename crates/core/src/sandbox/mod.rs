//! Sandbox-side instrumentation.
//!
//! Installed once per execution context; converts raw fault signals into
//! envelope reports posted across the trust boundary. Holds no host state.

pub mod console;
pub mod context;
pub mod instrument;
pub mod network;

pub use console::{ConsoleArg, ConsoleLevel, ConsoleSink, RecordingConsole, TracingConsole, join_args};
pub use context::{NetworkApi, NetworkFailure, Rejection, SandboxContext, ScriptFault, Signal};
pub use instrument::{INIT_MESSAGE, Report, Reporter, install};
pub use network::{
    NetworkError, NetworkRequest, NetworkResponse, NetworkTransport, PendingRequest, ScriptedNetwork,
};
