use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::context::{NetworkApi, NetworkFailure, SandboxContext, Signal};

/// Outbound request issued by hosted code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub method: String,
    pub url: String,
    pub body: Option<String>,
}

impl NetworkRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            url: url.into(),
            body: None,
        }
    }

    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            url: url.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkResponse {
    pub status: u16,
    pub status_text: String,
    pub body: String,
}

impl NetworkResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            status_text: "OK".into(),
            body: body.into(),
        }
    }

    pub fn status(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            body: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status < 400
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("{0}")]
    Failed(String),
    #[error("request timed out")]
    Timeout,
    #[error("request aborted")]
    Aborted,
}

/// The sandbox's underlying network stack.
#[async_trait::async_trait]
pub trait NetworkTransport: Send + Sync {
    async fn execute(&self, request: &NetworkRequest) -> Result<NetworkResponse, NetworkError>;
}

/// Network stack with canned per-URL results. Unknown URLs fail as unreachable.
#[derive(Debug, Default)]
pub struct ScriptedNetwork {
    routes: Mutex<HashMap<String, Result<NetworkResponse, NetworkError>>>,
}

impl ScriptedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: impl Into<String>, result: Result<NetworkResponse, NetworkError>) -> Self {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), result);
        self
    }
}

#[async_trait::async_trait]
impl NetworkTransport for ScriptedNetwork {
    async fn execute(&self, request: &NetworkRequest) -> Result<NetworkResponse, NetworkError> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| Err(NetworkError::Failed("net::ERR_NAME_NOT_RESOLVED".into())))
    }
}

/// Low-level request handle. Method and target are captured when the request
/// is opened and correlated with the outcome when it completes.
#[derive(Debug)]
pub struct PendingRequest<'a> {
    ctx: &'a SandboxContext,
    method: String,
    url: String,
}

impl<'a> PendingRequest<'a> {
    pub(super) fn open(ctx: &'a SandboxContext, method: &str, url: &str) -> Self {
        Self {
            ctx,
            method: method.to_uppercase(),
            url: url.to_string(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send(self, body: Option<String>) -> Result<NetworkResponse, NetworkError> {
        let request = NetworkRequest {
            method: self.method,
            url: self.url,
            body,
        };
        let result = self.ctx.network().execute(&request).await;
        self.ctx.observe_network(NetworkApi::Xhr, &request, &result);
        result
    }
}

/// Failure description for a completed request, `None` when it succeeded.
pub(super) fn failure_of(
    api: NetworkApi,
    request: &NetworkRequest,
    result: &Result<NetworkResponse, NetworkError>,
) -> Option<NetworkFailure> {
    let (status, reason) = match result {
        Ok(resp) if resp.is_ok() => return None,
        Ok(resp) => (Some(resp.status), format!("{} {}", resp.status, resp.status_text).trim().to_string()),
        Err(e) => (None, e.to_string()),
    };
    Some(NetworkFailure {
        api,
        method: request.method.clone(),
        url: request.url.clone(),
        status,
        reason,
    })
}

impl SandboxContext {
    /// High-level network API.
    pub async fn fetch(&self, request: NetworkRequest) -> Result<NetworkResponse, NetworkError> {
        let result = self.network().execute(&request).await;
        self.observe_network(NetworkApi::Fetch, &request, &result);
        result
    }

    /// Low-level network API: open now, send later.
    pub fn open_request(&self, method: &str, url: &str) -> PendingRequest<'_> {
        PendingRequest::open(self, method, url)
    }

    fn observe_network(
        &self,
        api: NetworkApi,
        request: &NetworkRequest,
        result: &Result<NetworkResponse, NetworkError>,
    ) {
        if let Some(failure) = failure_of(api, request, result) {
            self.dispatch(&Signal::NetworkFailure(&failure));
        }
    }
}
