use std::time::Duration;

use mender_core::sandbox::{NetworkError, NetworkRequest, NetworkResponse, NetworkTransport};

const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Real network stack for the sandbox.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait::async_trait]
impl NetworkTransport for HttpNetwork {
    async fn execute(&self, request: &NetworkRequest) -> Result<NetworkResponse, NetworkError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| NetworkError::Failed(e.to_string()))?;
        let mut builder = self.client.request(method, &request.url);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let resp = builder.send().await.map_err(map_err)?;
        let status = resp.status();
        let body = resp.text().await.map_err(map_err)?;
        Ok(NetworkResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        })
    }
}

fn map_err(e: reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        NetworkError::Timeout
    } else {
        NetworkError::Failed(e.to_string())
    }
}
