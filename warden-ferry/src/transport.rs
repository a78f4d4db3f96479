//! Transport seam between the ferry and its shores. The control plane
//! does not dictate wire framing; the production implementation speaks
//! HTTP via reqwest, tests script their own.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FerryError, Result};
use crate::shore::Shore;

/// A request entering the edge.
#[derive(Debug, Clone, Default)]
pub struct CrossingRequest {
    pub method: String,
    pub path: String,
    pub tenant: Option<String>,
    pub source_ip: Option<String>,
    pub session: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl CrossingRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossingResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Forwarding and probing against one shore.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShoreTransport: Send + Sync {
    async fn forward(
        &self,
        shore: &Shore,
        request: &CrossingRequest,
        timeout: Duration,
    ) -> Result<CrossingResponse>;

    /// Issue a health probe; returns the upstream status code.
    async fn probe(&self, shore: &Shore, path: &str, timeout: Duration) -> Result<u16>;
}

/// Production transport over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(shore: &Shore, path: &str) -> String {
        format!("http://{}{}", shore.address, path)
    }

    fn map_error(err: reqwest::Error) -> FerryError {
        if err.is_timeout() {
            FerryError::Timeout
        } else {
            FerryError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl ShoreTransport for HttpTransport {
    async fn forward(
        &self,
        shore: &Shore,
        request: &CrossingRequest,
        timeout: Duration,
    ) -> Result<CrossingResponse> {
        let method = request
            .method
            .parse::<reqwest::Method>()
            .map_err(|_| FerryError::Transport(format!("bad method: {}", request.method)))?;

        let mut builder = self
            .client
            .request(method, Self::url(shore, &request.path))
            .timeout(timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(Self::map_error)?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(Self::map_error)?
            .to_vec();
        Ok(CrossingResponse { status, body })
    }

    async fn probe(&self, shore: &Shore, path: &str, timeout: Duration) -> Result<u16> {
        let response = self
            .client
            .get(Self::url(shore, path))
            .timeout(timeout)
            .send()
            .await
            .map_err(Self::map_error)?;
        Ok(response.status().as_u16())
    }
}
