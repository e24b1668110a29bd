//! HTTP implementation of `ApiClient` over reqwest.

use async_trait::async_trait;
use casefile_core::api::{ApiClient, ApiRequest, ApiResponse, Method, Result, TransportError};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to the server API with a bearer token.
pub struct HttpApi {
    base_url: String,
    token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpApi {
    pub fn new(base_url: &str, token: Option<String>) -> reqwest::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("casefile/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http_client,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ApiClient for HttpApi {
    async fn request(&self, method: Method, request: ApiRequest) -> Result<ApiResponse> {
        let url = self.url(&request.path);
        let http_method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        debug!("{} {}", method, url);

        let mut builder = self
            .http_client
            .request(http_method, &url)
            .query(&request.query);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(url.clone())
            } else {
                TransportError::ConnectionFailed(e.to_string())
            }
        })?;

        let status = response.status();
        let envelope = response.json::<ApiResponse>().await;
        match envelope {
            Ok(envelope) => Ok(envelope),
            Err(_) if !status.is_success() => Err(TransportError::Rejected(format!(
                "HTTP {} from {}",
                status, url
            ))),
            Err(e) => Err(TransportError::InvalidResponse(e.to_string())),
        }
    }
}
