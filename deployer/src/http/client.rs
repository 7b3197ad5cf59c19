//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use cloud_api::ErrorResponse;

use crate::errors::DeployError;

/// HTTP client for the provider API
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DeployError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T, DeployError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let request = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token));
        self.send("GET", &url, request).await
    }

    /// Make a POST request
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<T, DeployError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let request = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .json(body);
        self.send("POST", &url, request).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &str,
        url: &str,
        request: RequestBuilder,
    ) -> Result<T, DeployError> {
        let response = request.send().await.map_err(|e| {
            DeployError::ProviderUnavailable(format!("{} {} failed: {}", method, url, e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("HTTP {} failed: {} - {}", method, status, body);
            return Err(status_error(status, &body));
        }

        let body = response.json().await?;
        Ok(body)
    }
}

/// Map a failed response onto the error taxonomy: rejections are final,
/// everything else may clear up on its own
pub fn status_error(status: StatusCode, body: &str) -> DeployError {
    let detail = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) => match parsed.error.suggestion {
            Some(suggestion) => format!(
                "{} ({}): {}; {}",
                status, parsed.error.code, parsed.error.message, suggestion
            ),
            None => format!("{} ({}): {}", status, parsed.error.code, parsed.error.message),
        },
        Err(_) => format!("{}: {}", status, body.trim()),
    };

    match status {
        StatusCode::NOT_FOUND => DeployError::NotFound(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            DeployError::ProviderUnavailable(detail)
        }
        s if s.is_client_error() => DeployError::ProvisionRejected(detail),
        _ => DeployError::ProviderUnavailable(detail),
    }
}
