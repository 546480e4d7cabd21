//! Authenticated HTTP client for the CRM backend
//!
//! Wraps reqwest::Client with bearer token injection.

use serde::Serialize;

use super::ApiError;
use crate::config::Config;

/// Client for the CRM backend that issues calling tokens and sends SMS.
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl BackendClient {
    pub fn new(config: &Config) -> Self {
        Self::with_http(reqwest::Client::new(), config)
    }

    pub fn with_http(http: reqwest::Client, config: &Config) -> Self {
        Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET request (bearer auth).
    pub async fn get(&self, path: &str) -> Result<reqwest::Response, ApiError> {
        let url = self.url(path);
        tracing::debug!("Backend GET {}", url);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        check_response(resp, &url).await
    }

    /// POST request with a JSON body (bearer auth).
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.url(path);
        tracing::debug!("Backend POST {}", url);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await?;

        check_response(resp, &url).await
    }
}

/// Check HTTP response status code and return the server's text on failure.
pub(crate) async fn check_response(
    resp: reqwest::Response,
    url: &str,
) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        tracing::warn!("401 Unauthorized for {}. Check api_token in the config file.", url);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        tracing::debug!("HTTP {} for {}: {}", status.as_u16(), url, body);
        return Err(ApiError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}
