//! Calling token endpoint

use async_trait::async_trait;
use serde::Deserialize;

use super::{error_text, ApiError, BackendClient};
use crate::calling::device::TokenProvider;
use crate::calling::{CallError, NOT_CONFIGURED_MESSAGE};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

/// Fetches short-lived calling tokens from the backend.
pub struct HttpTokenProvider {
    client: BackendClient,
    path: String,
}

impl HttpTokenProvider {
    pub fn new(client: BackendClient, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }

    async fn request(&self) -> Result<String, ApiError> {
        let resp = self.client.get(&self.path).await?;
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        token_from(body)
    }
}

fn token_from(body: TokenResponse) -> Result<String, ApiError> {
    match body.token {
        Some(token) if !token.is_empty() => Ok(token),
        _ => Err(ApiError::Decode("response has no token".to_string())),
    }
}

/// Map a token endpoint failure to what the user sees.
pub fn token_error(err: ApiError) -> CallError {
    match err {
        ApiError::Http { status, .. } if status == 400 || status == 500 => {
            CallError::TokenFetch(NOT_CONFIGURED_MESSAGE.to_string())
        }
        ApiError::Http { status, body } => {
            let text = error_text(&body);
            if text.is_empty() {
                CallError::TokenFetch(format!("Failed to fetch calling token (HTTP {})", status))
            } else {
                CallError::TokenFetch(text)
            }
        }
        ApiError::Decode(msg) => {
            CallError::TokenFetch(format!("Failed to fetch calling token: {}", msg))
        }
        other => CallError::TokenFetch(other.to_string()),
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self) -> Result<String, CallError> {
        tracing::debug!("Fetching calling token");
        self.request().await.map_err(|e| {
            tracing::warn!("Token endpoint failed: {}", e);
            token_error(e)
        })
    }
}
