//! CRM backend API: calling tokens and SMS

pub mod client;
pub mod sms;
pub mod token;

use thiserror::Error;

pub use client::BackendClient;
pub use sms::send_sms;
pub use token::HttpTokenProvider;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Rejected before any request was made.
    #[error("{0}")]
    Validation(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Pull a human-readable message out of an error body.
///
/// Backends answer with `{"error": "..."}` or `{"message": "..."}`; anything
/// else is returned as-is.
pub(crate) fn error_text(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["error", "message", "detail"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    body.trim().to_string()
}
