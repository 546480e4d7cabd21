//! One-off SMS through the backend

use serde::{Deserialize, Serialize};

use super::{ApiError, BackendClient};
use crate::calling::phone;

/// Longest body the backend accepts (ten concatenated segments).
pub const MAX_BODY_CHARS: usize = 1600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmsRequest {
    pub to: String,
    pub body: String,
}

impl SmsRequest {
    /// Normalize the recipient and check the body before anything is sent.
    pub fn new(to: &str, body: &str) -> Result<Self, ApiError> {
        let to = phone::normalize(to)
            .ok_or_else(|| ApiError::Validation("Invalid phone number format".to_string()))?;
        let body = body.trim();
        if body.is_empty() {
            return Err(ApiError::Validation("Message body is empty".to_string()));
        }
        if body.chars().count() > MAX_BODY_CHARS {
            return Err(ApiError::Validation(format!(
                "Message body exceeds {} characters",
                MAX_BODY_CHARS
            )));
        }
        Ok(Self {
            to,
            body: body.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmsReceipt {
    pub status: String,
}

/// Validate and send. Nothing hits the network when validation fails.
pub async fn send_sms(
    client: &BackendClient,
    path: &str,
    to: &str,
    body: &str,
) -> Result<SmsReceipt, ApiError> {
    let request = SmsRequest::new(to, body)?;
    tracing::info!("Sending SMS to {}", request.to);

    let resp = client.post_json(path, &request).await?;
    let receipt: SmsReceipt = resp
        .json()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))?;
    tracing::info!("SMS to {}: {}", request.to, receipt.status);
    Ok(receipt)
}
