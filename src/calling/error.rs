//! Call errors and their retry classification.

use std::time::Duration;

use thiserror::Error;

/// Shown for 400/500 responses from the token endpoint.
pub const NOT_CONFIGURED_MESSAGE: &str = "Twilio is not configured for your account";

/// Error raised by a device or call implementation.
///
/// The vendor layer only gives us a message, so this stays untyped until
/// [`CallError::from_device`] classifies it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DeviceError {
    pub message: String,
}

impl DeviceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything that can go wrong between "user pressed call" and "call ended".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("Enter a phone number")]
    EmptyNumber,

    #[error("Invalid phone number format")]
    InvalidNumber,

    /// Backend refused to issue a calling token. Not retryable.
    #[error("{0}")]
    TokenFetch(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Registration timeout after {}s", .0.as_secs())]
    RegistrationTimeout(Duration),

    /// Call setup or an established call failed.
    #[error("{0}")]
    Signaling(String),

    #[error("A call is already in progress")]
    CallInProgress,

    #[error("No active call")]
    NoActiveCall,

    #[error("No incoming call to answer")]
    NoIncomingCall,
}

/// Substrings that mark a device failure as a transport/registration problem.
const TRANSPORT_MARKERS: &[&str] = &["registration", "websocket", "connection"];

impl CallError {
    /// Classify a vendor error raised while connecting a call.
    pub fn from_device(err: DeviceError) -> Self {
        let lower = err.message.to_lowercase();
        if TRANSPORT_MARKERS.iter().any(|m| lower.contains(m)) {
            CallError::Registration(err.message)
        } else {
            CallError::Signaling(err.message)
        }
    }

    /// Whether a fresh device (new token, new registration) may fix this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::Registration(_) | CallError::RegistrationTimeout(_)
        )
    }

    /// Input errors never reach the backend.
    pub fn is_input(&self) -> bool {
        matches!(self, CallError::EmptyNumber | CallError::InvalidNumber)
    }

    /// Text for the status line.
    pub fn user_message(&self) -> String {
        match self {
            CallError::EmptyNumber | CallError::InvalidNumber | CallError::TokenFetch(_) => {
                self.to_string()
            }
            other => format!("Call error: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_messages_are_retryable() {
        for msg in [
            "WebSocket closed unexpectedly",
            "Registration failed: 31204",
            "connection lost",
        ] {
            let err = CallError::from_device(DeviceError::new(msg));
            assert!(err.is_retryable(), "{}", msg);
        }
    }

    #[test]
    fn test_other_messages_are_not_retryable() {
        let err = CallError::from_device(DeviceError::new("31486: busy here"));
        assert_eq!(err, CallError::Signaling("31486: busy here".into()));
        assert!(!err.is_retryable());
        assert!(!CallError::TokenFetch(NOT_CONFIGURED_MESSAGE.into()).is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = CallError::RegistrationTimeout(Duration::from_secs(10));
        assert!(err.is_retryable());
        assert!(err.user_message().contains("timeout"));
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(CallError::EmptyNumber.user_message(), "Enter a phone number");
        assert_eq!(
            CallError::InvalidNumber.user_message(),
            "Invalid phone number format"
        );
        assert_eq!(
            CallError::TokenFetch(NOT_CONFIGURED_MESSAGE.into()).user_message(),
            NOT_CONFIGURED_MESSAGE
        );
        assert_eq!(
            CallError::Signaling("31005: gateway hangup".into()).user_message(),
            "Call error: 31005: gateway hangup"
        );
    }
}
