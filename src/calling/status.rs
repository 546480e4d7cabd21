//! User-facing status line derived from manager state.

use serde::Serialize;

/// Coarse status for front-ends that want to style the status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusKind {
    Idle,
    Registering,
    Ready,
    Connecting,
    Reconnecting,
    Incoming,
    InCall,
    Ended,
    Cancelled,
    Error,
}

/// What the status line shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub kind: StatusKind,
    pub message: String,
}

impl Status {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn idle() -> Self {
        Self::new(StatusKind::Idle, "Idle")
    }

    pub fn registering() -> Self {
        Self::new(StatusKind::Registering, "Registering device...")
    }

    pub fn ready() -> Self {
        Self::new(StatusKind::Ready, "Ready for calls")
    }

    pub fn connecting() -> Self {
        Self::new(StatusKind::Connecting, "Connecting...")
    }

    pub fn reconnecting() -> Self {
        Self::new(StatusKind::Reconnecting, "Reconnecting to Twilio...")
    }

    pub fn incoming(from: &str) -> Self {
        Self::new(StatusKind::Incoming, format!("Incoming call from {}", from))
    }

    pub fn in_call() -> Self {
        Self::new(StatusKind::InCall, "In call")
    }

    pub fn ended() -> Self {
        Self::new(StatusKind::Ended, "Call ended")
    }

    pub fn cancelled() -> Self {
        Self::new(StatusKind::Cancelled, "Cancelled")
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StatusKind::Error, message)
    }

    /// A call is being set up or is up.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.kind,
            StatusKind::Connecting | StatusKind::Reconnecting | StatusKind::InCall
        )
    }

    /// Nothing further will happen to the last call.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            StatusKind::Ended | StatusKind::Cancelled | StatusKind::Error
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}
