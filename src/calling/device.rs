//! Device and call seams over the vendor calling SDK.
//!
//! A [`Device`] is one registration with the calling backend. It is built
//! from a short-lived access token by a [`DeviceFactory`] and reports
//! lifecycle changes on an event channel. Each placed or received call is a
//! [`Call`] with its own event channel.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CallError, DeviceError};

/// Registration state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unregistered,
    Registering,
    Registered,
    Destroyed,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Unregistered => "unregistered",
            DeviceState::Registering => "registering",
            DeviceState::Registered => "registered",
            DeviceState::Destroyed => "destroyed",
        }
    }
}

/// Lifecycle events pushed by a device.
pub enum DeviceEvent {
    Registering,
    Registered,
    Unregistered,
    Error(DeviceError),
    /// An inbound call is ringing.
    Incoming(IncomingCall),
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::Registering => f.write_str("Registering"),
            DeviceEvent::Registered => f.write_str("Registered"),
            DeviceEvent::Unregistered => f.write_str("Unregistered"),
            DeviceEvent::Error(e) => write!(f, "Error({})", e),
            DeviceEvent::Incoming(c) => write!(f, "Incoming(from={})", c.from),
        }
    }
}

/// Events pushed by a single call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Ringing,
    /// The far end answered (outbound) or we answered (inbound).
    Accept,
    Disconnect,
    /// The call was withdrawn before it was answered.
    Cancel,
    /// The far end declined.
    Reject,
    Error(DeviceError),
}

/// Parameters passed to the backend when placing a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// E.164 destination.
    pub to: String,
}

impl ConnectParams {
    /// The parameter map sent to the backend (`{ To: ... }`).
    pub fn to_form(&self) -> Vec<(&'static str, String)> {
        vec![("To", self.to.clone())]
    }
}

/// A live call plus the stream of its events.
pub struct CallHandle {
    pub call: Arc<dyn Call>,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
}

/// A ringing inbound call.
pub struct IncomingCall {
    /// Caller identifier (number or client name).
    pub from: String,
    pub handle: CallHandle,
}

/// A freshly built device plus the stream of its lifecycle events.
pub struct DeviceHandle {
    pub device: Arc<dyn Device>,
    pub events: mpsc::UnboundedReceiver<DeviceEvent>,
}

/// One call leg managed by the vendor SDK.
#[async_trait]
pub trait Call: Send + Sync {
    /// Backend identifier, once known.
    fn sid(&self) -> Option<String>;

    /// Answer an inbound call.
    async fn accept(&self) -> Result<(), DeviceError>;

    /// Decline an inbound call.
    fn reject(&self);

    /// Hang up. Best effort, does not wait for the backend.
    fn disconnect(&self) -> Result<(), DeviceError>;
}

/// A registration with the calling backend.
#[async_trait]
pub trait Device: Send + Sync {
    /// Resolves once the backend confirms the registration.
    async fn register(&self) -> Result<(), DeviceError>;

    /// Place an outbound call. Resolves once the call leg exists, not when
    /// it is answered.
    async fn connect(&self, params: ConnectParams) -> Result<CallHandle, DeviceError>;

    /// Hang up every call this device owns.
    fn disconnect_all(&self);

    /// Release the registration. The device is unusable afterwards.
    fn destroy(&self);
}

/// Builds devices from access tokens.
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    async fn create(&self, token: &str) -> Result<DeviceHandle, DeviceError>;
}

/// Issues short-lived calling tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<String, CallError>;
}
