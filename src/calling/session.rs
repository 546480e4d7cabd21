//! Call session manager: one device registration, at most one call.
//!
//! State lives in a single [`State`] struct behind a std mutex that is never
//! held across an await. Device and call events are consumed by spawned
//! listener tasks; every device and call gets a generation number so events
//! from a discarded instance are dropped on the floor.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use super::device::{
    Call, CallEvent, CallHandle, ConnectParams, Device, DeviceEvent, DeviceFactory, DeviceHandle,
    DeviceState, IncomingCall, TokenProvider,
};
use super::status::Status;
use super::{phone, CallError};

/// Registration must complete within this window.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an error stays on the status line before reverting to idle.
pub const ERROR_DISPLAY: Duration = Duration::from_secs(10);

/// Timing knobs for the manager.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub registration_timeout: Duration,
    pub error_display: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            registration_timeout: REGISTRATION_TIMEOUT,
            error_display: ERROR_DISPLAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    HungUp,
    Cancelled,
}

/// Lifecycle of the current call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Connecting,
    InCall,
    Ended(EndReason),
}

/// The one call the manager is tracking.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: String,
    pub direction: Direction,
    /// E.164 destination for outbound calls, caller identifier for inbound.
    pub target: String,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    fn new(direction: Direction, target: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            target,
            started_at: Utc::now(),
        }
    }
}

struct PendingIncoming {
    from: String,
    call: Arc<dyn Call>,
}

struct State {
    device: Option<Arc<dyn Device>>,
    device_state: DeviceState,
    device_generation: u64,

    phase: CallPhase,
    session: Option<CallSession>,
    call: Option<Arc<dyn Call>>,
    incoming: Option<PendingIncoming>,
    call_generation: u64,

    error: Option<CallError>,
    error_generation: u64,
    error_timer: Option<JoinHandle<()>>,

    reconnecting: bool,
}

impl State {
    fn new() -> Self {
        Self {
            device: None,
            device_state: DeviceState::Unregistered,
            device_generation: 0,
            phase: CallPhase::Idle,
            session: None,
            call: None,
            incoming: None,
            call_generation: 0,
            error: None,
            error_generation: 0,
            error_timer: None,
            reconnecting: false,
        }
    }

    fn is_busy(&self) -> bool {
        matches!(self.phase, CallPhase::Connecting | CallPhase::InCall) || self.incoming.is_some()
    }

    /// Call `generation` is still the one being set up.
    fn is_connecting(&self, generation: u64) -> bool {
        self.call_generation == generation && self.phase == CallPhase::Connecting
    }

    /// Result for a setup that lost its session: a hang-up is not a failure,
    /// an error that ended the session is.
    fn abandoned_outcome(&self, err: CallError) -> Result<(), CallError> {
        if self.error.is_some() {
            Err(err)
        } else {
            Ok(())
        }
    }

    fn project(&self) -> Status {
        if let Some(ref err) = self.error {
            return Status::error(err.user_message());
        }
        if self.reconnecting {
            return Status::reconnecting();
        }
        if let Some(ref pending) = self.incoming {
            return Status::incoming(&pending.from);
        }
        match self.phase {
            CallPhase::Connecting => Status::connecting(),
            CallPhase::InCall => Status::in_call(),
            CallPhase::Ended(EndReason::HungUp) => Status::ended(),
            CallPhase::Ended(EndReason::Cancelled) => Status::cancelled(),
            CallPhase::Idle => match self.device_state {
                DeviceState::Registered => Status::ready(),
                DeviceState::Registering => Status::registering(),
                DeviceState::Unregistered | DeviceState::Destroyed => Status::idle(),
            },
        }
    }

    /// Drop the current device, returning it so the caller can destroy it
    /// outside the lock.
    fn take_device(&mut self) -> Option<Arc<dyn Device>> {
        self.device_generation += 1;
        self.device_state = DeviceState::Destroyed;
        self.device.take()
    }

    fn clear_error(&mut self) {
        self.error = None;
        if let Some(timer) = self.error_timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    tokens: Arc<dyn TokenProvider>,
    factory: Arc<dyn DeviceFactory>,
    config: SessionConfig,
    state: Mutex<State>,
    status_tx: watch::Sender<Status>,
    /// Serializes `ensure_device` so only one registration runs at a time.
    registration: tokio::sync::Mutex<()>,
}

/// Coordinates device registration, the active call, and the status line.
pub struct CallSessionManager {
    inner: Arc<Inner>,
}

impl CallSessionManager {
    pub fn new(tokens: Arc<dyn TokenProvider>, factory: Arc<dyn DeviceFactory>) -> Self {
        Self::with_config(tokens, factory, SessionConfig::default())
    }

    pub fn with_config(
        tokens: Arc<dyn TokenProvider>,
        factory: Arc<dyn DeviceFactory>,
        config: SessionConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(Status::idle());
        Self {
            inner: Arc::new(Inner {
                tokens,
                factory,
                config,
                state: Mutex::new(State::new()),
                status_tx,
                registration: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Current status line.
    pub fn status(&self) -> Status {
        self.inner.status_tx.borrow().clone()
    }

    /// Receive every status change.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.inner.status_tx.subscribe()
    }

    pub fn phase(&self) -> CallPhase {
        self.inner.lock().phase
    }

    pub fn device_state(&self) -> DeviceState {
        self.inner.lock().device_state
    }

    pub fn session(&self) -> Option<CallSession> {
        self.inner.lock().session.clone()
    }

    /// Register a device ahead of the first call.
    pub async fn prepare(&self) -> Result<(), CallError> {
        self.inner.prepare(false).await
    }

    /// Throw away the current device and register a new one.
    ///
    /// Rejected with `CallInProgress` while a call is up, being set up, or
    /// ringing in, since destroying the device would orphan that call.
    pub async fn refresh_device(&self) -> Result<(), CallError> {
        self.inner.check_line_free()?;
        self.inner.prepare(true).await
    }

    /// Make sure a registered device exists, building one if needed.
    pub async fn ensure_device(&self, force_refresh: bool) -> Result<Arc<dyn Device>, CallError> {
        if force_refresh {
            self.inner.check_line_free()?;
        }
        self.inner.ensure_device(force_refresh).await
    }

    /// Place an outbound call.
    ///
    /// Returns once the call leg exists (status "Connecting..."); answer and
    /// hang-up arrive later as events. Rejected with `CallInProgress` while
    /// another call is being set up, is up, or is ringing in.
    pub async fn initiate(&self, raw_number: &str) -> Result<(), CallError> {
        self.inner.initiate(raw_number).await
    }

    /// Hang up whatever is going on. Never fails; status becomes "Call ended".
    pub fn hang_up(&self) {
        self.inner.hang_up();
    }

    /// Answer the ringing inbound call.
    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        self.inner.accept_incoming().await
    }

    /// Decline the ringing inbound call.
    pub fn reject_incoming(&self) -> Result<(), CallError> {
        self.inner.reject_incoming()
    }

    /// Tear everything down: timer, call, device.
    pub fn shutdown(&self) {
        self.inner.teardown();
    }
}

impl Drop for CallSessionManager {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &State) {
        let status = state.project();
        tracing::debug!("Status: {}", status);
        self.status_tx.send_replace(status);
    }

    /// Put an error on the status line and (re)start its clear timer.
    fn fail(self: &Arc<Self>, state: &mut State, err: CallError) {
        if err.is_input() {
            tracing::info!("{}", err);
        } else {
            tracing::error!("Call error: {}", err);
        }

        state.call_generation += 1;
        state.session = None;
        state.call = None;
        state.phase = CallPhase::Idle;
        state.reconnecting = false;
        state.error = Some(err);
        state.error_generation += 1;
        let generation = state.error_generation;

        if let Some(timer) = state.error_timer.take() {
            timer.abort();
        }
        let weak = Arc::downgrade(self);
        let deadline = time::Instant::now() + self.config.error_display;
        state.error_timer = Some(tokio::spawn(async move {
            time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_error(generation);
            }
        }));

        self.publish(state);
    }

    fn expire_error(&self, generation: u64) {
        let mut state = self.lock();
        if state.error_generation == generation && state.error.is_some() {
            state.error = None;
            state.error_timer = None;
            self.publish(&state);
        }
    }

    async fn prepare(self: &Arc<Self>, force_refresh: bool) -> Result<(), CallError> {
        match self.ensure_device(force_refresh).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let mut state = self.lock();
                if !state.is_busy() {
                    self.fail(&mut state, e.clone());
                }
                Err(e)
            }
        }
    }

    async fn ensure_device(
        self: &Arc<Self>,
        force_refresh: bool,
    ) -> Result<Arc<dyn Device>, CallError> {
        let _registering = self.registration.lock().await;

        let stale = {
            let mut state = self.lock();
            let mut stale = None;
            if force_refresh {
                tracing::info!("Forcing device refresh");
                stale = state.take_device();
            } else if let Some(ref device) = state.device {
                if state.device_state == DeviceState::Registered {
                    return Ok(Arc::clone(device));
                }
                tracing::debug!(
                    "Discarding device in state {}",
                    state.device_state.as_str()
                );
                stale = state.take_device();
            }
            state.device_state = DeviceState::Registering;
            self.publish(&state);
            stale
        };
        if let Some(device) = stale {
            device.destroy();
        }

        let token = match self.tokens.fetch_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Token fetch failed: {}", e);
                self.mark_unregistered();
                return Err(e);
            }
        };

        let DeviceHandle { device, events } = match self.factory.create(&token).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Device creation failed: {}", e);
                self.mark_unregistered();
                return Err(CallError::Registration(e.message));
            }
        };

        let generation = {
            let mut state = self.lock();
            state.device_generation += 1;
            state.device = Some(Arc::clone(&device));
            state.device_generation
        };
        tokio::spawn(watch_device(Arc::downgrade(self), generation, events));

        tracing::info!("Registering device...");
        match time::timeout(self.config.registration_timeout, device.register()).await {
            Ok(Ok(())) => {
                let mut state = self.lock();
                if state.device_generation != generation || state.device.is_none() {
                    return Err(CallError::Registration(
                        "device was discarded during registration".to_string(),
                    ));
                }
                state.device_state = DeviceState::Registered;
                self.publish(&state);
                tracing::info!("Device registered");
                Ok(device)
            }
            Ok(Err(e)) => {
                tracing::warn!("Device registration failed: {}", e);
                self.discard_device(generation);
                Err(CallError::Registration(e.message))
            }
            Err(_) => {
                tracing::warn!(
                    "Device registration timed out after {}s",
                    self.config.registration_timeout.as_secs()
                );
                self.discard_device(generation);
                Err(CallError::RegistrationTimeout(
                    self.config.registration_timeout,
                ))
            }
        }
    }

    fn check_line_free(&self) -> Result<(), CallError> {
        if self.lock().is_busy() {
            tracing::warn!("Refusing device refresh: a call is in progress");
            return Err(CallError::CallInProgress);
        }
        Ok(())
    }

    fn mark_unregistered(&self) {
        let mut state = self.lock();
        state.device_state = DeviceState::Unregistered;
        self.publish(&state);
    }

    /// Drop the device of `generation` if it is still the current one.
    fn discard_device(&self, generation: u64) {
        let device = {
            let mut state = self.lock();
            if state.device_generation != generation {
                return;
            }
            let device = state.take_device();
            state.device_state = DeviceState::Unregistered;
            self.publish(&state);
            device
        };
        if let Some(device) = device {
            device.destroy();
        }
    }

    async fn initiate(self: &Arc<Self>, raw_number: &str) -> Result<(), CallError> {
        let (number, generation) = {
            let mut state = self.lock();
            if state.is_busy() {
                tracing::warn!("Ignoring call request: a call is already in progress");
                return Err(CallError::CallInProgress);
            }
            let number = match phone::validate(raw_number) {
                Ok(number) => number,
                Err(e) => {
                    self.fail(&mut state, e.clone());
                    return Err(e);
                }
            };
            state.clear_error();
            state.call_generation += 1;
            state.call = None;
            state.session = Some(CallSession::new(Direction::Outbound, number.clone()));
            state.phase = CallPhase::Connecting;
            self.publish(&state);
            (number, state.call_generation)
        };

        let result = match self.attempt(&number, generation, false).await {
            Err(e) if e.is_retryable() => {
                tracing::warn!("Call setup failed ({}), retrying with a fresh device", e);
                if !self.begin_retry(generation) {
                    return self.lock().abandoned_outcome(e);
                }
                self.attempt(&number, generation, true).await
            }
            other => other,
        };

        match result {
            Ok(Some(handle)) => self.finish_connect(generation, Ok(handle)),
            Ok(None) => {
                let state = self.lock();
                match state.error {
                    Some(ref e) => Err(e.clone()),
                    None => Ok(()),
                }
            }
            Err(e) => self.finish_connect(generation, Err(e)),
        }
    }

    /// `None` when the call was given up before `connect` could run.
    async fn attempt(
        self: &Arc<Self>,
        number: &str,
        generation: u64,
        force_refresh: bool,
    ) -> Result<Option<CallHandle>, CallError> {
        let device = self.ensure_device(force_refresh).await?;
        if !self.lock().is_connecting(generation) {
            tracing::info!("Call to {} abandoned during setup, not connecting", number);
            return Ok(None);
        }
        tracing::info!("Placing call to {}", number);
        device
            .connect(ConnectParams {
                to: number.to_string(),
            })
            .await
            .map(Some)
            .map_err(CallError::from_device)
    }

    /// Show "Reconnecting..." unless the user gave up on this call meanwhile.
    fn begin_retry(&self, generation: u64) -> bool {
        let mut state = self.lock();
        if !state.is_connecting(generation) {
            return false;
        }
        state.reconnecting = true;
        self.publish(&state);
        true
    }

    fn finish_connect(
        self: &Arc<Self>,
        generation: u64,
        result: Result<CallHandle, CallError>,
    ) -> Result<(), CallError> {
        let mut state = self.lock();
        let abandoned = !state.is_connecting(generation);

        match result {
            Ok(CallHandle { call, events }) if abandoned => {
                drop(state);
                tracing::info!("Call was hung up during setup, disconnecting late leg");
                if let Err(e) = call.disconnect() {
                    tracing::warn!("Failed to disconnect abandoned call: {}", e);
                }
                drop(events);
                Ok(())
            }
            Ok(CallHandle { call, events }) => {
                tracing::info!(
                    "Call leg created (sid={})",
                    call.sid().as_deref().unwrap_or("?")
                );
                state.call = Some(call);
                state.reconnecting = false;
                self.publish(&state);
                tokio::spawn(watch_call(Arc::downgrade(self), generation, events));
                Ok(())
            }
            Err(e) if abandoned => {
                tracing::debug!("Setup error for abandoned call: {}", e);
                state.abandoned_outcome(e)
            }
            Err(e) => {
                self.fail(&mut state, e.clone());
                Err(e)
            }
        }
    }

    fn hang_up(&self) {
        let (call, incoming, device) = {
            let mut state = self.lock();
            state.call_generation += 1;
            (
                state.call.take(),
                state.incoming.take(),
                state.device.clone(),
            )
        };

        if let Some(call) = call {
            if let Err(e) = call.disconnect() {
                tracing::warn!("Disconnect failed: {}", e);
            }
        }
        if let Some(pending) = incoming {
            pending.call.reject();
        }
        if let Some(device) = device {
            device.disconnect_all();
        }

        let mut state = self.lock();
        state.session = None;
        state.reconnecting = false;
        state.clear_error();
        state.phase = CallPhase::Ended(EndReason::HungUp);
        self.publish(&state);
        tracing::info!("Call ended");
    }

    async fn accept_incoming(self: &Arc<Self>) -> Result<(), CallError> {
        let (call, generation) = {
            let state = self.lock();
            let pending = state.incoming.as_ref().ok_or(CallError::NoIncomingCall)?;
            (Arc::clone(&pending.call), state.call_generation)
        };

        if let Err(e) = call.accept().await {
            let err = CallError::Signaling(e.message);
            let mut state = self.lock();
            if state.call_generation == generation {
                state.incoming = None;
                self.fail(&mut state, err.clone());
            }
            return Err(err);
        }

        let mut state = self.lock();
        if state.call_generation != generation {
            return Err(CallError::NoIncomingCall);
        }
        if let Some(pending) = state.incoming.take() {
            promote_incoming(&mut state, pending);
            self.publish(&state);
        }
        Ok(())
    }

    fn reject_incoming(&self) -> Result<(), CallError> {
        let pending = {
            let mut state = self.lock();
            let pending = state.incoming.take().ok_or(CallError::NoIncomingCall)?;
            state.call_generation += 1;
            state.session = None;
            state.phase = CallPhase::Idle;
            self.publish(&state);
            pending
        };
        tracing::info!("Rejecting incoming call from {}", pending.from);
        pending.call.reject();
        Ok(())
    }

    fn teardown(&self) {
        let (call, incoming, device, timer) = {
            let mut state = self.lock();
            state.call_generation += 1;
            state.session = None;
            state.phase = CallPhase::Idle;
            state.reconnecting = false;
            state.error = None;
            let device = state.take_device();
            let timer = state.error_timer.take();
            let taken = (state.call.take(), state.incoming.take(), device, timer);
            self.publish(&state);
            taken
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(call) = call {
            if let Err(e) = call.disconnect() {
                tracing::warn!("Disconnect during teardown failed: {}", e);
            }
        }
        if let Some(pending) = incoming {
            pending.call.reject();
        }
        if let Some(device) = device {
            device.disconnect_all();
            device.destroy();
            tracing::debug!("Device destroyed");
        }
    }

    fn on_device_event(self: &Arc<Self>, generation: u64, event: DeviceEvent) {
        let mut state = self.lock();
        if state.device_generation != generation || state.device.is_none() {
            tracing::debug!("Dropping event from stale device: {:?}", event);
            drop(state);
            if let DeviceEvent::Incoming(incoming) = event {
                incoming.handle.call.reject();
            }
            return;
        }

        match event {
            DeviceEvent::Registering => state.device_state = DeviceState::Registering,
            DeviceEvent::Registered => state.device_state = DeviceState::Registered,
            DeviceEvent::Unregistered => {
                tracing::info!("Device unregistered by backend");
                state.device_state = DeviceState::Unregistered;
            }
            DeviceEvent::Error(e) => {
                tracing::error!("Device error: {}", e);
                let device = state.take_device();
                state.device_state = DeviceState::Unregistered;
                state.call_generation += 1;
                let incoming = state.incoming.take();
                let call = state.call.take();
                self.fail(&mut state, CallError::from_device(e));
                drop(state);
                if let Some(call) = call {
                    let _ = call.disconnect();
                }
                if let Some(pending) = incoming {
                    tracing::info!("Rejecting incoming call from {}: device failed", pending.from);
                    pending.call.reject();
                }
                if let Some(device) = device {
                    device.destroy();
                }
                return;
            }
            DeviceEvent::Incoming(IncomingCall { from, handle }) => {
                if state.is_busy() {
                    tracing::info!("Rejecting incoming call from {}: line busy", from);
                    drop(state);
                    handle.call.reject();
                    return;
                }
                tracing::info!("Incoming call from {}", from);
                state.clear_error();
                state.call_generation += 1;
                state.session = None;
                state.phase = CallPhase::Idle;
                state.incoming = Some(PendingIncoming {
                    from,
                    call: handle.call,
                });
                tokio::spawn(watch_call(
                    Arc::downgrade(self),
                    state.call_generation,
                    handle.events,
                ));
            }
        }
        self.publish(&state);
    }

    fn on_call_event(self: &Arc<Self>, generation: u64, event: CallEvent) {
        let mut state = self.lock();
        if state.call_generation != generation {
            tracing::debug!("Dropping event from stale call: {:?}", event);
            return;
        }

        match event {
            CallEvent::Ringing => {
                tracing::debug!("Remote is ringing");
                return;
            }
            CallEvent::Accept => {
                if let Some(pending) = state.incoming.take() {
                    promote_incoming(&mut state, pending);
                } else if state.phase == CallPhase::Connecting {
                    tracing::info!("Call answered");
                    state.phase = CallPhase::InCall;
                }
            }
            CallEvent::Disconnect | CallEvent::Reject => {
                if state.incoming.take().is_some() {
                    state.phase = CallPhase::Ended(EndReason::Cancelled);
                } else if matches!(state.phase, CallPhase::Connecting | CallPhase::InCall) {
                    tracing::info!("Call disconnected by remote");
                    state.call = None;
                    state.session = None;
                    state.reconnecting = false;
                    state.phase = CallPhase::Ended(EndReason::HungUp);
                }
            }
            CallEvent::Cancel => {
                tracing::info!("Call cancelled");
                state.incoming = None;
                state.call = None;
                state.session = None;
                state.reconnecting = false;
                state.phase = CallPhase::Ended(EndReason::Cancelled);
            }
            CallEvent::Error(e) => {
                let incoming = state.incoming.take();
                self.fail(&mut state, CallError::Signaling(e.message));
                drop(state);
                if let Some(pending) = incoming {
                    pending.call.reject();
                }
                return;
            }
        }
        self.publish(&state);
    }
}

fn promote_incoming(state: &mut State, pending: PendingIncoming) {
    tracing::info!("Inbound call from {} connected", pending.from);
    state.session = Some(CallSession::new(Direction::Inbound, pending.from));
    state.call = Some(pending.call);
    state.phase = CallPhase::InCall;
}

async fn watch_device(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
) {
    while let Some(event) = events.recv().await {
        match inner.upgrade() {
            Some(inner) => inner.on_device_event(generation, event),
            None => break,
        }
    }
}

async fn watch_call(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<CallEvent>,
) {
    while let Some(event) = events.recv().await {
        match inner.upgrade() {
            Some(inner) => inner.on_call_event(generation, event),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::status::StatusKind;
    use crate::calling::testing::FakeBackend;
    use crate::calling::DeviceError;
    use std::sync::atomic::Ordering;

    fn manager(backend: &Arc<FakeBackend>) -> CallSessionManager {
        CallSessionManager::new(backend.clone(), backend.clone())
    }

    /// Let listener tasks drain their channels.
    async fn settle() {
        time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_registers_device() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        assert_eq!(mgr.status(), Status::idle());

        mgr.prepare().await.unwrap();
        assert_eq!(mgr.device_state(), DeviceState::Registered);
        assert_eq!(mgr.status().message, "Ready for calls");

        // Second ensure reuses the registered device.
        mgr.ensure_device(false).await.unwrap();
        assert_eq!(backend.script.token_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(backend.device_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_builds_new_device() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.prepare().await.unwrap();
        mgr.refresh_device().await.unwrap();

        assert_eq!(backend.script.token_fetches.load(Ordering::SeqCst), 2);
        assert_eq!(backend.device_count(), 2);
        assert!(backend.device(0).destroyed.load(Ordering::SeqCst));
        assert!(!backend.device(1).destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_call_lifecycle() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);

        mgr.initiate("+447911123456").await.unwrap();
        assert_eq!(mgr.status().message, "Connecting...");
        let session = mgr.session().unwrap();
        assert_eq!(session.target, "+447911123456");
        assert_eq!(session.direction, Direction::Outbound);

        let device = backend.device(0);
        assert_eq!(device.last_call().to.as_deref(), Some("+447911123456"));

        device.last_call().emit(CallEvent::Accept);
        settle().await;
        assert_eq!(mgr.phase(), CallPhase::InCall);
        assert_eq!(mgr.status().message, "In call");

        device.last_call().emit(CallEvent::Disconnect);
        settle().await;
        assert_eq!(mgr.phase(), CallPhase::Ended(EndReason::HungUp));
        assert_eq!(mgr.status().message, "Call ended");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_shows_cancelled() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.initiate("5551234567").await.unwrap();

        backend.device(0).last_call().emit(CallEvent::Cancel);
        settle().await;
        assert_eq!(mgr.status(), Status::cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_errors_never_reach_backend() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);

        assert_eq!(mgr.initiate("   ").await, Err(CallError::EmptyNumber));
        assert_eq!(mgr.status(), Status::error("Enter a phone number"));

        assert_eq!(mgr.initiate("abc").await, Err(CallError::InvalidNumber));
        assert_eq!(mgr.status(), Status::error("Invalid phone number format"));

        assert_eq!(backend.script.token_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(backend.device_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_is_rejected_while_connecting() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.prepare().await.unwrap();

        mgr.initiate("5551234567").await.unwrap();
        assert_eq!(
            mgr.initiate("5559876543").await,
            Err(CallError::CallInProgress)
        );
        assert_eq!(backend.script.connects.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.session().unwrap().target, "+15551234567");
        assert_eq!(mgr.status().message, "Connecting...");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_initiates_yield_one_session() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);

        let (a, b) = tokio::join!(mgr.initiate("5551234567"), mgr.initiate("5559876543"));
        assert!(a.is_ok());
        assert_eq!(b, Err(CallError::CallInProgress));
        assert_eq!(backend.script.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_timeout_discards_device() {
        let backend = FakeBackend::new();
        backend.script.hang_registration.store(true, Ordering::SeqCst);
        let mgr = manager(&backend);

        let err = mgr.initiate("5551234567").await.unwrap_err();
        assert_eq!(err, CallError::RegistrationTimeout(REGISTRATION_TIMEOUT));
        let status = mgr.status();
        assert_eq!(status.kind, StatusKind::Error);
        assert!(status.message.contains("timeout"), "{}", status.message);

        // One retry with a fresh device, both timed out and destroyed.
        assert_eq!(backend.script.token_fetches.load(Ordering::SeqCst), 2);
        assert_eq!(backend.device_count(), 2);
        assert!(backend.device(0).destroyed.load(Ordering::SeqCst));
        assert!(backend.device(1).destroyed.load(Ordering::SeqCst));
        assert_ne!(mgr.device_state(), DeviceState::Registered);

        // Next attempt starts from scratch with a fresh token.
        backend.script.hang_registration.store(false, Ordering::SeqCst);
        mgr.ensure_device(false).await.unwrap();
        assert_eq!(backend.script.token_fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_websocket_error_retries_once() {
        let backend = FakeBackend::new();
        backend.fail_next_connect("WebSocket closed before call setup");
        let mgr = manager(&backend);

        mgr.initiate("5551234567").await.unwrap();
        assert_eq!(backend.script.token_fetches.load(Ordering::SeqCst), 2);
        assert_eq!(backend.script.registrations.load(Ordering::SeqCst), 2);
        assert_eq!(backend.script.connects.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.status().message, "Connecting...");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_is_terminal() {
        let backend = FakeBackend::new();
        backend.fail_next_connect("WebSocket closed");
        backend.fail_next_connect("connection reset");
        backend.fail_next_connect("never reached");
        let mgr = manager(&backend);

        let err = mgr.initiate("5551234567").await.unwrap_err();
        assert_eq!(err, CallError::Registration("connection reset".into()));
        assert_eq!(backend.script.connects.load(Ordering::SeqCst), 2);
        assert_eq!(
            mgr.status(),
            Status::error("Call error: Registration failed: connection reset")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_error_is_not_retried() {
        let backend = FakeBackend::new();
        backend.fail_next_connect("31486: busy here");
        let mgr = manager(&backend);

        let err = mgr.initiate("5551234567").await.unwrap_err();
        assert_eq!(err, CallError::Signaling("31486: busy here".into()));
        assert_eq!(backend.script.token_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(backend.script.connects.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.status(), Status::error("Call error: 31486: busy here"));
        assert!(mgr.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_error_is_not_retried() {
        let backend = FakeBackend::new();
        *backend.script.token_error.lock().unwrap() = Some(CallError::TokenFetch(
            crate::calling::NOT_CONFIGURED_MESSAGE.to_string(),
        ));
        let mgr = manager(&backend);

        assert!(mgr.initiate("5551234567").await.is_err());
        assert_eq!(backend.script.token_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(
            mgr.status().message,
            "Twilio is not configured for your account"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_failure_uses_fresh_device_on_retry() {
        let backend = FakeBackend::new();
        *backend.script.registration_error.lock().unwrap() = Some("31204: JWT invalid".into());
        let mgr = manager(&backend);

        let err = mgr.initiate("5551234567").await.unwrap_err();
        assert_eq!(err, CallError::Registration("31204: JWT invalid".into()));
        assert_eq!(backend.script.registrations.load(Ordering::SeqCst), 2);
        assert_eq!(backend.device_count(), 2);
        assert!(mgr.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reverts_to_idle_after_window() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.prepare().await.unwrap();

        let _ = mgr.initiate("abc").await;
        assert_eq!(mgr.status().kind, StatusKind::Error);

        time::advance(Duration::from_secs(9)).await;
        settle().await;
        assert_eq!(mgr.status().kind, StatusKind::Error);

        time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(mgr.status(), Status::ready());
        assert_eq!(mgr.phase(), CallPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_error_restarts_window() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);

        let _ = mgr.initiate("abc").await;
        time::advance(Duration::from_secs(5)).await;
        let _ = mgr.initiate("").await;
        assert_eq!(mgr.status(), Status::error("Enter a phone number"));

        // Original deadline (t=10s) passes without clearing.
        time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(mgr.status(), Status::error("Enter a phone number"));

        // New deadline is t=15s.
        time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(mgr.status(), Status::idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_error_event_clears_call() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.initiate("5551234567").await.unwrap();

        let call = backend.device(0).last_call();
        call.emit(CallEvent::Accept);
        call.emit(CallEvent::Error(DeviceError::new("31005: connection error")));
        settle().await;

        assert_eq!(
            mgr.status(),
            Status::error("Call error: 31005: connection error")
        );
        assert!(mgr.session().is_none());
        // Errors after setup are not retried.
        assert_eq!(backend.script.connects.load(Ordering::SeqCst), 1);

        // Later events from the dead call are ignored.
        call.emit(CallEvent::Accept);
        settle().await;
        assert_eq!(mgr.status().kind, StatusKind::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_ends_even_when_disconnect_fails() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.initiate("5551234567").await.unwrap();

        let device = backend.device(0);
        let call = device.last_call();
        call.emit(CallEvent::Accept);
        settle().await;

        call.fail_disconnect.store(true, Ordering::SeqCst);
        mgr.hang_up();
        assert_eq!(mgr.status().message, "Call ended");
        assert_eq!(call.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(device.disconnect_alls.load(Ordering::SeqCst), 1);

        // A late disconnect event does not change anything.
        call.emit(CallEvent::Disconnect);
        settle().await;
        assert_eq!(mgr.status().message, "Call ended");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_without_call() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.hang_up();
        assert_eq!(mgr.status(), Status::ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_call_after_end_starts_clean() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.initiate("5551234567").await.unwrap();
        let first = mgr.session().unwrap().id;
        mgr.hang_up();

        mgr.initiate("+447911123456").await.unwrap();
        let second = mgr.session().unwrap();
        assert_ne!(first, second.id);
        assert_eq!(second.target, "+447911123456");
        assert_eq!(backend.device_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_accept() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.prepare().await.unwrap();

        let call = backend.device(0).ring("+15550001111");
        settle().await;
        assert_eq!(mgr.status().message, "Incoming call from +15550001111");

        // Outbound is blocked while something is ringing.
        assert_eq!(
            mgr.initiate("5551234567").await,
            Err(CallError::CallInProgress)
        );

        mgr.accept_incoming().await.unwrap();
        assert!(call.accepted.load(Ordering::SeqCst));
        assert_eq!(mgr.phase(), CallPhase::InCall);
        let session = mgr.session().unwrap();
        assert_eq!(session.direction, Direction::Inbound);
        assert_eq!(session.target, "+15550001111");

        call.emit(CallEvent::Disconnect);
        settle().await;
        assert_eq!(mgr.status().message, "Call ended");
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_reject_never_reaches_in_call() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.prepare().await.unwrap();

        let call = backend.device(0).ring("client:alice");
        settle().await;
        mgr.reject_incoming().unwrap();

        assert!(call.rejected.load(Ordering::SeqCst));
        assert!(!call.accepted.load(Ordering::SeqCst));
        assert_eq!(mgr.phase(), CallPhase::Idle);
        assert_eq!(mgr.status(), Status::ready());
        assert_eq!(mgr.reject_incoming(), Err(CallError::NoIncomingCall));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_cancelled_before_answer() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.prepare().await.unwrap();

        let call = backend.device(0).ring("+15550001111");
        settle().await;
        call.emit(CallEvent::Cancel);
        settle().await;

        assert_eq!(mgr.status(), Status::cancelled());
        assert_eq!(mgr.accept_incoming().await, Err(CallError::NoIncomingCall));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_while_busy_is_rejected() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.initiate("5551234567").await.unwrap();

        let call = backend.device(0).ring("+15550001111");
        settle().await;
        assert!(call.rejected.load(Ordering::SeqCst));
        assert_eq!(mgr.status().message, "Connecting...");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_error_drops_device() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.prepare().await.unwrap();

        backend
            .device(0)
            .emit(DeviceEvent::Error(DeviceError::new("31009: transport unavailable")));
        settle().await;

        assert!(backend.device(0).destroyed.load(Ordering::SeqCst));
        assert_eq!(mgr.status().kind, StatusKind::Error);

        mgr.ensure_device(false).await.unwrap();
        assert_eq!(backend.device_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_event_forces_new_registration() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.prepare().await.unwrap();

        backend.device(0).emit(DeviceEvent::Unregistered);
        settle().await;
        assert_eq!(mgr.device_state(), DeviceState::Unregistered);
        assert_eq!(mgr.status(), Status::idle());

        mgr.ensure_device(false).await.unwrap();
        assert_eq!(backend.script.token_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_tears_down() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.initiate("5551234567").await.unwrap();
        let call = backend.device(0).last_call();

        drop(mgr);
        assert!(backend.device(0).destroyed.load(Ordering::SeqCst));
        assert_eq!(call.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_subscription_sees_transitions() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        let mut rx = mgr.subscribe();

        mgr.initiate("5551234567").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().message, "Connecting...");

        backend.device(0).last_call().emit(CallEvent::Accept);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().message, "In call");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_refused_while_in_call() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.initiate("5551234567").await.unwrap();
        let call = backend.device(0).last_call();
        call.emit(CallEvent::Accept);
        settle().await;

        assert_eq!(mgr.refresh_device().await, Err(CallError::CallInProgress));
        assert!(matches!(
            mgr.ensure_device(true).await,
            Err(CallError::CallInProgress)
        ));
        assert!(!backend.device(0).destroyed.load(Ordering::SeqCst));
        assert_eq!(backend.device_count(), 1);
        assert_eq!(call.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.status(), Status::in_call());

        mgr.hang_up();
        mgr.refresh_device().await.unwrap();
        assert!(backend.device(0).destroyed.load(Ordering::SeqCst));
        assert_eq!(backend.device_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_refused_while_ringing() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.prepare().await.unwrap();
        backend.device(0).ring("+15550001111");
        settle().await;

        assert_eq!(mgr.refresh_device().await, Err(CallError::CallInProgress));
        assert!(!backend.device(0).destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_error_rejects_ringing_call() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.prepare().await.unwrap();
        let call = backend.device(0).ring("+15550001111");
        settle().await;
        assert_eq!(mgr.status().kind, StatusKind::Incoming);

        backend
            .device(0)
            .emit(DeviceEvent::Error(DeviceError::new("31009: transport")));
        settle().await;

        assert!(call.rejected.load(Ordering::SeqCst));
        assert_eq!(mgr.status(), Status::error("Call error: 31009: transport"));
        assert_eq!(mgr.accept_incoming().await, Err(CallError::NoIncomingCall));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_error_rejects_ringing_call() {
        let backend = FakeBackend::new();
        let mgr = manager(&backend);
        mgr.prepare().await.unwrap();
        let call = backend.device(0).ring("+15550001111");
        settle().await;

        call.emit(CallEvent::Error(DeviceError::new("31005: connection error")));
        settle().await;

        assert!(call.rejected.load(Ordering::SeqCst));
        assert_eq!(mgr.status().kind, StatusKind::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_during_retry_never_connects() {
        let backend = FakeBackend::new();
        let mgr = Arc::new(manager(&backend));
        mgr.prepare().await.unwrap();
        backend.fail_next_connect("WebSocket closed before call setup");
        *backend.script.registration_delay.lock().unwrap() = Some(Duration::from_secs(2));

        let task = tokio::spawn({
            let mgr = Arc::clone(&mgr);
            async move { mgr.initiate("5551234567").await }
        });
        settle().await;
        assert_eq!(mgr.status(), Status::reconnecting());

        mgr.hang_up();
        assert_eq!(mgr.status(), Status::ended());

        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(backend.script.connects.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.status(), Status::ended());
        assert!(mgr.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_error_during_retry_fails_initiate() {
        let backend = FakeBackend::new();
        let mgr = Arc::new(manager(&backend));
        mgr.prepare().await.unwrap();
        backend.fail_next_connect("WebSocket closed before call setup");
        *backend.script.registration_delay.lock().unwrap() = Some(Duration::from_secs(2));

        let task = tokio::spawn({
            let mgr = Arc::clone(&mgr);
            async move { mgr.initiate("5551234567").await }
        });
        settle().await;
        assert_eq!(mgr.status(), Status::reconnecting());

        backend
            .device(1)
            .emit(DeviceEvent::Error(DeviceError::new("31009: transport")));
        settle().await;
        assert_eq!(mgr.status(), Status::error("Call error: 31009: transport"));

        assert!(task.await.unwrap().is_err());
        assert_eq!(backend.script.connects.load(Ordering::SeqCst), 1);
        assert!(mgr.session().is_none());
    }
}
