//! Twilio REST device.
//!
//! Registration checks the access token and the account, then polls the
//! account for calls ringing on the configured caller ID. Every call leg gets
//! its own status poller that turns Twilio call statuses into [`CallEvent`]s.
//! Hang-up and reject are fire-and-forget `Status=completed` updates.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use super::device::{
    Call, CallEvent, CallHandle, ConnectParams, Device, DeviceEvent, DeviceFactory, DeviceHandle,
    DeviceState, IncomingCall,
};
use super::DeviceError;
use crate::config::TwilioConfig;

/// Consecutive poll failures before the leg or device is reported broken.
const MAX_POLL_FAILURES: u32 = 3;

type Registry = Mutex<HashMap<String, Arc<TwilioCall>>>;

// ---------------------------------------------------------------------------
// Access token
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<i64>,
    #[serde(default)]
    grants: Option<Grants>,
}

#[derive(Debug, Deserialize)]
struct Grants {
    identity: Option<String>,
}

/// The claims of a calling access token this device cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub identity: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Decode the payload of a JWT. The signature is the backend's business.
    pub fn parse(token: &str) -> Result<Self, DeviceError> {
        let malformed = || DeviceError::new("registration failed: malformed access token");

        let mut parts = token.split('.');
        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => return Err(malformed()),
        };
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|_| malformed())?;
        let claims: Claims = serde_json::from_slice(&bytes).map_err(|_| malformed())?;

        Ok(Self {
            identity: claims.grants.and_then(|g| g.identity),
            expires_at: claims.exp.and_then(|exp| DateTime::from_timestamp(exp, 0)),
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |exp| now >= exp)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

// ---------------------------------------------------------------------------
// Call status mapping
// ---------------------------------------------------------------------------

/// Twilio call resource status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Queued,
    Ringing,
    InProgress,
    Completed,
    Busy,
    NoAnswer,
    Failed,
    Canceled,
}

impl RemoteStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" | "initiated" => Some(RemoteStatus::Queued),
            "ringing" => Some(RemoteStatus::Ringing),
            "in-progress" => Some(RemoteStatus::InProgress),
            "completed" => Some(RemoteStatus::Completed),
            "busy" => Some(RemoteStatus::Busy),
            "no-answer" => Some(RemoteStatus::NoAnswer),
            "failed" => Some(RemoteStatus::Failed),
            "canceled" => Some(RemoteStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RemoteStatus::Completed
                | RemoteStatus::Busy
                | RemoteStatus::NoAnswer
                | RemoteStatus::Failed
                | RemoteStatus::Canceled
        )
    }
}

/// Event to emit when a leg moves from `prev` to `next`, if any.
pub fn transition(prev: Option<RemoteStatus>, next: RemoteStatus) -> Option<CallEvent> {
    if prev == Some(next) {
        return None;
    }
    match next {
        RemoteStatus::Queued => None,
        RemoteStatus::Ringing => Some(CallEvent::Ringing),
        RemoteStatus::InProgress => Some(CallEvent::Accept),
        RemoteStatus::Completed => Some(CallEvent::Disconnect),
        RemoteStatus::Busy | RemoteStatus::NoAnswer => Some(CallEvent::Reject),
        RemoteStatus::Canceled => Some(CallEvent::Cancel),
        RemoteStatus::Failed => Some(CallEvent::Error(DeviceError::new("31000: call failed"))),
    }
}

// ---------------------------------------------------------------------------
// REST plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AccountResource {
    status: String,
    friendly_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
    status: String,
    from: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallList {
    #[serde(default)]
    calls: Vec<CallResource>,
}

#[derive(Debug, Deserialize)]
struct RestErrorBody {
    code: Option<u32>,
    message: Option<String>,
}

fn transport_error(err: reqwest::Error) -> DeviceError {
    DeviceError::new(format!("connection error: {}", err))
}

fn rest_error(status: u16, body: &str) -> DeviceError {
    match serde_json::from_str::<RestErrorBody>(body) {
        Ok(RestErrorBody {
            code: Some(code),
            message: Some(message),
        }) => DeviceError::new(format!("{}: {}", code, message)),
        Ok(RestErrorBody {
            message: Some(message),
            ..
        }) => DeviceError::new(message),
        _ => DeviceError::new(format!("HTTP {}: {}", status, body.trim())),
    }
}

struct Rest {
    http: reqwest::Client,
    config: TwilioConfig,
}

impl Rest {
    fn url(&self, tail: &str) -> String {
        format!(
            "{}/Accounts/{}{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid,
            tail
        )
    }

    fn account_url(&self) -> String {
        self.url(".json")
    }

    fn calls_url(&self) -> String {
        self.url("/Calls.json")
    }

    fn call_url(&self, sid: &str) -> String {
        self.url(&format!("/Calls/{}.json", sid))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, DeviceError> {
        let resp = request
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(rest_error(status.as_u16(), &body));
        }
        resp.json::<T>()
            .await
            .map_err(|e| DeviceError::new(format!("unexpected Twilio response: {}", e)))
    }

    async fn account(&self) -> Result<AccountResource, DeviceError> {
        self.send(self.http.get(self.account_url())).await
    }

    async fn fetch_call(&self, sid: &str) -> Result<CallResource, DeviceError> {
        self.send(self.http.get(self.call_url(sid))).await
    }

    async fn ringing_calls(&self) -> Result<Vec<CallResource>, DeviceError> {
        let query = [("To", self.config.caller_id.as_str()), ("Status", "ringing")];
        let list: CallList = self
            .send(self.http.get(self.calls_url()).query(&query))
            .await?;
        Ok(list.calls)
    }

    async fn create_call(&self, params: &ConnectParams) -> Result<CallResource, DeviceError> {
        let mut form = params.to_form();
        form.push(("From", self.config.caller_id.clone()));
        form.push(("Url", self.config.answer_url.clone()));
        self.send(self.http.post(self.calls_url()).form(&form)).await
    }

    async fn redirect(&self, sid: &str) -> Result<CallResource, DeviceError> {
        let form = [("Url", self.config.answer_url.as_str()), ("Method", "POST")];
        self.send(self.http.post(self.call_url(sid)).form(&form)).await
    }

    async fn complete(&self, sid: &str) -> Result<(), DeviceError> {
        let form = [("Status", "completed")];
        let _: CallResource = self
            .send(self.http.post(self.call_url(sid)).form(&form))
            .await?;
        Ok(())
    }
}

/// Run a request in the background, logging its failure.
fn spawn_request<F>(what: &'static str, request: F)
where
    F: Future<Output = Result<(), DeviceError>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = request.await {
                    tracing::warn!("{} failed: {}", what, e);
                }
            });
        }
        Err(_) => tracing::warn!("{} skipped: no runtime", what),
    }
}

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

/// One Twilio call leg.
pub struct TwilioCall {
    sid: String,
    rest: Arc<Rest>,
    finished: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
    registry: Weak<Registry>,
}

impl TwilioCall {
    fn start(
        rest: Arc<Rest>,
        sid: String,
        initial: Option<RemoteStatus>,
        registry: Weak<Registry>,
    ) -> (Arc<Self>, CallHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let poller = tokio::spawn(poll_call_status(
            Arc::clone(&rest),
            sid.clone(),
            tx,
            Arc::clone(&finished),
            registry.clone(),
            initial,
        ));
        let call = Arc::new(Self {
            sid,
            rest,
            finished,
            poller: Mutex::new(Some(poller)),
            registry,
        });
        let handle = CallHandle {
            call: Arc::clone(&call) as Arc<dyn Call>,
            events: rx,
        };
        (call, handle)
    }

    /// Stop polling and complete the leg on Twilio. Returns false if the leg
    /// was already finished.
    fn finish(&self) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.stop_polling();
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.sid);
        }
        let rest = Arc::clone(&self.rest);
        let sid = self.sid.clone();
        spawn_request("Completing call", async move { rest.complete(&sid).await });
        true
    }

    fn stop_polling(&self) {
        if let Some(task) = self
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

#[async_trait]
impl Call for TwilioCall {
    fn sid(&self) -> Option<String> {
        Some(self.sid.clone())
    }

    async fn accept(&self) -> Result<(), DeviceError> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(DeviceError::new("call is no longer ringing"));
        }
        tracing::info!("Answering call {}", self.sid);
        self.rest.redirect(&self.sid).await?;
        Ok(())
    }

    fn reject(&self) {
        if self.finish() {
            tracing::info!("Rejected call {}", self.sid);
        }
    }

    fn disconnect(&self) -> Result<(), DeviceError> {
        if !self.finish() {
            return Err(DeviceError::new("call already finished"));
        }
        tracing::info!("Hanging up call {}", self.sid);
        Ok(())
    }
}

async fn poll_call_status(
    rest: Arc<Rest>,
    sid: String,
    events: mpsc::UnboundedSender<CallEvent>,
    finished: Arc<AtomicBool>,
    registry: Weak<Registry>,
    mut last: Option<RemoteStatus>,
) {
    let mut failures = 0u32;
    loop {
        time::sleep(rest.config.poll_interval()).await;
        if finished.load(Ordering::SeqCst) {
            break;
        }
        match rest.fetch_call(&sid).await {
            Ok(resource) => {
                failures = 0;
                let Some(status) = RemoteStatus::parse(&resource.status) else {
                    tracing::debug!("Call {}: unknown status {}", sid, resource.status);
                    continue;
                };
                if let Some(event) = transition(last, status) {
                    tracing::debug!("Call {}: {:?} -> {:?}", sid, last, status);
                    if events.send(event).is_err() {
                        break;
                    }
                }
                last = Some(status);
                if status.is_terminal() {
                    finished.store(true, Ordering::SeqCst);
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    "Polling call {} failed ({}/{}): {}",
                    sid,
                    failures,
                    MAX_POLL_FAILURES,
                    e
                );
                if failures >= MAX_POLL_FAILURES {
                    let _ = events.send(CallEvent::Error(e));
                    break;
                }
            }
        }
    }

    if let Some(registry) = registry.upgrade() {
        registry.lock().unwrap_or_else(|e| e.into_inner()).remove(&sid);
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A registration with a Twilio account over the REST API.
pub struct TwilioRestDevice {
    rest: Arc<Rest>,
    token: AccessToken,
    events: mpsc::UnboundedSender<DeviceEvent>,
    calls: Arc<Registry>,
    state: Mutex<DeviceState>,
    inbound: Mutex<Option<JoinHandle<()>>>,
}

impl TwilioRestDevice {
    pub fn state(&self) -> DeviceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

#[async_trait]
impl Device for TwilioRestDevice {
    async fn register(&self) -> Result<(), DeviceError> {
        if self.state() == DeviceState::Destroyed {
            return Err(DeviceError::new("registration failed: device destroyed"));
        }
        if self.token.is_expired() {
            return Err(DeviceError::new("registration failed: access token expired"));
        }

        self.set_state(DeviceState::Registering);
        let _ = self.events.send(DeviceEvent::Registering);

        let account = self.rest.account().await.map_err(|e| {
            self.set_state(DeviceState::Unregistered);
            DeviceError::new(format!("registration failed: {}", e))
        })?;
        if account.status != "active" {
            self.set_state(DeviceState::Unregistered);
            return Err(DeviceError::new(format!(
                "registration failed: account is {}",
                account.status
            )));
        }
        tracing::info!(
            "Registered with Twilio account {}",
            account.friendly_name.as_deref().unwrap_or(&self.rest.config.account_sid)
        );

        self.set_state(DeviceState::Registered);
        let _ = self.events.send(DeviceEvent::Registered);

        let poller = tokio::spawn(poll_inbound(
            Arc::clone(&self.rest),
            self.token.expires_at,
            self.events.clone(),
            Arc::downgrade(&self.calls),
        ));
        if let Some(old) = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(poller)
        {
            old.abort();
        }
        Ok(())
    }

    async fn connect(&self, params: ConnectParams) -> Result<CallHandle, DeviceError> {
        if self.state() != DeviceState::Registered {
            return Err(DeviceError::new("registration required before placing a call"));
        }
        let resource = self.rest.create_call(&params).await?;
        tracing::debug!("Created call {} to {} ({})", resource.sid, params.to, resource.status);

        let (call, handle) = TwilioCall::start(
            Arc::clone(&self.rest),
            resource.sid.clone(),
            RemoteStatus::parse(&resource.status),
            Arc::downgrade(&self.calls),
        );
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(resource.sid, call);
        Ok(handle)
    }

    fn disconnect_all(&self) {
        let calls: Vec<Arc<TwilioCall>> = self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, call)| call)
            .collect();
        for call in calls {
            call.finish();
        }
    }

    fn destroy(&self) {
        self.set_state(DeviceState::Destroyed);
        if let Some(task) = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        let calls: Vec<Arc<TwilioCall>> = self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, call)| call)
            .collect();
        for call in calls {
            call.stop_polling();
        }
    }
}

impl Drop for TwilioRestDevice {
    fn drop(&mut self) {
        if let Some(task) = self
            .inbound
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

async fn poll_inbound(
    rest: Arc<Rest>,
    expires_at: Option<DateTime<Utc>>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    registry: Weak<Registry>,
) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut failures = 0u32;
    loop {
        time::sleep(rest.config.poll_interval()).await;

        if expires_at.map_or(false, |exp| Utc::now() >= exp) {
            tracing::info!("Access token expired, device unregistered");
            let _ = events.send(DeviceEvent::Unregistered);
            return;
        }

        let ringing = match rest.ringing_calls().await {
            Ok(calls) => {
                failures = 0;
                calls
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    "Polling for incoming calls failed ({}/{}): {}",
                    failures,
                    MAX_POLL_FAILURES,
                    e
                );
                if failures >= MAX_POLL_FAILURES {
                    let _ = events.send(DeviceEvent::Error(DeviceError::new(format!(
                        "connection lost: {}",
                        e
                    ))));
                    return;
                }
                continue;
            }
        };

        let current: HashSet<String> = ringing.iter().map(|c| c.sid.clone()).collect();
        for resource in ringing {
            if !seen.insert(resource.sid.clone()) {
                continue;
            }
            let Some(calls) = registry.upgrade() else {
                return;
            };
            let (call, handle) = TwilioCall::start(
                Arc::clone(&rest),
                resource.sid.clone(),
                Some(RemoteStatus::Ringing),
                Arc::downgrade(&calls),
            );
            calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(resource.sid.clone(), call);

            let from = resource.from.unwrap_or_else(|| "unknown caller".to_string());
            tracing::info!("Incoming call {} from {}", resource.sid, from);
            if events
                .send(DeviceEvent::Incoming(IncomingCall { from, handle }))
                .is_err()
            {
                return;
            }
        }
        seen.retain(|sid| current.contains(sid));
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds [`TwilioRestDevice`]s from calling tokens.
pub struct TwilioDeviceFactory {
    http: reqwest::Client,
    config: TwilioConfig,
}

impl TwilioDeviceFactory {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl DeviceFactory for TwilioDeviceFactory {
    async fn create(&self, token: &str) -> Result<DeviceHandle, DeviceError> {
        let token = AccessToken::parse(token)?;
        match token.identity {
            Some(ref identity) => tracing::info!("Calling identity: {}", identity),
            None => tracing::debug!("Access token carries no identity grant"),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let device = Arc::new(TwilioRestDevice {
            rest: Arc::new(Rest {
                http: self.http.clone(),
                config: self.config.clone(),
            }),
            token,
            events: tx,
            calls: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(DeviceState::Unregistered),
            inbound: Mutex::new(None),
        });
        Ok(DeviceHandle {
            device,
            events: rx,
        })
    }
}
