//! In-memory token provider, device, and call used by the calling tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::device::{
    Call, CallEvent, CallHandle, ConnectParams, Device, DeviceEvent, DeviceFactory, DeviceHandle,
    IncomingCall, TokenProvider,
};
use super::volume::{AudioConstraints, MediaError, MicrophoneSource, MicrophoneStream};
use super::{CallError, DeviceError};

/// Knobs and counters shared by every fake device a backend builds.
#[derive(Default)]
pub struct Script {
    pub token_fetches: AtomicUsize,
    pub registrations: AtomicUsize,
    pub connects: AtomicUsize,
    pub token_error: Mutex<Option<CallError>>,
    /// `register` never resolves.
    pub hang_registration: AtomicBool,
    /// `register` takes this long before resolving.
    pub registration_delay: Mutex<Option<Duration>>,
    pub registration_error: Mutex<Option<String>>,
    /// Popped one per `connect`.
    pub connect_errors: Mutex<VecDeque<String>>,
}

/// Token provider and device factory in one.
pub struct FakeBackend {
    pub script: Arc<Script>,
    devices: Mutex<Vec<Arc<FakeDevice>>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(Script::default()),
            devices: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next_connect(&self, message: &str) {
        self.script
            .connect_errors
            .lock()
            .unwrap()
            .push_back(message.to_string());
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    pub fn device(&self, index: usize) -> Arc<FakeDevice> {
        Arc::clone(&self.devices.lock().unwrap()[index])
    }
}

#[async_trait]
impl TokenProvider for FakeBackend {
    async fn fetch_token(&self) -> Result<String, CallError> {
        let n = self.script.token_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = self.script.token_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(format!("token-{}", n))
    }
}

#[async_trait]
impl DeviceFactory for FakeBackend {
    async fn create(&self, token: &str) -> Result<DeviceHandle, DeviceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = Arc::new(FakeDevice {
            token: token.to_string(),
            script: Arc::clone(&self.script),
            events: tx,
            calls: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            disconnect_alls: AtomicUsize::new(0),
        });
        self.devices.lock().unwrap().push(Arc::clone(&device));
        Ok(DeviceHandle {
            device,
            events: rx,
        })
    }
}

pub struct FakeDevice {
    pub token: String,
    script: Arc<Script>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    calls: Mutex<Vec<Arc<FakeCall>>>,
    pub destroyed: AtomicBool,
    pub disconnect_alls: AtomicUsize,
}

impl FakeDevice {
    pub fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    pub fn last_call(&self) -> Arc<FakeCall> {
        let calls = self.calls.lock().unwrap();
        Arc::clone(calls.last().expect("no call placed"))
    }

    /// Simulate an inbound call.
    pub fn ring(&self, from: &str) -> Arc<FakeCall> {
        let (call, handle) = FakeCall::new(None);
        self.calls.lock().unwrap().push(Arc::clone(&call));
        self.emit(DeviceEvent::Incoming(IncomingCall {
            from: from.to_string(),
            handle,
        }));
        call
    }
}

#[async_trait]
impl Device for FakeDevice {
    async fn register(&self) -> Result<(), DeviceError> {
        self.script.registrations.fetch_add(1, Ordering::SeqCst);
        if self.script.hang_registration.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = *self.script.registration_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = self.script.registration_error.lock().unwrap().clone() {
            return Err(DeviceError::new(msg));
        }
        Ok(())
    }

    async fn connect(&self, params: ConnectParams) -> Result<CallHandle, DeviceError> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        let failure = self.script.connect_errors.lock().unwrap().pop_front();
        if let Some(msg) = failure {
            return Err(DeviceError::new(msg));
        }
        let (call, handle) = FakeCall::new(Some(params.to));
        self.calls.lock().unwrap().push(call);
        Ok(handle)
    }

    fn disconnect_all(&self) {
        self.disconnect_alls.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeCall {
    pub to: Option<String>,
    events: mpsc::UnboundedSender<CallEvent>,
    pub accepted: AtomicBool,
    pub rejected: AtomicBool,
    pub disconnects: AtomicUsize,
    pub fail_disconnect: AtomicBool,
}

impl FakeCall {
    fn new(to: Option<String>) -> (Arc<Self>, CallHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let call = Arc::new(Self {
            to,
            events: tx,
            accepted: AtomicBool::new(false),
            rejected: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
            fail_disconnect: AtomicBool::new(false),
        });
        let handle = CallHandle {
            call: Arc::clone(&call) as Arc<dyn Call>,
            events: rx,
        };
        (call, handle)
    }

    pub fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Call for FakeCall {
    fn sid(&self) -> Option<String> {
        Some("CA00000000000000000000000000000000".to_string())
    }

    async fn accept(&self) -> Result<(), DeviceError> {
        self.accepted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn reject(&self) {
        self.rejected.store(true, Ordering::SeqCst);
    }

    fn disconnect(&self) -> Result<(), DeviceError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(DeviceError::new("transport already closed"));
        }
        Ok(())
    }
}

/// Microphone that serves frames pushed by the test and records teardown.
pub struct FakeMicrophone {
    frames: Arc<Mutex<VecDeque<Vec<i16>>>>,
    log: Arc<Mutex<Vec<&'static str>>>,
    fail_close: AtomicBool,
    denied: bool,
    pub constraints: Mutex<Option<AudioConstraints>>,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self {
            frames: Arc::new(Mutex::new(VecDeque::new())),
            log: Arc::new(Mutex::new(Vec::new())),
            fail_close: AtomicBool::new(false),
            denied: false,
            constraints: Mutex::new(None),
        }
    }

    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::new()
        }
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn push_frame(&self, frame: Vec<i16>) {
        self.frames.lock().unwrap().push_back(frame);
    }

    pub fn teardown_log(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }
}

impl MicrophoneSource for FakeMicrophone {
    fn open(&self, constraints: AudioConstraints) -> Result<Box<dyn MicrophoneStream>, MediaError> {
        if self.denied {
            return Err(MediaError::PermissionDenied);
        }
        *self.constraints.lock().unwrap() = Some(constraints);
        Ok(Box::new(FakeStream {
            frames: Arc::clone(&self.frames),
            log: Arc::clone(&self.log),
            fail_close: self.fail_close.load(Ordering::SeqCst),
        }))
    }
}

struct FakeStream {
    frames: Arc<Mutex<VecDeque<Vec<i16>>>>,
    log: Arc<Mutex<Vec<&'static str>>>,
    fail_close: bool,
}

impl MicrophoneStream for FakeStream {
    fn latest_frame(&mut self) -> Option<Vec<i16>> {
        self.frames.lock().unwrap().pop_front()
    }

    fn close(&mut self) -> Result<(), MediaError> {
        self.log.lock().unwrap().push("close");
        if self.fail_close {
            return Err(MediaError::Stream("context already closed".into()));
        }
        Ok(())
    }

    fn stop_tracks(&mut self) -> Result<(), MediaError> {
        self.log.lock().unwrap().push("stop_tracks");
        Ok(())
    }
}
