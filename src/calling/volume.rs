//! Microphone level meter shown while a call is up.
//!
//! Purely decorative: a failure here never touches call state. The meter
//! samples the most recent capture frame once per UI frame, computes its RMS,
//! and smooths it so the gauge does not flicker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Weight of the previous level in the exponential smoothing.
pub const SMOOTHING: f32 = 0.8;

/// Sampling period (~30 fps, matching the TUI frame rate).
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Microphone access denied")]
    PermissionDenied,

    #[error("No microphone found")]
    NoDevice,

    #[error("Microphone error: {0}")]
    Stream(String),
}

impl MediaError {
    /// Inline message for the call view.
    pub fn user_message(&self) -> String {
        match self {
            MediaError::PermissionDenied => {
                "Microphone access denied. Allow microphone access to see your input level."
                    .to_string()
            }
            MediaError::NoDevice => "No microphone found".to_string(),
            MediaError::Stream(msg) => format!("Could not start microphone: {}", msg),
        }
    }
}

/// Processing requested from the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Something that can hand out microphone streams.
pub trait MicrophoneSource: Send + Sync {
    fn open(&self, constraints: AudioConstraints) -> Result<Box<dyn MicrophoneStream>, MediaError>;
}

/// An open capture stream.
pub trait MicrophoneStream: Send {
    /// Most recent frame of mono PCM, if one arrived since the last call.
    fn latest_frame(&mut self) -> Option<Vec<i16>>;

    /// Release the processing attached to the stream.
    fn close(&mut self) -> Result<(), MediaError>;

    /// Stop the underlying capture.
    fn stop_tracks(&mut self) -> Result<(), MediaError>;
}

/// Used when the crate is built without the `audio` feature.
pub struct NoMicrophone;

impl MicrophoneSource for NoMicrophone {
    fn open(&self, _: AudioConstraints) -> Result<Box<dyn MicrophoneStream>, MediaError> {
        Err(MediaError::NoDevice)
    }
}

/// The platform microphone, if audio support is compiled in.
pub fn default_source() -> Box<dyn MicrophoneSource> {
    #[cfg(feature = "audio")]
    {
        Box::new(super::audio::CpalMicrophone)
    }
    #[cfg(not(feature = "audio"))]
    {
        Box::new(NoMicrophone)
    }
}

/// RMS of a frame, normalized to 0.0..=1.0.
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum_sq / samples.len() as f64).sqrt() / 32768.0).min(1.0) as f32
}

/// Exponentially smoothed RMS level.
#[derive(Debug, Default, Clone, Copy)]
pub struct VolumeMeter {
    level: f32,
}

impl VolumeMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame, returning the new smoothed level.
    pub fn push(&mut self, samples: &[i16]) -> f32 {
        let current = rms_level(samples);
        self.level = (self.level * SMOOTHING + current * (1.0 - SMOOTHING)).clamp(0.0, 1.0);
        self.level
    }

    pub fn level(&self) -> f32 {
        self.level
    }
}

/// A running meter bound to an open microphone stream.
pub struct VolumeMonitor {
    task: Option<JoinHandle<()>>,
    stream: Arc<Mutex<Box<dyn MicrophoneStream>>>,
    level_rx: watch::Receiver<f32>,
    stopped: bool,
}

impl VolumeMonitor {
    /// Open the microphone and start sampling.
    pub fn start(source: &dyn MicrophoneSource) -> Result<Self, MediaError> {
        let stream = source.open(AudioConstraints::default())?;
        let stream = Arc::new(Mutex::new(stream));
        let (level_tx, level_rx) = watch::channel(0.0f32);

        let sampled = Arc::clone(&stream);
        let task = tokio::spawn(async move {
            let mut meter = VolumeMeter::new();
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                ticker.tick().await;
                let frame = sampled
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .latest_frame();
                if let Some(frame) = frame {
                    level_tx.send_replace(meter.push(&frame));
                }
            }
        });

        tracing::debug!("Volume monitor started");
        Ok(Self {
            task: Some(task),
            stream,
            level_rx,
            stopped: false,
        })
    }

    pub fn level(&self) -> f32 {
        *self.level_rx.borrow()
    }

    /// Cancel sampling, close processing, stop capture. Safe to call twice.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(task) = self.task.take() {
            task.abort();
        }

        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = stream.close() {
            tracing::warn!("Failed to close audio processing: {}", e);
        }
        if let Err(e) = stream.stop_tracks() {
            tracing::warn!("Failed to stop microphone: {}", e);
        }
        tracing::debug!("Volume monitor stopped");
    }
}

impl Drop for VolumeMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
