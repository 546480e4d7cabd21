//! Microphone capture with cpal.
//!
//! The cpal stream is not `Send`, so it lives on a dedicated OS thread that
//! parks until the keep-alive sender is dropped. The input callback keeps only
//! the most recent 20 ms frame; the volume meter never needs more than that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};

use super::volume::{AudioConstraints, MediaError, MicrophoneSource, MicrophoneStream, VolumeMeter};

/// Frame length the callback slices capture into.
const FRAME_MS: usize = 20;

/// How long `open` waits for the capture thread to report in.
const START_TIMEOUT: Duration = Duration::from_secs(2);

type LatestFrame = Arc<Mutex<Option<Vec<i16>>>>;

/// The default input device of the default cpal host.
pub struct CpalMicrophone;

impl MicrophoneSource for CpalMicrophone {
    fn open(&self, constraints: AudioConstraints) -> Result<Box<dyn MicrophoneStream>, MediaError> {
        // cpal exposes raw capture only; platform processing is outside its reach.
        tracing::debug!(
            "Opening microphone (echo_cancellation={}, noise_suppression={})",
            constraints.echo_cancellation,
            constraints.noise_suppression
        );

        let latest: LatestFrame = Arc::new(Mutex::new(None));
        let processing = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), MediaError>>();
        let (keep_tx, keep_rx) = mpsc::channel::<()>();

        let slot = Arc::clone(&latest);
        let active = Arc::clone(&processing);
        thread::spawn(move || {
            let stream = match build_capture(slot, active) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            // Park; the stream stays alive until keep_rx's sender is dropped.
            let _ = keep_rx.recv();
            drop(stream);
            tracing::debug!("Microphone capture thread exiting");
        });

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                latest,
                processing,
                keep_alive: Some(keep_tx),
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MediaError::Stream(
                "microphone did not start in time".to_string(),
            )),
        }
    }
}

struct CpalStream {
    latest: LatestFrame,
    processing: Arc<AtomicBool>,
    keep_alive: Option<mpsc::Sender<()>>,
}

impl MicrophoneStream for CpalStream {
    fn latest_frame(&mut self) -> Option<Vec<i16>> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn close(&mut self) -> Result<(), MediaError> {
        self.processing.store(false, Ordering::SeqCst);
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    fn stop_tracks(&mut self) -> Result<(), MediaError> {
        // Dropping the sender wakes the capture thread, which drops the stream.
        self.keep_alive.take();
        Ok(())
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.processing.store(false, Ordering::SeqCst);
        self.keep_alive.take();
    }
}

fn build_capture(
    latest: LatestFrame,
    processing: Arc<AtomicBool>,
) -> Result<cpal::Stream, MediaError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(MediaError::NoDevice)?;
    let name = device.name().unwrap_or_else(|_| "unknown".into());
    tracing::info!("Audio input device: {}", name);

    let (config, format) = pick_config(&device)
        .ok_or_else(|| MediaError::Stream(format!("no usable input config for {}", name)))?;
    let stream = match format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, latest, processing)?,
        _ => build_stream::<i16>(&device, &config, latest, processing)?,
    };

    stream.play().map_err(|e| classify(&e.to_string()))?;
    tracing::info!(
        "Microphone capture started ({}Hz, {}ch, {:?})",
        config.sample_rate.0,
        config.channels,
        format
    );
    Ok(stream)
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    latest: LatestFrame,
    processing: Arc<AtomicBool>,
) -> Result<cpal::Stream, MediaError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let frame_len = (config.sample_rate.0 as usize * FRAME_MS) / 1000;
    let channels = config.channels.max(1) as usize;
    let mut acc: Vec<i16> = Vec::with_capacity(frame_len * 2);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !processing.load(Ordering::Relaxed) {
                    return;
                }
                // First channel only.
                acc.extend(data.iter().step_by(channels).map(|s| s.to_sample::<i16>()));
                while acc.len() >= frame_len {
                    let frame: Vec<i16> = acc.drain(..frame_len).collect();
                    *latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
                }
            },
            |err| tracing::warn!("Audio input stream error: {}", err),
            None,
        )
        .map_err(map_build_error)
}

fn map_build_error(err: BuildStreamError) -> MediaError {
    match err {
        BuildStreamError::DeviceNotAvailable => MediaError::NoDevice,
        other => classify(&other.to_string()),
    }
}

/// Backends report permission problems only as text.
fn classify(message: &str) -> MediaError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        MediaError::PermissionDenied
    } else {
        MediaError::Stream(message.to_string())
    }
}

/// Prefer i16 then f32, mono if offered, at the device's default rate.
fn pick_config(device: &Device) -> Option<(StreamConfig, SampleFormat)> {
    let configs: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_input_configs().ok()?.collect();

    let chosen = [SampleFormat::I16, SampleFormat::F32]
        .iter()
        .find_map(|format| {
            let mut matching = configs.iter().filter(|c| c.sample_format() == *format);
            let first = matching.clone().next()?;
            Some(matching.find(|c| c.channels() == 1).unwrap_or(first))
        })?;

    let rate = device
        .default_input_config()
        .map(|c| c.sample_rate())
        .ok()
        .filter(|r| *r >= chosen.min_sample_rate() && *r <= chosen.max_sample_rate())
        .unwrap_or_else(|| chosen.max_sample_rate());

    let config = chosen.clone().with_sample_rate(rate);
    let format = config.sample_format();
    Some((config.into(), format))
}

/// Show a live input meter for three seconds.
pub fn mic_test() -> anyhow::Result<()> {
    use std::io::Write;

    println!("=== Microphone Test ===");
    println!("Speak now, sampling for 3 seconds.\n");

    let mut stream = CpalMicrophone
        .open(AudioConstraints::default())
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    let mut meter = VolumeMeter::new();
    let mut peak = 0.0f32;
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(3) {
        if let Some(frame) = stream.latest_frame() {
            let level = meter.push(&frame);
            peak = peak.max(level);
            let bar_len = (level * 30.0).round().clamp(0.0, 30.0) as usize;
            print!(
                "\r  [{}{}] {:4.0}% ",
                "█".repeat(bar_len),
                "░".repeat(30 - bar_len),
                level * 100.0
            );
            let _ = std::io::stdout().flush();
        }
        thread::sleep(super::volume::SAMPLE_INTERVAL);
    }

    if let Err(e) = stream.close() {
        tracing::warn!("Failed to close audio processing: {}", e);
    }
    if let Err(e) = stream.stop_tracks() {
        tracing::warn!("Failed to stop microphone: {}", e);
    }

    println!("\n\nPeak level: {:.0}%", peak * 100.0);
    if peak < 0.01 {
        println!("No input detected. Check that the microphone is not muted.");
    }
    Ok(())
}
