//! Calling: device registration, one active call, and the status line.
//!
//! [`session::CallSessionManager`] is the core. The CLI flows below drive it
//! from the terminal; the TUI drives the same manager from its event loop.

#[cfg(feature = "audio")]
pub mod audio;
pub mod device;
mod error;
pub mod phone;
pub mod session;
pub mod status;
#[cfg(test)]
pub(crate) mod testing;
pub mod twilio;
pub mod volume;

use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time;

pub use error::{CallError, DeviceError, NOT_CONFIGURED_MESSAGE};
pub use session::CallSessionManager;
pub use status::{Status, StatusKind};

use crate::api::{BackendClient, HttpTokenProvider};
use crate::config::Config;
use volume::{VolumeMonitor, SAMPLE_INTERVAL};

/// Wire the HTTP token provider and the Twilio device into a manager.
pub fn build_manager(config: &Config) -> Result<CallSessionManager> {
    if let Err(problems) = config.validate() {
        bail!(
            "Configuration incomplete: {}. Edit {}",
            problems,
            Config::config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "the config file".to_string())
        );
    }
    let client = BackendClient::new(config);
    let tokens = Arc::new(HttpTokenProvider::new(client, config.token_path.clone()));
    let factory = Arc::new(twilio::TwilioDeviceFactory::new(config.twilio.clone()));
    Ok(CallSessionManager::with_config(
        tokens,
        factory,
        config.calling.session_config(),
    ))
}

/// Render a 0..1 level as a fixed-width bar.
pub fn level_bar(level: f32, width: usize) -> String {
    let filled = ((level.clamp(0.0, 1.0) * width as f32).round() as usize).min(width);
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

/// Place one call and follow it until it ends. Ctrl-C hangs up.
pub async fn run_call(config: &Config, number: &str, meter: bool) -> Result<()> {
    let manager = build_manager(config)?;
    let mut status = manager.subscribe();

    println!("{}", manager.status());
    if let Err(e) = manager.initiate(number).await {
        manager.shutdown();
        bail!("{}", e.user_message());
    }
    if let Some(session) = manager.session() {
        println!("Calling {} (Ctrl-C to hang up)", session.target);
    }
    println!("{}", manager.status());

    let source = volume::default_source();
    let mut monitor: Option<VolumeMonitor> = None;
    let mut ticker = time::interval(SAMPLE_INTERVAL * 3);
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if monitor.is_some() {
                    println!();
                }
                println!("{}", current);

                if current.kind == StatusKind::InCall && meter && monitor.is_none() {
                    match VolumeMonitor::start(source.as_ref()) {
                        Ok(m) => monitor = Some(m),
                        Err(e) => println!("{}", e.user_message()),
                    }
                }
                if current.is_terminal() {
                    if current.kind == StatusKind::Error {
                        outcome = Err(anyhow!("{}", current.message));
                    }
                    break;
                }
            }
            _ = ticker.tick(), if monitor.is_some() => {
                if let Some(ref m) = monitor {
                    print!("\r  mic [{}] ", level_bar(m.level(), 30));
                    let _ = std::io::stdout().flush();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nHanging up...");
                manager.hang_up();
            }
        }
    }

    if let Some(mut m) = monitor.take() {
        m.stop();
    }
    manager.shutdown();
    outcome
}

/// Register and wait for inbound calls until Ctrl-C.
pub async fn run_listen(config: &Config, auto_accept: bool) -> Result<()> {
    let manager = build_manager(config)?;
    let mut status = manager.subscribe();

    println!("Registering device...");
    if let Err(e) = manager.prepare().await {
        manager.shutdown();
        bail!("{}", e.user_message());
    }
    println!(
        "Listening for calls to {} (Ctrl-C to stop)",
        config.twilio.caller_id
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                println!("{}", current);
                if current.kind == StatusKind::Incoming {
                    if auto_accept {
                        if let Err(e) = manager.accept_incoming().await {
                            println!("{}", e.user_message());
                        }
                    } else {
                        println!("  [a]ccept / [r]eject");
                    }
                } else if current.kind == StatusKind::InCall {
                    println!("  [h]ang up");
                }
            }
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => {
                        stdin_open = false;
                        continue;
                    }
                };
                let result = match line.trim() {
                    "a" | "accept" => manager.accept_incoming().await,
                    "r" | "reject" => manager.reject_incoming(),
                    "h" | "hangup" => {
                        manager.hang_up();
                        Ok(())
                    }
                    "" => Ok(()),
                    other => {
                        println!("Unknown command: {}", other);
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    println!("{}", e.user_message());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    manager.shutdown();
    Ok(())
}

/// Report config validity and try one registration.
pub async fn run_status(config: &Config) -> Result<()> {
    let path = Config::config_path()?;
    println!("Config: {}", path.display());
    let problems = config.problems();
    if !problems.is_empty() {
        println!("Configuration incomplete:");
        for problem in &problems {
            println!("  - {}", problem);
        }
        return Ok(());
    }
    println!("Configuration OK");

    let manager = build_manager(config)?;
    println!("Registering device...");
    let result = manager.prepare().await;
    println!("Device: {}", manager.device_state().as_str());
    println!("Status: {}", manager.status());
    manager.shutdown();
    result.map_err(|e| anyhow!("{}", e.user_message()))
}
