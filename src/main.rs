//! Outreach dialer - terminal softphone for CRM sales reps
//!
//! Places and receives calls through Twilio and sends one-off SMS.

mod api;
mod calling;
mod config;
mod tui;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use tui::log_capture::LogBuffer;

#[derive(Parser)]
#[command(name = "dialer")]
#[command(about = "Terminal softphone for outreach calls and SMS", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call and follow it until it ends (Ctrl-C hangs up)
    Call {
        /// Phone number, E.164 or 10-digit US
        number: String,

        /// Show the microphone level while the call is up
        #[arg(long)]
        meter: bool,
    },

    /// Wait for incoming calls
    Listen {
        /// Answer every incoming call without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// Send an SMS
    Sms {
        /// Recipient phone number
        #[arg(short, long)]
        to: String,

        /// Message text
        body: String,
    },

    /// Print the E.164 form of a phone number
    Normalize {
        number: String,
    },

    /// Check configuration and try a device registration
    Status,

    /// Show the config file location, or write a default one
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Show a live microphone level meter for 3 seconds
    #[cfg(feature = "audio")]
    MicTest,

    /// Launch the terminal user interface
    Tui,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file if none exists
    Init,
}

/// Route tracing output to stderr, or to the TUI log pane when `capture` is set.
fn init_logging(verbose: bool, capture: Option<LogBuffer>) {
    let filter = if verbose { "debug" } else { "info" };
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
    );
    match capture {
        Some(logs) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(logs),
            )
            .init(),
        None => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs must not corrupt the alternate screen in TUI mode.
    let tui_logs = matches!(cli.command, Commands::Tui).then(LogBuffer::new);
    init_logging(cli.verbose, tui_logs.clone());

    match cli.command {
        Commands::Call { number, meter } => {
            let config = Config::load()?;
            calling::run_call(&config, &number, meter).await?;
        }
        Commands::Listen { auto_accept } => {
            let config = Config::load()?;
            calling::run_listen(&config, auto_accept).await?;
        }
        Commands::Sms { to, body } => {
            let config = Config::load()?;
            if let Err(problems) = config.validate() {
                bail!("Configuration incomplete: {}", problems);
            }
            let client = api::BackendClient::new(&config);
            let receipt = api::send_sms(&client, &config.sms_path, &to, &body).await?;
            println!("SMS {}", receipt.status);
        }
        Commands::Normalize { number } => match calling::phone::normalize(&number) {
            Some(e164) => println!("{}", e164),
            None => bail!("{}", calling::CallError::InvalidNumber),
        },
        Commands::Status => {
            let config = Config::load()?;
            calling::run_status(&config).await?;
        }
        Commands::Config { action } => {
            let path = Config::config_path()?;
            match action {
                Some(ConfigAction::Init) => {
                    if path.exists() {
                        println!("Config already exists: {}", path.display());
                    } else {
                        Config::default().save()?;
                        println!("Wrote default config to {}", path.display());
                    }
                }
                None => {
                    println!("Config: {}", path.display());
                    match Config::load()?.validate() {
                        Ok(()) => println!("Configuration OK"),
                        Err(problems) => println!("Configuration incomplete: {}", problems),
                    }
                }
            }
        }
        #[cfg(feature = "audio")]
        Commands::MicTest => {
            calling::audio::mic_test()?;
        }
        Commands::Tui => {
            let config = Config::load()?;
            tui::run(config, tui_logs.unwrap_or_default()).await?;
        }
    }

    Ok(())
}
