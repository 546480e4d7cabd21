//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calling::session::SessionConfig;

pub const DEFAULT_TOKEN_PATH: &str = "/api/twilio/token";
pub const DEFAULT_SMS_PATH: &str = "/api/twilio/sms";
pub const DEFAULT_TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// CRM backend origin, e.g. `https://crm.example.com`
    pub api_base_url: String,
    /// Bearer token for the CRM backend
    pub api_token: String,
    /// Path of the calling token endpoint
    pub token_path: String,
    /// Path of the SMS endpoint
    pub sms_path: String,
    pub calling: CallingConfig,
    pub twilio: TwilioConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            api_token: String::new(),
            token_path: DEFAULT_TOKEN_PATH.to_string(),
            sms_path: DEFAULT_SMS_PATH.to_string(),
            calling: CallingConfig::default(),
            twilio: TwilioConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallingConfig {
    pub registration_timeout_secs: u64,
    pub error_display_secs: u64,
}

impl Default for CallingConfig {
    fn default() -> Self {
        Self {
            registration_timeout_secs: 10,
            error_display_secs: 10,
        }
    }
}

impl CallingConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            registration_timeout: Duration::from_secs(self.registration_timeout_secs),
            error_display: Duration::from_secs(self.error_display_secs),
        }
    }
}

/// Credentials for the Twilio REST device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Number outbound calls are placed from, and inbound calls ring on
    pub caller_id: String,
    /// TwiML URL that bridges answered calls
    pub answer_url: String,
    pub poll_interval_ms: u64,
    pub api_base: String,
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            caller_id: String::new(),
            answer_url: String::new(),
            poll_interval_ms: 1000,
            api_base: DEFAULT_TWILIO_API_BASE.to_string(),
        }
    }
}

impl TwilioConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.account_sid.is_empty() {
            problems.push("twilio.account_sid is required".to_string());
        } else if !self.account_sid.starts_with("AC") {
            problems.push("twilio.account_sid must start with AC".to_string());
        }
        if self.auth_token.is_empty() {
            problems.push("twilio.auth_token is required".to_string());
        }
        if self.caller_id.is_empty() {
            problems.push("twilio.caller_id is required".to_string());
        } else if crate::calling::phone::normalize(&self.caller_id).is_none() {
            problems.push("twilio.caller_id is not a valid phone number".to_string());
        }
        if self.answer_url.is_empty() {
            problems.push("twilio.answer_url is required".to_string());
        }
        problems
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "outreach-dialer", "outreach-dialer")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Contains the backend token and Twilio auth token
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Every missing or malformed setting, in file order.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.api_base_url.is_empty() {
            problems.push("api_base_url is required".to_string());
        } else if url::Url::parse(&self.api_base_url).is_err() {
            problems.push("api_base_url is not a valid URL".to_string());
        }
        if self.api_token.is_empty() {
            problems.push("api_token is required".to_string());
        }
        if !self.token_path.starts_with('/') {
            problems.push("token_path must start with /".to_string());
        }
        if !self.sms_path.starts_with('/') {
            problems.push("sms_path must start with /".to_string());
        }
        if self.calling.registration_timeout_secs == 0 {
            problems.push("calling.registration_timeout_secs must be positive".to_string());
        }
        problems.extend(self.twilio.problems());
        problems
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }

    /// Backend URL for `path`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }
}
