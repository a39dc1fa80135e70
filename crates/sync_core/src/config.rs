use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::error::SyncError;

const DEFAULT_SETTINGS_FILE: &str = "sync.toml";
const ENV_PREFIX: &str = "SYNC__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub server_url: String,
    pub ws_path: String,
    pub bearer_token: Option<String>,
    pub typing_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub channel_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000/api".into(),
            ws_path: "/ws".into(),
            bearer_token: None,
            typing_timeout_ms: 3_000,
            send_timeout_ms: 10_000,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            channel_buffer: 256,
        }
    }
}

impl SyncSettings {
    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_initial_delay_ms))
    }

    /// Applies `SYNC__*` overrides; unparsable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("WS_PATH") {
            self.ws_path = v;
        }
        if let Some(v) = var("BEARER_TOKEN") {
            self.bearer_token = (!v.trim().is_empty()).then_some(v);
        }
        if let Some(v) = var("TYPING_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.typing_timeout_ms = v;
        }
        if let Some(v) = var("SEND_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.send_timeout_ms = v;
        }
        if let Some(v) = var("RECONNECT_INITIAL_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.reconnect_initial_delay_ms = v;
        }
        if let Some(v) = var("RECONNECT_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.reconnect_max_delay_ms = v;
        }
        if let Some(v) = var("CHANNEL_BUFFER").and_then(|v| v.parse().ok()) {
            self.channel_buffer = v;
        }
    }

    fn validate(self) -> Result<Self, SyncError> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(SyncError::Config(
                "server_url must start with http:// or https://".into(),
            ));
        }
        if self.channel_buffer == 0 {
            return Err(SyncError::Config("channel_buffer must be positive".into()));
        }
        Ok(self)
    }
}

/// Defaults, then `sync.toml` in the working directory, then the environment.
pub fn load_settings() -> Result<SyncSettings, SyncError> {
    let path = Path::new(DEFAULT_SETTINGS_FILE);
    let mut settings = if path.exists() {
        parse_settings_file(path)?
    } else {
        SyncSettings::default()
    };
    settings.apply_overrides(|key| std::env::var(key).ok());
    settings.validate()
}

pub fn load_settings_from(path: &Path) -> Result<SyncSettings, SyncError> {
    let mut settings = parse_settings_file(path)?;
    settings.apply_overrides(|key| std::env::var(key).ok());
    settings.validate()
}

fn parse_settings_file(path: &Path) -> Result<SyncSettings, SyncError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        SyncError::Config(format!("failed to read '{}': {err}", path.display()))
    })?;
    toml::from_str(&raw)
        .map_err(|err| SyncError::Config(format!("failed to parse '{}': {err}", path.display())))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
