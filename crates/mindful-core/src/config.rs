use std::time::Duration;

use crate::errors::CallError;
use crate::transport::PublishPreset;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
pub const DEFAULT_SERVER_ADDRESS: &str = "wss://mindfull-4wx7pfsc.livekit.cloud";

const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 20;

/// Everything a call controller needs to know about its environment.
///
/// The breathing/voice screens run audio-only; the general video-call variant
/// flips `video_enabled`. Both go through the same controller.
#[derive(Clone, Debug, PartialEq)]
pub struct CallConfig {
    pub backend_url: String,
    pub server_address: String,
    pub video_enabled: bool,
    pub acquire_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            video_enabled: false,
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl CallConfig {
    /// Build from process environment, falling back to defaults.
    ///
    /// Reads `MINDFUL_BACKEND_URL`, `LIVEKIT_WS_URL` and `MINDFUL_VIDEO_ENABLED`.
    pub fn from_env() -> Result<Self, CallError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CallError> {
        let mut config = Self::default();
        if let Some(url) = lookup("MINDFUL_BACKEND_URL") {
            config.backend_url = url;
        }
        if let Some(addr) = lookup("LIVEKIT_WS_URL") {
            config.server_address = addr;
        }
        if let Some(flag) = lookup("MINDFUL_VIDEO_ENABLED") {
            config.video_enabled = parse_flag(&flag).ok_or_else(|| {
                CallError::InvalidInput(format!("MINDFUL_VIDEO_ENABLED: expected a boolean, got '{flag}'"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if self.backend_url.trim().is_empty() {
            return Err(CallError::InvalidInput("backend_url is empty".into()));
        }
        if self.server_address.trim().is_empty() {
            return Err(CallError::InvalidInput("server_address is empty".into()));
        }
        if self.acquire_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(CallError::InvalidInput("timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn preset(&self) -> PublishPreset {
        if self.video_enabled {
            PublishPreset::AudioVideo
        } else {
            PublishPreset::AudioOnly
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
