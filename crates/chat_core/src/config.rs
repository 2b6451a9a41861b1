use std::{fs, path::Path};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "chat.toml";
const REALTIME_PATH: &str = "/ws/chat/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSettings {
    pub api_base_url: String,
    /// Explicit WebSocket URL; derived from `api_base_url` when unset.
    pub realtime_url: Option<String>,
    pub realtime_enabled: bool,
    pub request_timeout_secs: u64,
    pub event_buffer: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api".into(),
            realtime_url: None,
            realtime_enabled: true,
            request_timeout_secs: 30,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    realtime_url: Option<String>,
    realtime_enabled: Option<bool>,
    request_timeout_secs: Option<u64>,
    event_buffer: Option<usize>,
}

impl ChatSettings {
    pub fn realtime_endpoint(&self) -> anyhow::Result<String> {
        if let Some(url) = &self.realtime_url {
            return Ok(url.clone());
        }

        let mut url = Url::parse(&self.api_base_url)
            .with_context(|| format!("invalid api base url: {}", self.api_base_url))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(anyhow!("api base url must be http or https, got {other}")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from {}", self.api_base_url))?;
        url.set_path(REALTIME_PATH);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url.to_string())
    }
}

pub fn load_settings() -> ChatSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| {
        std::env::var(key).ok()
    })
}

/// Defaults, then the toml file at `path` if readable, then environment
/// overrides looked up through `env`.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> ChatSettings {
    let mut settings = ChatSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => tracing::warn!(
                path = %path.display(),
                "config: ignoring unparsable settings file: {err}"
            ),
        }
    }

    if let Some(v) = env("CHAT_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = env("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = env("CHAT_REALTIME_URL") {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = env("APP__REALTIME_URL") {
        settings.realtime_url = Some(v);
    }

    if let Some(v) = env("APP__REALTIME_ENABLED") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.realtime_enabled = parsed;
        }
    }

    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = parsed;
        }
    }

    if let Some(v) = env("APP__EVENT_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_buffer = parsed.max(1);
        }
    }

    settings
}

fn apply_file(settings: &mut ChatSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.api_base_url {
        settings.api_base_url = v;
    }
    if let Some(v) = file_cfg.realtime_url {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = file_cfg.realtime_enabled {
        settings.realtime_enabled = v;
    }
    if let Some(v) = file_cfg.request_timeout_secs {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = file_cfg.event_buffer {
        settings.event_buffer = v.max(1);
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
