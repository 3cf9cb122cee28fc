use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::{
    error::ChatError,
    layout::{MasonryLayout, DEFAULT_SPACING},
};

pub const DEFAULT_FALLBACK_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 30_000;
const SETTINGS_FILE: &str = "client.toml";
const REALTIME_PATH: &str = "/realtime";

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub api_url: String,
    pub realtime_url: Option<String>,
    pub auth_token: Option<String>,
    pub fallback_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub masonry_column_width: f32,
    pub masonry_spacing: f32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:3000/api".into(),
            realtime_url: None,
            auth_token: None,
            fallback_timeout_ms: DEFAULT_FALLBACK_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            masonry_column_width: 180.0,
            masonry_spacing: DEFAULT_SPACING,
        }
    }
}

impl ClientSettings {
    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn masonry_layout(&self) -> MasonryLayout {
        MasonryLayout::new(self.masonry_column_width, self.masonry_spacing)
    }

    pub fn api_base_url(&self) -> String {
        self.api_url.trim().trim_end_matches('/').to_string()
    }

    /// Explicit real-time URL, or one derived from the API URL.
    pub fn resolved_realtime_url(&self) -> Result<String, ChatError> {
        if let Some(url) = self.realtime_url.as_deref().map(str::trim) {
            if !url.is_empty() {
                return Ok(url.to_string());
            }
        }
        derive_realtime_url(&self.api_url)
    }
}

pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        apply_file_overrides(&mut settings, &raw);
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());

    settings
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    match fs::read_to_string(path) {
        Ok(raw) => apply_file_overrides(&mut settings, &raw),
        Err(err) => warn!("config: unable to read {}: {err}", path.display()),
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());

    settings
}

fn apply_file_overrides(settings: &mut ClientSettings, raw: &str) {
    // Scalars may be written bare or quoted.
    let parsed = toml::from_str::<HashMap<String, toml::Value>>(raw);
    let file_cfg: HashMap<String, String> = match parsed {
        Ok(table) => table
            .into_iter()
            .map(|(key, value)| match value {
                toml::Value::String(value) => (key, value),
                other => (key, other.to_string()),
            })
            .collect(),
        Err(err) => {
            warn!("config: ignoring malformed {SETTINGS_FILE}: {err}");
            return;
        }
    };

    if let Some(v) = file_cfg.get("api_url") {
        settings.api_url = v.clone();
    }
    if let Some(v) = file_cfg.get("realtime_url") {
        settings.realtime_url = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("auth_token") {
        settings.auth_token = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("fallback_timeout_ms").and_then(|v| v.parse().ok()) {
        settings.fallback_timeout_ms = v;
    }
    if let Some(v) = file_cfg.get("send_timeout_ms").and_then(|v| v.parse().ok()) {
        settings.send_timeout_ms = v;
    }
    if let Some(v) = file_cfg.get("reconnect_delay_ms").and_then(|v| v.parse().ok()) {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = file_cfg
        .get("masonry_column_width")
        .and_then(|v| v.parse().ok())
    {
        settings.masonry_column_width = v;
    }
    if let Some(v) = file_cfg.get("masonry_spacing").and_then(|v| v.parse().ok()) {
        settings.masonry_spacing = v;
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = var("APP__API_URL") {
        settings.api_url = v;
    }

    if let Some(v) = var("CHAT_REALTIME_URL") {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = var("APP__REALTIME_URL") {
        settings.realtime_url = Some(v);
    }

    if let Some(v) = var("CHAT_AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }
    if let Some(v) = var("APP__AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }

    if let Some(v) = var("APP__FALLBACK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.fallback_timeout_ms = v;
    }
    if let Some(v) = var("APP__SEND_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.send_timeout_ms = v;
    }
    if let Some(v) = var("APP__RECONNECT_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = var("APP__MASONRY_COLUMN_WIDTH").and_then(|v| v.parse().ok()) {
        settings.masonry_column_width = v;
    }
    if let Some(v) = var("APP__MASONRY_SPACING").and_then(|v| v.parse().ok()) {
        settings.masonry_spacing = v;
    }
}

fn derive_realtime_url(api_url: &str) -> Result<String, ChatError> {
    let api_url = api_url.trim();
    let ws_url = if api_url.starts_with("https://") {
        api_url.replacen("https://", "wss://", 1)
    } else if api_url.starts_with("http://") {
        api_url.replacen("http://", "ws://", 1)
    } else {
        return Err(ChatError::InvalidUrl {
            url: api_url.to_string(),
            reason: "api_url must start with http:// or https://".into(),
        });
    };

    let mut url = url::Url::parse(&ws_url).map_err(|err| ChatError::InvalidUrl {
        url: ws_url.clone(),
        reason: err.to_string(),
    })?;
    url.set_path(REALTIME_PATH);
    url.set_query(None);
    Ok(url.to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
