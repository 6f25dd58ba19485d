use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "wss://streaming.assemblyai.com/v3/ws";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Empty means let the server pick its default English model.
    #[serde(default)]
    pub language: String,
    #[serde(default = "default_true")]
    pub format_turns: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_termination_timeout_ms")]
    pub termination_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub warm_keepalive_interval_ms: u64,
    #[serde(default = "default_rewarm_delay_ms")]
    pub rewarm_delay_ms: u64,
    #[serde(default = "default_max_rewarm_delay_ms")]
    pub max_rewarm_delay_ms: u64,
    #[serde(default = "default_max_rewarm_attempts")]
    pub max_rewarm_attempts: u32,
    #[serde(default = "default_token_expiry_ms")]
    pub token_expiry_ms: u64,
    #[serde(default = "default_token_refresh_buffer_ms")]
    pub token_refresh_buffer_ms: u64,
    #[serde(default = "default_true")]
    pub record_usage: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            sample_rate: default_sample_rate(),
            language: String::new(),
            format_turns: true,
            connect_timeout_ms: default_connect_timeout_ms(),
            termination_timeout_ms: default_termination_timeout_ms(),
            warm_keepalive_interval_ms: default_keepalive_interval_ms(),
            rewarm_delay_ms: default_rewarm_delay_ms(),
            max_rewarm_delay_ms: default_max_rewarm_delay_ms(),
            max_rewarm_attempts: default_max_rewarm_attempts(),
            token_expiry_ms: default_token_expiry_ms(),
            token_refresh_buffer_ms: default_token_refresh_buffer_ms(),
            record_usage: true,
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.into()
}
fn default_sample_rate() -> u32 {
    16000
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_termination_timeout_ms() -> u64 {
    5_000
}
fn default_keepalive_interval_ms() -> u64 {
    30_000
}
fn default_rewarm_delay_ms() -> u64 {
    2_000
}
fn default_max_rewarm_delay_ms() -> u64 {
    60_000
}
fn default_max_rewarm_attempts() -> u32 {
    5
}
fn default_token_expiry_ms() -> u64 {
    600_000
}
fn default_token_refresh_buffer_ms() -> u64 {
    30_000
}

/// Runtime knobs for [`crate::StreamingManager`], derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub endpoint: String,
    pub default_sample_rate: u32,
    pub default_language: Option<String>,
    pub format_turns: bool,
    pub connect_timeout: Duration,
    pub termination_timeout: Duration,
    pub warm_keepalive_interval: Duration,
    pub rewarm_delay: Duration,
    pub max_rewarm_delay: Duration,
    pub max_rewarm_attempts: u32,
    pub token_expiry_ms: u64,
    pub token_refresh_buffer_ms: u64,
    /// Directory for the session usage log; `None` disables it.
    pub usage_dir: Option<PathBuf>,
}

/// Defaults without a usage log; only settings loaded from disk opt into one.
impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            usage_dir: None,
            ..Settings::default().manager_config()
        }
    }
}

impl Settings {
    pub fn manager_config(&self) -> ManagerConfig {
        let language = self.language.trim();
        ManagerConfig {
            endpoint: self.endpoint.clone(),
            default_sample_rate: self.sample_rate,
            default_language: if language.is_empty() {
                None
            } else {
                Some(language.to_string())
            },
            format_turns: self.format_turns,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            termination_timeout: Duration::from_millis(self.termination_timeout_ms),
            warm_keepalive_interval: Duration::from_millis(self.warm_keepalive_interval_ms.max(1)),
            rewarm_delay: Duration::from_millis(self.rewarm_delay_ms),
            max_rewarm_delay: Duration::from_millis(self.max_rewarm_delay_ms),
            max_rewarm_attempts: self.max_rewarm_attempts,
            token_expiry_ms: self.token_expiry_ms,
            token_refresh_buffer_ms: self.token_refresh_buffer_ms,
            usage_dir: if self.record_usage { data_dir() } else { None },
        }
    }
}

pub fn data_dir() -> Option<PathBuf> {
    if let Some(dir) = dirs::data_local_dir() {
        return Some(dir.join("LiveScribe"));
    }
    if let Some(home) = dirs::home_dir() {
        return Some(home.join(".livescribe"));
    }
    None
}

pub fn settings_path() -> Result<PathBuf, String> {
    data_dir()
        .map(|dir| dir.join("settings.json"))
        .ok_or_else(|| "Failed to resolve data directory".to_string())
}

pub fn load() -> Settings {
    match settings_path() {
        Ok(path) => load_from(&path),
        Err(_) => Settings::default(),
    }
}

/// Missing or unreadable files fall back to defaults; unknown fields are ignored.
pub fn load_from(path: &Path) -> Settings {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            log::warn!("[settings] invalid {}: {}", path.display(), e);
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

pub fn save(settings: &Settings) -> Result<(), String> {
    save_to(&settings_path()?, settings)
}

pub fn save_to(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))?;
    Ok(())
}
