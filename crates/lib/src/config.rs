//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.wabridge/config.json`) and environment.
//! Relative directories are resolved against the config file's parent.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Exchange mailbox location and timing.
    #[serde(default)]
    pub mailbox: MailboxConfig,

    /// Credential store and pairing settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Reconnect backoff after transient disconnects.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Evolution API server that wraps the WhatsApp Web client.
    #[serde(default)]
    pub evolution: EvolutionConfig,

    /// Local HTTP server for webhooks and health.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Mailbox slots shared with the external decision process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxConfig {
    /// Directory holding both slots. Default: `mailbox` next to the config file.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Request slot file name (default "wa_in.json").
    #[serde(default = "default_request_file")]
    pub request_file: String,

    /// Reply slot file name (default "wa_out.json").
    #[serde(default = "default_reply_file")]
    pub reply_file: String,

    /// How often the reply slot is checked, in milliseconds (default 400).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up on a reply after this many seconds; 0 waits forever (default 120).
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,

    /// Inbound messages that may wait behind the pending exchange (default 16).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_request_file() -> String {
    "wa_in.json".to_string()
}

fn default_reply_file() -> String {
    "wa_out.json".to_string()
}

fn default_poll_interval_ms() -> u64 {
    400
}

fn default_reply_timeout_secs() -> u64 {
    120
}

fn default_queue_capacity() -> usize {
    16
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            directory: None,
            request_file: default_request_file(),
            reply_file: default_reply_file(),
            poll_interval_ms: default_poll_interval_ms(),
            reply_timeout_secs: default_reply_timeout_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl MailboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// `None` when the timeout is disabled (0).
    pub fn reply_timeout(&self) -> Option<Duration> {
        if self.reply_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.reply_timeout_secs))
        }
    }
}

/// Credential store directory and optional pairing phone number.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Directory for the persisted credential bundle. Default: `session` next to the config file.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Phone number (international format, digits only) used to request a pairing code instead of QR.
    #[serde(default)]
    pub phone_number: Option<String>,
}

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Stop reconnecting after this many consecutive failures. Unlimited when absent.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

/// Evolution API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionConfig {
    /// Base URL (default "http://127.0.0.1:8085").
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Global API key. Overridden by EVOLUTION_API_KEY env.
    pub api_key: Option<String>,

    /// Instance name (default "wabridge").
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// URL the Evolution server posts webhooks to. Defaults to this bridge's server as seen from a container.
    pub webhook_url: Option<String>,
}

fn default_api_url() -> String {
    "http://127.0.0.1:8085".to_string()
}

fn default_instance_name() -> String {
    "wabridge".to_string()
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            instance_name: default_instance_name(),
            webhook_url: None,
        }
    }
}

/// Webhook + health server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port (default 8086).
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_server_bind")]
    pub bind: String,
}

fn default_server_port() -> u16 {
    8086
}

fn default_server_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind: default_server_bind(),
        }
    }
}

/// Resolve the Evolution API key: env EVOLUTION_API_KEY overrides config.
pub fn resolve_evolution_api_key(config: &Config) -> Option<String> {
    std::env::var("EVOLUTION_API_KEY")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .evolution
                .api_key
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Webhook URL registered with the Evolution instance.
pub fn resolve_webhook_url(config: &Config) -> String {
    config
        .evolution
        .webhook_url
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            format!(
                "http://host.docker.internal:{}/webhook/whatsapp",
                config.server.port
            )
        })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("WABRIDGE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".wabridge").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used (for resolving relative directories).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn resolve_dir(configured: Option<&PathBuf>, config_path: &Path, default_name: &str) -> PathBuf {
    let parent = config_parent(config_path);
    match configured {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                parent.join(d)
            }
        }
        _ => parent.join(default_name),
    }
}

/// Mailbox directory: `mailbox.directory` if set, otherwise `mailbox` next to the config file.
pub fn resolve_mailbox_dir(config: &Config, config_path: &Path) -> PathBuf {
    resolve_dir(config.mailbox.directory.as_ref(), config_path, "mailbox")
}

/// Credential store directory: `session.directory` if set, otherwise `session` next to the config file.
pub fn resolve_session_dir(config: &Config, config_path: &Path) -> PathBuf {
    resolve_dir(config.session.directory.as_ref(), config_path, "session")
}
