// =============================================================================
// Runtime Configuration: feed endpoints, credentials and tunables
// =============================================================================
//
// Loaded from an optional JSON file, then overridden from the environment
// (`.env` is read by main before this runs).  All fields carry serde
// defaults so that an older or partial file still loads.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::stream::supervisor::SessionSettings;

/// Longest symbol accepted into a subscribe frame.
pub const MAX_SYMBOL_LEN: usize = 48;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BBCA".to_string(),
        "BBRI".to_string(),
        "BMRI".to_string(),
        "TLKM".to_string(),
        "ASII".to_string(),
    ]
}

fn default_fetch_delay_ms() -> u64 {
    400
}

fn default_http_timeout_secs() -> u64 {
    20
}

fn default_reconnect_backoff_secs() -> u64 {
    5
}

fn default_live_keepalive_secs() -> u64 {
    10
}

fn default_orderbook_keepalive_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    5
}

fn default_handshake_attempts() -> u32 {
    3
}

fn default_max_symbols_per_subscribe() -> usize {
    20
}

fn default_notify_throttle_ms() -> u64 {
    250
}

fn default_history_lookback_days() -> i64 {
    730
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Endpoints & identity ------------------------------------------------

    /// REST base URL, e.g. `https://feed.example.com`.
    #[serde(default)]
    pub host: String,

    /// User id sent in the handshake and subscribe frames.
    #[serde(default)]
    pub username: String,

    /// Persistent socket URL (`wss://...`).
    #[serde(default)]
    pub socket_url: String,

    /// Symbols subscribed on the live-quote connection.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Fetch worker --------------------------------------------------------

    /// Fixed pause between two fetch tasks (global rate limit).
    #[serde(default = "default_fetch_delay_ms")]
    pub fetch_delay_ms: u64,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// How far back a cold candle fetch reaches when nothing is preloaded.
    #[serde(default = "default_history_lookback_days")]
    pub history_lookback_days: i64,

    // --- Streaming -----------------------------------------------------------

    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,

    #[serde(default = "default_live_keepalive_secs")]
    pub live_keepalive_secs: u64,

    #[serde(default = "default_orderbook_keepalive_secs")]
    pub orderbook_keepalive_secs: u64,

    /// How long to wait for the handshake acknowledgement before re-sending.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_handshake_attempts")]
    pub handshake_attempts: u32,

    #[serde(default = "default_max_symbols_per_subscribe")]
    pub max_symbols_per_subscribe: usize,

    /// Minimum gap between two tick-driven host notifications.
    #[serde(default = "default_notify_throttle_ms")]
    pub notify_throttle_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            socket_url: String::new(),
            symbols: default_symbols(),
            fetch_delay_ms: default_fetch_delay_ms(),
            http_timeout_secs: default_http_timeout_secs(),
            history_lookback_days: default_history_lookback_days(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            live_keepalive_secs: default_live_keepalive_secs(),
            orderbook_keepalive_secs: default_orderbook_keepalive_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            handshake_attempts: default_handshake_attempts(),
            max_symbols_per_subscribe: default_max_symbols_per_subscribe(),
            notify_throttle_ms: default_notify_throttle_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration with an atomic write (tmp file + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `PLUGIN_HOST`, `PLUGIN_USERNAME`, `PLUGIN_SOCKET` and
    /// `VALKYRIE_SYMBOLS` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("PLUGIN_HOST").filter(|v| !v.trim().is_empty()) {
            self.host = host.trim().trim_end_matches('/').to_string();
        }
        if let Some(user) = lookup("PLUGIN_USERNAME").filter(|v| !v.trim().is_empty()) {
            self.username = user.trim().to_string();
        }
        if let Some(socket) = lookup("PLUGIN_SOCKET").filter(|v| !v.trim().is_empty()) {
            self.socket_url = socket.trim().to_string();
        }
        if let Some(syms) = lookup("VALKYRIE_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            anyhow::bail!("host is not configured (set PLUGIN_HOST)");
        }
        if self.socket_url.is_empty() {
            anyhow::bail!("socket url is not configured (set PLUGIN_SOCKET)");
        }
        if self.max_symbols_per_subscribe == 0 {
            anyhow::bail!("max_symbols_per_subscribe must be at least 1");
        }
        Ok(())
    }

    pub fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_delay_ms)
    }

    pub fn notify_throttle(&self) -> Duration {
        Duration::from_millis(self.notify_throttle_ms)
    }

    /// Session settings for the live-quote connection.
    pub fn live_session(&self) -> SessionSettings {
        SessionSettings {
            name: "livequote",
            url: self.socket_url.clone(),
            user_id: self.username.clone(),
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
            keepalive_interval: Duration::from_secs(self.live_keepalive_secs),
            keepalive_message: "ping".to_string(),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            handshake_attempts: self.handshake_attempts.max(1),
        }
    }

    /// Session settings for the order-book connection.
    pub fn orderbook_session(&self) -> SessionSettings {
        SessionSettings {
            name: "orderbook",
            keepalive_interval: Duration::from_secs(self.orderbook_keepalive_secs),
            keepalive_message: "PING".to_string(),
            ..self.live_session()
        }
    }
}
