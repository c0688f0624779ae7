use std::{fs, path::Path, time::Duration};

use display_core::{AnimationTiming, ReconnectPolicy, SessionConfig, SignalOrderingKind};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "display.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_url: String,
    pub match_id: Option<i64>,
    pub grid_columns: usize,
    pub refetch_debounce_ms: u64,
    pub fade_ms: u64,
    pub restore_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub snapshot_retry_attempts: u32,
    pub snapshot_retry_delay_ms: u64,
    pub resync_on_reconnect: bool,
    pub signal_ordering: SignalOrderingKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            match_id: None,
            grid_columns: 10,
            refetch_debounce_ms: 300,
            fade_ms: 1000,
            restore_ms: 1000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 10_000,
            snapshot_retry_attempts: 3,
            snapshot_retry_delay_ms: 1000,
            resync_on_reconnect: true,
            signal_ordering: SignalOrderingKind::Arrival,
        }
    }
}

const KEYS: [&str; 12] = [
    "server_url",
    "match_id",
    "grid_columns",
    "refetch_debounce_ms",
    "fade_ms",
    "restore_ms",
    "reconnect_initial_ms",
    "reconnect_max_ms",
    "snapshot_retry_attempts",
    "snapshot_retry_delay_ms",
    "resync_on_reconnect",
    "signal_ordering",
];

/// Defaults, then the TOML file at `path` if it exists, then `APP__<KEY>`
/// variables looked up through `env`.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<toml::Table>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    settings.set(&key, &value);
                }
            }
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable file: {err}"),
        }
    }

    for key in KEYS {
        if let Some(value) = env(&format!("APP__{}", key.to_ascii_uppercase())) {
            settings.set(key, &value);
        }
    }

    settings
}

impl Settings {
    fn set(&mut self, key: &str, value: &str) {
        let value = value.trim();
        let applied = match key {
            "server_url" => {
                self.server_url = value.to_string();
                true
            }
            "match_id" => parse_into(value, |v| self.match_id = Some(v)),
            "grid_columns" => parse_into(value, |v| self.grid_columns = v),
            "refetch_debounce_ms" => parse_into(value, |v| self.refetch_debounce_ms = v),
            "fade_ms" => parse_into(value, |v| self.fade_ms = v),
            "restore_ms" => parse_into(value, |v| self.restore_ms = v),
            "reconnect_initial_ms" => parse_into(value, |v| self.reconnect_initial_ms = v),
            "reconnect_max_ms" => parse_into(value, |v| self.reconnect_max_ms = v),
            "snapshot_retry_attempts" => parse_into(value, |v| self.snapshot_retry_attempts = v),
            "snapshot_retry_delay_ms" => parse_into(value, |v| self.snapshot_retry_delay_ms = v),
            "resync_on_reconnect" => parse_into(value, |v| self.resync_on_reconnect = v),
            "signal_ordering" => parse_into(value, |v| self.signal_ordering = v),
            _ => {
                warn!(key, "config: unknown setting");
                return;
            }
        };
        if !applied {
            warn!(key, value, "config: ignoring invalid value");
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let initial = Duration::from_millis(self.reconnect_initial_ms);
        SessionConfig {
            refetch_debounce: Duration::from_millis(self.refetch_debounce_ms),
            animation: AnimationTiming {
                fade: Duration::from_millis(self.fade_ms),
                restore: Duration::from_millis(self.restore_ms),
            },
            reconnect: ReconnectPolicy {
                initial,
                max: Duration::from_millis(self.reconnect_max_ms).max(initial),
            },
            snapshot_retry_attempts: self.snapshot_retry_attempts,
            snapshot_retry_delay: Duration::from_millis(self.snapshot_retry_delay_ms),
            resync_on_reconnect: self.resync_on_reconnect,
            ordering: self.signal_ordering,
            grid_columns: self.grid_columns.max(1),
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, assign: impl FnOnce(T)) -> bool {
    match value.parse::<T>() {
        Ok(parsed) => {
            assign(parsed);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
