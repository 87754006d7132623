// Configuration
//
// Settings come from an optional `domus.toml` next to the data directory,
// with every field defaulted so a bare start works.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::RuntimeConfig;
use crate::types::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of all persisted artifacts.
    pub data_dir: PathBuf,
    /// HTTP/WebSocket listen address.
    pub http_listen: String,
    /// KNX/IP gateway, `host:port`. None runs without an external bus.
    pub knx_gateway: Option<String>,
    /// Soft per-execution timeout in seconds.
    pub execute_timeout_secs: f64,
    /// Remanent checkpoint interval in seconds.
    pub checkpoint_interval_secs: u64,
    /// Debounce for config saves after mutating calls, in milliseconds.
    pub save_debounce_ms: u64,
    /// Telegram ring capacity (minimum 500).
    pub telegram_ring: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            http_listen: "0.0.0.0:8700".to_string(),
            knx_gateway: None,
            execute_timeout_secs: 5.0,
            checkpoint_interval_secs: 60,
            save_debounce_ms: 1500,
            telegram_ring: 500,
        }
    }
}

impl Settings {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Settings> {
        match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw).map_err(|e| {
                crate::types::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{}: {e}", path.display()),
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn custom_blocks_dir(&self) -> PathBuf {
        self.data_dir.join("custom_blocks")
    }

    pub fn addresses_db_path(&self) -> PathBuf {
        self.data_dir.join("addresses.db")
    }

    pub fn logic_config_path(&self) -> PathBuf {
        self.data_dir.join("logic_config.json")
    }

    pub fn remanent_path(&self) -> PathBuf {
        self.data_dir.join("remanent.json")
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            config_path: self.logic_config_path(),
            custom_blocks_dir: self.custom_blocks_dir(),
            execute_timeout: Duration::from_secs_f64(self.execute_timeout_secs.max(0.1)),
            checkpoint_interval: Duration::from_secs(self.checkpoint_interval_secs.max(1)),
            save_debounce: Duration::from_millis(self.save_debounce_ms.max(10)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("domus.toml")).unwrap();
        assert_eq!(settings.telegram_ring, 500);
        assert!(settings.knx_gateway.is_none());
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domus.toml");
        std::fs::write(&path, "http_listen = \"127.0.0.1:9000\"\n").unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.http_listen, "127.0.0.1:9000");
        assert_eq!(settings.save_debounce_ms, 1500);
    }
}
