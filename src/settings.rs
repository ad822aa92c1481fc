//! File-backed settings for walletauth.
//!
//! Settings are the TOML layer of configuration: every field is optional, and
//! `crate::config::AuthConfig::resolve` fills gaps from env vars and
//! defaults. The file lives at `~/.walletauth/config.toml` unless an explicit
//! path is given.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Timing and identity settings read from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connect_debounce_ms: Option<u64>,
    pub safe_stabilization_ms: Option<u64>,
    pub safe_activation_retries: Option<u32>,
    pub safe_backoff_step_ms: Option<u64>,
    pub recovery_settle_ms: Option<u64>,
    pub nonce_history: Option<usize>,
    pub device_id: Option<String>,
    pub platform: Option<String>,
}

impl Settings {
    /// Default TOML config file path (~/.walletauth/config.toml).
    pub fn default_toml_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".walletauth")
            .join("config.toml")
    }

    /// Load settings from a TOML file.
    ///
    /// Returns `None` if the file doesn't exist. Returns an error only
    /// if the file exists but can't be parsed.
    pub fn load_toml(path: &Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };

        let settings: Self = toml::from_str(&data)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))?;
        Ok(Some(settings))
    }

    /// Overlay every field `other` sets onto `self`.
    pub fn merge_from(&mut self, other: &Self) {
        fn overlay<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
            if source.is_some() {
                target.clone_from(source);
            }
        }

        overlay(&mut self.connect_debounce_ms, &other.connect_debounce_ms);
        overlay(&mut self.safe_stabilization_ms, &other.safe_stabilization_ms);
        overlay(
            &mut self.safe_activation_retries,
            &other.safe_activation_retries,
        );
        overlay(&mut self.safe_backoff_step_ms, &other.safe_backoff_step_ms);
        overlay(&mut self.recovery_settle_ms, &other.recovery_settle_ms);
        overlay(&mut self.nonce_history, &other.nonce_history);
        overlay(&mut self.device_id, &other.device_id);
        overlay(&mut self.platform, &other.platform);
    }
}
