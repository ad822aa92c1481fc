//! Configuration for walletauth.
//!
//! Settings are loaded with priority: env var > TOML config file > default.
//! Env vars may come from `./.env` or `~/.walletauth/.env` (loaded via
//! dotenvy in [`crate::bootstrap`]).

pub(crate) mod helpers;

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::bridge::Platform;
use crate::error::ConfigError;
use crate::settings::Settings;

use self::helpers::{normalize_variant, optional_env, parse_env_or};

pub const DEFAULT_CONNECT_DEBOUNCE_MS: u64 = 2500;
pub const DEFAULT_SAFE_STABILIZATION_MS: u64 = 2000;
pub const DEFAULT_SAFE_ACTIVATION_RETRIES: u32 = 3;
pub const DEFAULT_SAFE_BACKOFF_STEP_MS: u64 = 1000;
pub const DEFAULT_RECOVERY_SETTLE_MS: u64 = 1000;
pub const DEFAULT_NONCE_HISTORY: usize = 256;

/// Resolved runtime configuration for the reconciliation core.
#[derive(Debug, Clone, Serialize)]
pub struct AuthConfig {
    /// Delay before a fresh connection triggers authentication.
    #[serde(with = "duration_ms")]
    pub connect_debounce: Duration,
    /// Wait before the first Safe-wallet session activation.
    #[serde(with = "duration_ms")]
    pub safe_stabilization_delay: Duration,
    /// Extra activation attempts for Safe wallets.
    pub safe_activation_retries: u32,
    /// Linear backoff step between Safe activation retries.
    #[serde(with = "duration_ms")]
    pub safe_backoff_step: Duration,
    /// Delay before the automatic startup recovery pass.
    #[serde(with = "duration_ms")]
    pub recovery_settle_delay: Duration,
    /// Consumed challenge nonces remembered by the pipeline.
    pub nonce_history: usize,
    pub device_id: String,
    pub platform: Platform,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            connect_debounce: Duration::from_millis(DEFAULT_CONNECT_DEBOUNCE_MS),
            safe_stabilization_delay: Duration::from_millis(DEFAULT_SAFE_STABILIZATION_MS),
            safe_activation_retries: DEFAULT_SAFE_ACTIVATION_RETRIES,
            safe_backoff_step: Duration::from_millis(DEFAULT_SAFE_BACKOFF_STEP_MS),
            recovery_settle_delay: Duration::from_millis(DEFAULT_RECOVERY_SETTLE_MS),
            nonce_history: DEFAULT_NONCE_HISTORY,
            device_id: Uuid::new_v4().to_string(),
            platform: Platform::current(),
        }
    }
}

impl AuthConfig {
    /// Load configuration from env vars and the default TOML file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional TOML config file overlay.
    ///
    /// If `toml_path` is `Some`, a missing or unparsable file is fatal. The
    /// default path is best-effort.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        crate::bootstrap::load_walletauth_env();
        let mut settings = Settings::default();
        Self::apply_toml_overlay(&mut settings, toml_path)?;
        Self::resolve(&settings)
    }

    fn apply_toml_overlay(
        settings: &mut Settings,
        explicit_path: Option<&Path>,
    ) -> Result<(), ConfigError> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(toml_settings)) => {
                settings.merge_from(&toml_settings);
                tracing::debug!("Loaded TOML config from {}", path.display());
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(e));
                }
                tracing::warn!("Failed to load default config file: {}", e);
            }
        }
        Ok(())
    }

    /// Build config from settings, letting env vars win.
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let connect_debounce_ms = parse_env_or(
            "WALLETAUTH_CONNECT_DEBOUNCE_MS",
            settings.connect_debounce_ms,
            "must be a positive integer",
        )?
        .unwrap_or(DEFAULT_CONNECT_DEBOUNCE_MS);
        if connect_debounce_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WALLETAUTH_CONNECT_DEBOUNCE_MS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let safe_stabilization_ms = parse_env_or(
            "WALLETAUTH_SAFE_STABILIZATION_MS",
            settings.safe_stabilization_ms,
            "must be a non-negative integer",
        )?
        .unwrap_or(DEFAULT_SAFE_STABILIZATION_MS);

        let safe_activation_retries = parse_env_or(
            "WALLETAUTH_SAFE_ACTIVATION_RETRIES",
            settings.safe_activation_retries,
            "must be a non-negative integer",
        )?
        .unwrap_or(DEFAULT_SAFE_ACTIVATION_RETRIES);

        let safe_backoff_step_ms = parse_env_or(
            "WALLETAUTH_SAFE_BACKOFF_STEP_MS",
            settings.safe_backoff_step_ms,
            "must be a non-negative integer",
        )?
        .unwrap_or(DEFAULT_SAFE_BACKOFF_STEP_MS);

        let recovery_settle_ms = parse_env_or(
            "WALLETAUTH_RECOVERY_SETTLE_MS",
            settings.recovery_settle_ms,
            "must be a non-negative integer",
        )?
        .unwrap_or(DEFAULT_RECOVERY_SETTLE_MS);

        let nonce_history = parse_env_or(
            "WALLETAUTH_NONCE_HISTORY",
            settings.nonce_history,
            "must be a non-negative integer",
        )?
        .unwrap_or(DEFAULT_NONCE_HISTORY);

        let device_id = optional_env("WALLETAUTH_DEVICE_ID")?
            .or_else(|| settings.device_id.clone())
            .unwrap_or(defaults.device_id);

        let platform = match optional_env("WALLETAUTH_PLATFORM")?.or_else(|| settings.platform.clone())
        {
            Some(raw) => parse_platform(&raw, "WALLETAUTH_PLATFORM")?,
            None => defaults.platform,
        };

        Ok(Self {
            connect_debounce: Duration::from_millis(connect_debounce_ms),
            safe_stabilization_delay: Duration::from_millis(safe_stabilization_ms),
            safe_activation_retries,
            safe_backoff_step: Duration::from_millis(safe_backoff_step_ms),
            recovery_settle_delay: Duration::from_millis(recovery_settle_ms),
            nonce_history,
            device_id,
            platform,
        })
    }

    /// Backoff before Safe activation retry `attempt` (1-based): 1x, 2x, 3x
    /// the configured step.
    pub fn safe_backoff(&self, attempt: u32) -> Duration {
        self.safe_backoff_step.saturating_mul(attempt)
    }
}

fn parse_platform(value: &str, key: &str) -> Result<Platform, ConfigError> {
    match normalize_variant(value).as_str() {
        "ios" => Ok(Platform::Ios),
        "android" => Ok(Platform::Android),
        "web" => Ok(Platform::Web),
        "desktop" | "macos" | "linux" | "windows" => Ok(Platform::Desktop),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected 'ios', 'android', 'web', or 'desktop', got '{value}'"),
        }),
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: [&str; 8] = [
        "WALLETAUTH_CONNECT_DEBOUNCE_MS",
        "WALLETAUTH_SAFE_STABILIZATION_MS",
        "WALLETAUTH_SAFE_ACTIVATION_RETRIES",
        "WALLETAUTH_SAFE_BACKOFF_STEP_MS",
        "WALLETAUTH_RECOVERY_SETTLE_MS",
        "WALLETAUTH_NONCE_HISTORY",
        "WALLETAUTH_DEVICE_ID",
        "WALLETAUTH_PLATFORM",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            // SAFETY: Guarded by ENV_MUTEX in tests.
            unsafe {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn defaults_match_observed_timings() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();

        let config = AuthConfig::resolve(&Settings::default()).expect("config");
        assert_eq!(config.connect_debounce, Duration::from_millis(2500));
        assert_eq!(config.safe_stabilization_delay, Duration::from_millis(2000));
        assert_eq!(config.safe_activation_retries, 3);
        assert_eq!(config.safe_backoff(1), Duration::from_secs(1));
        assert_eq!(config.safe_backoff(3), Duration::from_secs(3));
        assert_eq!(config.recovery_settle_delay, Duration::from_secs(1));
        assert!(Uuid::parse_str(&config.device_id).is_ok());
    }

    #[test]
    fn env_overrides_settings() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("WALLETAUTH_CONNECT_DEBOUNCE_MS", "1200");
            std::env::set_var("WALLETAUTH_PLATFORM", "Android");
        }

        let settings = Settings {
            connect_debounce_ms: Some(4000),
            safe_activation_retries: Some(5),
            device_id: Some("device-from-toml".to_string()),
            ..Settings::default()
        };
        let config = AuthConfig::resolve(&settings).expect("config");
        assert_eq!(config.connect_debounce, Duration::from_millis(1200));
        assert_eq!(config.safe_activation_retries, 5);
        assert_eq!(config.device_id, "device-from-toml");
        assert_eq!(config.platform, Platform::Android);

        clear_env();
    }

    #[test]
    fn rejects_invalid_values() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("WALLETAUTH_SAFE_BACKOFF_STEP_MS", "fast");
        }
        let err = AuthConfig::resolve(&Settings::default()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "WALLETAUTH_SAFE_BACKOFF_STEP_MS"
        ));
        clear_env();

        let zero = Settings {
            connect_debounce_ms: Some(0),
            ..Settings::default()
        };
        assert!(AuthConfig::resolve(&zero).is_err());

        let bad_platform = Settings {
            platform: Some("toaster".to_string()),
            ..Settings::default()
        };
        assert!(AuthConfig::resolve(&bad_platform).is_err());
    }

    #[test]
    fn explicit_missing_toml_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        let err =
            AuthConfig::apply_toml_overlay(&mut settings, Some(&dir.path().join("nope.toml")))
                .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
