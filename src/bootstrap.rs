//! Bootstrap helpers for walletauth.
//!
//! Env vars can be supplied from two dotenv files: the working directory's
//! `./.env` and the per-user `~/.walletauth/.env`.

use std::path::PathBuf;

/// Path to the walletauth-specific `.env` file: `~/.walletauth/.env`.
pub fn walletauth_env_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".walletauth")
        .join(".env")
}

/// Load `./.env` and then `~/.walletauth/.env`.
///
/// dotenvy never overwrites existing env vars, so the effective priority is:
///
///   explicit env vars > `./.env` > `~/.walletauth/.env`
pub fn load_walletauth_env() {
    let _ = dotenvy::dotenv();

    let path = walletauth_env_path();
    if path.exists()
        && let Err(e) = dotenvy::from_path(&path)
    {
        tracing::warn!("Failed to load {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_path_is_under_walletauth_dir() {
        let path = walletauth_env_path();
        assert!(path.ends_with(".walletauth/.env"));
    }
}
