//! `walletauth doctor` - configuration and signing diagnostics.
//!
//! Validates env and TOML configuration and runs a local sign-and-recover
//! cycle so problems surface before a session is started.

use std::path::Path;

use crate::bridge::memory::{DEV_WALLET_KEY, InMemoryIdentity, InMemoryWallet};
use crate::bridge::{GeneratedChallenge, IdentityBridge, SignerKind, WalletBridge};
use crate::config::AuthConfig;
use crate::settings::Settings;

/// Run diagnostic checks and print results.
pub async fn run_doctor_command(config_path: Option<&Path>, strict: bool) -> anyhow::Result<()> {
    println!("walletauth doctor");
    println!("=================\n");

    let mut passed = 0u32;
    let mut failed = 0u32;

    // ── Configuration checks ──────────────────────────────────

    check(
        "dotenv file",
        check_env_file(),
        &mut passed,
        &mut failed,
    );

    check(
        "TOML config",
        check_toml_file(config_path),
        &mut passed,
        &mut failed,
    );

    check(
        "Resolved configuration",
        check_resolved_config(config_path),
        &mut passed,
        &mut failed,
    );

    // ── Signing checks ────────────────────────────────────────

    check(
        "Personal-sign round trip",
        check_signing_round_trip(SignerKind::PersonalSign).await,
        &mut passed,
        &mut failed,
    );

    check(
        "Safe-wallet round trip",
        check_signing_round_trip(SignerKind::SafeWallet).await,
        &mut passed,
        &mut failed,
    );

    println!();
    println!("  {passed} passed, {failed} failed");

    if failed > 0 && strict {
        anyhow::bail!("doctor strict mode failed with {failed} check(s)");
    }

    Ok(())
}

// ── Individual checks ───────────────────────────────────────

fn check(name: &str, result: CheckResult, passed: &mut u32, failed: &mut u32) {
    match result {
        CheckResult::Pass(detail) => {
            *passed += 1;
            println!("  [pass] {name}: {detail}");
        }
        CheckResult::Fail(detail) => {
            *failed += 1;
            println!("  [FAIL] {name}: {detail}");
        }
        CheckResult::Skip(reason) => {
            println!("  [skip] {name}: {reason}");
        }
    }
}

enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

fn check_env_file() -> CheckResult {
    let path = crate::bootstrap::walletauth_env_path();
    if !path.exists() {
        return CheckResult::Skip(format!("{} not present", path.display()));
    }
    match dotenvy::from_path_iter(&path) {
        Ok(iter) => match iter.collect::<Result<Vec<_>, _>>() {
            Ok(entries) => CheckResult::Pass(format!("{} entries in {}", entries.len(), path.display())),
            Err(e) => CheckResult::Fail(format!("{}: {e}", path.display())),
        },
        Err(e) => CheckResult::Fail(format!("{}: {e}", path.display())),
    }
}

fn check_toml_file(explicit: Option<&Path>) -> CheckResult {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(Settings::default_toml_path);
    match Settings::load_toml(&path) {
        Ok(Some(_)) => CheckResult::Pass(format!("parsed {}", path.display())),
        Ok(None) if explicit.is_some() => {
            CheckResult::Fail(format!("{} does not exist", path.display()))
        }
        Ok(None) => CheckResult::Skip(format!("{} not present, using defaults", path.display())),
        Err(e) => CheckResult::Fail(e),
    }
}

fn check_resolved_config(explicit: Option<&Path>) -> CheckResult {
    match AuthConfig::from_env_with_toml(explicit) {
        Ok(config) => CheckResult::Pass(format!(
            "debounce {}ms, {} Safe retries, platform {}",
            config.connect_debounce.as_millis(),
            config.safe_activation_retries,
            config.platform.as_str()
        )),
        Err(e) => CheckResult::Fail(e.to_string()),
    }
}

/// Sign a fresh challenge with the development key and have the in-memory
/// identity provider verify it by public-key recovery.
async fn check_signing_round_trip(signer: SignerKind) -> CheckResult {
    let wallet = match InMemoryWallet::from_key_hex(DEV_WALLET_KEY) {
        Ok(wallet) => wallet,
        Err(e) => return CheckResult::Fail(e.to_string()),
    };
    wallet.connect(1);
    wallet.set_signer_kind(signer);
    let identity = InMemoryIdentity::new();
    let address = wallet.address().clone();

    let result = async {
        let payload = identity
            .generate_challenge(&address)
            .await
            .map_err(|e| e.to_string())?;
        let challenge = GeneratedChallenge::try_from(payload)?;
        let signed = wallet
            .request_signature(&challenge.signing_payload(&address, signer), signer)
            .await
            .map_err(|e| e.to_string())?;
        let token = identity
            .exchange_signature_for_token(&crate::bridge::TokenExchangeRequest {
                address: address.clone(),
                signature: signed.signature,
                chain_id: 1,
                signature_type: signed.signature_type,
                nonce: challenge.nonce,
                device_id: "doctor".to_string(),
                platform: crate::bridge::Platform::current(),
            })
            .await
            .map_err(|e| e.to_string())?;
        identity
            .activate_session(&token)
            .await
            .map_err(|e| e.to_string())
    }
    .await;

    match result {
        Ok(()) => CheckResult::Pass(format!("{} verified for {}", signer.as_str(), address.short())),
        Err(e) => CheckResult::Fail(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_result(result: &CheckResult) -> String {
        match result {
            CheckResult::Pass(s) => format!("Pass({s})"),
            CheckResult::Fail(s) => format!("Fail({s})"),
            CheckResult::Skip(s) => format!("Skip({s})"),
        }
    }

    #[tokio::test]
    async fn signing_round_trips_pass() {
        for signer in [SignerKind::PersonalSign, SignerKind::SafeWallet] {
            match check_signing_round_trip(signer).await {
                CheckResult::Pass(_) => {}
                other => panic!("expected Pass for {signer:?}, got: {}", format_result(&other)),
            }
        }
    }

    #[test]
    fn explicit_missing_toml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        match check_toml_file(Some(&missing)) {
            CheckResult::Fail(_) => {}
            other => panic!("expected Fail, got: {}", format_result(&other)),
        }
    }

    #[test]
    fn explicit_valid_toml_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "safe_activation_retries = 2\n").unwrap();
        match check_toml_file(Some(&path)) {
            CheckResult::Pass(_) => {}
            other => panic!("expected Pass, got: {}", format_result(&other)),
        }
    }
}
