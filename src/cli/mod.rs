//! Command-line surface for exercising the reconciliation core.

pub mod doctor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::address::WalletAddress;
use crate::bridge::SignerKind;
use crate::bridge::memory::{DEV_WALLET_KEY, InMemoryIdentity, InMemoryWallet};
use crate::config::AuthConfig;
use crate::pipeline::{ProgressEvent, ProgressLog};
use crate::recovery::{RecoveryOutcome, SessionValidation, validate_session};
use crate::session::AuthSession;
use crate::state::{BackendIdentityState, LocalAuthState, WalletConnectionState};

pub use doctor::run_doctor_command;

#[derive(Parser, Debug)]
#[command(name = "walletauth", version, about = "Wallet authentication and session reconciliation")]
pub struct Cli {
    /// TOML config file (defaults to ~/.walletauth/config.toml)
    #[arg(long, global = true, env = "WALLETAUTH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Cross-check a wallet connection against a backend session
    Validate {
        /// Connected wallet address
        #[arg(long)]
        wallet: Option<String>,
        /// Address the backend session is authenticated for
        #[arg(long)]
        backend: Option<String>,
        #[arg(long, default_value_t = 1)]
        chain: u64,
    },

    /// Run a full connect-and-authenticate cycle against in-memory bridges
    Simulate {
        /// Sign as a Safe smart-contract wallet
        #[arg(long)]
        safe: bool,
        /// Reject the signature prompt
        #[arg(long)]
        reject_signature: bool,
        /// Start with a stale backend session for this address
        #[arg(long)]
        backend: Option<String>,
        /// Hex private key for the simulated wallet
        #[arg(long, default_value = DEV_WALLET_KEY)]
        wallet_key: String,
        #[arg(long, default_value_t = 1)]
        chain: u64,
    },

    /// Print the resolved configuration
    Config,

    /// Check configuration and signing prerequisites
    Doctor {
        /// Exit non-zero if any check fails
        #[arg(long)]
        strict: bool,
    },
}

pub fn run_validate(wallet: Option<String>, backend: Option<String>, chain: u64) -> anyhow::Result<()> {
    let wallet = match wallet {
        Some(address) => WalletConnectionState::connected(address.as_str(), chain),
        None => WalletConnectionState::disconnected(),
    };
    let identity = match backend {
        Some(address) => BackendIdentityState::authenticated(address.as_str()),
        None => BackendIdentityState::signed_out(),
    };
    let validation = validate_session(&wallet, &identity);
    println!("{}", serde_json::to_string_pretty(&validation)?);
    Ok(())
}

pub fn run_config(config: &AuthConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    wallet: WalletConnectionState,
    identity: BackendIdentityState,
    local: LocalAuthState,
    validation: SessionValidation,
    recovery: Option<RecoveryOutcome>,
    progress: Vec<ProgressEvent>,
    elapsed_ms: u64,
}

pub struct SimulateOptions {
    pub safe: bool,
    pub reject_signature: bool,
    pub backend: Option<String>,
    pub wallet_key: String,
    pub chain: u64,
}

pub async fn run_simulate(config: AuthConfig, options: SimulateOptions) -> anyhow::Result<()> {
    let wallet = Arc::new(InMemoryWallet::from_key_hex(&options.wallet_key)?);
    if options.safe {
        wallet.set_signer_kind(SignerKind::SafeWallet);
    }
    wallet.set_reject_signatures(options.reject_signature);

    let identity = Arc::new(match &options.backend {
        Some(address) => {
            InMemoryIdentity::with_state(BackendIdentityState::authenticated(address.as_str()))
        }
        None => InMemoryIdentity::new(),
    });

    let budget = simulation_budget(&config);
    let progress = Arc::new(ProgressLog::new());
    let session = AuthSession::with_progress(config, wallet.clone(), identity.clone(), progress.clone());
    session.start();

    let started = tokio::time::Instant::now();
    wallet.connect(options.chain);
    let target: WalletAddress = wallet.address().clone();
    tracing::info!(address = %target, "simulated wallet connected");

    let mut local_rx = session.auth_state().subscribe();
    let settled = tokio::time::timeout(
        budget,
        local_rx.wait_for(|state| {
            !state.is_authenticating
                && (state.auth_error.is_some() || state.auth_wallet_address.as_ref() == Some(&target))
        }),
    )
    .await
    .map(|changed| changed.is_ok());
    match settled {
        Ok(true) => {}
        Ok(false) => anyhow::bail!("auth-state store closed during simulation"),
        Err(_) => tracing::warn!(budget_ms = budget.as_millis() as u64, "simulation did not settle in time"),
    }

    let report = SimulationReport {
        wallet: session.wallet_state(),
        identity: session.identity_state(),
        local: session.auth_state().snapshot(),
        validation: session.validate(),
        recovery: session.last_recovery_outcome(),
        progress: progress.events(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    session.shutdown();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Upper bound on how long one simulated cycle can take.
fn simulation_budget(config: &AuthConfig) -> Duration {
    let backoff: Duration = (1..=config.safe_activation_retries)
        .map(|attempt| config.safe_backoff(attempt))
        .sum();
    config.connect_debounce
        + config.recovery_settle_delay
        + config.safe_stabilization_delay
        + backoff
        + Duration::from_secs(10)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_simulate_flags() {
        let cli = Cli::try_parse_from([
            "walletauth",
            "--log-json",
            "simulate",
            "--safe",
            "--backend",
            "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        ])
        .unwrap();
        assert!(cli.log_json);
        match cli.command {
            Command::Simulate {
                safe,
                reject_signature,
                backend,
                wallet_key,
                chain,
            } => {
                assert!(safe);
                assert!(!reject_signature);
                assert!(backend.is_some());
                assert_eq!(wallet_key, DEV_WALLET_KEY);
                assert_eq!(chain, 1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn budget_covers_safe_retries() {
        let config = AuthConfig::default();
        assert_eq!(
            simulation_budget(&config),
            Duration::from_millis(2500 + 1000 + 2000 + 6000 + 10_000)
        );
    }
}
