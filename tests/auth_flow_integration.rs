//! End-to-end flows through `AuthSession` with in-memory bridges.
//!
//! Every test runs on a paused clock so debounce, settle and backoff delays
//! are deterministic.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use walletauth::address::WalletAddress;
use walletauth::bridge::SignerKind;
use walletauth::bridge::memory::{DEV_WALLET_KEY, InMemoryIdentity, InMemoryWallet};
use walletauth::config::AuthConfig;
use walletauth::error::{BridgeError, ErrorKind};
use walletauth::pipeline::{AuthStep, ProgressEvent, ProgressLog, RunOutcome};
use walletauth::recovery::RecoveryOutcome;
use walletauth::session::AuthSession;
use walletauth::state::{BackendIdentityState, WalletConnectionState};

struct Env {
    wallet: Arc<InMemoryWallet>,
    identity: Arc<InMemoryIdentity>,
    progress: Arc<ProgressLog>,
    session: Arc<AuthSession>,
}

fn env(identity: BackendIdentityState) -> Env {
    let wallet = Arc::new(InMemoryWallet::from_key_hex(DEV_WALLET_KEY).unwrap());
    let identity = Arc::new(InMemoryIdentity::with_state(identity));
    let progress = Arc::new(ProgressLog::new());
    let session = AuthSession::with_progress(
        AuthConfig::default(),
        wallet.clone(),
        identity.clone(),
        progress.clone(),
    );
    Env {
        wallet,
        identity,
        progress,
        session,
    }
}

fn dev_address() -> WalletAddress {
    WalletAddress::new("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
}

#[tokio::test(start_paused = true)]
async fn fresh_connection_runs_all_six_steps() {
    let env = env(BackendIdentityState::signed_out());
    env.session.start();
    env.wallet.connect(137);

    tokio::time::sleep(Duration::from_millis(2400)).await;
    assert!(env.progress.events().is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let expected: Vec<ProgressEvent> = AuthStep::ALL
        .iter()
        .flat_map(|step| [ProgressEvent::Started(*step), ProgressEvent::Completed(*step)])
        .collect();
    assert_eq!(env.progress.events(), expected);

    assert_eq!(env.wallet.address(), &dev_address());
    assert_eq!(
        env.identity.state().authenticated_address(),
        Some(&dev_address())
    );
    let local = env.session.auth_state().snapshot();
    assert_eq!(local.auth_wallet_address, Some(dev_address()));
    assert!(!local.is_authenticating);
    assert!(local.auth_error.is_none());

    let requests = env.identity.exchange_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].chain_id, 137);
    assert_eq!(requests[0].device_id, env.session.config().device_id);

    env.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn stale_backend_session_for_other_address_is_signed_out() {
    let stale = "0x1111111111111111111111111111111111111111";
    let env = env(BackendIdentityState::authenticated(stale));
    env.session.auth_state().record_success(stale.into());
    env.session.start();
    env.wallet.connect(1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.identity.sign_out_calls(), 1);
    assert!(!env.identity.state().is_authenticated);
    assert_eq!(env.session.auth_state().auth_wallet_address(), None);
    assert!(env.session.auth_state().auth_error().is_none());

    // The settled connection then authenticates the wallet that is present.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        env.session.auth_state().auth_wallet_address(),
        Some(dev_address())
    );
    assert_eq!(env.identity.sign_out_calls(), 1);

    env.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn restart_with_matching_sessions_validates_without_sign_out() {
    let env = env(BackendIdentityState::loading());
    env.wallet.connect(1);
    env.session.start();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(env.session.last_recovery_outcome(), None);
    env.identity
        .set_state(BackendIdentityState::authenticated(dev_address()));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(
        env.session.last_recovery_outcome(),
        Some(RecoveryOutcome::ValidatedExistingSession)
    );
    assert_eq!(
        env.session.auth_state().auth_wallet_address(),
        Some(dev_address())
    );

    // The debounced connection sees the backend already authenticated.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(env.identity.sign_out_calls(), 0);
    assert!(env.identity.exchange_requests().is_empty());
    assert!(env.session.is_session_valid());

    env.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn safe_wallet_retries_activation_with_backoff() {
    let env = env(BackendIdentityState::signed_out());
    env.wallet.set_signer_kind(SignerKind::SafeWallet);
    env.wallet.connect(1);
    env.session
        .wallet_store()
        .publish(WalletConnectionState::connected(dev_address(), 1));
    for _ in 0..2 {
        env.identity
            .fail_next_activation(BridgeError::Rejected("signature not yet indexed".into()));
    }

    let started = tokio::time::Instant::now();
    let outcome = env.session.trigger_authentication().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(
        outcome,
        RunOutcome::Authenticated {
            address: dev_address()
        }
    );
    assert_eq!(env.identity.activation_calls(), 3);
    assert!(elapsed >= Duration::from_millis(5000));
    assert!(elapsed < Duration::from_millis(5100));
}

#[tokio::test(start_paused = true)]
async fn back_to_back_recovery_runs_once() {
    let env = env(BackendIdentityState::authenticated(
        "0x1111111111111111111111111111111111111111",
    ));
    env.identity.set_latency(Duration::from_millis(500));
    env.session
        .wallet_store()
        .publish(WalletConnectionState::connected(dev_address(), 1));

    let (first, second) = tokio::join!(
        env.session.trigger_recovery(),
        env.session.trigger_recovery()
    );
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(Option::is_some);
    assert_eq!(
        outcomes,
        vec![None, Some(RecoveryOutcome::ClearedMismatchedAuth)]
    );
    assert_eq!(env.identity.sign_out_calls(), 1);
    assert_eq!(
        env.session.last_recovery_outcome(),
        Some(RecoveryOutcome::ClearedMismatchedAuth)
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_signature_is_surfaced_and_retryable_manually() {
    let env = env(BackendIdentityState::signed_out());
    env.wallet.set_reject_signatures(true);
    env.session.start();
    env.wallet.connect(1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let error = env.session.auth_state().auth_error().expect("error surfaced");
    assert_eq!(error.kind, ErrorKind::SignatureRejected);
    assert!(error.kind.is_retryable());
    assert!(!env.session.lock().is_locked());
    assert_eq!(env.identity.sign_out_calls(), 0);

    env.wallet.set_reject_signatures(false);
    let outcome = env.session.trigger_authentication().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Authenticated { .. }));
    assert!(env.session.auth_state().auth_error().is_none());

    env.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_signature_cancels_run_and_signs_out_nothing() {
    let env = env(BackendIdentityState::signed_out());
    env.wallet.set_signature_delay(Duration::from_secs(30));
    env.session.start();
    env.wallet.connect(1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(env.session.lock().is_locked());
    assert!(env.session.auth_state().is_authenticating());

    env.wallet.push_state(WalletConnectionState::disconnected());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!env.session.lock().is_locked());
    assert!(!env.session.auth_state().is_authenticating());
    assert!(env.identity.exchange_requests().is_empty());

    env.session.shutdown();
}
