//! Drift reconciler.
//!
//! Whenever any of the wallet mirror, backend identity, auth lock or local
//! auth-state changes, the reconciler re-evaluates the combination and
//! repairs drift between them. The decision itself is the pure function
//! [`evaluate`]; [`SessionReconciler::reconcile`] applies it.
//!
//! Cases, first match wins:
//!
//! | # | condition | action |
//! |---|-----------|--------|
//! | 1 | backend authenticated with an address, wallet gone | sign out, clear local |
//! | 2 | both connected, addresses differ | sign out, clear local |
//! | 3 | both connected, same address, no local record | adopt backend address |
//! | 4 | wallet connected, backend not, lock free, no error | wait for the pipeline |
//! | 5 | backend authenticated, wallet not yet reported | keep the session |
//!
//! Nothing is evaluated while the backend is still loading its persisted
//! session, and evaluations that land while a remediation is in flight are
//! skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::watch;

use crate::address::WalletAddress;
use crate::bridge::{IdentityBridge, WalletBridge};
use crate::lock::{AuthLock, LockState};
use crate::state::{AuthStateStore, BackendIdentityState, LocalAuthState, WalletConnectionState, WalletStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftCase {
    BackendWithoutWallet,
    AddressMismatch,
}

impl DriftCase {
    pub fn as_str(self) -> &'static str {
        match self {
            DriftCase::BackendWithoutWallet => "backend_without_wallet",
            DriftCase::AddressMismatch => "address_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "address", rename_all = "snake_case")]
pub enum ReconcileDecision {
    Remediate(DriftCase),
    AdoptBackendAddress(WalletAddress),
    AwaitAuthentication(WalletAddress),
    PreserveSession,
    Idle,
}

/// Everything one evaluation looks at.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileInputs<'a> {
    pub wallet: &'a WalletConnectionState,
    /// The SDK's own connection flag, read live.
    pub wallet_live_connected: bool,
    /// A connected wallet has been observed since the last remediation.
    pub wallet_seen_connected: bool,
    pub identity: &'a BackendIdentityState,
    pub lock: &'a LockState,
    pub local: &'a LocalAuthState,
}

pub fn evaluate(inputs: ReconcileInputs<'_>) -> ReconcileDecision {
    let ReconcileInputs {
        wallet,
        wallet_live_connected,
        wallet_seen_connected,
        identity,
        lock,
        local,
    } = inputs;

    if identity.is_loading {
        return ReconcileDecision::Idle;
    }

    let wallet_address = wallet.connected_address();
    let backend_address = identity.authenticated_address();
    let wallet_gone = wallet_address.is_none() && !wallet_live_connected;

    // A wallet that was never seen this session is still reconnecting.
    if backend_address.is_some() && wallet_gone && wallet_seen_connected {
        return ReconcileDecision::Remediate(DriftCase::BackendWithoutWallet);
    }

    match (wallet_address, backend_address) {
        (Some(wallet_address), Some(backend_address)) if wallet_address != backend_address => {
            return ReconcileDecision::Remediate(DriftCase::AddressMismatch);
        }
        (Some(_), Some(backend_address)) if local.auth_wallet_address.is_none() => {
            return ReconcileDecision::AdoptBackendAddress(backend_address.clone());
        }
        _ => {}
    }

    if let Some(wallet_address) = wallet_address
        && !identity.is_authenticated
        && !lock.is_locked
        && local.auth_error.is_none()
    {
        return ReconcileDecision::AwaitAuthentication(wallet_address.clone());
    }

    if identity.is_authenticated && wallet_gone {
        return ReconcileDecision::PreserveSession;
    }

    ReconcileDecision::Idle
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A remediation was already running.
    Skipped,
    Evaluated(ReconcileDecision),
}

pub struct SessionReconciler {
    wallet_store: Arc<WalletStore>,
    wallet: Arc<dyn WalletBridge>,
    identity: Arc<dyn IdentityBridge>,
    lock: Arc<AuthLock>,
    auth_state: Arc<AuthStateStore>,
    resetting: AtomicBool,
    wallet_seen_connected: AtomicBool,
}

/// Clears the re-entrancy flag even if the remediation future is dropped.
struct ResetGuard<'a>(&'a AtomicBool);

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SessionReconciler {
    pub fn new(
        wallet_store: Arc<WalletStore>,
        wallet: Arc<dyn WalletBridge>,
        identity: Arc<dyn IdentityBridge>,
        lock: Arc<AuthLock>,
        auth_state: Arc<AuthStateStore>,
    ) -> Self {
        Self {
            wallet_store,
            wallet,
            identity,
            lock,
            auth_state,
            resetting: AtomicBool::new(false),
            wallet_seen_connected: AtomicBool::new(false),
        }
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::SeqCst)
    }

    /// Evaluate current state once and apply the resulting action.
    pub async fn reconcile(&self) -> ReconcileOutcome {
        if self.is_resetting() {
            tracing::debug!("reconcile skipped, remediation in progress");
            return ReconcileOutcome::Skipped;
        }

        let wallet = self.wallet_store.snapshot();
        if wallet.connected_address().is_some() {
            self.wallet_seen_connected.store(true, Ordering::SeqCst);
        }
        let identity = self.identity.subscribe().borrow().clone();
        let lock = self.lock.snapshot();
        let local = self.auth_state.snapshot();

        let decision = evaluate(ReconcileInputs {
            wallet: &wallet,
            wallet_live_connected: self.wallet.is_connected(),
            wallet_seen_connected: self.wallet_seen_connected.load(Ordering::SeqCst),
            identity: &identity,
            lock: &lock,
            local: &local,
        });

        match &decision {
            ReconcileDecision::Remediate(case) => {
                if !self.remediate(*case).await {
                    return ReconcileOutcome::Skipped;
                }
            }
            ReconcileDecision::AdoptBackendAddress(address) => {
                tracing::info!(address = %address.short(), "adopting restored backend session");
                let address = address.clone();
                self.auth_state.update(|state| {
                    state.auth_wallet_address = Some(address);
                    state.is_authenticating = false;
                });
            }
            ReconcileDecision::AwaitAuthentication(address) => {
                tracing::debug!(address = %address.short(), "wallet connected without backend session");
            }
            ReconcileDecision::PreserveSession => {
                tracing::debug!("backend session kept while wallet reconnects");
            }
            ReconcileDecision::Idle => {}
        }
        ReconcileOutcome::Evaluated(decision)
    }

    /// Sign out and clear local state. Returns false if another remediation
    /// already holds the flag.
    async fn remediate(&self, case: DriftCase) -> bool {
        if self
            .resetting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let _guard = ResetGuard(&self.resetting);

        tracing::warn!(case = case.as_str(), "session drift detected, signing out");
        if let Err(e) = self.identity.sign_out().await {
            tracing::warn!(case = case.as_str(), error = %e, "sign-out during drift repair failed");
        }
        self.auth_state.reset();
        if case == DriftCase::BackendWithoutWallet {
            self.wallet_seen_connected.store(false, Ordering::SeqCst);
        }
        true
    }
}

/// Keeps the reconciler watcher running. Drop to stop.
#[derive(Clone)]
pub struct ReconcilerHandle {
    cancel: Arc<watch::Sender<bool>>,
    evaluations: Arc<AtomicU64>,
}

impl ReconcilerHandle {
    /// Completed evaluations, skipped ones included.
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.cancel.send_replace(true);
    }
}

/// Spawn the watcher that re-runs [`SessionReconciler::reconcile`] whenever
/// an observed container changes.
pub fn spawn_reconciler(reconciler: Arc<SessionReconciler>) -> ReconcilerHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let evaluations = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&evaluations);

    tokio::spawn(async move {
        run_reconciler(reconciler, cancel_rx, counter).await;
    });

    ReconcilerHandle {
        cancel: Arc::new(cancel_tx),
        evaluations,
    }
}

async fn run_reconciler(
    reconciler: Arc<SessionReconciler>,
    mut cancel_rx: watch::Receiver<bool>,
    evaluations: Arc<AtomicU64>,
) {
    let mut wallet_rx = reconciler.wallet_store.subscribe();
    let mut identity_rx = reconciler.identity.subscribe();
    let mut lock_rx = reconciler.lock.subscribe();
    let mut local_rx = reconciler.auth_state.subscribe();

    tracing::debug!("starting drift reconciler");
    loop {
        // Changes that land while a pass is running, including its own
        // writes, stay pending and trigger the next pass. Own writes settle
        // because the stores only notify on real changes.
        reconciler.reconcile().await;
        evaluations.fetch_add(1, Ordering::Relaxed);

        let open = tokio::select! {
            r = wallet_rx.changed() => r.is_ok(),
            r = identity_rx.changed() => r.is_ok(),
            r = lock_rx.changed() => r.is_ok(),
            r = local_rx.changed() => r.is_ok(),
            r = cancel_rx.changed() => r.is_ok() && !*cancel_rx.borrow(),
        };
        if !open {
            tracing::debug!("drift reconciler shutting down");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bridge::memory::{InMemoryIdentity, InMemoryWallet};
    use crate::error::{AuthError, BridgeError, ErrorKind};

    const A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn inputs<'a>(
        wallet: &'a WalletConnectionState,
        identity: &'a BackendIdentityState,
        lock: &'a LockState,
        local: &'a LocalAuthState,
    ) -> ReconcileInputs<'a> {
        ReconcileInputs {
            wallet,
            wallet_live_connected: wallet.is_connected,
            wallet_seen_connected: true,
            identity,
            lock,
            local,
        }
    }

    #[test]
    fn decision_table() {
        let lock = LockState::default();
        let local = LocalAuthState::default();
        let on_a = WalletConnectionState::connected(A, 1);
        let off = WalletConnectionState::disconnected();
        let backend_a = BackendIdentityState::authenticated(A);
        let backend_b = BackendIdentityState::authenticated(B);
        let signed_out = BackendIdentityState::signed_out();

        assert_eq!(
            evaluate(inputs(&off, &backend_a, &lock, &local)),
            ReconcileDecision::Remediate(DriftCase::BackendWithoutWallet)
        );
        assert_eq!(
            evaluate(inputs(&on_a, &backend_b, &lock, &local)),
            ReconcileDecision::Remediate(DriftCase::AddressMismatch)
        );
        assert_eq!(
            evaluate(inputs(&on_a, &backend_a, &lock, &local)),
            ReconcileDecision::AdoptBackendAddress(A.into())
        );
        assert_eq!(
            evaluate(inputs(&on_a, &signed_out, &lock, &local)),
            ReconcileDecision::AwaitAuthentication(A.into())
        );
        assert_eq!(
            evaluate(inputs(&off, &signed_out, &lock, &local)),
            ReconcileDecision::Idle
        );
    }

    #[test]
    fn matching_session_with_local_record_is_idle() {
        let local = LocalAuthState {
            auth_wallet_address: Some(A.into()),
            ..LocalAuthState::default()
        };
        let wallet = WalletConnectionState::connected(A, 1);
        let identity = BackendIdentityState::authenticated(A.to_uppercase().replacen("0X", "0x", 1).as_str());
        assert_eq!(
            evaluate(inputs(&wallet, &identity, &LockState::default(), &local)),
            ReconcileDecision::Idle
        );
    }

    #[test]
    fn cold_start_keeps_backend_session() {
        let wallet = WalletConnectionState::disconnected();
        let identity = BackendIdentityState::authenticated(A);
        let lock = LockState::default();
        let local = LocalAuthState::default();
        let decision = evaluate(ReconcileInputs {
            wallet_seen_connected: false,
            ..inputs(&wallet, &identity, &lock, &local)
        });
        assert_eq!(decision, ReconcileDecision::PreserveSession);
    }

    #[test]
    fn live_sdk_connection_blocks_sign_out() {
        let wallet = WalletConnectionState::disconnected();
        let identity = BackendIdentityState::authenticated(A);
        let lock = LockState::default();
        let local = LocalAuthState::default();
        let decision = evaluate(ReconcileInputs {
            wallet_live_connected: true,
            ..inputs(&wallet, &identity, &lock, &local)
        });
        assert_eq!(decision, ReconcileDecision::Idle);
    }

    #[test]
    fn loading_identity_is_never_remediated() {
        let wallet = WalletConnectionState::connected(A, 1);
        let identity = BackendIdentityState {
            is_loading: true,
            ..BackendIdentityState::authenticated(B)
        };
        assert_eq!(
            evaluate(inputs(
                &wallet,
                &identity,
                &LockState::default(),
                &LocalAuthState::default()
            )),
            ReconcileDecision::Idle
        );
    }

    #[test]
    fn pending_error_or_lock_suppresses_await() {
        let wallet = WalletConnectionState::connected(A, 1);
        let identity = BackendIdentityState::signed_out();
        let with_error = LocalAuthState {
            auth_error: Some(AuthError::new(ErrorKind::SignatureRejected, "no")),
            ..LocalAuthState::default()
        };
        assert_eq!(
            evaluate(inputs(&wallet, &identity, &LockState::default(), &with_error)),
            ReconcileDecision::Idle
        );

        let lock = AuthLock::new();
        assert!(lock.acquire(&A.into()));
        let held = lock.snapshot();
        assert_eq!(
            evaluate(inputs(&wallet, &identity, &held, &LocalAuthState::default())),
            ReconcileDecision::Idle
        );
    }

    struct Fixture {
        store: Arc<WalletStore>,
        wallet: Arc<InMemoryWallet>,
        identity: Arc<InMemoryIdentity>,
        auth_state: Arc<AuthStateStore>,
        reconciler: Arc<SessionReconciler>,
    }

    fn fixture(identity: BackendIdentityState) -> Fixture {
        let store = Arc::new(WalletStore::new());
        let wallet = Arc::new(InMemoryWallet::random());
        let identity = Arc::new(InMemoryIdentity::with_state(identity));
        let auth_state = Arc::new(AuthStateStore::new());
        let reconciler = Arc::new(SessionReconciler::new(
            Arc::clone(&store),
            wallet.clone(),
            identity.clone(),
            Arc::new(AuthLock::new()),
            Arc::clone(&auth_state),
        ));
        Fixture {
            store,
            wallet,
            identity,
            auth_state,
            reconciler,
        }
    }

    #[tokio::test]
    async fn mismatch_signs_out_and_clears_local_state() {
        let f = fixture(BackendIdentityState::authenticated(A));
        f.auth_state.record_success(A.into());
        f.wallet.push_state(WalletConnectionState::connected(B, 1));
        f.store.publish(WalletConnectionState::connected(B, 1));

        let outcome = f.reconciler.reconcile().await;
        assert_eq!(
            outcome,
            ReconcileOutcome::Evaluated(ReconcileDecision::Remediate(DriftCase::AddressMismatch))
        );
        assert_eq!(f.identity.sign_out_calls(), 1);
        assert!(!f.identity.state().is_authenticated);
        assert_eq!(f.auth_state.snapshot().auth_wallet_address, None);
        assert!(!f.reconciler.is_resetting());
    }

    #[tokio::test]
    async fn failed_sign_out_is_logged_not_surfaced() {
        let f = fixture(BackendIdentityState::authenticated(A));
        f.identity
            .fail_next_sign_out(BridgeError::Transport("offline".into()));
        f.store.publish(WalletConnectionState::connected(B, 1));

        f.reconciler.reconcile().await;
        assert!(f.auth_state.auth_error().is_none());
        assert!(!f.reconciler.is_resetting());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_evaluation_is_skipped_during_remediation() {
        let f = fixture(BackendIdentityState::authenticated(A));
        f.identity.set_latency(Duration::from_secs(1));
        f.store.publish(WalletConnectionState::connected(B, 1));

        let first = {
            let reconciler = Arc::clone(&f.reconciler);
            tokio::spawn(async move { reconciler.reconcile().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.reconciler.is_resetting());
        assert_eq!(f.reconciler.reconcile().await, ReconcileOutcome::Skipped);

        first.await.unwrap();
        assert_eq!(f.identity.sign_out_calls(), 1);
    }

    #[tokio::test]
    async fn restored_session_adopts_backend_address() {
        let f = fixture(BackendIdentityState::authenticated(A));
        f.store.publish(WalletConnectionState::connected(A, 1));
        f.reconciler.reconcile().await;
        assert_eq!(f.auth_state.auth_wallet_address(), Some(A.into()));
        assert_eq!(f.identity.sign_out_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_signs_out_after_wallet_disconnects() {
        let f = fixture(BackendIdentityState::authenticated(A));
        f.store.publish(WalletConnectionState::connected(A, 1));
        let handle = spawn_reconciler(Arc::clone(&f.reconciler));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.auth_state.auth_wallet_address(), Some(A.into()));

        f.store.publish(WalletConnectionState::disconnected());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.identity.sign_out_calls(), 1);
        assert_eq!(f.auth_state.auth_wallet_address(), None);
        assert!(handle.evaluations() >= 2);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn wallet_change_during_sign_out_is_evaluated_afterwards() {
        let f = fixture(BackendIdentityState::authenticated(A));
        f.identity.set_latency(Duration::from_secs(1));
        f.identity
            .fail_next_sign_out(BridgeError::Transport("offline".into()));
        f.store.publish(WalletConnectionState::connected(B, 1));
        let handle = spawn_reconciler(Arc::clone(&f.reconciler));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(f.reconciler.is_resetting());
        f.store.publish(WalletConnectionState::connected(A, 1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.identity.sign_out_calls(), 1);
        assert!(f.identity.state().is_authenticated);
        assert_eq!(f.auth_state.auth_wallet_address(), Some(A.into()));
        assert!(handle.evaluations() >= 2);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_settles_after_its_own_writes() {
        let f = fixture(BackendIdentityState::authenticated(A));
        f.store.publish(WalletConnectionState::connected(A, 1));
        let handle = spawn_reconciler(Arc::clone(&f.reconciler));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let settled = handle.evaluations();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.evaluations(), settled);
        assert_eq!(f.auth_state.auth_wallet_address(), Some(A.into()));

        handle.stop();
    }
}
