//! Session recovery.
//!
//! [`validate_session`] cross-checks the wallet connection against the
//! backend identity. [`RecoveryValidator::recover`] acts on the result:
//! it syncs a valid session into local state, leaves transient states
//! alone, and tears down corrupted sessions. Destructive branches take a
//! [`SessionStateSnapshot`] first and roll back to it if a remediation step
//! fails.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::task::JoinHandle;

use crate::address::WalletAddress;
use crate::bridge::{IdentityBridge, WalletBridge};
use crate::error::RecoveryError;
use crate::lock::{AuthLock, LockSnapshot};
use crate::state::{
    AuthStateStore, BackendIdentityState, LocalAuthState, WalletConnectionState, WalletStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionIssue {
    NoBackendAuthentication,
    NoWalletConnection,
    WalletAddressMismatch,
    InvalidBackendAddressFormat,
    InvalidWalletAddressFormat,
}

impl SessionIssue {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionIssue::NoBackendAuthentication => "No backend authentication",
            SessionIssue::NoWalletConnection => "No wallet connection",
            SessionIssue::WalletAddressMismatch => "Wallet address mismatch with backend auth",
            SessionIssue::InvalidBackendAddressFormat => "Invalid backend wallet address format",
            SessionIssue::InvalidWalletAddressFormat => "Invalid wallet address format",
        }
    }

    pub fn is_format_issue(self) -> bool {
        matches!(
            self,
            SessionIssue::InvalidBackendAddressFormat | SessionIssue::InvalidWalletAddressFormat
        )
    }
}

impl fmt::Display for SessionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SessionIssue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionValidation {
    pub is_valid: bool,
    pub issues: Vec<SessionIssue>,
    pub wallet_address: Option<WalletAddress>,
    pub backend_address: Option<WalletAddress>,
}

impl SessionValidation {
    pub fn has_issue(&self, issue: SessionIssue) -> bool {
        self.issues.contains(&issue)
    }
}

/// Pure consistency check between wallet and backend identity.
pub fn validate_session(
    wallet: &WalletConnectionState,
    identity: &BackendIdentityState,
) -> SessionValidation {
    let wallet_address = wallet.connected_address().cloned();
    let backend_address = identity.authenticated_address().cloned();
    let mut issues = Vec::new();

    if backend_address.is_none() {
        issues.push(SessionIssue::NoBackendAuthentication);
    }
    if wallet_address.is_none() {
        issues.push(SessionIssue::NoWalletConnection);
    }
    if let (Some(wallet), Some(backend)) = (&wallet_address, &backend_address)
        && wallet != backend
    {
        issues.push(SessionIssue::WalletAddressMismatch);
    }
    if backend_address
        .as_ref()
        .is_some_and(|address| !address.is_well_formed())
    {
        issues.push(SessionIssue::InvalidBackendAddressFormat);
    }
    if wallet_address
        .as_ref()
        .is_some_and(|address| !address.is_well_formed())
    {
        issues.push(SessionIssue::InvalidWalletAddressFormat);
    }

    SessionValidation {
        is_valid: issues.is_empty(),
        issues,
        wallet_address,
        backend_address,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    ValidatedExistingSession,
    AwaitWalletConnection,
    AuthenticationRequired,
    ClearedMismatchedAuth,
    ClearedInvalidData,
    NoSession,
}

impl RecoveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryOutcome::ValidatedExistingSession => "validated_existing_session",
            RecoveryOutcome::AwaitWalletConnection => "await_wallet_connection",
            RecoveryOutcome::AuthenticationRequired => "authentication_required",
            RecoveryOutcome::ClearedMismatchedAuth => "cleared_mismatched_auth",
            RecoveryOutcome::ClearedInvalidData => "cleared_invalid_data",
            RecoveryOutcome::NoSession => "no_session",
        }
    }
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State captured before a destructive remediation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateSnapshot {
    pub wallet: WalletConnectionState,
    pub lock: LockSnapshot,
    pub auth: LocalAuthState,
    pub taken_at: DateTime<Utc>,
}

pub struct RecoveryValidator {
    wallet_store: Arc<WalletStore>,
    wallet: Arc<dyn WalletBridge>,
    identity: Arc<dyn IdentityBridge>,
    lock: Arc<AuthLock>,
    auth_state: Arc<AuthStateStore>,
    running: AtomicBool,
    attempted: AtomicBool,
    last_outcome: Mutex<Option<RecoveryOutcome>>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RecoveryValidator {
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
            running: AtomicBool::new(false),
            attempted: AtomicBool::new(false),
            last_outcome: Mutex::new(None),
        }
    }

    pub fn validate(&self) -> SessionValidation {
        let identity = self.identity.subscribe().borrow().clone();
        validate_session(&self.wallet_store.snapshot(), &identity)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once any recovery pass has started.
    pub fn has_attempted(&self) -> bool {
        self.attempted.load(Ordering::SeqCst)
    }

    pub fn last_outcome(&self) -> Option<RecoveryOutcome> {
        *self.last_outcome.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run one recovery pass. Returns `Ok(None)` when a pass is already in
    /// flight.
    pub async fn recover(&self) -> Result<Option<RecoveryOutcome>, RecoveryError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("recovery already in progress");
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);
        self.attempted.store(true, Ordering::SeqCst);

        let outcome = self.recover_inner().await?;
        tracing::info!(outcome = outcome.as_str(), "session recovery finished");
        *self.last_outcome.lock().unwrap_or_else(|p| p.into_inner()) = Some(outcome);
        Ok(Some(outcome))
    }

    async fn recover_inner(&self) -> Result<RecoveryOutcome, RecoveryError> {
        let wallet = self.wallet_store.snapshot();
        let identity = self.identity.subscribe().borrow().clone();
        let validation = validate_session(&wallet, &identity);

        if validation.is_valid {
            self.sync_valid_session(&wallet, &identity)?;
            return Ok(RecoveryOutcome::ValidatedExistingSession);
        }

        let backend_authenticated = identity.is_authenticated;
        let wallet_connected = validation.wallet_address.is_some();

        if backend_authenticated && !wallet_connected {
            tracing::debug!("backend session present, waiting for wallet to reconnect");
            return Ok(RecoveryOutcome::AwaitWalletConnection);
        }
        if wallet_connected && !backend_authenticated {
            return Ok(RecoveryOutcome::AuthenticationRequired);
        }
        if validation.has_issue(SessionIssue::WalletAddressMismatch) {
            tracing::warn!(
                wallet = ?validation.wallet_address.as_ref().map(WalletAddress::short),
                backend = ?validation.backend_address.as_ref().map(WalletAddress::short),
                "wallet and backend disagree, clearing backend session"
            );
            self.clear_mismatched_auth().await?;
            return Ok(RecoveryOutcome::ClearedMismatchedAuth);
        }
        if validation.issues.iter().any(|issue| issue.is_format_issue()) {
            tracing::warn!(issues = ?validation.issues, "malformed session data, clearing");
            self.clear_invalid_data().await?;
            return Ok(RecoveryOutcome::ClearedInvalidData);
        }
        Ok(RecoveryOutcome::NoSession)
    }

    fn sync_valid_session(
        &self,
        wallet: &WalletConnectionState,
        identity: &BackendIdentityState,
    ) -> Result<(), RecoveryError> {
        let (Some(wallet_address), Some(backend_address)) =
            (wallet.connected_address(), identity.authenticated_address())
        else {
            return Err(RecoveryError::SessionCorruption {
                reason: "validated session lost an address".to_string(),
            });
        };
        if wallet_address != backend_address || !wallet_address.is_well_formed() {
            return Err(RecoveryError::SessionCorruption {
                reason: format!(
                    "wallet {} and backend {} disagree after validation",
                    wallet_address.short(),
                    backend_address.short()
                ),
            });
        }

        let address = wallet_address.clone();
        self.auth_state.update(|state| {
            state.auth_wallet_address = Some(address);
            state.is_authenticating = false;
            state.auth_error = None;
        });
        Ok(())
    }

    fn take_snapshot(&self) -> SessionStateSnapshot {
        SessionStateSnapshot {
            wallet: self.wallet_store.snapshot(),
            lock: self.lock.snapshot().snapshot(),
            auth: self.auth_state.snapshot(),
            taken_at: Utc::now(),
        }
    }

    fn rollback(&self, snapshot: SessionStateSnapshot) {
        tracing::warn!(taken_at = %snapshot.taken_at, "rolling back failed remediation");
        self.wallet_store.publish(snapshot.wallet);
        self.lock.restore(&snapshot.lock);
        self.auth_state.restore(snapshot.auth);
    }

    async fn clear_mismatched_auth(&self) -> Result<(), RecoveryError> {
        let snapshot = self.take_snapshot();
        if let Err(source) = self.identity.sign_out().await {
            self.rollback(snapshot);
            return Err(RecoveryError::RemediationFailed {
                step: "sign_out",
                source,
            });
        }
        self.auth_state.reset();
        Ok(())
    }

    async fn clear_invalid_data(&self) -> Result<(), RecoveryError> {
        let snapshot = self.take_snapshot();
        if let Err(source) = self.identity.sign_out().await {
            self.rollback(snapshot);
            return Err(RecoveryError::RemediationFailed {
                step: "sign_out",
                source,
            });
        }
        self.auth_state.reset();
        if let Err(source) = self.wallet.disconnect().await {
            self.rollback(snapshot);
            return Err(RecoveryError::RemediationFailed {
                step: "wallet_disconnect",
                source,
            });
        }
        self.wallet_store.publish(WalletConnectionState::disconnected());
        Ok(())
    }
}

/// Startup pass: once the backend has finished loading its persisted
/// session, wait `settle` and recover if nothing else has tried yet.
pub fn spawn_startup_recovery(
    validator: Arc<RecoveryValidator>,
    settle: Duration,
) -> JoinHandle<()> {
    let mut identity_rx = validator.identity.subscribe();
    tokio::spawn(async move {
        let ready = identity_rx.wait_for(|state| !state.is_loading).await.is_ok();
        if !ready {
            return;
        }
        tokio::time::sleep(settle).await;

        if validator.has_attempted() {
            tracing::debug!("startup recovery skipped, a pass already ran");
            return;
        }
        match validator.recover().await {
            Ok(Some(outcome)) => {
                tracing::debug!(outcome = outcome.as_str(), "startup recovery complete");
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "startup recovery failed"),
        }
    })
}
