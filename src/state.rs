//! Observable state containers shared by the reconciliation components.
//!
//! Each container wraps a `tokio::sync::watch` channel: readers take cheap
//! snapshots with [`borrow`](tokio::sync::watch::Receiver::borrow) or await
//! changes on a subscribed receiver, and every mutation notifies all
//! subscribers. Multi-field updates are applied inside a single
//! `send_modify`/`send_if_modified` closure, so no observer can see a
//! half-applied transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::address::{WalletAddress, addresses_match};
use crate::error::AuthError;

/// Snapshot of the wallet SDK's connection status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletConnectionState {
    pub is_connected: bool,
    pub address: Option<WalletAddress>,
    pub chain_id: Option<u64>,
}

impl WalletConnectionState {
    pub fn connected(address: impl Into<WalletAddress>, chain_id: u64) -> Self {
        Self {
            is_connected: true,
            address: Some(address.into()),
            chain_id: Some(chain_id),
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Connected with an address present; the only shape that counts as a
    /// usable connection.
    pub fn connected_address(&self) -> Option<&WalletAddress> {
        if self.is_connected {
            self.address.as_ref()
        } else {
            None
        }
    }
}

/// Profile data the identity provider attaches to an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub uid: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Live status of the backend identity provider's session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendIdentityState {
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub address: Option<WalletAddress>,
    pub user: Option<UserRecord>,
}

impl BackendIdentityState {
    pub fn authenticated(address: impl Into<WalletAddress>) -> Self {
        let address = address.into();
        Self {
            is_authenticated: true,
            is_loading: false,
            user: Some(UserRecord {
                uid: address.normalized(),
                display_name: None,
            }),
            address: Some(address),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn loading() -> Self {
        Self {
            is_loading: true,
            ..Self::default()
        }
    }

    pub fn authenticated_address(&self) -> Option<&WalletAddress> {
        if self.is_authenticated {
            self.address.as_ref()
        } else {
            None
        }
    }
}

/// Local auth-state owned by the core and read by the UI layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalAuthState {
    pub is_authenticating: bool,
    pub auth_error: Option<AuthError>,
    pub auth_wallet_address: Option<WalletAddress>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl LocalAuthState {
    /// A recorded address with no pending run and no surfaced error.
    pub fn has_valid_session(&self) -> bool {
        self.auth_wallet_address.is_some() && self.auth_error.is_none() && !self.is_authenticating
    }
}

/// Write-through mirror of the wallet SDK's connection samples.
#[derive(Debug)]
pub struct WalletStore {
    tx: watch::Sender<WalletConnectionState>,
}

impl Default for WalletStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(WalletConnectionState::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> WalletConnectionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WalletConnectionState> {
        self.tx.subscribe()
    }

    /// Mirror a new sample. Identical samples do not wake observers.
    pub fn publish(&self, sample: WalletConnectionState) {
        self.tx.send_if_modified(|current| {
            if *current == sample {
                return false;
            }
            *current = sample;
            true
        });
    }
}

/// Container for [`LocalAuthState`].
#[derive(Debug)]
pub struct AuthStateStore {
    tx: watch::Sender<LocalAuthState>,
}

impl Default for AuthStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthStateStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LocalAuthState::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> LocalAuthState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LocalAuthState> {
        self.tx.subscribe()
    }

    pub fn is_authenticating(&self) -> bool {
        self.tx.borrow().is_authenticating
    }

    pub fn auth_error(&self) -> Option<AuthError> {
        self.tx.borrow().auth_error.clone()
    }

    pub fn auth_wallet_address(&self) -> Option<WalletAddress> {
        self.tx.borrow().auth_wallet_address.clone()
    }

    pub fn has_valid_session(&self) -> bool {
        self.tx.borrow().has_valid_session()
    }

    /// Local session agrees with both external sources.
    pub fn is_session_valid(
        &self,
        wallet: &WalletConnectionState,
        identity: &BackendIdentityState,
    ) -> bool {
        let local = self.tx.borrow();
        local.has_valid_session()
            && addresses_match(local.auth_wallet_address.as_ref(), wallet.connected_address())
            && addresses_match(
                local.auth_wallet_address.as_ref(),
                identity.authenticated_address(),
            )
    }

    /// Apply a multi-field update as one transaction. Updates that leave
    /// every field as it was do not wake observers.
    pub fn update(&self, apply: impl FnOnce(&mut LocalAuthState)) {
        self.tx.send_if_modified(|state| {
            let before = state.clone();
            apply(state);
            state.updated_at = before.updated_at;
            if *state == before {
                return false;
            }
            state.updated_at = Some(Utc::now());
            true
        });
    }

    pub fn begin_authentication(&self) {
        self.update(|state| {
            state.is_authenticating = true;
            state.auth_error = None;
        });
    }

    pub fn record_success(&self, address: WalletAddress) {
        self.update(|state| {
            state.is_authenticating = false;
            state.auth_error = None;
            state.auth_wallet_address = Some(address);
        });
    }

    pub fn record_failure(&self, error: AuthError) {
        self.update(|state| {
            state.is_authenticating = false;
            state.auth_error = Some(error);
        });
    }

    pub fn finish_without_result(&self) {
        self.update(|state| state.is_authenticating = false);
    }

    pub fn clear_error(&self) {
        self.tx.send_if_modified(|state| state.auth_error.take().is_some());
    }

    pub fn reset(&self) {
        self.update(|state| {
            *state = LocalAuthState::default();
        });
    }

    pub(crate) fn restore(&self, snapshot: LocalAuthState) {
        self.tx.send_replace(snapshot);
    }
}
