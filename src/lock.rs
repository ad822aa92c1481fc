//! Authentication lock: at most one pipeline run holds it at any instant.
//!
//! The lock state lives in a `watch` channel so the reconciler can observe
//! it, and the test-and-set in [`AuthLock::try_acquire`] runs inside
//! `send_if_modified`, which holds the channel's write lock for the whole
//! closure. That makes acquisition atomic even on a multi-threaded runtime.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::address::WalletAddress;

/// Cooperative cancellation token for one pipeline run.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender is owned by `self`, so `wait_for` cannot observe a
        // closed channel while this future is alive.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug, Clone, Default)]
pub struct LockState {
    pub is_locked: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub address: Option<WalletAddress>,
    pub cancel_handle: Option<CancelHandle>,
    generation: u64,
}

impl LockState {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            is_locked: self.is_locked,
            start_time: self.start_time,
            address: self.address.clone(),
        }
    }
}

/// Cancel-handle-free capture of the lock, taken before destructive
/// recovery remediation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSnapshot {
    pub is_locked: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub address: Option<WalletAddress>,
}

/// Proof of a successful acquisition, scoped to one generation of the lock.
#[derive(Debug, Clone)]
pub struct LockLease {
    generation: u64,
    address: WalletAddress,
    cancel: CancelHandle,
}

impl LockLease {
    pub fn address(&self) -> &WalletAddress {
        &self.address
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug)]
pub struct AuthLock {
    tx: watch::Sender<LockState>,
}

impl Default for AuthLock {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthLock {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LockState::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> LockState {
        self.tx.borrow().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.tx.borrow().is_locked
    }

    pub fn holder(&self) -> Option<WalletAddress> {
        let state = self.tx.borrow();
        if state.is_locked {
            state.address.clone()
        } else {
            None
        }
    }

    /// Returns true iff the lock was free and is now held for `address`.
    pub fn acquire(&self, address: &WalletAddress) -> bool {
        self.try_acquire(address).is_some()
    }

    /// Like [`acquire`](Self::acquire) but hands back a lease so the caller
    /// can release exactly its own generation.
    pub fn try_acquire(&self, address: &WalletAddress) -> Option<LockLease> {
        let mut lease = None;
        self.tx.send_if_modified(|state| {
            if state.is_locked {
                return false;
            }
            let cancel = CancelHandle::new();
            let generation = state.generation + 1;
            *state = LockState {
                is_locked: true,
                start_time: Some(Utc::now()),
                address: Some(address.clone()),
                cancel_handle: Some(cancel.clone()),
                generation,
            };
            lease = Some(LockLease {
                generation,
                address: address.clone(),
                cancel,
            });
            true
        });

        match &lease {
            Some(_) => tracing::debug!(address = %address.short(), "authentication lock acquired"),
            None => tracing::debug!(
                address = %address.short(),
                "authentication lock busy, yielding to in-flight run"
            ),
        }
        lease
    }

    /// Fire any pending cancel handle and reset to the unlocked default.
    /// No-op when already unlocked.
    pub fn release(&self) {
        self.release_matching(|_| true);
    }

    /// Release only if `lease` still owns the lock.
    pub fn release_lease(&self, lease: &LockLease) -> bool {
        self.release_matching(|state| state.generation == lease.generation)
    }

    fn release_matching(&self, owns: impl FnOnce(&LockState) -> bool) -> bool {
        self.tx.send_if_modified(|state| {
            if !state.is_locked || !owns(state) {
                return false;
            }
            if let Some(handle) = state.cancel_handle.take() {
                handle.cancel();
            }
            let generation = state.generation;
            *state = LockState {
                generation,
                ..LockState::default()
            };
            tracing::debug!("authentication lock released");
            true
        })
    }

    /// Reinstate a snapshot taken before remediation, if the lock is free.
    pub(crate) fn restore(&self, snapshot: &LockSnapshot) {
        if !snapshot.is_locked {
            return;
        }
        self.tx.send_if_modified(|state| {
            if state.is_locked {
                return false;
            }
            state.is_locked = true;
            state.start_time = snapshot.start_time;
            state.address = snapshot.address.clone();
            state.cancel_handle = Some(CancelHandle::new());
            state.generation += 1;
            true
        });
    }
}
