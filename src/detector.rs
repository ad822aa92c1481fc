//! Connection edge detection.
//!
//! Turns the wallet SDK's continuous connection signal into discrete
//! new-connection / disconnection events. New connections are debounced so a
//! burst of connect/disconnect churn produces a single notification for the
//! state the wallet settles in; disconnections fire immediately. Chain
//! switches for the same address never produce an event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::address::WalletAddress;
use crate::bridge::WalletSamples;
use crate::state::{WalletConnectionState, WalletStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    NewConnection {
        address: WalletAddress,
        chain_id: Option<u64>,
    },
    Disconnection,
}

/// Classification of one sample against the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Connected(WalletAddress),
    Disconnected,
    AddressChanged {
        from: WalletAddress,
        to: WalletAddress,
    },
    ChainSwitched {
        from: Option<u64>,
        to: Option<u64>,
    },
    Unchanged,
}

/// A sample only counts as connected when it also carries an address.
pub fn classify(previous: &WalletConnectionState, next: &WalletConnectionState) -> Transition {
    match (previous.connected_address(), next.connected_address()) {
        (None, Some(address)) => Transition::Connected(address.clone()),
        (Some(_), None) => Transition::Disconnected,
        (Some(from), Some(to)) if from != to => Transition::AddressChanged {
            from: from.clone(),
            to: to.clone(),
        },
        (Some(_), Some(_)) if previous.chain_id != next.chain_id => Transition::ChainSwitched {
            from: previous.chain_id,
            to: next.chain_id,
        },
        _ => Transition::Unchanged,
    }
}

pub struct ConnectionEdgeDetector {
    previous: WalletConnectionState,
    debounce: Duration,
    store: Arc<WalletStore>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    pending: Option<JoinHandle<()>>,
}

impl ConnectionEdgeDetector {
    /// The retained sample starts out disconnected, so a wallet that is
    /// already connected when the detector starts is reported as a fresh
    /// connection.
    pub fn new(
        store: Arc<WalletStore>,
        debounce: Duration,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            previous: WalletConnectionState::disconnected(),
            debounce,
            store,
            events,
            pending: None,
        }
    }

    /// Feed one SDK sample. Must be called from within a Tokio runtime.
    pub fn observe(&mut self, sample: WalletConnectionState) -> Transition {
        self.store.publish(sample.clone());

        let transition = classify(&self.previous, &sample);
        match &transition {
            Transition::Connected(address) => {
                tracing::debug!(address = %address.short(), "wallet connected, scheduling authentication");
                self.schedule_new_connection(address.clone());
            }
            Transition::Disconnected => {
                tracing::debug!("wallet disconnected");
                self.cancel_pending();
                self.emit(ConnectionEvent::Disconnection);
            }
            Transition::AddressChanged { from, to } => {
                tracing::info!(
                    from = %from.short(),
                    to = %to.short(),
                    "wallet account changed, treating as reconnect"
                );
                self.cancel_pending();
                self.emit(ConnectionEvent::Disconnection);
                self.schedule_new_connection(to.clone());
            }
            Transition::ChainSwitched { from, to } => {
                tracing::debug!(?from, ?to, "chain switched, authentication unaffected");
            }
            Transition::Unchanged => {}
        }

        self.previous = sample;
        transition
    }

    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel any scheduled notification.
    pub fn shutdown(&mut self) {
        self.cancel_pending();
    }

    /// Drive the detector from an SDK subscription until it closes.
    pub async fn run(mut self, mut samples: WalletSamples) {
        while let Some(sample) = samples.recv().await {
            self.observe(sample);
        }
        tracing::debug!("wallet subscription closed, stopping edge detector");
    }

    fn schedule_new_connection(&mut self, address: WalletAddress) {
        self.cancel_pending();

        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let debounce = self.debounce;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            // Chain switches during the window are folded into the event.
            let current = store.snapshot();
            if current.connected_address() != Some(&address) {
                tracing::debug!(address = %address.short(), "debounced connection went stale");
                return;
            }
            let _ = events.send(ConnectionEvent::NewConnection {
                address,
                chain_id: current.chain_id,
            });
        }));
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("connection event receiver dropped");
        }
    }
}

impl Drop for ConnectionEdgeDetector {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
