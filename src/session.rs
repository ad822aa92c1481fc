//! Wires the detector, pipeline, reconciler and recovery validator around a
//! pair of bridges and exposes the external trigger surface.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::address::WalletAddress;
use crate::bridge::{IdentityBridge, WalletBridge};
use crate::config::AuthConfig;
use crate::detector::{ConnectionEdgeDetector, ConnectionEvent};
use crate::error::{AuthError, ErrorKind, RecoveryError};
use crate::lock::AuthLock;
use crate::pipeline::{AuthPipeline, NoopProgress, ProgressObserver, RunOutcome};
use crate::reconciler::{ReconcileOutcome, ReconcilerHandle, SessionReconciler, spawn_reconciler};
use crate::recovery::{RecoveryOutcome, RecoveryValidator, SessionValidation, spawn_startup_recovery};
use crate::state::{AuthStateStore, BackendIdentityState, WalletConnectionState, WalletStore};

pub type RunHandle = JoinHandle<Result<RunOutcome, AuthError>>;

pub struct AuthSession {
    config: AuthConfig,
    wallet: Arc<dyn WalletBridge>,
    identity: Arc<dyn IdentityBridge>,
    wallet_store: Arc<WalletStore>,
    auth_state: Arc<AuthStateStore>,
    lock: Arc<AuthLock>,
    pipeline: Arc<AuthPipeline>,
    reconciler: Arc<SessionReconciler>,
    recovery: Arc<RecoveryValidator>,
    progress: Arc<dyn ProgressObserver>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconciler_handle: Mutex<Option<ReconcilerHandle>>,
}

impl AuthSession {
    pub fn new(
        config: AuthConfig,
        wallet: Arc<dyn WalletBridge>,
        identity: Arc<dyn IdentityBridge>,
    ) -> Arc<Self> {
        Self::with_progress(config, wallet, identity, Arc::new(NoopProgress))
    }

    /// Build a session with configuration resolved from env vars and the
    /// default TOML file.
    pub fn from_env(
        wallet: Arc<dyn WalletBridge>,
        identity: Arc<dyn IdentityBridge>,
    ) -> crate::Result<Arc<Self>> {
        let config = AuthConfig::from_env()?;
        Ok(Self::new(config, wallet, identity))
    }

    pub fn with_progress(
        config: AuthConfig,
        wallet: Arc<dyn WalletBridge>,
        identity: Arc<dyn IdentityBridge>,
        progress: Arc<dyn ProgressObserver>,
    ) -> Arc<Self> {
        let wallet_store = Arc::new(WalletStore::new());
        let auth_state = Arc::new(AuthStateStore::new());
        let lock = Arc::new(AuthLock::new());

        let pipeline = Arc::new(AuthPipeline::new(
            Arc::clone(&wallet),
            Arc::clone(&identity),
            Arc::clone(&lock),
            Arc::clone(&auth_state),
            config.clone(),
        ));
        let reconciler = Arc::new(SessionReconciler::new(
            Arc::clone(&wallet_store),
            Arc::clone(&wallet),
            Arc::clone(&identity),
            Arc::clone(&lock),
            Arc::clone(&auth_state),
        ));
        let recovery = Arc::new(RecoveryValidator::new(
            Arc::clone(&wallet_store),
            Arc::clone(&wallet),
            Arc::clone(&identity),
            Arc::clone(&lock),
            Arc::clone(&auth_state),
        ));

        Arc::new(Self {
            config,
            wallet,
            identity,
            wallet_store,
            auth_state,
            lock,
            pipeline,
            reconciler,
            recovery,
            progress,
            tasks: Mutex::new(Vec::new()),
            reconciler_handle: Mutex::new(None),
        })
    }

    /// Spawn the background tasks: edge detector, event dispatch, drift
    /// reconciler and the one-shot startup recovery.
    pub fn start(self: &Arc<Self>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let detector = ConnectionEdgeDetector::new(
            Arc::clone(&self.wallet_store),
            self.config.connect_debounce,
            events_tx,
        );
        let detector_task = tokio::spawn(detector.run(self.wallet.subscribe()));
        let dispatch_task = tokio::spawn(dispatch_events(Arc::downgrade(self), events_rx));
        let recovery_task = spawn_startup_recovery(
            Arc::clone(&self.recovery),
            self.config.recovery_settle_delay,
        );

        *self
            .reconciler_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(spawn_reconciler(Arc::clone(&self.reconciler)));
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend([detector_task, dispatch_task, recovery_task]);

        tracing::info!(
            device_id = %self.config.device_id,
            platform = self.config.platform.as_str(),
            "auth session started"
        );
    }

    /// Stop background tasks and cancel any in-flight run.
    pub fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            task.abort();
        }
        if let Some(handle) = self
            .reconciler_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.stop();
        }
        self.lock.release();
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn auth_state(&self) -> &Arc<AuthStateStore> {
        &self.auth_state
    }

    pub fn wallet_store(&self) -> &Arc<WalletStore> {
        &self.wallet_store
    }

    pub fn lock(&self) -> &Arc<AuthLock> {
        &self.lock
    }

    pub fn wallet_state(&self) -> WalletConnectionState {
        self.wallet_store.snapshot()
    }

    pub fn identity_state(&self) -> BackendIdentityState {
        self.identity.subscribe().borrow().clone()
    }

    pub fn validate(&self) -> SessionValidation {
        self.recovery.validate()
    }

    pub fn last_recovery_outcome(&self) -> Option<RecoveryOutcome> {
        self.recovery.last_outcome()
    }

    pub fn is_session_valid(&self) -> bool {
        self.auth_state
            .is_session_valid(&self.wallet_state(), &self.identity_state())
    }

    pub async fn reconcile(&self) -> ReconcileOutcome {
        self.reconciler.reconcile().await
    }

    pub async fn trigger_recovery(&self) -> Result<Option<RecoveryOutcome>, RecoveryError> {
        self.recovery.recover().await
    }

    /// Run the pipeline for the currently connected wallet, clearing any
    /// previous error first.
    pub async fn trigger_authentication(&self) -> Result<RunOutcome, AuthError> {
        let wallet = self.wallet_store.snapshot();
        let (Some(address), Some(chain_id)) = (wallet.connected_address(), wallet.chain_id) else {
            return Err(AuthError::new(
                ErrorKind::AuthenticationFailed,
                "no connected wallet to authenticate",
            )
            .with_user_message("Connect your wallet to continue."));
        };
        self.auth_state.clear_error();
        self.pipeline
            .run(address, chain_id, self.progress.as_ref())
            .await
    }

    /// React to a settled new connection. Returns `None` when the backend is
    /// already authenticated for `address`.
    pub fn on_new_connection(&self, address: WalletAddress, chain_id: u64) -> Option<RunHandle> {
        let identity = self.identity_state();
        if identity.authenticated_address() == Some(&address) {
            tracing::debug!(address = %address.short(), "backend already authenticated for wallet");
            self.auth_state.update(|state| {
                state.auth_wallet_address = Some(address);
                state.is_authenticating = false;
                state.auth_error = None;
            });
            return None;
        }

        if let Some(holder) = self.lock.holder()
            && holder != address
        {
            tracing::info!(
                previous = %holder.short(),
                next = %address.short(),
                "superseding authentication for previous wallet"
            );
            self.lock.release();
        }

        let pipeline = Arc::clone(&self.pipeline);
        let progress = Arc::clone(&self.progress);
        Some(tokio::spawn(async move {
            pipeline.run(&address, chain_id, progress.as_ref()).await
        }))
    }

    pub fn on_disconnection(&self) {
        if self.lock.is_locked() {
            tracing::info!("wallet disconnected, cancelling in-flight authentication");
            self.lock.release();
        }
        if self.auth_state.is_authenticating() {
            self.auth_state.finish_without_result();
        }
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn dispatch_events(
    session: Weak<AuthSession>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        match event {
            ConnectionEvent::NewConnection {
                address,
                chain_id: Some(chain_id),
            } => {
                session.on_new_connection(address, chain_id);
            }
            ConnectionEvent::NewConnection {
                address,
                chain_id: None,
            } => {
                tracing::warn!(address = %address.short(), "wallet connected without a chain id, not authenticating");
            }
            ConnectionEvent::Disconnection => session.on_disconnection(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bridge::memory::{DEV_WALLET_KEY, InMemoryIdentity, InMemoryWallet};

    fn session() -> (Arc<AuthSession>, Arc<InMemoryWallet>, Arc<InMemoryIdentity>) {
        let wallet = Arc::new(InMemoryWallet::from_key_hex(DEV_WALLET_KEY).unwrap());
        let identity = Arc::new(InMemoryIdentity::new());
        let session = AuthSession::new(AuthConfig::default(), wallet.clone(), identity.clone());
        (session, wallet, identity)
    }

    #[tokio::test]
    async fn trigger_authentication_requires_connected_wallet() {
        let (session, _wallet, _identity) = session();
        let err = session.trigger_authentication().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
    }

    #[tokio::test]
    async fn new_connection_short_circuits_when_backend_matches() {
        let (session, wallet, identity) = session();
        identity.set_state(BackendIdentityState::authenticated(wallet.address().clone()));

        assert!(session.on_new_connection(wallet.address().clone(), 1).is_none());
        assert_eq!(
            session.auth_state().auth_wallet_address(),
            Some(wallet.address().clone())
        );
        assert!(identity.exchange_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_for_new_address_supersedes_held_lock() {
        let (session, wallet, _identity) = session();
        let stale: WalletAddress = "0xcccccccccccccccccccccccccccccccccccccccc".into();
        assert!(session.lock().acquire(&stale));
        let stale_cancel = session.lock().snapshot().cancel_handle.unwrap();

        wallet.connect(1);
        let run = session
            .on_new_connection(wallet.address().clone(), 1)
            .expect("run");
        assert!(stale_cancel.is_cancelled());
        assert!(matches!(
            run.await.unwrap().unwrap(),
            RunOutcome::Authenticated { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnection_cancels_inflight_run() {
        let (session, wallet, _identity) = session();
        wallet.set_signature_delay(Duration::from_secs(60));
        wallet.connect(1);
        let run = session
            .on_new_connection(wallet.address().clone(), 1)
            .expect("run");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.auth_state().is_authenticating());

        session.on_disconnection();
        assert_eq!(run.await.unwrap().unwrap(), RunOutcome::Cancelled);
        assert!(!session.auth_state().is_authenticating());
        assert!(!session.lock().is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn started_session_authenticates_after_debounce() {
        let (session, wallet, identity) = session();
        session.start();
        wallet.connect(1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(identity.exchange_requests().is_empty());

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(
            session.auth_state().auth_wallet_address(),
            Some(wallet.address().clone())
        );
        assert!(session.is_session_valid());
        session.shutdown();
    }
}
