//! Authentication pipeline.
//!
//! One run takes a connected wallet from "no backend session" to "backend
//! session established":
//!
//! 1. `connect-wallet`: the caller already holds a connected address.
//! 2. `acquire-lock`: yield silently if another run holds the lock.
//! 3. `generate-message`: fetch a single-use challenge.
//! 4. `request-signature`: prompt the wallet.
//! 5. `verify-signature`: local checkpoint; the backend verifies.
//! 6. `firebase-auth`: exchange the signature for a token and activate it,
//!    with stabilization and linear backoff for Safe wallets.
//!
//! A run is cancelled when its lock generation is released by someone else
//! (disconnect, account switch, reconciler remediation). Dropping the inner
//! future at that point abandons any in-flight bridge call.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::address::WalletAddress;
use crate::bridge::{
    GeneratedChallenge, IdentityBridge, SessionToken, TokenExchangeRequest, WalletBridge,
};
use crate::config::AuthConfig;
use crate::error::{AuthError, ErrorKind};
use crate::lock::{AuthLock, LockLease};
use crate::state::AuthStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStep {
    ConnectWallet,
    AcquireLock,
    GenerateMessage,
    RequestSignature,
    VerifySignature,
    FirebaseAuth,
}

impl AuthStep {
    pub const ALL: [AuthStep; 6] = [
        AuthStep::ConnectWallet,
        AuthStep::AcquireLock,
        AuthStep::GenerateMessage,
        AuthStep::RequestSignature,
        AuthStep::VerifySignature,
        AuthStep::FirebaseAuth,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AuthStep::ConnectWallet => "connect-wallet",
            AuthStep::AcquireLock => "acquire-lock",
            AuthStep::GenerateMessage => "generate-message",
            AuthStep::RequestSignature => "request-signature",
            AuthStep::VerifySignature => "verify-signature",
            AuthStep::FirebaseAuth => "firebase-auth",
        }
    }
}

impl std::fmt::Display for AuthStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step-by-step progress sink for UI layers. Every method defaults to a
/// no-op.
pub trait ProgressObserver: Send + Sync {
    fn on_step_start(&self, _step: AuthStep) {}
    fn on_step_complete(&self, _step: AuthStep) {}
    /// `message` is the redacted technical message. The user-facing text is
    /// on the surfaced [`AuthError`].
    fn on_step_fail(&self, _step: AuthStep, _message: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "step", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started(AuthStep),
    Completed(AuthStep),
    Failed(AuthStep, String),
}

/// Records every progress callback in order.
#[derive(Debug, Default)]
pub struct ProgressLog {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn push(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}

impl ProgressObserver for ProgressLog {
    fn on_step_start(&self, step: AuthStep) {
        self.push(ProgressEvent::Started(step));
    }

    fn on_step_complete(&self, step: AuthStep) {
        self.push(ProgressEvent::Completed(step));
    }

    fn on_step_fail(&self, step: AuthStep, message: &str) {
        self.push(ProgressEvent::Failed(step, message.to_string()));
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Authenticated { address: WalletAddress },
    /// Another run held the lock.
    Yielded,
    /// The lock generation was released out from under this run.
    Cancelled,
}

/// Bounded set of challenge nonces already sent to the backend.
#[derive(Debug)]
struct NonceLedger {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl NonceLedger {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, nonce: &str) -> bool {
        self.seen.contains(nonce)
    }

    /// False if the nonce was already consumed.
    fn consume(&mut self, nonce: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(nonce.to_string()) {
            return false;
        }
        self.order.push_back(nonce.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

pub struct AuthPipeline {
    wallet: Arc<dyn WalletBridge>,
    identity: Arc<dyn IdentityBridge>,
    lock: Arc<AuthLock>,
    auth_state: Arc<AuthStateStore>,
    config: AuthConfig,
    nonces: Mutex<NonceLedger>,
}

impl AuthPipeline {
    pub fn new(
        wallet: Arc<dyn WalletBridge>,
        identity: Arc<dyn IdentityBridge>,
        lock: Arc<AuthLock>,
        auth_state: Arc<AuthStateStore>,
        config: AuthConfig,
    ) -> Self {
        let nonces = Mutex::new(NonceLedger::new(config.nonce_history));
        Self {
            wallet,
            identity,
            lock,
            auth_state,
            config,
            nonces,
        }
    }

    /// Run the pipeline for `address`.
    ///
    /// Failures are recorded in the auth-state store and returned; the lock
    /// generation this run acquired is always released on the way out.
    pub async fn run(
        &self,
        address: &WalletAddress,
        chain_id: u64,
        progress: &dyn ProgressObserver,
    ) -> Result<RunOutcome, AuthError> {
        progress.on_step_start(AuthStep::ConnectWallet);
        progress.on_step_complete(AuthStep::ConnectWallet);

        let Some(lease) = self.lock.try_acquire(address) else {
            return Ok(RunOutcome::Yielded);
        };
        progress.on_step_start(AuthStep::AcquireLock);
        self.auth_state.begin_authentication();
        progress.on_step_complete(AuthStep::AcquireLock);

        tracing::info!(address = %address.short(), chain_id, "authentication started");

        let cancel = lease.cancel_handle().clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(address = %address.short(), "authentication superseded, abandoning run");
                return Ok(RunOutcome::Cancelled);
            }
            result = self.execute(&lease, chain_id, progress) => result,
        };

        self.lock.release_lease(&lease);
        match result {
            Ok(()) => {
                self.auth_state.record_success(address.clone());
                tracing::info!(address = %address.short(), "authentication complete");
                Ok(RunOutcome::Authenticated {
                    address: address.clone(),
                })
            }
            Err(error) => {
                tracing::warn!(
                    address = %address.short(),
                    kind = error.kind.as_str(),
                    error = %error.message,
                    "authentication failed"
                );
                self.auth_state.record_failure(error.clone());
                Err(error)
            }
        }
    }

    async fn execute(
        &self,
        lease: &LockLease,
        chain_id: u64,
        progress: &dyn ProgressObserver,
    ) -> Result<(), AuthError> {
        let address = lease.address();

        progress.on_step_start(AuthStep::GenerateMessage);
        let challenge = self
            .generate_challenge(address)
            .await
            .map_err(|e| fail(progress, AuthStep::GenerateMessage, e))?;
        progress.on_step_complete(AuthStep::GenerateMessage);

        progress.on_step_start(AuthStep::RequestSignature);
        let signer = self.wallet.signer_kind();
        let payload = challenge.signing_payload(address, signer);
        let signature = self
            .wallet
            .request_signature(&payload, signer)
            .await
            .map_err(|e| {
                fail(
                    progress,
                    AuthStep::RequestSignature,
                    AuthError::from_signature_failure(&e),
                )
            })?;
        progress.on_step_complete(AuthStep::RequestSignature);

        // Verification happens server-side during the exchange.
        progress.on_step_start(AuthStep::VerifySignature);
        progress.on_step_complete(AuthStep::VerifySignature);

        progress.on_step_start(AuthStep::FirebaseAuth);
        if !self.consume_nonce(&challenge.nonce) {
            return Err(fail(
                progress,
                AuthStep::FirebaseAuth,
                AuthError::new(
                    ErrorKind::AuthenticationFailed,
                    "challenge nonce was already exchanged",
                ),
            ));
        }
        let request = TokenExchangeRequest {
            address: address.clone(),
            signature: signature.signature,
            chain_id,
            signature_type: signature.signature_type,
            nonce: challenge.nonce,
            device_id: self.config.device_id.clone(),
            platform: self.config.platform,
        };
        let token = self
            .identity
            .exchange_signature_for_token(&request)
            .await
            .map_err(|e| {
                fail(
                    progress,
                    AuthStep::FirebaseAuth,
                    AuthError::from_backend_failure(&e),
                )
            })?;

        let activation = if signature.signature_type.is_safe() {
            self.activate_safe_session(&token).await
        } else {
            self.identity
                .activate_session(&token)
                .await
                .map_err(|e| AuthError::from_backend_failure(&e))
        };
        activation.map_err(|e| fail(progress, AuthStep::FirebaseAuth, e))?;
        progress.on_step_complete(AuthStep::FirebaseAuth);
        Ok(())
    }

    async fn generate_challenge(
        &self,
        address: &WalletAddress,
    ) -> Result<GeneratedChallenge, AuthError> {
        let payload = self
            .identity
            .generate_challenge(address)
            .await
            .map_err(|e| AuthError::from_backend_failure(&e))?;
        let challenge = GeneratedChallenge::try_from(payload)
            .map_err(|detail| AuthError::new(ErrorKind::AuthenticationFailed, detail))?;

        let replayed = self
            .nonces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&challenge.nonce);
        if replayed {
            return Err(AuthError::new(
                ErrorKind::AuthenticationFailed,
                "backend issued a challenge nonce that was already used",
            ));
        }
        Ok(challenge)
    }

    fn consume_nonce(&self, nonce: &str) -> bool {
        self.nonces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .consume(nonce)
    }

    /// Safe wallets need the backend to index the signature before the
    /// session can be activated: wait, then retry with linear backoff.
    async fn activate_safe_session(&self, token: &SessionToken) -> Result<(), AuthError> {
        tokio::time::sleep(self.config.safe_stabilization_delay).await;

        let mut attempt = 0;
        loop {
            match self.identity.activate_session(token).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.safe_activation_retries => {
                    attempt += 1;
                    let backoff = self.config.safe_backoff(attempt);
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Safe session activation failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(AuthError::from_backend_failure(&e)),
            }
        }
    }
}

fn fail(progress: &dyn ProgressObserver, step: AuthStep, error: AuthError) -> AuthError {
    progress.on_step_fail(step, &error.message);
    error
}
