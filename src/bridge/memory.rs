//! In-process wallet and identity bridges.
//!
//! The wallet holds a real secp256k1 key and produces EIP-191 personal-sign
//! signatures; the identity provider issues nonce-bound challenges and
//! verifies those signatures by public-key recovery before minting a session
//! token. Failure injection hooks let callers script rejected signatures,
//! transport errors and flaky session activation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::{Rng, distributions::Alphanumeric};
use sha3::{Digest, Keccak256};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::address::WalletAddress;
use crate::bridge::{
    ChallengePayload, GeneratedChallenge, IdentityBridge, SessionToken, SignatureResult,
    SignatureType, SignerKind, TokenExchangeRequest, WalletBridge, WalletSamples,
};
use crate::error::BridgeError;
use crate::state::{BackendIdentityState, WalletConnectionState};

/// Well-known development key (first Anvil/Hardhat account).
pub const DEV_WALLET_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct WalletFeed {
    current: WalletConnectionState,
    subscribers: Vec<mpsc::UnboundedSender<WalletConnectionState>>,
}

/// Wallet SDK stand-in backed by a local signing key.
pub struct InMemoryWallet {
    key: SigningKey,
    address: WalletAddress,
    feed: Mutex<WalletFeed>,
    fail_disconnects: Mutex<VecDeque<BridgeError>>,
    signer: Mutex<SignerKind>,
    reject_signatures: AtomicBool,
    signature_delay: Mutex<Duration>,
    signed_payloads: Mutex<Vec<String>>,
}

impl InMemoryWallet {
    pub fn from_key_hex(key_hex: &str) -> Result<Self, BridgeError> {
        let bytes = decode_hex_prefixed(key_hex).map_err(BridgeError::Other)?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| BridgeError::Other(format!("invalid signing key: {e}")))?;
        Ok(Self::from_signing_key(key))
    }

    pub fn random() -> Self {
        Self::from_signing_key(SigningKey::random(&mut rand::thread_rng()))
    }

    fn from_signing_key(key: SigningKey) -> Self {
        let address = WalletAddress::new(address_from_verifying_key(key.verifying_key()));
        Self {
            key,
            address,
            feed: Mutex::new(WalletFeed::default()),
            fail_disconnects: Mutex::new(VecDeque::new()),
            signer: Mutex::new(SignerKind::PersonalSign),
            reject_signatures: AtomicBool::new(false),
            signature_delay: Mutex::new(Duration::ZERO),
            signed_payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> &WalletAddress {
        &self.address
    }

    /// Simulate the user connecting this wallet on `chain_id`.
    pub fn connect(&self, chain_id: u64) {
        self.push_state(WalletConnectionState::connected(self.address.clone(), chain_id));
    }

    pub fn switch_chain(&self, chain_id: u64) {
        self.notify(|state| state.chain_id = Some(chain_id));
    }

    /// Push an arbitrary SDK sample, e.g. a different account.
    pub fn push_state(&self, state: WalletConnectionState) {
        self.notify(|current| *current = state);
    }

    /// Make the next `disconnect` call fail without changing state.
    pub fn fail_next_disconnect(&self, error: BridgeError) {
        lock(&self.fail_disconnects).push_back(error);
    }

    fn notify(&self, apply: impl FnOnce(&mut WalletConnectionState)) {
        let mut feed = lock(&self.feed);
        apply(&mut feed.current);
        let sample = feed.current.clone();
        feed.subscribers.retain(|tx| tx.send(sample.clone()).is_ok());
    }

    pub fn set_signer_kind(&self, signer: SignerKind) {
        *lock(&self.signer) = signer;
    }

    pub fn set_reject_signatures(&self, reject: bool) {
        self.reject_signatures.store(reject, Ordering::SeqCst);
    }

    /// Time the simulated user takes to approve a signature.
    pub fn set_signature_delay(&self, delay: Duration) {
        *lock(&self.signature_delay) = delay;
    }

    pub fn signed_payloads(&self) -> Vec<String> {
        lock(&self.signed_payloads).clone()
    }
}

#[async_trait]
impl WalletBridge for InMemoryWallet {
    fn subscribe(&self) -> WalletSamples {
        let mut feed = lock(&self.feed);
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(feed.current.clone()).is_ok() {
            feed.subscribers.push(tx);
        }
        rx
    }

    fn is_connected(&self) -> bool {
        lock(&self.feed).current.is_connected
    }

    fn signer_kind(&self) -> SignerKind {
        *lock(&self.signer)
    }

    async fn request_signature(
        &self,
        message: &str,
        signer: SignerKind,
    ) -> Result<SignatureResult, BridgeError> {
        let delay = *lock(&self.signature_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.reject_signatures.load(Ordering::SeqCst) {
            return Err(BridgeError::Rejected(
                "User rejected the signature request".to_string(),
            ));
        }
        if !self.is_connected() {
            return Err(BridgeError::Other("wallet is not connected".to_string()));
        }

        let signature = sign_personal_message(&self.key, message)?;
        lock(&self.signed_payloads).push(message.to_string());
        let signature_type = match signer {
            SignerKind::PersonalSign => SignatureType::PersonalSign,
            SignerKind::TypedData => SignatureType::TypedData,
            SignerKind::SafeWallet => SignatureType::Safe,
        };
        Ok(SignatureResult {
            signature,
            signature_type,
        })
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        if let Some(error) = lock(&self.fail_disconnects).pop_front() {
            return Err(error);
        }
        self.push_state(WalletConnectionState::disconnected());
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct IssuedChallenge {
    address: WalletAddress,
    challenge: GeneratedChallenge,
}

#[derive(Default)]
struct IdentityFaults {
    challenge: VecDeque<BridgeError>,
    malformed_challenges: usize,
    exchange: VecDeque<BridgeError>,
    activation: VecDeque<BridgeError>,
    sign_out: VecDeque<BridgeError>,
}

/// Identity provider stand-in with signature verification.
pub struct InMemoryIdentity {
    state: watch::Sender<BackendIdentityState>,
    issued: Mutex<HashMap<String, IssuedChallenge>>,
    consumed: Mutex<HashSet<String>>,
    tokens: Mutex<HashMap<String, WalletAddress>>,
    faults: Mutex<IdentityFaults>,
    latency: Mutex<Duration>,
    exchange_requests: Mutex<Vec<TokenExchangeRequest>>,
    activation_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
}

impl Default for InMemoryIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIdentity {
    pub fn new() -> Self {
        Self::with_state(BackendIdentityState::signed_out())
    }

    pub fn with_state(initial: BackendIdentityState) -> Self {
        let (state, _rx) = watch::channel(initial);
        Self {
            state,
            issued: Mutex::new(HashMap::new()),
            consumed: Mutex::new(HashSet::new()),
            tokens: Mutex::new(HashMap::new()),
            faults: Mutex::new(IdentityFaults::default()),
            latency: Mutex::new(Duration::ZERO),
            exchange_requests: Mutex::new(Vec::new()),
            activation_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_state(&self, state: BackendIdentityState) {
        self.state.send_replace(state);
    }

    pub fn state(&self) -> BackendIdentityState {
        self.state.borrow().clone()
    }

    /// Round-trip delay applied to every network call.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn fail_next_challenge(&self, error: BridgeError) {
        lock(&self.faults).challenge.push_back(error);
    }

    /// Next challenge response omits its nonce and timestamp.
    pub fn malform_next_challenge(&self) {
        lock(&self.faults).malformed_challenges += 1;
    }

    pub fn fail_next_exchange(&self, error: BridgeError) {
        lock(&self.faults).exchange.push_back(error);
    }

    pub fn fail_next_activation(&self, error: BridgeError) {
        lock(&self.faults).activation.push_back(error);
    }

    pub fn fail_next_sign_out(&self, error: BridgeError) {
        lock(&self.faults).sign_out.push_back(error);
    }

    pub fn activation_calls(&self) -> usize {
        self.activation_calls.load(Ordering::SeqCst)
    }

    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    pub fn exchange_requests(&self) -> Vec<TokenExchangeRequest> {
        lock(&self.exchange_requests).clone()
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn verify(&self, request: &TokenExchangeRequest) -> Result<(), BridgeError> {
        let issued = lock(&self.issued).get(&request.nonce).cloned().ok_or_else(|| {
            BridgeError::Rejected("unknown or expired challenge nonce".to_string())
        })?;
        if issued.address != request.address {
            return Err(BridgeError::Rejected(
                "challenge was issued for a different wallet".to_string(),
            ));
        }

        let signer = match request.signature_type {
            SignatureType::Safe => SignerKind::SafeWallet,
            SignatureType::TypedData => SignerKind::TypedData,
            SignatureType::PersonalSign => SignerKind::PersonalSign,
        };
        let payload = issued.challenge.signing_payload(&issued.address, signer);
        verify_personal_signature(&payload, &request.signature, &request.address)
            .map_err(BridgeError::Rejected)?;

        if !lock(&self.consumed).insert(request.nonce.clone()) {
            return Err(BridgeError::Rejected(
                "challenge nonce already used".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityBridge for InMemoryIdentity {
    fn subscribe(&self) -> watch::Receiver<BackendIdentityState> {
        self.state.subscribe()
    }

    async fn generate_challenge(
        &self,
        address: &WalletAddress,
    ) -> Result<ChallengePayload, BridgeError> {
        self.simulate_latency().await;
        {
            let mut faults = lock(&self.faults);
            if let Some(error) = faults.challenge.pop_front() {
                return Err(error);
            }
            if faults.malformed_challenges > 0 {
                faults.malformed_challenges -= 1;
                return Ok(ChallengePayload {
                    message: Some("Sign in".to_string()),
                    nonce: None,
                    timestamp: None,
                });
            }
        }

        let nonce = random_nonce(24);
        let issued_at: DateTime<Utc> = Utc::now();
        let message = format!(
            "Sign in to authenticate your wallet\nWallet: {}\nNonce: {nonce}\nIssued At: {}",
            address.normalized(),
            issued_at.to_rfc3339()
        );
        let payload = ChallengePayload {
            message: Some(message.clone()),
            nonce: Some(nonce.clone()),
            timestamp: Some(issued_at.timestamp_millis()),
        };
        let challenge = GeneratedChallenge::try_from(payload.clone()).map_err(BridgeError::Other)?;
        lock(&self.issued).insert(
            nonce,
            IssuedChallenge {
                address: address.clone(),
                challenge,
            },
        );
        Ok(payload)
    }

    async fn exchange_signature_for_token(
        &self,
        request: &TokenExchangeRequest,
    ) -> Result<SessionToken, BridgeError> {
        self.simulate_latency().await;
        lock(&self.exchange_requests).push(request.clone());
        if let Some(error) = lock(&self.faults).exchange.pop_front() {
            return Err(error);
        }
        self.verify(request)?;

        let token = format!("session-{}", Uuid::new_v4());
        lock(&self.tokens).insert(token.clone(), request.address.clone());
        Ok(SessionToken::new(token))
    }

    async fn activate_session(&self, token: &SessionToken) -> Result<(), BridgeError> {
        self.activation_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(error) = lock(&self.faults).activation.pop_front() {
            return Err(error);
        }
        let address = lock(&self.tokens)
            .get(token.expose())
            .cloned()
            .ok_or_else(|| BridgeError::Rejected("unknown session token".to_string()))?;
        self.state
            .send_replace(BackendIdentityState::authenticated(address));
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), BridgeError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(error) = lock(&self.faults).sign_out.pop_front() {
            return Err(error);
        }
        self.state.send_replace(BackendIdentityState::signed_out());
        Ok(())
    }
}

fn random_nonce(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn sign_personal_message(key: &SigningKey, message: &str) -> Result<String, BridgeError> {
    let prehash = eip191_personal_sign_hash(message);
    let (sig, recid) = key
        .sign_prehash_recoverable(&prehash)
        .map_err(|e| BridgeError::Other(format!("signing failed: {e}")))?;
    let mut bytes = sig.to_bytes().to_vec();
    bytes.push(recid.to_byte() + 27);
    Ok(format!("0x{}", encode_hex_lower(&bytes)))
}

fn verify_personal_signature(
    message: &str,
    signature_hex: &str,
    expected: &WalletAddress,
) -> Result<(), String> {
    let signature_bytes = decode_hex_prefixed(signature_hex)?;
    if signature_bytes.len() != 65 {
        return Err("signature must decode to 65 bytes".to_string());
    }

    let sig = EcdsaSignature::try_from(&signature_bytes[..64])
        .map_err(|e| format!("invalid ECDSA signature bytes: {e}"))?;
    let recovery_id = normalize_recovery_id(signature_bytes[64])?;
    let prehash = eip191_personal_sign_hash(message);
    let verifying_key = VerifyingKey::recover_from_prehash(&prehash, &sig, recovery_id)
        .map_err(|e| format!("failed recovering signer from signature: {e}"))?;
    let recovered = WalletAddress::new(address_from_verifying_key(&verifying_key));
    if &recovered != expected {
        return Err("signature does not match wallet address".to_string());
    }
    Ok(())
}

fn normalize_recovery_id(raw: u8) -> Result<RecoveryId, String> {
    let id = match raw {
        27 | 28 => raw - 27,
        0 | 1 => raw,
        _ => return Err("signature recovery id must be 0/1 or 27/28".to_string()),
    };
    RecoveryId::try_from(id).map_err(|_| "signature recovery id is invalid".to_string())
}

fn eip191_personal_sign_hash(message: &str) -> [u8; 32] {
    let bytes = message.as_bytes();
    let prefix = format!("\x19Ethereum Signed Message:\n{}", bytes.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn address_from_verifying_key(key: &VerifyingKey) -> String {
    let encoded = key.to_encoded_point(false);
    let mut hasher = Keccak256::new();
    hasher.update(&encoded.as_bytes()[1..]);
    let digest = hasher.finalize();
    format!("0x{}", encode_hex_lower(&digest[12..]))
}

fn decode_hex_prefixed(value: &str) -> Result<Vec<u8>, String> {
    let hex = value
        .trim()
        .strip_prefix("0x")
        .ok_or_else(|| "hex string must be 0x-prefixed".to_string())?;
    if hex.is_empty() || !hex.len().is_multiple_of(2) {
        return Err("hex string must have a non-zero even length".to_string());
    }
    hex.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16);
            let lo = (pair[1] as char).to_digit(16);
            match (hi, lo) {
                (Some(hi), Some(lo)) => Ok(((hi << 4) | lo) as u8),
                _ => Err("invalid hex character".to_string()),
            }
        })
        .collect()
}

fn encode_hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
