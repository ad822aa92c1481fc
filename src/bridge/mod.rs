//! Contracts for the two external collaborators the core is bound to: the
//! wallet-connection SDK and the backend identity provider.
//!
//! Both are consumed through object-safe async traits so the session can hold
//! them as `Arc<dyn ...>`. [`memory`] provides in-process implementations.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::address::WalletAddress;
use crate::error::BridgeError;
use crate::state::{BackendIdentityState, WalletConnectionState};

/// Signing strategy requested from the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignerKind {
    PersonalSign,
    TypedData,
    SafeWallet,
}

impl SignerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PersonalSign => "personal-sign",
            Self::TypedData => "typed-data",
            Self::SafeWallet => "safe-wallet",
        }
    }
}

/// Signature flavor reported back to the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureType {
    PersonalSign,
    TypedData,
    Safe,
}

impl SignatureType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PersonalSign => "personal_sign",
            Self::TypedData => "typed_data",
            Self::Safe => "safe",
        }
    }

    /// Multi-sig signatures resolve asynchronously and need the
    /// stabilization/backoff treatment during session activation.
    pub fn is_safe(self) -> bool {
        matches!(self, Self::Safe)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureResult {
    pub signature: String,
    pub signature_type: SignatureType,
}

/// Client platform sent alongside the token exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
    Desktop,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Web => "web",
            Self::Desktop => "desktop",
        }
    }

    pub fn current() -> Self {
        match std::env::consts::OS {
            "ios" => Self::Ios,
            "android" => Self::Android,
            _ => Self::Desktop,
        }
    }
}

/// Raw challenge response as returned by the identity provider. Every field
/// is optional on the wire; [`GeneratedChallenge::try_from`] enforces
/// presence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengePayload {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    /// Issue time in epoch milliseconds.
    #[serde(default, alias = "issuedAt", alias = "issued_at")]
    pub timestamp: Option<i64>,
}

/// A validated, single-use signing challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedChallenge {
    pub message: String,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
}

impl TryFrom<ChallengePayload> for GeneratedChallenge {
    type Error = String;

    fn try_from(payload: ChallengePayload) -> Result<Self, Self::Error> {
        let mut missing = Vec::new();
        let message = payload.message.filter(|m| !m.trim().is_empty());
        let nonce = payload.nonce.filter(|n| !n.trim().is_empty());
        let issued_at = payload
            .timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        if message.is_none() {
            missing.push("message");
        }
        if nonce.is_none() {
            missing.push("nonce");
        }
        if issued_at.is_none() {
            missing.push("timestamp");
        }

        match (message, nonce, issued_at) {
            (Some(message), Some(nonce), Some(issued_at)) => Ok(Self {
                message,
                nonce,
                issued_at,
            }),
            _ => Err(format!(
                "challenge response missing required fields: {}",
                missing.join(", ")
            )),
        }
    }
}

impl GeneratedChallenge {
    /// The exact payload the wallet signs for a given signer kind. Safe
    /// wallets sign `address:nonce:timestamp` instead of the prose message.
    pub fn signing_payload(&self, address: &WalletAddress, signer: SignerKind) -> String {
        match signer {
            SignerKind::SafeWallet => format!(
                "{}:{}:{}",
                address.normalized(),
                self.nonce,
                self.issued_at.timestamp_millis()
            ),
            SignerKind::PersonalSign | SignerKind::TypedData => self.message.clone(),
        }
    }
}

/// Everything the identity provider needs to mint a session credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenExchangeRequest {
    pub address: WalletAddress,
    pub signature: String,
    pub chain_id: u64,
    pub signature_type: SignatureType,
    pub nonce: String,
    pub device_id: String,
    pub platform: Platform,
}

/// Backend session credential.
#[derive(Debug, Clone)]
pub struct SessionToken(SecretString);

impl SessionToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(SecretString::from(raw.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

/// Every connection sample the wallet SDK emits, in order. The first item is
/// the sample current at subscription time.
pub type WalletSamples = mpsc::UnboundedReceiver<WalletConnectionState>;

#[async_trait]
pub trait WalletBridge: Send + Sync {
    /// Samples are queued per subscriber, so bursts of notifications are
    /// never coalesced.
    fn subscribe(&self) -> WalletSamples;

    /// The SDK's own live connection flag, read directly rather than through
    /// the mirrored store.
    fn is_connected(&self) -> bool;

    /// Signing strategy appropriate for the currently connected wallet.
    fn signer_kind(&self) -> SignerKind;

    async fn request_signature(
        &self,
        message: &str,
        signer: SignerKind,
    ) -> Result<SignatureResult, BridgeError>;

    async fn disconnect(&self) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait IdentityBridge: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<BackendIdentityState>;

    async fn generate_challenge(
        &self,
        address: &WalletAddress,
    ) -> Result<ChallengePayload, BridgeError>;

    async fn exchange_signature_for_token(
        &self,
        request: &TokenExchangeRequest,
    ) -> Result<SessionToken, BridgeError>;

    async fn activate_session(&self, token: &SessionToken) -> Result<(), BridgeError>;

    async fn sign_out(&self) -> Result<(), BridgeError>;
}
