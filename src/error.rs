//! Error types for walletauth.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by one of the external bridges (wallet SDK, identity
/// provider). The pipeline maps these into [`AuthError`] kinds.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    pub fn detail(&self) -> &str {
        match self {
            Self::Transport(d) | Self::Rejected(d) | Self::InvalidResponse(d) | Self::Other(d) => d,
        }
    }
}

/// Closed set of authentication failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SignatureRejected,
    NetworkError,
    SessionCorruption,
    AuthenticationFailed,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SignatureRejected => "signature_rejected",
            Self::NetworkError => "network_error",
            Self::SessionCorruption => "session_corruption",
            Self::AuthenticationFailed => "authentication_failed",
            Self::UnknownError => "unknown_error",
        }
    }

    /// Whether the UI should offer a retry affordance.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::SignatureRejected | Self::NetworkError)
    }

    fn default_user_message(self) -> &'static str {
        match self {
            Self::SignatureRejected => "Signature request was declined. Tap retry to sign again.",
            Self::NetworkError => "Network error while authenticating. Please try again.",
            Self::SessionCorruption => "Your session was reset. Please authenticate again.",
            Self::AuthenticationFailed => "Authentication failed. Please try again.",
            Self::UnknownError => "Something went wrong during authentication.",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEVICE_VERIFICATION_USER_MESSAGE: &str =
    "Device verification failed. Please disconnect and reconnect your wallet.";

static DEVICE_VERIFICATION_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)device[\s_\-]*(verification|not[\s_\-]*verified|unverified|mismatch)|unverified[\s_\-]*device|device[\s_\-]*id[\s_\-]*(invalid|mismatch)",
    )
    .ok()
});

/// Whether a raw provider message carries one of the known device
/// verification failure signatures.
pub fn is_device_verification_failure(raw: &str) -> bool {
    DEVICE_VERIFICATION_PATTERN
        .as_ref()
        .is_some_and(|re| re.is_match(raw))
}

/// An authentication failure surfaced to the local auth-state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AuthError {
    pub kind: ErrorKind,
    pub message: String,
    pub user_facing_message: String,
    pub occurred_at: DateTime<Utc>,
}

impl AuthError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: redact_sensitive_detail(&message.into()),
            user_facing_message: kind.default_user_message().to_string(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_facing_message = message.into();
        self
    }

    /// `AuthenticationFailed` carrying the reconnect remediation message.
    pub fn device_verification(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthenticationFailed, message)
            .with_user_message(DEVICE_VERIFICATION_USER_MESSAGE)
    }

    pub fn is_device_verification(&self) -> bool {
        self.kind == ErrorKind::AuthenticationFailed
            && self.user_facing_message == DEVICE_VERIFICATION_USER_MESSAGE
    }

    /// Map a failed signature request.
    pub fn from_signature_failure(err: &BridgeError) -> Self {
        match err {
            BridgeError::Rejected(detail) => Self::new(ErrorKind::SignatureRejected, detail),
            BridgeError::Transport(detail) => Self::new(ErrorKind::NetworkError, detail),
            other => Self::new(ErrorKind::UnknownError, other.to_string()),
        }
    }

    /// Map a failed token exchange or session activation.
    pub fn from_backend_failure(err: &BridgeError) -> Self {
        if is_device_verification_failure(err.detail()) {
            return Self::device_verification(err.detail());
        }
        match err {
            BridgeError::Transport(detail) => Self::new(ErrorKind::NetworkError, detail),
            BridgeError::Rejected(detail) | BridgeError::InvalidResponse(detail) => {
                Self::new(ErrorKind::AuthenticationFailed, detail)
            }
            BridgeError::Other(detail) => Self::new(ErrorKind::UnknownError, detail),
        }
    }
}

/// Errors raised by the recovery validator's remediation branches.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Session corruption detected: {reason}")]
    SessionCorruption { reason: String },

    #[error("Remediation step '{step}' failed and was rolled back: {source}")]
    RemediationFailed {
        step: &'static str,
        #[source]
        source: BridgeError,
    },
}

pub(crate) fn redact_sensitive_detail(raw: &str) -> String {
    static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
        [
            (r"(?i)\b(bearer)\s+[a-z0-9._\-~+/]+=*", "$1 [REDACTED]"),
            (
                r"(?i)\b(token|api[_\-]?key|secret|password)\b(\s*[:=]\s*)([^,\s]+)",
                "$1$2[REDACTED]",
            ),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
        .collect()
    });

    let mut value = raw.to_string();
    for (re, replacement) in PATTERNS.iter() {
        value = re.replace_all(&value, *replacement).to_string();
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_labels_are_stable() {
        assert_eq!(ErrorKind::SignatureRejected.as_str(), "signature_rejected");
        assert_eq!(ErrorKind::SessionCorruption.as_str(), "session_corruption");
        assert_eq!(
            serde_json::to_string(&ErrorKind::NetworkError).unwrap(),
            "\"network_error\""
        );
    }

    #[test]
    fn only_rejection_and_network_failures_are_retryable() {
        assert!(ErrorKind::SignatureRejected.is_retryable());
        assert!(ErrorKind::NetworkError.is_retryable());
        assert!(!ErrorKind::SessionCorruption.is_retryable());
        assert!(!ErrorKind::AuthenticationFailed.is_retryable());
        assert!(!ErrorKind::UnknownError.is_retryable());
    }

    #[test]
    fn device_verification_messages_are_translated() {
        for raw in [
            "auth/device-verification-failed",
            "Device not verified for this account",
            "DEVICE_ID_MISMATCH",
            "request came from an unverified device",
        ] {
            let err = AuthError::from_backend_failure(&BridgeError::Rejected(raw.to_string()));
            assert!(err.is_device_verification(), "{raw} should be translated");
            assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
            assert_eq!(err.user_facing_message, DEVICE_VERIFICATION_USER_MESSAGE);
        }

        let plain =
            AuthError::from_backend_failure(&BridgeError::Rejected("bad signature".to_string()));
        assert!(!plain.is_device_verification());
    }

    #[test]
    fn bridge_failures_map_to_kinds() {
        let rejected =
            AuthError::from_signature_failure(&BridgeError::Rejected("user denied".to_string()));
        assert_eq!(rejected.kind, ErrorKind::SignatureRejected);

        let transport =
            AuthError::from_backend_failure(&BridgeError::Transport("timed out".to_string()));
        assert_eq!(transport.kind, ErrorKind::NetworkError);

        let other = AuthError::from_backend_failure(&BridgeError::Other("boom".to_string()));
        assert_eq!(other.kind, ErrorKind::UnknownError);
    }

    #[test]
    fn auth_error_messages_are_redacted() {
        let err = AuthError::new(
            ErrorKind::NetworkError,
            "exchange failed bearer abc.def token=abc123",
        );
        assert!(!err.message.contains("abc.def"));
        assert!(!err.message.contains("abc123"));
    }
}
