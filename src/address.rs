//! Wallet address handling.
//!
//! Addresses reported by the wallet SDK and the identity provider can differ
//! in hex-digit case (EIP-55 checksums vs lowercase), so every comparison in
//! the crate goes through [`WalletAddress`], which compares and hashes
//! case-insensitively while keeping the original spelling for display.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// An EVM wallet address as reported by an external source.
///
/// Construction does not validate the shape: the recovery validator must be
/// able to hold (and report) malformed addresses. Use [`WalletAddress::parse`]
/// when a well-formed value is required.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    /// Accept only `0x`-prefixed, 40-hex-digit addresses.
    pub fn parse(raw: &str) -> Option<Self> {
        let candidate = Self::new(raw);
        candidate.is_well_formed().then_some(candidate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        is_well_formed_address(&self.0)
    }

    /// Lowercase spelling, used for hashing and for payloads signed by Safe
    /// wallets.
    pub fn normalized(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// Abbreviated form for logs (`0xabcd…1234`).
    pub fn short(&self) -> String {
        if self.0.len() <= 12 || !self.0.is_ascii() {
            return self.0.clone();
        }
        format!("{}…{}", &self.0[..6], &self.0[self.0.len() - 4..])
    }
}

impl PartialEq for WalletAddress {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Hash for WalletAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl std::fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WalletAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Case-insensitive comparison of two optional addresses. Two absent
/// addresses are not considered a match.
pub fn addresses_match(a: Option<&WalletAddress>, b: Option<&WalletAddress>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

pub fn is_well_formed_address(value: &str) -> bool {
    let Some(hex) = value.strip_prefix("0x") else {
        return false;
    };
    hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit())
}
