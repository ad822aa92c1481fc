//! Wallet-to-backend authentication and session reconciliation.
//!
//! A wallet SDK reports connection samples; a backend identity provider
//! holds a session. This crate keeps the two consistent: it detects
//! connection edges, runs a challenge-signature authentication pipeline
//! under a single-flight lock, reconciles drift between the wallet, the
//! backend and local auth-state, and recovers persisted sessions at startup.
//!
//! The wallet and backend sit behind the [`bridge::WalletBridge`] and
//! [`bridge::IdentityBridge`] traits; [`session::AuthSession`] wires every
//! component together.

pub mod address;
pub mod bootstrap;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod detector;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod reconciler;
pub mod recovery;
pub mod session;
pub mod settings;
pub mod state;

pub use address::WalletAddress;
pub use config::AuthConfig;
pub use error::{AuthError, Error, ErrorKind, Result};
pub use session::AuthSession;
