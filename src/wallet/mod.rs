//! Wallet backends.
//!
//! A [`WalletBackend`] is anything that can hold a Solana identity and sign bytes with it
//! after asking the user: a keypair on disk, a key in the environment, a hardware device.
//! Backends are registered by name in a [`WalletRegistry`], which tracks the single active
//! wallet and invalidates the session key whenever the active identity changes.

mod approver;
mod keypair;
mod registry;

pub use approver::*;
pub use keypair::*;
pub use registry::*;

use solana_pubkey::Pubkey;
use solana_signature::Signature;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("Unknown wallet provider: {0}")]
    NotFound(String),
    #[error("Wallet provider {0} is not available")]
    NotAvailable(String),
    #[error("No wallet connected")]
    NotConnected,
    #[error("{0}")]
    Rejected(String),
    #[error("Wallet backend failure: {0}")]
    Backend(String),
}

/// What a signature is being requested for, shown to the user before approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningPurpose {
    Payment {
        resource: String,
        amount: String,
        asset: String,
        network: String,
        pay_to: String,
    },
    SessionAuthorization {
        session_key: String,
        expiry_ms: u64,
    },
}

impl std::fmt::Display for SigningPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningPurpose::Payment {
                resource,
                amount,
                asset,
                network,
                pay_to,
            } => write!(
                f,
                "pay {amount} {asset} to {pay_to} on {network} for {resource}"
            ),
            SigningPurpose::SessionAuthorization {
                session_key,
                expiry_ms,
            } => write!(
                f,
                "authorize session key {session_key} until {expiry_ms} (unix ms)"
            ),
        }
    }
}

/// A wallet provider.
///
/// `sign_message` may suspend for as long as the user takes to decide.
#[async_trait::async_trait]
pub trait WalletBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Probes the environment. Providers can appear and disappear between calls.
    async fn is_available(&self) -> bool;

    async fn connect(&self) -> Result<Pubkey, WalletError>;

    async fn disconnect(&self);

    async fn sign_message(
        &self,
        message: &[u8],
        purpose: &SigningPurpose,
    ) -> Result<Signature, WalletError>;
}

/// Observable state of the active wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletHandle {
    pub provider_name: String,
    pub connected: bool,
    pub public_key: Option<Pubkey>,
}
