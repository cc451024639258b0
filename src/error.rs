//! Error kinds surfaced by a payment attempt.
//!
//! Each component has its own error enum; they all collapse into [`PaymentError`]
//! once they reach the [`PaymentFlowController`](crate::flow::PaymentFlowController),
//! which is what a caller (or the CLI) sees.

use crate::authorization::AuthorizationError;
use crate::session::SessionError;
use crate::transport::TransportError;
use crate::wallet::WalletError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    /// The provider's requirements failed validation. Nothing was signed or sent.
    #[error("Invalid payment requirements: {0}")]
    InvalidRequirements(String),
    /// Neither a wallet is connected nor a session is active.
    #[error("No signer available: connect a wallet or create a session")]
    NoSigner,
    #[error("Signing request rejected: {0}")]
    SignerRejected(String),
    /// The paid request never produced an HTTP response.
    #[error("Network error: {0}")]
    NetworkError(String),
    /// The provider answered, but did not confirm settlement.
    #[error("Settlement failed: {0}")]
    SettlementFailed(String),
    #[error("Session expired, authorize a new session")]
    SessionExpired,
    #[error("A payment is already in progress")]
    AlreadyInProgress,
    /// Confirmation could not be determined within the polling budget.
    #[error("Timed out waiting for confirmation")]
    TimedOut,
    #[error("Payment cancelled before the request was sent")]
    Cancelled,
}

impl PaymentError {
    /// Whether repeating the same attempt may succeed without changing anything.
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::SignerRejected(_)
            | PaymentError::NetworkError(_)
            | PaymentError::TimedOut
            | PaymentError::Cancelled => true,
            PaymentError::InvalidRequirements(_)
            | PaymentError::NoSigner
            | PaymentError::SettlementFailed(_)
            | PaymentError::SessionExpired
            | PaymentError::AlreadyInProgress => false,
        }
    }

    /// Whether the user has to act (connect, approve, re-authorize) before a retry helps.
    pub fn requires_user_action(&self) -> bool {
        match self {
            PaymentError::NoSigner
            | PaymentError::SignerRejected(_)
            | PaymentError::SessionExpired => true,
            PaymentError::InvalidRequirements(_)
            | PaymentError::NetworkError(_)
            | PaymentError::SettlementFailed(_)
            | PaymentError::AlreadyInProgress
            | PaymentError::TimedOut
            | PaymentError::Cancelled => false,
        }
    }
}

impl From<WalletError> for PaymentError {
    fn from(value: WalletError) -> Self {
        match value {
            WalletError::NotFound(_) | WalletError::NotAvailable(_) | WalletError::NotConnected => {
                PaymentError::NoSigner
            }
            WalletError::Rejected(reason) => PaymentError::SignerRejected(reason),
            WalletError::Backend(reason) => PaymentError::SignerRejected(reason),
        }
    }
}

impl From<SessionError> for PaymentError {
    fn from(value: SessionError) -> Self {
        match value {
            SessionError::Expired => PaymentError::SessionExpired,
            SessionError::NoSession => PaymentError::NoSigner,
            SessionError::Wallet(e) => e.into(),
            SessionError::Encoding(e) => PaymentError::InvalidRequirements(e.to_string()),
        }
    }
}

impl From<AuthorizationError> for PaymentError {
    fn from(value: AuthorizationError) -> Self {
        PaymentError::InvalidRequirements(value.to_string())
    }
}

impl From<TransportError> for PaymentError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::HttpStatus { status, body, .. } => {
                PaymentError::SettlementFailed(format!("HTTP {status}: {body}"))
            }
            TransportError::UrlParse { .. } => PaymentError::InvalidRequirements(value.to_string()),
            other => PaymentError::NetworkError(other.to_string()),
        }
    }
}
