//! Ephemeral session keys.
//!
//! A session key is a fresh ed25519 keypair that the active wallet authorizes once,
//! by signing a [`SessionAuthorizationMessage`]. Until it expires, payments are signed
//! with the session key and never prompt the user.
//!
//! The secret lives only in memory and is destroyed on expiry, revocation and wallet
//! disconnect. An expired session keeps failing with [`SessionError::Expired`] until it
//! is replaced or revoked.

use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::Signer;
use std::fmt::{Debug, Formatter};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use microapi_x402_types::proto::v1::{SessionAuthorizationMessage, SessionDelegation, SessionPurpose};
use microapi_x402_types::timestamp::unix_millis_now;

use crate::wallet::{SigningPurpose, WalletError, WalletRegistry};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No active session")]
    NoSession,
    #[error("Session expired")]
    Expired,
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error("Failed to encode session authorization: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Exclusively owned session secret. Never serialized, never cloned.
pub struct SessionSecret {
    keypair: Option<Keypair>,
}

impl SessionSecret {
    fn generate() -> Self {
        Self {
            keypair: Some(Keypair::new()),
        }
    }

    fn public_key(&self) -> Option<Pubkey> {
        self.keypair.as_ref().map(|k| k.pubkey())
    }

    fn sign(&self, message: &[u8]) -> Option<Signature> {
        self.keypair.as_ref().map(|k| k.sign_message(message))
    }

    /// Drops the key material. Idempotent.
    pub fn destroy(&mut self) {
        self.keypair.take();
    }
}

impl Drop for SessionSecret {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Debug for SessionSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret(<redacted>)")
    }
}

/// An authorized session key.
#[derive(Debug)]
pub struct SessionCredential {
    pub session_public_key: Pubkey,
    secret: SessionSecret,
    /// Unix milliseconds, as signed by the wallet.
    pub expiry: u64,
    expires_at: Instant,
    pub authorized_by: Pubkey,
    pub authorization: Signature,
}

impl SessionCredential {
    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_public_key: self.session_public_key,
            expiry: self.expiry,
            authorized_by: self.authorized_by,
        }
    }

    pub fn delegation(&self) -> SessionDelegation {
        SessionDelegation {
            wallet_public_key: self.authorized_by.to_string(),
            session_public_key: self.session_public_key.to_string(),
            expiry: self.expiry,
            purpose: SessionPurpose,
            signature: self.authorization.to_string(),
        }
    }
}

/// Public view of a session, safe to log and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_public_key: Pubkey,
    pub expiry: u64,
    pub authorized_by: Pubkey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    None,
    Active(SessionInfo),
    Expired,
    Revoked,
}

#[derive(Debug)]
enum SessionState {
    None,
    Active(SessionCredential),
    Expired,
    Revoked,
}

#[derive(Debug)]
pub struct SessionKeyManager {
    state: Mutex<SessionState>,
}

impl Default for SessionKeyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionKeyManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::None),
        }
    }

    /// Creates a session valid for `duration`, authorized by the active wallet.
    ///
    /// Suspends until the user approves or rejects the authorization. On success the
    /// previous session, if any, is replaced and its secret destroyed.
    #[tracing::instrument(skip_all, fields(duration_secs = duration.as_secs()), err)]
    pub async fn create_session(
        &self,
        wallets: &WalletRegistry,
        duration: Duration,
    ) -> Result<SessionInfo, SessionError> {
        let wallet_key = wallets
            .active_public_key()
            .await
            .ok_or(WalletError::NotConnected)?;
        let secret = SessionSecret::generate();
        let session_public_key = secret.public_key().ok_or(SessionError::NoSession)?;
        let expiry = unix_millis_now().saturating_add(duration.as_millis() as u64);
        let message = SessionAuthorizationMessage::new(session_public_key.to_string(), expiry);
        let purpose = SigningPurpose::SessionAuthorization {
            session_key: session_public_key.to_string(),
            expiry_ms: expiry,
        };
        let authorization = wallets
            .sign_with_active(&message.canonical_bytes()?, &purpose)
            .await?;
        // The wallet may have been switched while the prompt was open.
        if wallets.active_public_key().await != Some(wallet_key) {
            return Err(WalletError::NotConnected.into());
        }
        let credential = SessionCredential {
            session_public_key,
            secret,
            expiry,
            expires_at: Instant::now() + duration,
            authorized_by: wallet_key,
            authorization,
        };
        let info = credential.info();
        *self.state.lock().await = SessionState::Active(credential);
        tracing::info!(
            session = %info.session_public_key,
            wallet = %info.authorized_by,
            expiry = info.expiry,
            "Session authorized"
        );
        Ok(info)
    }

    /// True while a session exists and has not reached its expiry.
    pub async fn is_valid(&self) -> bool {
        match &*self.state.lock().await {
            SessionState::Active(credential) => credential.is_live(),
            _ => false,
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let mut state = self.state.lock().await;
        Self::expire_if_due(&mut state);
        match &*state {
            SessionState::None => SessionStatus::None,
            SessionState::Active(credential) => SessionStatus::Active(credential.info()),
            SessionState::Expired => SessionStatus::Expired,
            SessionState::Revoked => SessionStatus::Revoked,
        }
    }

    /// Delegation proof of the live session, for inclusion in a payment header.
    pub async fn delegation(&self) -> Result<SessionDelegation, SessionError> {
        let mut state = self.state.lock().await;
        Self::expire_if_due(&mut state);
        match &*state {
            SessionState::Active(credential) => Ok(credential.delegation()),
            SessionState::Expired => Err(SessionError::Expired),
            SessionState::None | SessionState::Revoked => Err(SessionError::NoSession),
        }
    }

    /// Signs `message` with the session key. Never prompts.
    pub async fn sign(&self, message: &[u8]) -> Result<Signature, SessionError> {
        let mut state = self.state.lock().await;
        Self::expire_if_due(&mut state);
        match &*state {
            SessionState::Active(credential) => {
                credential.secret.sign(message).ok_or(SessionError::NoSession)
            }
            SessionState::Expired => Err(SessionError::Expired),
            SessionState::None | SessionState::Revoked => Err(SessionError::NoSession),
        }
    }

    /// Destroys the session key, if any.
    pub async fn revoke(&self) {
        let mut state = self.state.lock().await;
        if let SessionState::Active(credential) = &mut *state {
            credential.secret.destroy();
            tracing::info!(session = %credential.session_public_key, "Session revoked");
        }
        if !matches!(*state, SessionState::None) {
            *state = SessionState::Revoked;
        }
    }

    fn expire_if_due(state: &mut SessionState) {
        match state {
            SessionState::Active(credential) if !credential.is_live() => {
                credential.secret.destroy();
                tracing::info!(session = %credential.session_public_key, "Session expired");
            }
            _ => return,
        }
        *state = SessionState::Expired;
    }
}
