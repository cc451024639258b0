use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::Signer;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::wallet::{Approval, Approver, SigningPurpose, WalletBackend, WalletError};

/// Where a [`KeypairWallet`] finds its secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// A Solana CLI keypair file: a JSON array of 64 bytes.
    File(PathBuf),
    /// An environment variable holding the base58-encoded 64-byte secret.
    Env(String),
}

impl KeySource {
    async fn is_present(&self) -> bool {
        match self {
            KeySource::File(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            KeySource::Env(var) => std::env::var(var).is_ok_and(|v| !v.trim().is_empty()),
        }
    }

    async fn load(&self) -> Result<Keypair, WalletError> {
        let bytes = match self {
            KeySource::File(path) => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    WalletError::Backend(format!("Failed to read {}: {e}", path.display()))
                })?;
                serde_json::from_str::<Vec<u8>>(&content).map_err(|e| {
                    WalletError::Backend(format!("Invalid keypair file {}: {e}", path.display()))
                })?
            }
            KeySource::Env(var) => {
                let value = std::env::var(var)
                    .map_err(|_| WalletError::NotAvailable(format!("${var}")))?;
                bs58::decode(value.trim()).into_vec().map_err(|e| {
                    WalletError::Backend(format!("Invalid base58 secret in ${var}: {e}"))
                })?
            }
        };
        Keypair::try_from(bytes.as_slice())
            .map_err(|e| WalletError::Backend(format!("Invalid keypair bytes: {e}")))
    }
}

/// An ed25519 keypair wallet with an [`Approver`] gating every signature.
pub struct KeypairWallet {
    name: String,
    source: KeySource,
    approver: Arc<dyn Approver>,
    keypair: RwLock<Option<Keypair>>,
}

impl Debug for KeypairWallet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeypairWallet")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

impl KeypairWallet {
    pub fn new(name: impl Into<String>, source: KeySource, approver: Arc<dyn Approver>) -> Self {
        Self {
            name: name.into(),
            source,
            approver,
            keypair: RwLock::new(None),
        }
    }
}

#[async_trait::async_trait]
impl WalletBackend for KeypairWallet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.source.is_present().await
    }

    async fn connect(&self) -> Result<Pubkey, WalletError> {
        if !self.source.is_present().await {
            return Err(WalletError::NotAvailable(self.name.clone()));
        }
        let keypair = self.source.load().await?;
        let pubkey = keypair.pubkey();
        *self.keypair.write().await = Some(keypair);
        tracing::debug!(wallet = %self.name, %pubkey, "Keypair loaded");
        Ok(pubkey)
    }

    async fn disconnect(&self) {
        self.keypair.write().await.take();
    }

    async fn sign_message(
        &self,
        message: &[u8],
        purpose: &SigningPurpose,
    ) -> Result<Signature, WalletError> {
        if self.keypair.read().await.is_none() {
            return Err(WalletError::NotConnected);
        }
        match self.approver.approve(&self.name, purpose).await {
            Approval::Approved => {}
            Approval::Rejected(reason) => return Err(WalletError::Rejected(reason)),
        }
        // Disconnected while the prompt was open.
        let guard = self.keypair.read().await;
        let keypair = guard.as_ref().ok_or(WalletError::NotConnected)?;
        Ok(keypair.sign_message(message))
    }
}
