use solana_pubkey::Pubkey;
use solana_signature::Signature;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::session::SessionKeyManager;
use crate::wallet::{SigningPurpose, WalletBackend, WalletError, WalletHandle};

struct ActiveWallet {
    backend: Arc<dyn WalletBackend>,
    public_key: Pubkey,
}

/// Named wallet adapters plus the single active connection.
///
/// Owns the [`SessionKeyManager`] so that a change of identity (connect, disconnect)
/// always revokes the session key authorized by the previous identity.
pub struct WalletRegistry {
    adapters: BTreeMap<String, Arc<dyn WalletBackend>>,
    active: RwLock<Option<ActiveWallet>>,
    sessions: Arc<SessionKeyManager>,
}

impl Default for WalletRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletRegistry {
    pub fn new() -> Self {
        Self {
            adapters: BTreeMap::new(),
            active: RwLock::new(None),
            sessions: Arc::new(SessionKeyManager::new()),
        }
    }

    /// Registers `backend` under its own name, replacing any adapter with the same name.
    pub fn register<B: WalletBackend + 'static>(&mut self, backend: B) -> &mut Self {
        self.adapters
            .insert(backend.name().to_string(), Arc::new(backend));
        self
    }

    pub fn with<B: WalletBackend + 'static>(mut self, backend: B) -> Self {
        self.register(backend);
        self
    }

    pub fn sessions(&self) -> Arc<SessionKeyManager> {
        Arc::clone(&self.sessions)
    }

    /// Names of every registered adapter.
    pub fn registered(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    /// Names of the adapters available right now. Probes every adapter on each call.
    pub async fn detect(&self) -> BTreeSet<String> {
        let mut available = BTreeSet::new();
        for (name, adapter) in &self.adapters {
            if adapter.is_available().await {
                available.insert(name.clone());
            }
        }
        available
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn connect(&self, name: &str) -> Result<WalletHandle, WalletError> {
        let adapter = self
            .adapters
            .get(name)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(name.to_string()))?;
        if !adapter.is_available().await {
            return Err(WalletError::NotAvailable(name.to_string()));
        }
        let mut active = self.active.write().await;
        if let Some(previous) = active.take() {
            previous.backend.disconnect().await;
        }
        self.sessions.revoke().await;
        let public_key = adapter.connect().await?;
        tracing::info!(wallet = name, %public_key, "Wallet connected");
        *active = Some(ActiveWallet {
            backend: adapter,
            public_key,
        });
        Ok(WalletHandle {
            provider_name: name.to_string(),
            connected: true,
            public_key: Some(public_key),
        })
    }

    /// Disconnects the active wallet, if any, and destroys the session key.
    pub async fn disconnect(&self) {
        let previous = self.active.write().await.take();
        self.sessions.revoke().await;
        if let Some(previous) = previous {
            previous.backend.disconnect().await;
            tracing::info!(wallet = previous.backend.name(), "Wallet disconnected");
        }
    }

    pub async fn active_handle(&self) -> Option<WalletHandle> {
        self.active.read().await.as_ref().map(|a| WalletHandle {
            provider_name: a.backend.name().to_string(),
            connected: true,
            public_key: Some(a.public_key),
        })
    }

    pub async fn active_public_key(&self) -> Option<Pubkey> {
        self.active.read().await.as_ref().map(|a| a.public_key)
    }

    /// Signs with the active wallet. Suspends while the user decides.
    pub async fn sign_with_active(
        &self,
        message: &[u8],
        purpose: &SigningPurpose,
    ) -> Result<Signature, WalletError> {
        // The lock is not held across the approval prompt, so connect/disconnect stay responsive.
        let backend = self
            .active
            .read()
            .await
            .as_ref()
            .map(|a| Arc::clone(&a.backend))
            .ok_or(WalletError::NotConnected)?;
        backend.sign_message(message, purpose).await
    }
}
