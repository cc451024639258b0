//! Chain RPC collaborator.
//!
//! The engine only needs two things from a Solana node: the status of a signature and
//! a best-effort summary of a landed transaction. [`ChainRpc`] is that seam,
//! [`SolanaRpc`] its production implementation.

use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_client::rpc_request::RpcRequest;
use solana_commitment_config::CommitmentConfig;
use solana_signature::Signature;
use solana_transaction_status_client_types::{
    EncodedConfirmedTransactionWithStatusMeta, UiTransactionEncoding,
};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use microapi_x402_types::networks::Network;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// RPC transport error. Always transient from the engine's point of view.
    #[error(transparent)]
    Transport(Box<ClientErrorKind>),
    #[error("No RPC endpoint configured for {0}")]
    UnsupportedNetwork(Network),
    #[error("{0}")]
    Custom(String),
}

impl From<ClientError> for RpcError {
    fn from(value: ClientError) -> Self {
        RpcError::Transport(value.kind)
    }
}

/// Where a signature stands, as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureState {
    /// The node has not seen the signature (yet).
    Unknown,
    /// Processed, but not yet at `confirmed` commitment.
    Pending,
    Confirmed,
    Finalized,
    /// Landed with an execution error.
    Failed(String),
}

impl SignatureState {
    pub fn is_settled(&self) -> bool {
        matches!(self, SignatureState::Confirmed | SignatureState::Finalized)
    }
}

/// Summary of a landed transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionDetails {
    pub slot: Option<u64>,
    /// Unix seconds.
    pub block_time: Option<i64>,
    /// Lamports.
    pub fee: Option<u64>,
    pub error: Option<String>,
    /// Absolute lamport change of the fee payer, fee included.
    pub payer_balance_change: Option<u64>,
}

#[async_trait::async_trait]
pub trait ChainRpc: Send + Sync {
    async fn signature_status(
        &self,
        network: Network,
        signature: &Signature,
    ) -> Result<SignatureState, RpcError>;

    /// `Ok(None)` when the node has no transaction for `signature` at `confirmed`
    /// commitment, which includes one that is still processing.
    async fn transaction(
        &self,
        network: Network,
        signature: &Signature,
    ) -> Result<Option<TransactionDetails>, RpcError>;
}

/// One nonblocking [`RpcClient`] per network.
pub struct SolanaRpc {
    clients: HashMap<Network, Arc<RpcClient>>,
}

impl Debug for SolanaRpc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (network, client) in &self.clients {
            map.entry(network, &client.url());
        }
        map.finish()
    }
}

impl SolanaRpc {
    /// Builds a client for every known network, using `overrides` where given and the
    /// public cluster endpoint otherwise.
    pub fn new(overrides: &HashMap<Network, String>) -> Self {
        let clients = Network::ALL
            .into_iter()
            .map(|network| {
                let url = overrides
                    .get(&network)
                    .cloned()
                    .unwrap_or_else(|| network.default_rpc_url().to_string());
                tracing::debug!(%network, rpc = %url, "Using Solana RPC");
                let client = RpcClient::new_with_commitment(url, CommitmentConfig::confirmed());
                (network, Arc::new(client))
            })
            .collect();
        Self { clients }
    }

    fn client(&self, network: Network) -> Result<&RpcClient, RpcError> {
        self.clients
            .get(&network)
            .map(Arc::as_ref)
            .ok_or(RpcError::UnsupportedNetwork(network))
    }
}

#[async_trait::async_trait]
impl ChainRpc for SolanaRpc {
    async fn signature_status(
        &self,
        network: Network,
        signature: &Signature,
    ) -> Result<SignatureState, RpcError> {
        let response = self
            .client(network)?
            .get_signature_statuses_with_history(&[*signature])
            .await?;
        let status = response.value.into_iter().next().flatten();
        let state = match status {
            None => SignatureState::Unknown,
            Some(status) => match &status.err {
                Some(err) => SignatureState::Failed(err.to_string()),
                None if status.satisfies_commitment(CommitmentConfig::finalized()) => {
                    SignatureState::Finalized
                }
                None if status.satisfies_commitment(CommitmentConfig::confirmed()) => {
                    SignatureState::Confirmed
                }
                None => SignatureState::Pending,
            },
        };
        Ok(state)
    }

    async fn transaction(
        &self,
        network: Network,
        signature: &Signature,
    ) -> Result<Option<TransactionDetails>, RpcError> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Json),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        // `getTransaction` answers `null` for a transaction it does not have yet.
        let tx: Option<EncodedConfirmedTransactionWithStatusMeta> = self
            .client(network)?
            .send(
                RpcRequest::GetTransaction,
                serde_json::json!([signature.to_string(), config]),
            )
            .await?;
        let Some(tx) = tx else {
            tracing::debug!(%network, %signature, "Transaction not available yet");
            return Ok(None);
        };
        let meta = tx.transaction.meta.as_ref();
        let payer_balance_change = meta.and_then(|m| {
            let pre = m.pre_balances.first()?;
            let post = m.post_balances.first()?;
            Some(pre.abs_diff(*post))
        });
        Ok(Some(TransactionDetails {
            slot: Some(tx.slot),
            block_time: tx.block_time,
            fee: meta.map(|m| m.fee),
            error: meta.and_then(|m| m.err.as_ref().map(|e| e.to_string())),
            payer_balance_change,
        }))
    }
}
