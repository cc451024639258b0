//! Importing a payment made elsewhere, by its transaction signature.

use solana_signature::Signature;

use microapi_x402_types::networks::Network;
use microapi_x402_types::timestamp::unix_millis_now;

use crate::authorization::NATIVE_ASSET;
use crate::chain::{ChainRpc, RpcError, SignatureState, TransactionDetails};
use crate::receipts::{Receipt, ReceiptStatus};

pub const UNKNOWN_RESOURCE: &str = "Unknown";

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Transaction {0} not found on {1}")]
    NotFound(Signature, Network),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Builds a receipt for `signature` from what the chain knows about it.
///
/// The resource is not recoverable from the chain and is recorded as `Unknown`. The
/// amount is the fee payer's lamport balance change, fee included. Transaction details
/// are best effort: a signature the node knows but cannot describe yet still yields a
/// receipt, with amount `0` and the current time.
#[tracing::instrument(skip(rpc), fields(signature = %signature, network = %network), err)]
pub async fn lookup_receipt(
    rpc: &dyn ChainRpc,
    signature: &Signature,
    network: Network,
) -> Result<Receipt, LookupError> {
    let status = match rpc.signature_status(network, signature).await? {
        SignatureState::Unknown => return Err(LookupError::NotFound(*signature, network)),
        SignatureState::Pending => ReceiptStatus::Pending,
        SignatureState::Confirmed | SignatureState::Finalized => ReceiptStatus::Confirmed,
        SignatureState::Failed(_) => ReceiptStatus::Failed,
    };
    let details = match rpc.transaction(network, signature).await {
        Ok(details) => details.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "Transaction details unavailable");
            TransactionDetails::default()
        }
    };
    let timestamp = details
        .block_time
        .and_then(|secs| u64::try_from(secs).ok())
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or_else(unix_millis_now);
    Ok(Receipt {
        signature: signature.to_string(),
        timestamp,
        resource: UNKNOWN_RESOURCE.to_string(),
        amount: details.payer_balance_change.unwrap_or(0).to_string(),
        asset: NATIVE_ASSET.to_string(),
        network: network.to_string(),
        status,
        payer: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::ScriptedRpc;

    #[tokio::test]
    async fn test_lookup_confirmed() {
        let rpc = ScriptedRpc::new(vec![Ok(SignatureState::Finalized)]).with_details(
            TransactionDetails {
                slot: Some(10),
                block_time: Some(1_700_000_000),
                fee: Some(5000),
                error: None,
                payer_balance_change: Some(10_000),
            },
        );
        let signature = Signature::from([8u8; 64]);
        let receipt = lookup_receipt(&rpc, &signature, Network::SolanaDevnet)
            .await
            .unwrap();
        assert_eq!(receipt.signature, signature.to_string());
        assert_eq!(receipt.timestamp, 1_700_000_000_000);
        assert_eq!(receipt.resource, "Unknown");
        assert_eq!(receipt.amount, "10000");
        assert_eq!(receipt.asset, "SOL");
        assert_eq!(receipt.network, "solana-devnet");
        assert_eq!(receipt.status, ReceiptStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_lookup_failed_and_missing() {
        let rpc = ScriptedRpc::new(vec![Ok(SignatureState::Failed("boom".into()))]);
        let receipt = lookup_receipt(&rpc, &Signature::from([1u8; 64]), Network::Solana)
            .await
            .unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Failed);
        assert_eq!(receipt.amount, "0");

        let rpc = ScriptedRpc::new(vec![Ok(SignatureState::Unknown)]);
        let err = lookup_receipt(&rpc, &Signature::from([2u8; 64]), Network::Solana)
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::NotFound(_, Network::Solana)));
    }

    #[tokio::test]
    async fn test_lookup_pending_without_details() {
        let rpc = ScriptedRpc::new(vec![Ok(SignatureState::Pending)])
            .with_details_error("Transaction not found");
        let before = unix_millis_now();
        let receipt = lookup_receipt(&rpc, &Signature::from([3u8; 64]), Network::SolanaDevnet)
            .await
            .unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Pending);
        assert_eq!(receipt.amount, "0");
        assert!(receipt.timestamp >= before);

        // A failing status query is still an error.
        let rpc = ScriptedRpc::new(vec![Err("connection refused".into())]);
        let err = lookup_receipt(&rpc, &Signature::from([4u8; 64]), Network::SolanaDevnet)
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::Rpc(_)));
    }
}
