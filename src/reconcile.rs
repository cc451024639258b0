//! Background settlement of pending receipts.
//!
//! A receipt is written as `pending` the moment a provider reports settlement. The
//! [`ReceiptReconciler`] polls each pending signature and moves the receipt to
//! `confirmed` or `failed`. A poll that times out leaves the receipt `pending`, so a
//! later [`ReceiptReconciler::reconcile_pending`] picks it up again.

use solana_signature::Signature;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::task::TaskTracker;

use microapi_x402_types::networks::Network;

use crate::poller::{ConfirmationOutcome, ConfirmationPoller};
use crate::receipts::{Receipt, ReceiptStatus, ReceiptStore};

pub struct ReceiptReconciler {
    poller: Arc<ConfirmationPoller>,
    store: Arc<ReceiptStore>,
    tracker: TaskTracker,
}

impl ReceiptReconciler {
    pub fn new(poller: Arc<ConfirmationPoller>, store: Arc<ReceiptStore>) -> Self {
        Self {
            poller,
            store,
            tracker: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &Arc<ReceiptStore> {
        &self.store
    }

    /// Starts watching `receipt` if it is still pending. Returns whether a poll started.
    pub fn track(&self, receipt: &Receipt) -> bool {
        if receipt.status != ReceiptStatus::Pending {
            return false;
        }
        let signature = match Signature::from_str(&receipt.signature) {
            Ok(signature) => signature,
            Err(e) => {
                tracing::warn!(signature = %receipt.signature, error = %e, "Not a Solana signature, leaving receipt as is");
                return false;
            }
        };
        let network = match Network::from_str(&receipt.network) {
            Ok(network) => network,
            Err(e) => {
                tracing::warn!(signature = %receipt.signature, error = %e, "Unknown receipt network, leaving receipt as is");
                return false;
            }
        };
        let Some(handle) = self.poller.start(signature, network, None) else {
            return false;
        };
        let store = Arc::clone(&self.store);
        let key = receipt.signature.clone();
        self.tracker.spawn(async move {
            let status = match handle.outcome().await {
                Some(ConfirmationOutcome::Confirmed(_)) => ReceiptStatus::Confirmed,
                Some(ConfirmationOutcome::Failed(_)) => ReceiptStatus::Failed,
                Some(ConfirmationOutcome::TimedOut) => {
                    tracing::info!(signature = %key, "Still unconfirmed, receipt stays pending");
                    return;
                }
                None => return,
            };
            store.update_status(&key, status).await;
        });
        true
    }

    /// Starts a poll for every pending receipt in the store. Returns how many started.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_pending(&self) -> usize {
        let pending = self.store.pending().await;
        let started = pending.iter().filter(|r| self.track(r)).count();
        tracing::info!(pending = pending.len(), started, "Reconciling receipts");
        started
    }

    /// Waits until every tracked receipt has an outcome.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SignatureState;
    use crate::chain::testing::ScriptedRpc;
    use crate::poller::PollerConfig;
    use crate::receipts::{MemoryStore, ReceiptFilter};

    fn receipt(signature: String, status: ReceiptStatus) -> Receipt {
        Receipt {
            signature,
            timestamp: 1_700_000_000_000,
            resource: "https://api.example.com/weather".into(),
            amount: "5000".into(),
            asset: "SOL".into(),
            network: "solana-devnet".into(),
            status,
            payer: None,
        }
    }

    async fn reconciler(rpc: ScriptedRpc) -> ReceiptReconciler {
        let poller = ConfirmationPoller::new(Arc::new(rpc), PollerConfig::default());
        let store = ReceiptStore::open(Arc::new(MemoryStore::new())).await;
        ReceiptReconciler::new(Arc::new(poller), Arc::new(store))
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_updates_receipt() {
        let reconciler = reconciler(ScriptedRpc::new(vec![
            Ok(SignatureState::Pending),
            Ok(SignatureState::Finalized),
        ]))
        .await;
        let signature = Signature::from([9u8; 64]).to_string();
        reconciler
            .store()
            .append(receipt(signature.clone(), ReceiptStatus::Pending))
            .await;

        assert_eq!(reconciler.reconcile_pending().await, 1);
        reconciler.wait().await;

        let stored = reconciler.store().get(&signature).await.unwrap();
        assert_eq!(stored.status, ReceiptStatus::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_and_timed_out() {
        let reconciler = reconciler(ScriptedRpc::new(vec![Ok(SignatureState::Failed(
            "InsufficientFundsForFee".into(),
        ))]))
        .await;
        let failed = Signature::from([5u8; 64]).to_string();
        reconciler
            .store()
            .append(receipt(failed.clone(), ReceiptStatus::Pending))
            .await;
        assert!(reconciler.track(&receipt(failed.clone(), ReceiptStatus::Pending)));
        reconciler.wait().await;
        assert_eq!(
            reconciler.store().get(&failed).await.unwrap().status,
            ReceiptStatus::Failed
        );

        let reconciler = reconciler_never_resolving().await;
        let stuck = Signature::from([6u8; 64]).to_string();
        reconciler
            .store()
            .append(receipt(stuck.clone(), ReceiptStatus::Pending))
            .await;
        reconciler.reconcile_pending().await;
        reconciler.wait().await;
        assert_eq!(
            reconciler.store().get(&stuck).await.unwrap().status,
            ReceiptStatus::Pending
        );
    }

    async fn reconciler_never_resolving() -> ReceiptReconciler {
        reconciler(ScriptedRpc::new(vec![Ok(SignatureState::Unknown)])).await
    }

    #[tokio::test]
    async fn test_skips_unusable_receipts() {
        let reconciler = reconciler(ScriptedRpc::new(vec![])).await;
        assert!(!reconciler.track(&receipt("not-base58!".into(), ReceiptStatus::Pending)));
        let mut other_chain = receipt(Signature::from([1u8; 64]).to_string(), ReceiptStatus::Pending);
        other_chain.network = "base-sepolia".into();
        assert!(!reconciler.track(&other_chain));
        assert!(!reconciler.track(&receipt(
            Signature::from([2u8; 64]).to_string(),
            ReceiptStatus::Confirmed
        )));
        assert!(
            reconciler
                .store()
                .list(&ReceiptFilter::default())
                .await
                .is_empty()
        );
    }
}
