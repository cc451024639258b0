//! The payment state machine.
//!
//! ```text
//! Idle -> Submitting -> AwaitingSignature -> Settling -> Succeeded
//!                 \              |               \
//!                  \             v (cancel)       -> Failed -> (retry) -> Submitting
//!                   ---------> Idle
//! ```
//!
//! One [`PaymentFlowController`] runs at most one attempt at a time. The paid request
//! is sent exactly once per attempt; a new attempt is always an explicit
//! [`retry`](PaymentFlowController::retry) that signs a fresh authorization.

use http::StatusCode;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use microapi_x402_types::proto::v1::{PaymentRequirements, SettleResponse};
use microapi_x402_types::timestamp::unix_millis_now;

use crate::authorization::{self, PaymentHeader, PaymentSigner, SessionSigner, WalletSigner};
use crate::error::PaymentError;
use crate::receipts::{Receipt, ReceiptStatus, ReceiptStore};
use crate::reconcile::ReceiptReconciler;
use crate::session::{SessionKeyManager, SessionStatus};
use crate::transport::{PaidResponse, ResourceClient};
use crate::wallet::WalletRegistry;

/// A successful payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentOutcome {
    /// Settlement transaction signature reported by the provider.
    pub signature: String,
    pub network: String,
    pub status: StatusCode,
    /// Body of the paid response.
    pub body: Vec<u8>,
    pub receipt: Receipt,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PaymentState {
    #[default]
    Idle,
    Submitting,
    AwaitingSignature,
    Settling,
    Succeeded(PaymentOutcome),
    Failed(PaymentError),
}

impl PaymentState {
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            PaymentState::Submitting | PaymentState::AwaitingSignature | PaymentState::Settling
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentState::Succeeded(_) | PaymentState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            PaymentState::Idle => "idle",
            PaymentState::Submitting => "submitting",
            PaymentState::AwaitingSignature => "awaiting_signature",
            PaymentState::Settling => "settling",
            PaymentState::Succeeded(_) => "succeeded",
            PaymentState::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
struct Attempt {
    url: Url,
    requirements: PaymentRequirements,
}

pub struct PaymentFlowController {
    wallets: Arc<WalletRegistry>,
    sessions: Arc<SessionKeyManager>,
    client: ResourceClient,
    receipts: Arc<ReceiptStore>,
    reconciler: Option<Arc<ReceiptReconciler>>,
    state: watch::Sender<PaymentState>,
    last_attempt: Mutex<Option<Attempt>>,
    /// Set while the running attempt can still be cancelled.
    cancellation: std::sync::Mutex<Option<CancellationToken>>,
}

/// Reason recorded when an attempt is dropped after the paid request may have gone out.
const ABANDONED_WHILE_SETTLING: &str =
    "attempt abandoned before the provider answered; check receipts before retrying";

impl PaymentFlowController {
    pub fn new(
        wallets: Arc<WalletRegistry>,
        client: ResourceClient,
        receipts: Arc<ReceiptStore>,
    ) -> Self {
        let sessions = wallets.sessions();
        Self {
            wallets,
            sessions,
            client,
            receipts,
            reconciler: None,
            state: watch::Sender::new(PaymentState::Idle),
            last_attempt: Mutex::new(None),
            cancellation: std::sync::Mutex::new(None),
        }
    }

    /// Starts confirmation tracking for every receipt a successful payment writes.
    pub fn with_reconciler(mut self, reconciler: Arc<ReceiptReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn state(&self) -> PaymentState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PaymentState> {
        self.state.subscribe()
    }

    /// Pays for `url` under `requirements`.
    ///
    /// Fails with [`PaymentError::AlreadyInProgress`] unless the controller is idle, and
    /// with [`PaymentError::NoSigner`] if neither a wallet nor a session can sign. Both
    /// leave the state untouched. Every other failure ends in [`PaymentState::Failed`],
    /// except cancellation, which returns to [`PaymentState::Idle`].
    ///
    /// Dropping the returned future before the paid request is sent also returns the
    /// controller to [`PaymentState::Idle`]. Dropping it later ends in
    /// [`PaymentState::Failed`], since the provider may already have settled.
    #[tracing::instrument(skip_all, fields(url = %url), err)]
    pub async fn pay(
        &self,
        url: Url,
        requirements: PaymentRequirements,
    ) -> Result<PaymentOutcome, PaymentError> {
        if !matches!(*self.state.borrow(), PaymentState::Idle) {
            return Err(PaymentError::AlreadyInProgress);
        }
        if !self.has_signer().await {
            return Err(PaymentError::NoSigner);
        }
        let guard = self.begin(|state| matches!(state, PaymentState::Idle))?;
        self.run(Attempt { url, requirements }, guard).await
    }

    /// Runs a new attempt for the last failed payment, with a freshly signed header.
    #[tracing::instrument(skip_all, err)]
    pub async fn retry(&self) -> Result<PaymentOutcome, PaymentError> {
        let retryable = match &*self.state.borrow() {
            PaymentState::Failed(_) => Ok(()),
            s if s.is_in_progress() => Err(PaymentError::AlreadyInProgress),
            _ => Err(PaymentError::InvalidRequirements(
                "no failed payment to retry".to_string(),
            )),
        };
        retryable?;
        let Some(attempt) = self.last_attempt.lock().await.clone() else {
            return Err(PaymentError::InvalidRequirements(
                "no failed payment to retry".to_string(),
            ));
        };
        let guard = self.begin(|state| matches!(state, PaymentState::Failed(_)))?;
        self.run(attempt, guard).await
    }

    /// Returns a finished controller to [`PaymentState::Idle`]. No-op while in progress.
    pub fn reset(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                *state = PaymentState::Idle;
                true
            } else {
                false
            }
        })
    }

    /// Aborts the attempt if it has not sent the paid request yet.
    ///
    /// Returns whether there was an attempt to cancel. A request already sent, and any
    /// transaction it settled, is unaffected.
    pub async fn cancel(&self) -> bool {
        match self.cancellation_slot().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn has_signer(&self) -> bool {
        self.wallets.active_public_key().await.is_some() || self.sessions.is_valid().await
    }

    fn cancellation_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.cancellation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Atomically moves into `Submitting` if the current state satisfies `from`, and
    /// installs the attempt's cancellation token in the same step.
    fn begin(
        &self,
        from: impl FnOnce(&PaymentState) -> bool,
    ) -> Result<AttemptGuard<'_>, PaymentError> {
        let mut token = None;
        self.state.send_if_modified(|state| {
            if from(state) {
                let fresh = CancellationToken::new();
                *self.cancellation_slot() = Some(fresh.clone());
                token = Some(fresh);
                *state = PaymentState::Submitting;
                true
            } else {
                false
            }
        });
        token
            .map(|token| AttemptGuard {
                controller: self,
                token,
                finished: false,
            })
            .ok_or(PaymentError::AlreadyInProgress)
    }

    fn transition(&self, next: PaymentState) {
        tracing::debug!(state = next.name(), "Payment state");
        self.state.send_replace(next);
    }

    async fn run(
        &self,
        attempt: Attempt,
        guard: AttemptGuard<'_>,
    ) -> Result<PaymentOutcome, PaymentError> {
        let result = self.attempt(&attempt, &guard.token).await;
        match result {
            Ok(outcome) => {
                tracing::info!(signature = %outcome.signature, network = %outcome.network, "Payment settled");
                guard.finish(PaymentState::Succeeded(outcome.clone()));
                Ok(outcome)
            }
            Err(PaymentError::Cancelled) => {
                tracing::info!("Payment cancelled before sending");
                guard.finish(PaymentState::Idle);
                Err(PaymentError::Cancelled)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Payment failed");
                guard.finish(PaymentState::Failed(e.clone()));
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        attempt: &Attempt,
        token: &CancellationToken,
    ) -> Result<PaymentOutcome, PaymentError> {
        *self.last_attempt.lock().await = Some(attempt.clone());

        let header = tokio::select! {
            biased;
            _ = token.cancelled() => Err(PaymentError::Cancelled),
            header = self.authorize(&attempt.requirements) => header,
        };
        // A cancel that raced the signer still wins: it saw the token before it was cleared.
        *self.cancellation_slot() = None;
        if token.is_cancelled() {
            return Err(PaymentError::Cancelled);
        }
        let header = header?;

        self.transition(PaymentState::Settling);
        let response = self.client.send_paid(&attempt.url, &header).await?;
        let outcome = settled(response, &header)?;

        let receipt = Receipt {
            signature: outcome.transaction.clone(),
            timestamp: unix_millis_now(),
            resource: attempt.requirements.resource.clone(),
            amount: attempt.requirements.max_amount_required.clone(),
            asset: attempt.requirements.asset.clone(),
            network: outcome.network.clone(),
            status: ReceiptStatus::Pending,
            payer: Some(outcome.payer.unwrap_or_else(|| header.payer().to_string())),
        };
        self.receipts.append(receipt.clone()).await;
        if let Some(reconciler) = &self.reconciler {
            reconciler.track(&receipt);
        }
        Ok(PaymentOutcome {
            signature: outcome.transaction,
            network: outcome.network,
            status: outcome.status,
            body: outcome.body,
            receipt,
        })
    }

    /// `Submitting -> AwaitingSignature`: picks a signer and builds the header.
    async fn authorize(
        &self,
        requirements: &PaymentRequirements,
    ) -> Result<PaymentHeader, PaymentError> {
        match self.sessions.status().await {
            SessionStatus::Active(_) => {
                let signer = SessionSigner::active(&self.sessions).await?;
                self.sign(requirements, &signer).await
            }
            SessionStatus::Expired => Err(PaymentError::SessionExpired),
            SessionStatus::None | SessionStatus::Revoked => {
                let signer = WalletSigner::active(&self.wallets)
                    .await
                    .ok_or(PaymentError::NoSigner)?;
                self.sign(requirements, &signer).await
            }
        }
    }

    async fn sign(
        &self,
        requirements: &PaymentRequirements,
        signer: &dyn PaymentSigner,
    ) -> Result<PaymentHeader, PaymentError> {
        self.transition(PaymentState::AwaitingSignature);
        authorization::build(requirements, signer).await
    }
}

/// The running attempt. Every attempt leaves its in-progress states through
/// [`AttemptGuard::finish`], or through `Drop` when its future is dropped.
struct AttemptGuard<'a> {
    controller: &'a PaymentFlowController,
    token: CancellationToken,
    finished: bool,
}

impl AttemptGuard<'_> {
    fn finish(mut self, next: PaymentState) {
        self.finished = true;
        *self.controller.cancellation_slot() = None;
        self.controller.transition(next);
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        *self.controller.cancellation_slot() = None;
        self.controller.state.send_if_modified(|state| match state {
            PaymentState::Submitting | PaymentState::AwaitingSignature => {
                tracing::info!("Payment abandoned before sending");
                *state = PaymentState::Idle;
                true
            }
            PaymentState::Settling => {
                tracing::warn!("Payment abandoned while settling");
                *state = PaymentState::Failed(PaymentError::SettlementFailed(
                    ABANDONED_WHILE_SETTLING.to_string(),
                ));
                true
            }
            _ => false,
        });
    }
}

struct Settled {
    transaction: String,
    network: String,
    payer: Option<String>,
    status: StatusCode,
    body: Vec<u8>,
}

/// Reads the provider's verdict on a paid request.
fn settled(response: PaidResponse, header: &PaymentHeader) -> Result<Settled, PaymentError> {
    if let Some(SettleResponse::Error { reason, .. }) = &response.settlement {
        return Err(PaymentError::SettlementFailed(reason.clone()));
    }
    if response.status != StatusCode::OK {
        let reason = response
            .payment_required
            .as_ref()
            .and_then(|p| p.error.clone())
            .unwrap_or_else(|| {
                let body = String::from_utf8_lossy(&response.body);
                format!("HTTP {}: {}", response.status, body.trim())
            });
        return Err(PaymentError::SettlementFailed(reason));
    }
    match response.settlement {
        Some(SettleResponse::Success {
            payer,
            transaction,
            network,
        }) => Ok(Settled {
            transaction,
            network: if network.is_empty() {
                header.payload.network.clone()
            } else {
                network
            },
            payer,
            status: response.status,
            body: response.body,
        }),
        _ => Err(PaymentError::SettlementFailed(
            "response carried no settlement confirmation".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipts::{MemoryStore, ReceiptFilter};
    use crate::wallet::{Approval, Approver, AutoApprove, KeySource, KeypairWallet, SigningPurpose};
    use serde_json::json;
    use solana_keypair::Keypair;
    use std::time::Duration;
    use tokio::sync::Notify;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAY_TO: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";

    /// Holds every approval until released.
    struct Gate(Notify);

    #[async_trait::async_trait]
    impl Approver for Gate {
        async fn approve(&self, _wallet: &str, _purpose: &SigningPurpose) -> Approval {
            self.0.notified().await;
            Approval::Approved
        }
    }

    struct Harness {
        server: MockServer,
        controller: Arc<PaymentFlowController>,
        receipts: Arc<ReceiptStore>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new(approver: Arc<dyn Approver>, connect: bool) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let key_path = dir.path().join("id.json");
            std::fs::write(
                &key_path,
                serde_json::to_string(&Keypair::new().to_bytes().to_vec()).unwrap(),
            )
            .unwrap();
            let wallets = Arc::new(
                WalletRegistry::new().with(KeypairWallet::new("local", KeySource::File(key_path), approver)),
            );
            if connect {
                wallets.connect("local").await.unwrap();
            }
            let receipts = Arc::new(ReceiptStore::open(Arc::new(MemoryStore::new())).await);
            let controller = PaymentFlowController::new(
                wallets,
                ResourceClient::default(),
                Arc::clone(&receipts),
            );
            Self {
                server: MockServer::start().await,
                controller: Arc::new(controller),
                receipts,
                _dir: dir,
            }
        }

        fn url(&self) -> Url {
            format!("{}/api/weather", self.server.uri()).parse().unwrap()
        }

        fn requirements(&self) -> PaymentRequirements {
            serde_json::from_value(json!({
                "scheme": "exact",
                "network": "solana-devnet",
                "maxAmountRequired": "5000",
                "resource": self.url().to_string(),
                "payTo": PAY_TO,
                "maxTimeoutSeconds": 60,
                "asset": "SOL"
            }))
            .unwrap()
        }

        async fn respond(&self, template: ResponseTemplate) {
            Mock::given(method("GET"))
                .and(path("/api/weather"))
                .and(header_exists("X-PAYMENT"))
                .respond_with(template)
                .mount(&self.server)
                .await;
        }
    }

    #[tokio::test]
    async fn test_no_signer_leaves_state_unchanged() {
        let harness = Harness::new(Arc::new(AutoApprove), false).await;
        let err = harness
            .controller
            .pay(harness.url(), harness.requirements())
            .await
            .unwrap_err();
        assert_eq!(err, PaymentError::NoSigner);
        assert_eq!(harness.controller.state(), PaymentState::Idle);
    }

    #[tokio::test]
    async fn test_success_records_pending_receipt() {
        let harness = Harness::new(Arc::new(AutoApprove), true).await;
        harness
            .respond(ResponseTemplate::new(200).set_body_json(json!({
                "temperature": 21,
                "settlement": {"signature": "3sig"}
            })))
            .await;
        let outcome = harness
            .controller
            .pay(harness.url(), harness.requirements())
            .await
            .unwrap();
        assert_eq!(outcome.signature, "3sig");
        assert_eq!(outcome.network, "solana-devnet");
        assert!(matches!(harness.controller.state(), PaymentState::Succeeded(_)));

        let receipts = harness.receipts.list(&ReceiptFilter::default()).await;
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].signature, "3sig");
        assert_eq!(receipts[0].amount, "5000");
        assert_eq!(receipts[0].status, ReceiptStatus::Pending);

        // Terminal until reset.
        assert_eq!(
            harness
                .controller
                .pay(harness.url(), harness.requirements())
                .await,
            Err(PaymentError::AlreadyInProgress)
        );
        assert!(harness.controller.reset());
        assert_eq!(harness.controller.state(), PaymentState::Idle);
    }

    #[tokio::test]
    async fn test_provider_rejection_fails_then_retry_signs_fresh() {
        let harness = Harness::new(Arc::new(AutoApprove), true).await;
        harness
            .respond(ResponseTemplate::new(402).set_body_json(json!({
                "x402Version": 1,
                "accepts": [],
                "error": "insufficient_funds"
            })))
            .await;
        let err = harness
            .controller
            .pay(harness.url(), harness.requirements())
            .await
            .unwrap_err();
        assert_eq!(err, PaymentError::SettlementFailed("insufficient_funds".into()));
        assert_eq!(harness.controller.state(), PaymentState::Failed(err));
        assert!(harness.receipts.list(&ReceiptFilter::default()).await.is_empty());

        let retried = harness.controller.retry().await;
        let expected = PaymentError::SettlementFailed("insufficient_funds".into());
        assert_eq!(retried, Err(expected.clone()));
        assert_eq!(harness.controller.state(), PaymentState::Failed(expected));
        let requests = harness.server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let headers: Vec<_> = requests
            .iter()
            .map(|r| r.headers.get("X-PAYMENT").unwrap().to_str().unwrap().to_string())
            .collect();
        let first = authorization::decode_payment_header(&headers[0]).unwrap();
        let second = authorization::decode_payment_header(&headers[1]).unwrap();
        assert_ne!(
            first.payload.authorization.nonce,
            second.payload.authorization.nonce
        );
    }

    #[tokio::test]
    async fn test_ok_without_settlement_is_failure() {
        let harness = Harness::new(Arc::new(AutoApprove), true).await;
        harness
            .respond(ResponseTemplate::new(200).set_body_string("free lunch"))
            .await;
        let err = harness
            .controller
            .pay(harness.url(), harness.requirements())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::SettlementFailed(_)));
    }

    #[tokio::test]
    async fn test_invalid_requirements_fail_without_request() {
        let harness = Harness::new(Arc::new(AutoApprove), true).await;
        let mut requirements = harness.requirements();
        requirements.max_amount_required = "-1".into();
        let err = harness
            .controller
            .pay(harness.url(), requirements)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidRequirements(_)));
        assert!(harness.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_signature() {
        let gate = Arc::new(Gate(Notify::new()));
        let harness = Harness::new(gate.clone(), true).await;
        let controller = Arc::clone(&harness.controller);
        let mut states = controller.subscribe();
        let (url, requirements) = (harness.url(), harness.requirements());
        let task = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.pay(url, requirements).await }
        });

        states
            .wait_for(|s| matches!(s, PaymentState::AwaitingSignature))
            .await
            .unwrap();
        assert_eq!(
            controller.pay(harness.url(), harness.requirements()).await,
            Err(PaymentError::AlreadyInProgress)
        );
        assert!(controller.cancel().await);
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(PaymentError::Cancelled));
        assert_eq!(controller.state(), PaymentState::Idle);
        assert!(harness.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_attempt_returns_to_idle() {
        let gate = Arc::new(Gate(Notify::new()));
        let harness = Harness::new(gate.clone(), true).await;
        harness
            .respond(ResponseTemplate::new(200).set_body_json(json!({
                "settlement": {"signature": "4sig"}
            })))
            .await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            harness.controller.pay(harness.url(), harness.requirements()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(harness.controller.state(), PaymentState::Idle);
        assert!(!harness.controller.cancel().await);
        assert!(!harness.controller.reset());
        assert!(harness.server.received_requests().await.unwrap().is_empty());

        // The controller takes the next payment normally.
        gate.0.notify_one();
        let outcome = harness
            .controller
            .pay(harness.url(), harness.requirements())
            .await
            .unwrap();
        assert_eq!(outcome.signature, "4sig");
    }

    #[tokio::test]
    async fn test_dropped_while_settling_fails() {
        let harness = Harness::new(Arc::new(AutoApprove), true).await;
        harness
            .respond(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"settlement": {"signature": "5sig"}}))
                    .set_delay(Duration::from_secs(10)),
            )
            .await;
        let abandoned = tokio::time::timeout(
            Duration::from_millis(500),
            harness.controller.pay(harness.url(), harness.requirements()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(
            harness.controller.state(),
            PaymentState::Failed(PaymentError::SettlementFailed(
                ABANDONED_WHILE_SETTLING.to_string()
            ))
        );
        assert!(harness.controller.reset());
        assert_eq!(harness.controller.state(), PaymentState::Idle);
    }
}
