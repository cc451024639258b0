//! Transaction confirmation polling.
//!
//! [`ConfirmationPoller::start`] spawns one task per signature. The task asks the node
//! for the signature status every [`PollerConfig::interval`], at most
//! [`PollerConfig::max_attempts`] times, and ends with exactly one outcome:
//!
//! - `Confirmed` once the signature reaches `confirmed` or `finalized` commitment,
//! - `Failed` if it landed with an execution error,
//! - `TimedOut` if the attempts (or the optional deadline) ran out first.
//!
//! RPC errors count as unresolved attempts. The outcome is broadcast to every
//! subscriber and returned through the [`PollHandle`]. Cancelling a handle stops the
//! observation and emits nothing; it has no effect on the transaction itself.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use solana_signature::Signature;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use microapi_x402_types::networks::Network;

use crate::chain::{ChainRpc, SignatureState};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// What the chain says about a settled or failed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationResult {
    pub slot: Option<u64>,
    /// Unix milliseconds.
    pub block_time: Option<i64>,
    /// Lamports.
    pub fee: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
    pub network: Network,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed(ConfirmationResult),
    Failed(ConfirmationResult),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationEvent {
    pub signature: Signature,
    pub outcome: ConfirmationOutcome,
}

/// Handle to one running poll.
#[derive(Debug)]
pub struct PollHandle {
    signature: Signature,
    cancellation: CancellationToken,
    task: JoinHandle<Option<ConfirmationOutcome>>,
}

impl PollHandle {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Stops observing. The transaction's fate is unaffected.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Waits for the outcome. `None` if the poll was cancelled.
    pub async fn outcome(self) -> Option<ConfirmationOutcome> {
        self.task.await.ok().flatten()
    }
}

pub struct ConfirmationPoller {
    rpc: Arc<dyn ChainRpc>,
    config: PollerConfig,
    in_flight: Arc<DashMap<Signature, CancellationToken>>,
    events: broadcast::Sender<ConfirmationEvent>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ConfirmationPoller {
    pub fn new(rpc: Arc<dyn ChainRpc>, config: PollerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            rpc,
            config,
            in_flight: Arc::new(DashMap::new()),
            events,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> PollerConfig {
        self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfirmationEvent> {
        self.events.subscribe()
    }

    pub fn is_polling(&self, signature: &Signature) -> bool {
        self.in_flight.contains_key(signature)
    }

    /// Starts polling `signature`. Returns `None` if it is already being polled.
    pub fn start(
        &self,
        signature: Signature,
        network: Network,
        deadline: Option<Instant>,
    ) -> Option<PollHandle> {
        let cancellation = self.shutdown.child_token();
        match self.in_flight.entry(signature) {
            Entry::Occupied(_) => {
                tracing::debug!(%signature, "Already polling");
                return None;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(cancellation.clone());
            }
        }
        let poll = Poll {
            rpc: Arc::clone(&self.rpc),
            config: self.config,
            signature,
            network,
            deadline,
        };
        let in_flight = Arc::clone(&self.in_flight);
        let events = self.events.clone();
        let token = cancellation.clone();
        let task = self.tracker.spawn(async move {
            let outcome = poll.run(&token).await;
            in_flight.remove(&signature);
            if let Some(outcome) = &outcome {
                let _ = events.send(ConfirmationEvent {
                    signature,
                    outcome: outcome.clone(),
                });
            }
            outcome
        });
        Some(PollHandle {
            signature,
            cancellation,
            task,
        })
    }

    /// Cancels every running poll and waits for the tasks to wind down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

struct Poll {
    rpc: Arc<dyn ChainRpc>,
    config: PollerConfig,
    signature: Signature,
    network: Network,
    deadline: Option<Instant>,
}

impl Poll {
    #[tracing::instrument(name = "confirmation_poll", skip_all, fields(signature = %self.signature, network = %self.network))]
    async fn run(&self, cancellation: &CancellationToken) -> Option<ConfirmationOutcome> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = 0u32;
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => return None,
                _ = ticker.tick() => {}
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::info!(attempts, "Deadline passed before confirmation");
                return Some(ConfirmationOutcome::TimedOut);
            }
            attempts += 1;
            let status = tokio::select! {
                _ = cancellation.cancelled() => return None,
                status = self.rpc.signature_status(self.network, &self.signature) => status,
            };
            match status {
                Ok(state) if state.is_settled() => {
                    let result = self.details(true, None).await;
                    tracing::info!(attempts, slot = ?result.slot, "Transaction confirmed");
                    return Some(ConfirmationOutcome::Confirmed(result));
                }
                Ok(SignatureState::Failed(error)) => {
                    let result = self.details(false, Some(error)).await;
                    tracing::warn!(attempts, error = ?result.error, "Transaction failed");
                    return Some(ConfirmationOutcome::Failed(result));
                }
                Ok(state) => tracing::debug!(attempts, ?state, "Not settled yet"),
                Err(e) => tracing::warn!(attempts, error = %e, "Status query failed, will retry"),
            }
            if attempts >= self.config.max_attempts {
                tracing::info!(attempts, "Giving up on confirmation");
                return Some(ConfirmationOutcome::TimedOut);
            }
        }
    }

    /// Best-effort transaction details. Missing details never change the outcome.
    async fn details(&self, success: bool, error: Option<String>) -> ConfirmationResult {
        let details = match self.rpc.transaction(self.network, &self.signature).await {
            Ok(details) => details.unwrap_or_default(),
            Err(e) => {
                tracing::debug!(error = %e, "Transaction details unavailable");
                Default::default()
            }
        };
        ConfirmationResult {
            slot: details.slot,
            block_time: details.block_time.map(|secs| secs.saturating_mul(1000)),
            fee: details.fee,
            success,
            error: error.or(details.error),
            network: self.network,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TransactionDetails;
    use crate::chain::testing::ScriptedRpc;

    fn poller(rpc: Arc<ScriptedRpc>) -> ConfirmationPoller {
        ConfirmationPoller::new(rpc, PollerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_on_third_attempt() {
        let rpc = Arc::new(
            ScriptedRpc::new(vec![
                Ok(SignatureState::Unknown),
                Ok(SignatureState::Pending),
                Ok(SignatureState::Confirmed),
            ])
            .with_details(TransactionDetails {
                slot: Some(42),
                block_time: Some(1_700_000_000),
                fee: Some(5000),
                ..Default::default()
            }),
        );
        let poller = poller(Arc::clone(&rpc));
        let mut events = poller.subscribe();
        let signature = Signature::from([7u8; 64]);

        let handle = poller
            .start(signature, Network::SolanaDevnet, None)
            .unwrap();
        let outcome = handle.outcome().await.unwrap();
        let expected = ConfirmationOutcome::Confirmed(ConfirmationResult {
            slot: Some(42),
            block_time: Some(1_700_000_000_000),
            fee: Some(5000),
            success: true,
            error: None,
            network: Network::SolanaDevnet,
        });
        assert_eq!(outcome, expected);
        assert_eq!(rpc.calls(), 3);

        let event = events.recv().await.unwrap();
        assert_eq!(event.outcome, expected);
        assert!(events.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(rpc.calls(), 3);
        assert!(!poller.is_polling(&signature));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_resolving_times_out_once() {
        let rpc = Arc::new(ScriptedRpc::new(vec![
            Ok(SignatureState::Unknown),
            Err("connection refused".into()),
            Ok(SignatureState::Pending),
        ]));
        let poller = poller(Arc::clone(&rpc));
        let mut events = poller.subscribe();
        let started = Instant::now();

        let handle = poller
            .start(Signature::from([1u8; 64]), Network::SolanaDevnet, None)
            .unwrap();
        assert_eq!(handle.outcome().await, Some(ConfirmationOutcome::TimedOut));
        assert_eq!(rpc.calls(), DEFAULT_MAX_ATTEMPTS as usize);
        // The first attempt is immediate, the rest are spaced by the interval.
        assert_eq!(
            started.elapsed(),
            DEFAULT_POLL_INTERVAL * (DEFAULT_MAX_ATTEMPTS - 1)
        );
        assert_eq!(
            events.recv().await.unwrap().outcome,
            ConfirmationOutcome::TimedOut
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_is_distinct_from_timeout() {
        let rpc = Arc::new(ScriptedRpc::new(vec![Ok(SignatureState::Failed(
            "InstructionError(0, Custom(1))".into(),
        ))]));
        let poller = poller(rpc);
        let handle = poller
            .start(Signature::from([2u8; 64]), Network::Solana, None)
            .unwrap();
        match handle.outcome().await {
            Some(ConfirmationOutcome::Failed(result)) => {
                assert!(!result.success);
                assert_eq!(result.error.as_deref(), Some("InstructionError(0, Custom(1))"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_start_is_noop_and_cancel_is_silent() {
        let rpc = Arc::new(ScriptedRpc::new(vec![Ok(SignatureState::Pending)]));
        let poller = poller(Arc::clone(&rpc));
        let mut events = poller.subscribe();
        let signature = Signature::from([3u8; 64]);

        let handle = poller
            .start(signature, Network::SolanaDevnet, None)
            .unwrap();
        assert!(poller.start(signature, Network::SolanaDevnet, None).is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();
        assert_eq!(handle.outcome().await, None);
        assert!(events.try_recv().is_err());
        assert!(!poller.is_polling(&signature));

        // A fresh poll may start once the previous one is gone.
        assert!(poller.start(signature, Network::SolanaDevnet, None).is_some());
        poller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_attempts_short() {
        let rpc = Arc::new(ScriptedRpc::new(vec![Ok(SignatureState::Unknown)]));
        let poller = poller(Arc::clone(&rpc));
        let deadline = Instant::now() + Duration::from_secs(5);
        let handle = poller
            .start(Signature::from([4u8; 64]), Network::SolanaDevnet, Some(deadline))
            .unwrap();
        assert_eq!(handle.outcome().await, Some(ConfirmationOutcome::TimedOut));
        // Ticks at 0s, 2s and 4s poll; the tick at 6s is past the deadline.
        assert_eq!(rpc.calls(), 3);
    }
}
