//! Client engine for [x402](https://www.x402.org) pay-per-use HTTP APIs on Solana.
//!
//! A protected resource answers `402 Payment Required` with machine-readable payment
//! requirements. This crate takes it from there: it signs a payment authorization
//! with the user's wallet (or a short-lived session key), retries the request with
//! an `X-PAYMENT` header, records a receipt for the settlement transaction, and
//! follows that transaction on-chain until it is confirmed or failed.
//!
//! # Modules
//!
//! - [`wallet`] - wallet adapters behind the [`WalletBackend`](wallet::WalletBackend) trait, and the registry holding the active one.
//! - [`session`] - delegated session keys that sign without prompting until they expire.
//! - [`authorization`] - builds, decodes and verifies `X-PAYMENT` headers.
//! - [`flow`] - the [`PaymentFlowController`](flow::PaymentFlowController) state machine.
//! - [`transport`] - probing for requirements, discovery, and the paid request.
//! - [`chain`] - the Solana RPC seam.
//! - [`poller`] - confirmation polling for settlement transactions.
//! - [`receipts`] - durable, filterable, exportable payment receipts.
//! - [`reconcile`] - moves pending receipts to their on-chain outcome.
//! - [`lookup`] - imports a payment made elsewhere by its signature.
//! - [`config`] - JSON configuration with environment fallbacks.
//! - [`util`] - logging setup and signal handling for the binary.
//!
//! Wire types live in the `microapi-x402-types` crate.

pub mod authorization;
pub mod chain;
pub mod config;
pub mod error;
pub mod flow;
pub mod lookup;
pub mod poller;
pub mod receipts;
pub mod reconcile;
pub mod session;
pub mod transport;
pub mod util;
pub mod wallet;

pub use error::PaymentError;
pub use microapi_x402_types as types;
