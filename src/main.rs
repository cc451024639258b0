//! `microapi-x402` command line client.
//!
//! Pays for x402-protected HTTP resources from a local Solana keypair and keeps a
//! receipt of every settlement.
//!
//! - `wallets` – list wallet adapters and whether they are usable
//! - `discover <base-url>` – list paid resources a provider advertises
//! - `pay <url>` – pay for and fetch a resource, body on stdout
//! - `receipts list|export|remove|clear` – manage the local receipt history
//! - `lookup <signature>` – build a receipt from an on-chain transaction
//! - `reconcile` – resolve pending receipts against the chain
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` names the JSON config file (default `microapi.json`)
//! - `MICROAPI_NETWORK`, `SOLANA_RPC_URL`, `MICROAPI_DATA_DIR`, `MICROAPI_KEYPAIR`
//! - `RUST_LOG` filters log output on stderr; `OTEL_*` enables export with the `telemetry` feature

mod run;

use std::process;

use crate::run::run;

#[tokio::main]
async fn main() {
    let result = run().await;
    if let Err(e) = result {
        eprintln!("{e}");
        process::exit(1)
    }
}
