#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Wire types for the x402 payment protocol as spoken by the MicroAPI client.
//!
//! The x402 protocol enables micropayments over HTTP by leveraging the 402 Payment Required
//! status code. When a client requests a paid resource, the server responds with payment
//! requirements. The client signs a payment authorization, attaches it to a retry of the
//! same request, and receives the resource together with a settlement confirmation.
//!
//! This crate is transport- and signer-agnostic: it only describes what travels over the
//! wire and how it is encoded.
//!
//! # Modules
//!
//! - [`config`] - `$VAR` / `${VAR}` resolution for configuration values
//! - [`networks`] - Registry of the Solana clusters the client can settle on
//! - [`proto`] - Wire format types (requirements, payment header, settlement, discovery)
//! - [`timestamp`] - Unix timestamp utilities for payment authorization windows
//! - [`util`] - Helper types (base64, token amounts)

pub mod config;
pub mod networks;
pub mod proto;
pub mod timestamp;
pub mod util;
