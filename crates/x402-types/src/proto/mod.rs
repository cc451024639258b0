//! Protocol types for x402 payment messages.
//!
//! This module defines the wire format spoken between the client, a resource
//! provider, and (indirectly) its facilitator. The client speaks protocol version 1,
//! which identifies networks by name (`"solana-devnet"`).
//!
//! # Key Types
//!
//! - [`v1::PaymentRequirements`] - Payment terms set by the resource provider
//! - [`v1::PaymentRequired`] - HTTP 402 response body
//! - [`v1::PaymentPayload`] - Signed payment authorization, carried in `X-PAYMENT`
//! - [`v1::SettleResponse`] - Settlement result, carried in `X-PAYMENT-RESPONSE`
//! - [`discovery::DiscoveryDocument`] - The provider's `/.well-known/x402` listing
//!
//! # Wire Format
//!
//! All types serialize to JSON using camelCase field names. Header values are
//! base64-encoded JSON, see [`crate::util::Base64Bytes`].

pub mod discovery;
pub mod v1;

/// Request header carrying the base64 [`v1::PaymentPayload`].
pub const PAYMENT_HEADER: &str = "X-PAYMENT";

/// Response header carrying the base64 [`v1::SettleResponse`].
pub const PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";

/// Response header some providers use to carry a base64 [`v1::PaymentRequired`] on a 402.
pub const PAYMENT_REQUIREMENTS_HEADER: &str = "X-PAYMENT-REQUIREMENTS";

/// Path of the provider discovery document.
pub const DISCOVERY_PATH: &str = "/.well-known/x402";
