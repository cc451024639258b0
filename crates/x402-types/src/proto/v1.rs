//! Protocol version 1 (V1) types for x402.
//!
//! V1 uses network names (e.g., "solana-devnet") instead of CAIP-2 chain IDs.
//!
//! # Key Types
//!
//! - [`X402Version1`] - Version marker that serializes as `1`
//! - [`PaymentRequirements`] - Payment terms set by the resource provider
//! - [`PaymentRequired`] - HTTP 402 response body
//! - [`PaymentPayload`] - Signed payment authorization from the payer
//! - [`PaymentAuthorization`] - The canonical message a payer signs
//! - [`SessionDelegation`] - Wallet approval for a session key to sign on its behalf
//! - [`SettleResponse`] - Settlement result

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;

use crate::timestamp::UnixTimestamp;
use crate::util::TokenAmount;

crate::lit_str!(ExactScheme, "exact");
crate::lit_str!(SessionPurpose, "microapi-session");

/// Version marker for x402 protocol version 1.
///
/// This type serializes as the integer `1` and is used to identify V1 protocol
/// messages in the wire format.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version1;

impl X402Version1 {
    pub const VALUE: u8 = 1;
}

impl PartialEq<u8> for X402Version1 {
    fn eq(&self, other: &u8) -> bool {
        *other == Self::VALUE
    }
}

impl From<X402Version1> for u8 {
    fn from(_: X402Version1) -> Self {
        X402Version1::VALUE
    }
}

impl Serialize for X402Version1 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version1 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        if num == Self::VALUE {
            Ok(X402Version1)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected version {}, got {}",
                Self::VALUE,
                num
            )))
        }
    }
}

impl Display for X402Version1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::VALUE)
    }
}

/// Payment requirements set by the resource provider.
///
/// Server-issued and therefore untrusted: fields are kept as received so that a
/// client can validate them and report exactly what was wrong.
///
/// ```json
/// {
///   "scheme": "exact",
///   "network": "solana-devnet",
///   "maxAmountRequired": "5000",
///   "resource": "https://api.example.com/weather",
///   "payTo": "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin",
///   "maxTimeoutSeconds": 60,
///   "asset": "SOL"
/// }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// The payment scheme (e.g., "exact").
    pub scheme: String,
    /// The network name (e.g., "solana-devnet").
    pub network: String,
    /// The maximum amount required, as an integer string in the asset's smallest unit.
    pub max_amount_required: String,
    /// The resource URL being paid for.
    pub resource: String,
    /// Human-readable description of the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Optional JSON schema for the resource output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    /// The recipient address for payment.
    pub pay_to: String,
    /// Maximum time in seconds for payment validity.
    pub max_timeout_seconds: u64,
    /// `"SOL"` for native lamports, otherwise the token mint address.
    pub asset: String,
    /// Scheme-specific extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// HTTP 402 Payment Required response body for V1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Protocol version (always 1).
    pub x402_version: X402Version1,
    /// List of acceptable payment methods.
    #[serde(default)]
    pub accepts: Vec<PaymentRequirements>,
    /// Optional error message, e.g. why a previously attached payment was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A signed payment authorization from the payer.
///
/// # Type Parameters
///
/// - `TScheme` - The scheme identifier type (default: `String`)
/// - `TPayload` - The scheme-specific payload type (default: raw JSON)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload<TScheme = String, TPayload = serde_json::Value> {
    /// Protocol version (always 1).
    pub x402_version: X402Version1,
    /// The payment scheme (e.g., "exact").
    pub scheme: TScheme,
    /// The network name (e.g., "solana-devnet").
    pub network: String,
    /// The scheme-specific signed payload.
    pub payload: TPayload,
}

/// The header body produced by this client.
pub type ExactPaymentPayload = PaymentPayload<ExactScheme, ExactPayload>;

/// Payload of the `exact` scheme: an authorization, its ed25519 signature, and,
/// when a session key signed it, the wallet's delegation to that key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactPayload {
    pub authorization: PaymentAuthorization,
    /// Base58 ed25519 signature over [`PaymentAuthorization::canonical_bytes`].
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionDelegation>,
}

/// The message a payer signs.
///
/// Field order is part of the wire contract: the signature covers the JSON
/// serialization of this struct exactly as declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorization {
    /// Base58 public key of whoever signs, wallet or session key.
    pub payer: String,
    pub resource: String,
    pub amount: TokenAmount,
    pub asset: String,
    pub pay_to: String,
    pub network: String,
    /// Hex-encoded 16 random bytes.
    pub nonce: String,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
}

impl PaymentAuthorization {
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// The message a wallet signs to authorize a session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuthorizationMessage {
    /// Base58 public key of the session.
    pub session_key: String,
    /// Unix milliseconds after which the session may no longer sign.
    pub expiry: u64,
    pub purpose: SessionPurpose,
}

impl SessionAuthorizationMessage {
    pub fn new(session_key: String, expiry: u64) -> Self {
        Self {
            session_key,
            expiry,
            purpose: SessionPurpose,
        }
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Proof that a wallet delegated signing to a session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDelegation {
    pub wallet_public_key: String,
    pub session_public_key: String,
    pub expiry: u64,
    pub purpose: SessionPurpose,
    /// Base58 wallet signature over [`SessionAuthorizationMessage::canonical_bytes`].
    pub signature: String,
}

impl SessionDelegation {
    /// Reconstructs the message the wallet signed.
    pub fn message(&self) -> SessionAuthorizationMessage {
        SessionAuthorizationMessage {
            session_key: self.session_public_key.clone(),
            expiry: self.expiry,
            purpose: self.purpose,
        }
    }
}

/// Settlement result, as reported by the resource provider in `X-PAYMENT-RESPONSE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleResponse {
    /// Settlement succeeded.
    Success {
        /// The address that paid, when reported.
        payer: Option<String>,
        /// The transaction signature.
        transaction: String,
        /// The network where settlement occurred.
        network: String,
    },
    /// Settlement failed.
    Error {
        /// The reason for failure.
        reason: String,
        /// The network where settlement was attempted.
        network: String,
    },
}

impl SettleResponse {
    pub fn transaction(&self) -> Option<&str> {
        match self {
            SettleResponse::Success { transaction, .. } => Some(transaction),
            SettleResponse::Error { .. } => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponseWire {
    pub success: bool,
    #[serde(default, alias = "error_reason", skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default)]
    pub network: String,
}

impl Serialize for SettleResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wire = match self {
            SettleResponse::Success {
                payer,
                transaction,
                network,
            } => SettleResponseWire {
                success: true,
                error_reason: None,
                payer: payer.clone(),
                transaction: Some(transaction.clone()),
                network: network.clone(),
            },
            SettleResponse::Error { reason, network } => SettleResponseWire {
                success: false,
                error_reason: Some(reason.clone()),
                payer: None,
                transaction: None,
                network: network.clone(),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SettleResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = SettleResponseWire::deserialize(deserializer)?;
        match wire.success {
            true => {
                let transaction = wire
                    .transaction
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| serde::de::Error::missing_field("transaction"))?;
                Ok(SettleResponse::Success {
                    payer: wire.payer,
                    transaction,
                    network: wire.network,
                })
            }
            false => Ok(SettleResponse::Error {
                reason: wire
                    .error_reason
                    .unwrap_or_else(|| "settlement failed".to_string()),
                network: wire.network,
            }),
        }
    }
}
