//! Building and checking `X-PAYMENT` headers.
//!
//! [`build`] validates untrusted [`PaymentRequirements`], binds them to the payer and
//! to fresh single-use values (nonce and validity window), has a [`PaymentSigner`] sign
//! the canonical message, and base64-encodes the resulting [`ExactPaymentPayload`].
//! Nothing is signed and no prompt is shown when validation fails.
//!
//! [`verify_payment_header`] is the inverse: it decodes a header and checks the payer
//! signature and, for session-signed payments, the wallet's delegation.

use solana_pubkey::Pubkey;
use solana_signature::Signature;
use std::str::FromStr;
use url::Url;

use microapi_x402_types::networks::Network;
use microapi_x402_types::proto::v1::{
    ExactPayload, ExactPaymentPayload, ExactScheme, PaymentAuthorization, PaymentPayload,
    PaymentRequirements, SessionDelegation, X402Version1,
};
use microapi_x402_types::timestamp::UnixTimestamp;
use microapi_x402_types::util::{Base64Bytes, Base64JsonError, TokenAmount, TokenAmountParseError};

use crate::error::PaymentError;
use crate::session::SessionKeyManager;
use crate::wallet::{SigningPurpose, WalletRegistry};

/// Asset name for native SOL.
pub const NATIVE_ASSET: &str = "SOL";

#[derive(Debug, thiserror::Error)]
pub enum AuthorizationError {
    #[error("unsupported scheme {0:?}, expected \"exact\"")]
    UnsupportedScheme(String),
    #[error("unknown network {0:?}")]
    UnknownNetwork(String),
    #[error("maxAmountRequired: {0}")]
    InvalidAmount(#[from] TokenAmountParseError),
    #[error("resource is not an absolute URL: {0:?}")]
    InvalidResource(String),
    #[error("payTo is not a base58 public key: {0:?}")]
    InvalidPayTo(String),
    #[error("asset must be \"SOL\" or a base58 mint address, got {0:?}")]
    InvalidAsset(String),
    #[error("maxTimeoutSeconds must be greater than zero")]
    ZeroTimeout,
    #[error("malformed payment header: {0}")]
    MalformedHeader(#[from] Base64JsonError),
    #[error("invalid public key {0:?}")]
    InvalidPublicKey(String),
    #[error("invalid signature encoding {0:?}")]
    InvalidSignatureEncoding(String),
    #[error("payment signature does not verify against payer {0}")]
    BadSignature(String),
    #[error("session delegation does not verify against wallet {0}")]
    BadDelegation(String),
    #[error("payment signed by {payer}, but the delegation is for session {session}")]
    DelegationMismatch { payer: String, session: String },
    #[error("failed to encode payment: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asset {
    Sol,
    Mint(Pubkey),
}

/// [`PaymentRequirements`] that passed validation, in parsed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequirements {
    pub network: Network,
    pub amount: TokenAmount,
    pub resource: Url,
    pub pay_to: Pubkey,
    pub asset: Asset,
    pub max_timeout_seconds: u64,
}

/// Checks server-issued requirements before anything is signed.
pub fn validate(
    requirements: &PaymentRequirements,
) -> Result<ValidatedRequirements, AuthorizationError> {
    if requirements.scheme != ExactScheme::VALUE {
        return Err(AuthorizationError::UnsupportedScheme(
            requirements.scheme.clone(),
        ));
    }
    let network = Network::from_str(&requirements.network)
        .map_err(|_| AuthorizationError::UnknownNetwork(requirements.network.clone()))?;
    let amount = TokenAmount::from_str(&requirements.max_amount_required)?;
    let resource = Url::parse(&requirements.resource)
        .ok()
        .filter(|url| url.has_host())
        .ok_or_else(|| AuthorizationError::InvalidResource(requirements.resource.clone()))?;
    let pay_to = Pubkey::from_str(&requirements.pay_to)
        .map_err(|_| AuthorizationError::InvalidPayTo(requirements.pay_to.clone()))?;
    if requirements.max_timeout_seconds == 0 {
        return Err(AuthorizationError::ZeroTimeout);
    }
    let asset = if requirements.asset == NATIVE_ASSET {
        Asset::Sol
    } else {
        Pubkey::from_str(&requirements.asset)
            .map(Asset::Mint)
            .map_err(|_| AuthorizationError::InvalidAsset(requirements.asset.clone()))?
    };
    Ok(ValidatedRequirements {
        network,
        amount,
        resource,
        pay_to,
        asset,
        max_timeout_seconds: requirements.max_timeout_seconds,
    })
}

/// Something that can sign a payment authorization: the active wallet or a session key.
#[async_trait::async_trait]
pub trait PaymentSigner: Send + Sync {
    /// Key the authorization is bound to, as `payer`.
    fn public_key(&self) -> Pubkey;

    /// Signs `message`. May suspend on user approval.
    async fn sign(&self, message: &[u8], purpose: &SigningPurpose)
    -> Result<Signature, PaymentError>;

    /// Delegation proof to attach when the signer acts on a wallet's behalf.
    fn delegation(&self) -> Option<SessionDelegation> {
        None
    }
}

/// Signs through the active wallet of a [`WalletRegistry`].
pub struct WalletSigner<'a> {
    wallets: &'a WalletRegistry,
    public_key: Pubkey,
}

impl<'a> WalletSigner<'a> {
    /// `None` when no wallet is connected.
    pub async fn active(wallets: &'a WalletRegistry) -> Option<Self> {
        let public_key = wallets.active_public_key().await?;
        Some(Self {
            wallets,
            public_key,
        })
    }
}

#[async_trait::async_trait]
impl PaymentSigner for WalletSigner<'_> {
    fn public_key(&self) -> Pubkey {
        self.public_key
    }

    async fn sign(
        &self,
        message: &[u8],
        purpose: &SigningPurpose,
    ) -> Result<Signature, PaymentError> {
        Ok(self.wallets.sign_with_active(message, purpose).await?)
    }
}

/// Signs with the live session key, attaching the wallet's delegation.
pub struct SessionSigner<'a> {
    sessions: &'a SessionKeyManager,
    delegation: SessionDelegation,
    public_key: Pubkey,
}

impl<'a> SessionSigner<'a> {
    pub async fn active(sessions: &'a SessionKeyManager) -> Result<Self, PaymentError> {
        let delegation = sessions.delegation().await?;
        let public_key = Pubkey::from_str(&delegation.session_public_key)
            .map_err(|_| PaymentError::NoSigner)?;
        Ok(Self {
            sessions,
            delegation,
            public_key,
        })
    }
}

#[async_trait::async_trait]
impl PaymentSigner for SessionSigner<'_> {
    fn public_key(&self) -> Pubkey {
        self.public_key
    }

    async fn sign(
        &self,
        message: &[u8],
        _purpose: &SigningPurpose,
    ) -> Result<Signature, PaymentError> {
        Ok(self.sessions.sign(message).await?)
    }

    fn delegation(&self) -> Option<SessionDelegation> {
        Some(self.delegation.clone())
    }
}

/// An encoded `X-PAYMENT` header value together with what it encodes.
#[derive(Debug, Clone)]
pub struct PaymentHeader {
    pub value: String,
    pub payload: ExactPaymentPayload,
}

impl PaymentHeader {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn payer(&self) -> &str {
        &self.payload.payload.authorization.payer
    }
}

/// Builds a fresh payment header for `requirements`, signed by `signer`.
///
/// Every call draws a new nonce and validity window.
pub async fn build(
    requirements: &PaymentRequirements,
    signer: &dyn PaymentSigner,
) -> Result<PaymentHeader, PaymentError> {
    let validated = validate(requirements)?;
    let now = UnixTimestamp::now();
    let authorization = PaymentAuthorization {
        payer: signer.public_key().to_string(),
        resource: requirements.resource.clone(),
        amount: validated.amount,
        asset: requirements.asset.clone(),
        pay_to: requirements.pay_to.clone(),
        network: requirements.network.clone(),
        nonce: hex::encode(rand::random::<[u8; 16]>()),
        valid_after: now,
        valid_before: now + validated.max_timeout_seconds,
    };
    let message = authorization
        .canonical_bytes()
        .map_err(AuthorizationError::from)?;
    let purpose = SigningPurpose::Payment {
        resource: requirements.resource.clone(),
        amount: requirements.max_amount_required.clone(),
        asset: requirements.asset.clone(),
        network: requirements.network.clone(),
        pay_to: requirements.pay_to.clone(),
    };
    let signature = signer.sign(&message, &purpose).await?;
    let payload = PaymentPayload {
        x402_version: X402Version1,
        scheme: ExactScheme,
        network: requirements.network.clone(),
        payload: ExactPayload {
            authorization,
            signature: signature.to_string(),
            session: signer.delegation(),
        },
    };
    let value = Base64Bytes::encode_json(&payload)
        .map_err(AuthorizationError::from)?
        .to_string();
    Ok(PaymentHeader { value, payload })
}

/// Decodes a header value without checking signatures.
pub fn decode_payment_header(header: &str) -> Result<ExactPaymentPayload, AuthorizationError> {
    Ok(Base64Bytes::from(header).decode_json()?)
}

fn verify_ed25519(
    public_key: &str,
    signature: &str,
    message: &[u8],
) -> Result<bool, AuthorizationError> {
    let public_key = Pubkey::from_str(public_key)
        .map_err(|_| AuthorizationError::InvalidPublicKey(public_key.to_string()))?;
    let signature = Signature::from_str(signature)
        .map_err(|_| AuthorizationError::InvalidSignatureEncoding(signature.to_string()))?;
    Ok(signature.verify(public_key.as_ref(), message))
}

/// Decodes a header value and checks its signature chain.
pub fn verify_payment_header(header: &str) -> Result<ExactPaymentPayload, AuthorizationError> {
    let decoded = decode_payment_header(header)?;
    let exact = &decoded.payload;
    let payer = &exact.authorization.payer;
    let message = exact.authorization.canonical_bytes()?;
    if !verify_ed25519(payer, &exact.signature, &message)? {
        return Err(AuthorizationError::BadSignature(payer.clone()));
    }
    if let Some(delegation) = &exact.session {
        if &delegation.session_public_key != payer {
            return Err(AuthorizationError::DelegationMismatch {
                payer: payer.clone(),
                session: delegation.session_public_key.clone(),
            });
        }
        let delegated = delegation.message().canonical_bytes()?;
        if !verify_ed25519(
            &delegation.wallet_public_key,
            &delegation.signature,
            &delegated,
        )? {
            return Err(AuthorizationError::BadDelegation(
                delegation.wallet_public_key.clone(),
            ));
        }
    }
    Ok(decoded)
}
