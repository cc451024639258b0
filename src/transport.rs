//! HTTP side of x402: probing for requirements, discovery, and the paid request.

use http::StatusCode;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use microapi_x402_types::networks::Network;
use microapi_x402_types::proto::discovery::DiscoveryDocument;
use microapi_x402_types::proto::v1::{PaymentRequired, SettleResponse};
use microapi_x402_types::proto::{
    DISCOVERY_PATH, PAYMENT_HEADER, PAYMENT_REQUIREMENTS_HEADER, PAYMENT_RESPONSE_HEADER,
};
use microapi_x402_types::util::Base64Bytes;

use crate::authorization::PaymentHeader;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to deserialize response: {context}: {reason}")]
    Deserialization {
        context: &'static str,
        reason: String,
    },
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("Failed to read response body: {context}: {source}")]
    ResponseBodyRead {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Response to the request that carried `X-PAYMENT`.
#[derive(Debug, Clone)]
pub struct PaidResponse {
    pub status: StatusCode,
    /// Settlement metadata from `X-PAYMENT-RESPONSE` or the body's `settlement` field.
    pub settlement: Option<SettleResponse>,
    /// Present when the provider answered 402 again, i.e. refused the payment.
    pub payment_required: Option<PaymentRequired>,
    pub body: Vec<u8>,
}

/// Body-level settlement shape used by providers that do not set `X-PAYMENT-RESPONSE`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BodySettlement {
    #[serde(default, alias = "txHash", alias = "signature")]
    transaction: Option<String>,
    #[serde(default)]
    payer: Option<String>,
    #[serde(default)]
    network: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BodyWithSettlement {
    settlement: BodySettlement,
}

/// Thin client for resource providers.
#[derive(Debug, Clone, Default)]
pub struct ResourceClient {
    client: Client,
}

impl ResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Requests `url` without payment and returns its requirements if it answers 402.
    #[tracing::instrument(skip(self), fields(url = %url), err)]
    pub async fn probe_requirements(
        &self,
        url: &Url,
    ) -> Result<Option<PaymentRequired>, TransportError> {
        let context = "probe";
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TransportError::Http { context, source: e })?;
        if response.status() != StatusCode::PAYMENT_REQUIRED {
            tracing::debug!(status = %response.status(), "Resource did not ask for payment");
            return Ok(None);
        }
        let from_header = header_payment_required(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::ResponseBodyRead { context, source: e })?;
        match serde_json::from_slice::<PaymentRequired>(&body) {
            Ok(payment_required) => Ok(Some(payment_required)),
            Err(e) => from_header.map(Some).ok_or(TransportError::Deserialization {
                context,
                reason: e.to_string(),
            }),
        }
    }

    /// Fetches `/.well-known/x402` from the provider at `base_url`.
    #[tracing::instrument(skip(self), fields(base_url = %base_url), err)]
    pub async fn discover(&self, base_url: &Url) -> Result<DiscoveryDocument, TransportError> {
        let context = "discover";
        let url = base_url
            .join(DISCOVERY_PATH)
            .map_err(|e| TransportError::UrlParse { context, source: e })?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Http { context, source: e })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::ResponseBodyRead { context, source: e })?;
        if status != StatusCode::OK {
            return Err(TransportError::HttpStatus {
                context,
                status,
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| TransportError::Deserialization {
            context,
            reason: e.to_string(),
        })
    }

    /// Issues the paid request. Exactly one HTTP call, no retry.
    #[tracing::instrument(skip(self, header), fields(url = %url), err)]
    pub async fn send_paid(
        &self,
        url: &Url,
        header: &PaymentHeader,
    ) -> Result<PaidResponse, TransportError> {
        let context = "paid request";
        let response = self
            .client
            .get(url.clone())
            .header(PAYMENT_HEADER, header.as_str())
            .send()
            .await
            .map_err(|e| TransportError::Http { context, source: e })?;
        let status = response.status();
        let header_settlement = response
            .headers()
            .get(PAYMENT_RESPONSE_HEADER)
            .and_then(|v| {
                Base64Bytes::from(v.as_bytes())
                    .decode_json::<SettleResponse>()
                    .inspect_err(|e| tracing::warn!(error = %e, "Unreadable X-PAYMENT-RESPONSE"))
                    .ok()
            });
        let body = match response.bytes().await {
            Ok(body) => body.to_vec(),
            // The provider already reported settlement; losing the body must not lose that.
            Err(e) => match &header_settlement {
                Some(SettleResponse::Success { transaction, .. }) => {
                    tracing::warn!(error = %e, transaction, "Paid response body unreadable, keeping settlement");
                    Vec::new()
                }
                _ => return Err(TransportError::ResponseBodyRead { context, source: e }),
            },
        };
        let settlement = header_settlement.or_else(|| body_settlement(&body, header));
        let payment_required = (status == StatusCode::PAYMENT_REQUIRED)
            .then(|| serde_json::from_slice::<PaymentRequired>(&body).ok())
            .flatten();
        tracing::debug!(%status, settled = settlement.is_some(), "Paid request answered");
        Ok(PaidResponse {
            status,
            settlement,
            payment_required,
            body,
        })
    }
}

fn header_payment_required(headers: &http::HeaderMap) -> Option<PaymentRequired> {
    let value = headers.get(PAYMENT_REQUIREMENTS_HEADER)?;
    Base64Bytes::from(value.as_bytes()).decode_json().ok()
}

fn body_settlement(body: &[u8], header: &PaymentHeader) -> Option<SettleResponse> {
    let parsed: BodyWithSettlement = serde_json::from_slice(body).ok()?;
    let transaction = parsed.settlement.transaction.filter(|t| !t.is_empty())?;
    Some(SettleResponse::Success {
        payer: parsed.settlement.payer,
        transaction,
        network: parsed
            .settlement
            .network
            .unwrap_or_else(|| header.payload.network.clone()),
    })
}

/// Solscan link for a settlement signature.
pub fn explorer_url(signature: &str, network: Network) -> String {
    network.explorer_tx_url(signature)
}
