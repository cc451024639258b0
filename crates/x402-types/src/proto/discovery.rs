//! The `/.well-known/x402` discovery document.
//!
//! Providers list their paid routes together with a summary of the payment terms:
//!
//! ```json
//! {
//!   "accepts": [
//!     {
//!       "route": "GET /api/data",
//!       "requirements": {
//!         "network": "solana-devnet",
//!         "asset": "SOL",
//!         "maxAmountRequired": "5000"
//!       }
//!     }
//!   ]
//! }
//! ```
//!
//! The summary is advisory and every field is optional. Authoritative requirements
//! come from the 402 response of the route itself.

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub accepts: Vec<DiscoveredResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredResource {
    /// `"METHOD /path"` or just `"/path"`.
    pub route: String,
    #[serde(default)]
    pub requirements: DiscoveredRequirements,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount_required: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl DiscoveredResource {
    /// HTTP method of the route, from the route string or the requirements summary.
    pub fn method(&self) -> Option<&str> {
        match self.route.trim().split_once(' ') {
            Some((method, _)) => Some(method),
            None => self.requirements.method.as_deref(),
        }
    }

    pub fn path(&self) -> &str {
        let route = self.route.trim();
        match route.split_once(' ') {
            Some((_, path)) => path.trim(),
            None => route,
        }
    }

    /// Absolute URL of the route relative to the provider's base URL.
    pub fn resource_url(&self, base: &Url) -> Result<Url, url::ParseError> {
        base.join(self.path())
    }
}
