//! Environment-aware configuration values.
//!
//! Client configuration files tend to carry RPC endpoints with embedded API keys.
//! [`LiteralOrEnv`] lets such values be written either literally or as a reference
//! to an environment variable:
//!
//! ```json
//! {
//!   "rpc": {
//!     "solana-devnet": "https://api.devnet.solana.com",
//!     "solana": "$MAINNET_RPC_URL",
//!     "solana-testnet": "${TESTNET_RPC_URL}"
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::str::FromStr;

/// A transparent wrapper that resolves environment variables during deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"https://api.devnet.solana.com"`
/// - Simple env var: `"$SOLANA_RPC_URL"`
/// - Braced env var: `"${SOLANA_RPC_URL}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn from_literal(value: T) -> Self {
        Self(value)
    }

    pub fn inner(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Returns the variable name if `s` is written as `$VAR` or `${VAR}`.
pub fn env_reference(s: &str) -> Option<&str> {
    if let Some(braced) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        return (!braced.is_empty()).then_some(braced);
    }
    let name = s.strip_prefix('$')?;
    let valid = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    valid.then_some(name)
}

/// Resolves `s` through the environment when it is an env reference, else returns it as-is.
pub fn resolve_literal_or_env(s: &str) -> Result<String, String> {
    match env_reference(s) {
        Some(var_name) => std::env::var(var_name).map_err(|_| {
            format!("Environment variable '{var_name}' not found (referenced as '{s}')")
        }),
        None => Ok(s.to_string()),
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = resolve_literal_or_env(&s).map_err(serde::de::Error::custom)?;
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {e}")))?;
        Ok(LiteralOrEnv(parsed))
    }
}

impl<T> Serialize for LiteralOrEnv<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}
