//! Token amounts in the smallest on-chain unit.
//!
//! x402 carries amounts as decimal integer strings (`"5000"`) so that JSON consumers
//! never round them through a floating point number. [`TokenAmount`] is the parsed form.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// A non-negative amount in the smallest unit of an asset (lamports, token base units).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenAmount(pub u64);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenAmountParseError {
    #[error("amount is empty")]
    Empty,
    #[error("amount must be a non-negative integer, got {0:?}")]
    NotAnInteger(String),
    #[error("amount {0} does not fit into 64 bits")]
    Overflow(String),
}

impl TokenAmount {
    pub fn inner(&self) -> u64 {
        self.0
    }

    /// Renders the amount with `decimals` fractional digits, trimming trailing zeros.
    ///
    /// ```rust
    /// use microapi_x402_types::util::TokenAmount;
    ///
    /// assert_eq!(TokenAmount(5000).format_units(9), "0.000005");
    /// assert_eq!(TokenAmount(1_500_000).format_units(6), "1.5");
    /// assert_eq!(TokenAmount(42).format_units(0), "42");
    /// ```
    pub fn format_units(&self, decimals: u8) -> String {
        if decimals == 0 {
            return self.0.to_string();
        }
        let scale = 10u128.pow(decimals as u32);
        let value = self.0 as u128;
        let whole = value / scale;
        let fraction = value % scale;
        if fraction == 0 {
            return whole.to_string();
        }
        let fraction = format!("{:0width$}", fraction, width = decimals as usize);
        format!("{}.{}", whole, fraction.trim_end_matches('0'))
    }
}

impl FromStr for TokenAmount {
    type Err = TokenAmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TokenAmountParseError::Empty);
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TokenAmountParseError::NotAnInteger(s.to_string()));
        }
        s.parse::<u64>()
            .map(TokenAmount)
            .map_err(|_| TokenAmountParseError::Overflow(s.to_string()))
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount(value)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer_string() {
        assert_eq!("5000".parse::<TokenAmount>().unwrap(), TokenAmount(5000));
        assert_eq!("0".parse::<TokenAmount>().unwrap(), TokenAmount(0));
    }

    #[test]
    fn test_parse_rejects_non_integers() {
        assert_eq!("".parse::<TokenAmount>(), Err(TokenAmountParseError::Empty));
        for bad in ["-1", "1.5", "+3", " 4", "1e3", "0x10"] {
            assert!(
                matches!(
                    bad.parse::<TokenAmount>(),
                    Err(TokenAmountParseError::NotAnInteger(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_overflow() {
        let err = "18446744073709551616".parse::<TokenAmount>().unwrap_err();
        assert!(matches!(err, TokenAmountParseError::Overflow(_)));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&TokenAmount(12)).unwrap();
        assert_eq!(json, "\"12\"");
        let back: TokenAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TokenAmount(12));
    }
}
