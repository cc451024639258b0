//! Known Solana networks.
//!
//! x402 v1 identifies networks by name (`"solana"`, `"solana-devnet"`). Wallet tooling and
//! older configuration use cluster names instead (`"mainnet-beta"`, `"devnet"`). [`Network`]
//! accepts both spellings and always renders the x402 name.
//!
//! Each network also knows its CAIP-2 reference (the first 32 characters of the genesis
//! hash), its public RPC endpoint, and the `cluster` query parameter used by explorers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// The CAIP-2 namespace for Solana chains.
pub const SOLANA_NAMESPACE: &str = "solana";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Network {
    Solana,
    SolanaDevnet,
    SolanaTestnet,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Unknown network: {0}")]
pub struct UnknownNetwork(pub String);

impl Network {
    pub const ALL: [Network; 3] = [Network::Solana, Network::SolanaDevnet, Network::SolanaTestnet];

    /// The x402 v1 network name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Solana => "solana",
            Network::SolanaDevnet => "solana-devnet",
            Network::SolanaTestnet => "solana-testnet",
        }
    }

    /// The cluster name used by Solana tooling.
    pub fn cluster(&self) -> &'static str {
        match self {
            Network::Solana => "mainnet-beta",
            Network::SolanaDevnet => "devnet",
            Network::SolanaTestnet => "testnet",
        }
    }

    /// CAIP-2 chain reference: genesis hash prefix.
    pub fn caip2_reference(&self) -> &'static str {
        match self {
            Network::Solana => "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp",
            Network::SolanaDevnet => "EtWTRABZaYq6iMfeYKouRu166VU2xqa1",
            Network::SolanaTestnet => "4uhcVJyU9pJkvQyS88uRDiswHXSCkY3z",
        }
    }

    /// Full CAIP-2 chain id, e.g. `solana:EtWTRABZaYq6iMfeYKouRu166VU2xqa1`.
    pub fn caip2(&self) -> String {
        format!("{}:{}", SOLANA_NAMESPACE, self.caip2_reference())
    }

    /// Public RPC endpoint operated by Solana Labs for this cluster.
    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            Network::Solana => "https://api.mainnet-beta.solana.com",
            Network::SolanaDevnet => "https://api.devnet.solana.com",
            Network::SolanaTestnet => "https://api.testnet.solana.com",
        }
    }

    /// Value for the explorer `?cluster=` parameter. Mainnet needs none.
    pub fn explorer_cluster(&self) -> Option<&'static str> {
        match self {
            Network::Solana => None,
            Network::SolanaDevnet => Some("devnet"),
            Network::SolanaTestnet => Some("testnet"),
        }
    }

    /// Solscan link for a transaction signature.
    pub fn explorer_tx_url(&self, signature: &str) -> String {
        match self.explorer_cluster() {
            Some(cluster) => format!("https://solscan.io/tx/{signature}?cluster={cluster}"),
            None => format!("https://solscan.io/tx/{signature}"),
        }
    }

    /// Solscan link for an account address.
    pub fn explorer_account_url(&self, address: &str) -> String {
        match self.explorer_cluster() {
            Some(cluster) => format!("https://solscan.io/account/{address}?cluster={cluster}"),
            None => format!("https://solscan.io/account/{address}"),
        }
    }
}

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "solana" | "solana-mainnet" | "mainnet" | "mainnet-beta" => Ok(Network::Solana),
            "solana-devnet" | "devnet" => Ok(Network::SolanaDevnet),
            "solana-testnet" | "testnet" => Ok(Network::SolanaTestnet),
            other => Network::ALL
                .into_iter()
                .find(|n| n.caip2() == other)
                .ok_or_else(|| UnknownNetwork(other.to_string())),
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Network {
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
    fn test_aliases() {
        assert_eq!("devnet".parse::<Network>().unwrap(), Network::SolanaDevnet);
        assert_eq!("solana-devnet".parse::<Network>().unwrap(), Network::SolanaDevnet);
        assert_eq!("mainnet-beta".parse::<Network>().unwrap(), Network::Solana);
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::SolanaTestnet);
        assert_eq!(
            "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp"
                .parse::<Network>()
                .unwrap(),
            Network::Solana
        );
        assert!("base-sepolia".parse::<Network>().is_err());
    }

    #[test]
    fn test_display_uses_x402_name() {
        assert_eq!(Network::SolanaDevnet.to_string(), "solana-devnet");
        assert_eq!(
            serde_json::to_string(&Network::Solana).unwrap(),
            "\"solana\""
        );
    }

    #[test]
    fn test_explorer_urls() {
        assert_eq!(
            Network::SolanaDevnet.explorer_tx_url("abc"),
            "https://solscan.io/tx/abc?cluster=devnet"
        );
        assert_eq!(Network::Solana.explorer_tx_url("abc"), "https://solscan.io/tx/abc");
        assert_eq!(
            Network::SolanaTestnet.explorer_account_url("xyz"),
            "https://solscan.io/account/xyz?cluster=testnet"
        );
    }
}
