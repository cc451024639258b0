//! Client configuration.
//!
//! A JSON file, by default `microapi.json` in the working directory, optional unless
//! named explicitly:
//!
//! ```json
//! {
//!   "network": "solana-devnet",
//!   "rpc": { "solana-devnet": "$DEVNET_RPC_URL" },
//!   "dataDir": "~/.microapi",
//!   "poller": { "intervalMs": 2000, "maxAttempts": 30 },
//!   "session": { "durationSecs": 3600 },
//!   "wallets": [
//!     { "name": "solana-cli", "keypairPath": "/home/me/.config/solana/id.json" },
//!     { "name": "ci", "keypairEnv": "CI_KEYPAIR" }
//!   ]
//! }
//! ```
//!
//! Missing fields fall back to environment variables, then to hardcoded defaults.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use microapi_x402_types::config::LiteralOrEnv;
use microapi_x402_types::networks::Network;

use crate::poller::PollerConfig;
use crate::wallet::KeySource;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "config_defaults::default_network")]
    network: Network,
    #[serde(default)]
    rpc: HashMap<Network, LiteralOrEnv<Url>>,
    #[serde(default = "config_defaults::default_data_dir")]
    data_dir: LiteralOrEnv<PathBuf>,
    #[serde(default)]
    poller: PollerSettings,
    #[serde(default)]
    session: SessionSettings,
    #[serde(default)]
    wallets: Vec<WalletConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerSettings {
    #[serde(default = "config_defaults::default_poll_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "config_defaults::default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_ms: config_defaults::default_poll_interval_ms(),
            max_attempts: config_defaults::default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    #[serde(default = "config_defaults::default_session_secs")]
    pub duration_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            duration_secs: config_defaults::default_session_secs(),
        }
    }
}

/// A keypair-backed wallet adapter. Exactly one of `keypairPath` and `keypairEnv`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfig {
    pub name: String,
    #[serde(default)]
    keypair_path: Option<LiteralOrEnv<PathBuf>>,
    #[serde(default)]
    keypair_env: Option<String>,
}

impl WalletConfig {
    pub fn key_source(&self) -> Result<KeySource, ConfigError> {
        match (&self.keypair_path, &self.keypair_env) {
            (Some(path), None) => Ok(KeySource::File(path.inner().clone())),
            (None, Some(var)) => Ok(KeySource::Env(var.clone())),
            _ => Err(ConfigError::WalletSource(self.name.clone())),
        }
    }
}

pub mod config_defaults {
    use microapi_x402_types::config::LiteralOrEnv;
    use microapi_x402_types::networks::Network;
    use std::env;
    use std::path::PathBuf;

    pub const DEFAULT_NETWORK: Network = Network::SolanaDevnet;
    pub const DEFAULT_DATA_DIR: &str = ".microapi";
    pub const DEFAULT_SESSION_SECS: u64 = 3600;
    pub const DEFAULT_KEYPAIR_ENV: &str = "MICROAPI_KEYPAIR";

    /// `$MICROAPI_NETWORK` -> solana-devnet
    pub fn default_network() -> Network {
        env::var("MICROAPI_NETWORK")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_NETWORK)
    }

    /// `$MICROAPI_DATA_DIR` -> `.microapi`
    pub fn default_data_dir() -> LiteralOrEnv<PathBuf> {
        let dir = env::var("MICROAPI_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        LiteralOrEnv::from_literal(PathBuf::from(dir))
    }

    pub fn default_poll_interval_ms() -> u64 {
        crate::poller::DEFAULT_POLL_INTERVAL.as_millis() as u64
    }

    pub fn default_max_attempts() -> u32 {
        crate::poller::DEFAULT_MAX_ATTEMPTS
    }

    pub fn default_session_secs() -> u64 {
        DEFAULT_SESSION_SECS
    }

    /// `$SOLANA_RPC_URL`, applied to the configured network when `rpc` has no entry for it.
    pub fn rpc_url_from_env() -> Option<String> {
        env::var("SOLANA_RPC_URL").ok().filter(|s| !s.is_empty())
    }

    /// The Solana CLI's default keypair location.
    pub fn solana_cli_keypair() -> Option<PathBuf> {
        env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/solana/id.json"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Wallet {0:?} needs exactly one of keypairPath or keypairEnv")]
    WalletSource(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network: config_defaults::default_network(),
            rpc: HashMap::new(),
            data_dir: config_defaults::default_data_dir(),
            poller: PollerSettings::default(),
            session: SessionSettings::default(),
            wallets: Vec::new(),
        }
    }
}

impl Config {
    /// Loads `path`. A missing file yields the defaults unless `required` is set.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(ConfigError::FileRead(path.to_path_buf(), e)),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// RPC endpoints by network. Networks absent here use their public endpoint.
    pub fn rpc_urls(&self) -> HashMap<Network, String> {
        let mut urls: HashMap<Network, String> = self
            .rpc
            .iter()
            .map(|(network, url)| (*network, url.inner().to_string()))
            .collect();
        if let Some(url) = config_defaults::rpc_url_from_env() {
            urls.entry(self.network).or_insert(url);
        }
        urls
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.inner()
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.poller.interval_ms.max(1)),
            max_attempts: self.poller.max_attempts.max(1),
        }
    }

    pub fn session_duration(&self) -> Duration {
        Duration::from_secs(self.session.duration_secs)
    }

    /// Configured wallet adapters, or the Solana CLI keypair and `$MICROAPI_KEYPAIR`
    /// when none are configured.
    pub fn wallet_sources(&self) -> Result<Vec<(String, KeySource)>, ConfigError> {
        if self.wallets.is_empty() {
            let mut defaults = Vec::new();
            if let Some(path) = config_defaults::solana_cli_keypair() {
                defaults.push(("solana-cli".to_string(), KeySource::File(path)));
            }
            defaults.push((
                "env".to_string(),
                KeySource::Env(config_defaults::DEFAULT_KEYPAIR_ENV.to_string()),
            ));
            return Ok(defaults);
        }
        self.wallets
            .iter()
            .map(|w| Ok((w.name.clone(), w.key_source()?)))
            .collect()
    }
}
