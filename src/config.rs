//! Configuration management for interchain transfers
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub network: NetworkConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub transfer: TransferConfig,
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub network_id: u32,
    pub info_urls: Vec<String>,
    #[serde(default)]
    pub platform_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Alias used for blockchain ID lookup and address prefixes (`X`, `C`)
    pub alias: String,
    pub rpc_urls: Vec<String>,
    /// JSON-RPC method namespace (`avm`, `avax`)
    #[serde(default = "default_api_namespace")]
    pub api_namespace: String,
    /// Symbol of the asset fees are paid in
    #[serde(default = "default_fee_asset")]
    pub fee_asset: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Cadence for transaction status polling
    pub status_poll: PollConfig,
    /// Cadence for destination UTXO visibility polling
    pub propagation_poll: PollConfig,
    /// Retries for transport failures inside fetch/submit
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub memo: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            status_poll: PollConfig::status_default(),
            propagation_poll: PollConfig::propagation_default(),
            max_retries: 3,
            retry_delay_ms: 500,
            memo: None,
        }
    }
}

/// Bounded polling policy with exponential backoff
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    /// 1 = fixed interval
    pub backoff_factor: u32,
    pub max_attempts: u32,
}

impl PollConfig {
    pub fn status_default() -> Self {
        Self {
            interval_ms: 500,
            max_interval_ms: 5_000,
            backoff_factor: 2,
            max_attempts: 30,
        }
    }

    pub fn propagation_default() -> Self {
        Self {
            interval_ms: 1_000,
            max_interval_ms: 10_000,
            backoff_factor: 2,
            max_attempts: 20,
        }
    }

    /// Delay to wait after the given zero-based attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_factor.max(1)).saturating_pow(attempt);
        let cap = self.max_interval_ms.max(self.interval_ms);
        Duration::from_millis(self.interval_ms.saturating_mul(factor).min(cap))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// JSON file holding `{ "privkey": ... }`
    pub keypair_path: String,
    /// Environment variable that overrides the file
    pub private_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_api_namespace() -> String {
    "avm".to_string()
}

fn default_fee_asset() -> String {
    "AVAX".to_string()
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from an explicit path, `$TRANSFER_CONFIG`, or the default file
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => env::var("TRANSFER_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/default.toml")),
        };

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(input: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.network.info_urls.is_empty() {
            anyhow::bail!("Network {} has no info endpoint configured", self.network.name);
        }

        for (name, chain) in self.enabled_chains() {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        for (name, poll) in [
            ("status_poll", &self.transfer.status_poll),
            ("propagation_poll", &self.transfer.propagation_poll),
        ] {
            if poll.max_attempts == 0 {
                anyhow::bail!("transfer.{}.max_attempts must be positive", name);
            }
        }

        if self.network.platform_urls.is_empty() {
            tracing::warn!("No platform endpoint configured - network queries will be limited");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by alias
    pub fn chain(&self, alias: &str) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.alias == alias)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
