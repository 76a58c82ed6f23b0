//! Configuration management for the deposit relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::chain::finality::recommended_confirmations;

/// Event signature watched on the source chain
pub const DEPOSITED_EVENT: &str = "Deposited(address,uint256)";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub source: ChainConfig,
    pub destination: ChainConfig,
    pub fill: FillConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_concurrent_fills")]
    pub max_concurrent_fills: usize,
    #[serde(default = "default_max_pending_queue")]
    pub max_pending_queue: usize,
    #[serde(default = "default_max_fill_attempts")]
    pub max_fill_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_warn_after_failures")]
    pub warn_after_failures: u32,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Contract emitting deposits (source) or receiving fills (destination)
    pub contract_address: String,
    /// Blocks required before a block is treated as final
    pub confirmation_blocks: Option<u64>,
    /// First block to scan when no cursor has been persisted
    #[serde(default)]
    pub genesis_block: u64,
    #[serde(default = "default_gas_price_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FillConfig {
    /// Token delivered to depositors on the destination chain
    pub token_address: String,
    #[serde(default = "default_gas_limit_buffer_percent")]
    pub gas_limit_buffer_percent: u64,
    #[serde(default = "default_gas_price_buffer_percent")]
    pub gas_price_buffer_percent: u64,
    /// Price increase applied to every same-nonce resend
    #[serde(default = "default_gas_bump_percent")]
    pub gas_bump_percent: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding the relayer private key
    pub private_key_env: Option<String>,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_max_concurrent_fills() -> usize {
    4
}
fn default_max_pending_queue() -> usize {
    256
}
fn default_max_fill_attempts() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_max_retry_delay_ms() -> u64 {
    60_000
}
fn default_rpc_timeout_secs() -> u64 {
    30
}
fn default_receipt_timeout_secs() -> u64 {
    180
}
fn default_warn_after_failures() -> u32 {
    5
}
fn default_max_block_range() -> u64 {
    500
}
fn default_drain_timeout_secs() -> u64 {
    60
}
fn default_health_check_interval_secs() -> u64 {
    30
}
fn default_max_connections() -> u32 {
    10
}
fn default_min_connections() -> u32 {
    1
}
fn default_gas_price_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Eip1559
}
fn default_max_gas_price_gwei() -> u64 {
    500
}
fn default_gas_limit_buffer_percent() -> u64 {
    20
}
fn default_gas_price_buffer_percent() -> u64 {
    10
}
fn default_gas_bump_percent() -> u64 {
    15
}
fn default_receipt_poll_interval_ms() -> u64 {
    2_000
}

impl Settings {
    /// Load settings from the file named by `RELAYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let mut settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        if settings.relayer.instance_id.is_empty() {
            settings.relayer.instance_id = uuid::Uuid::new_v4().to_string();
        }

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.source.chain_id == self.destination.chain_id {
            anyhow::bail!(
                "Source and destination must be different chains (both are {})",
                self.source.chain_id
            );
        }

        for chain in [&self.source, &self.destination] {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", chain.name);
            }
            Address::from_str(&chain.contract_address).with_context(|| {
                format!("Chain {} has an invalid contract address", chain.name)
            })?;
            if chain.confirmation_blocks == Some(0) {
                anyhow::bail!("Chain {} needs at least one confirmation block", chain.name);
            }
        }

        Address::from_str(&self.fill.token_address)
            .with_context(|| "Invalid fill token address")?;

        if self.relayer.max_concurrent_fills == 0 {
            anyhow::bail!("max_concurrent_fills must be at least 1");
        }
        if self.relayer.max_fill_attempts == 0 {
            anyhow::bail!("max_fill_attempts must be at least 1");
        }
        if self.relayer.max_block_range == 0 {
            anyhow::bail!("max_block_range must be at least 1");
        }

        Ok(())
    }
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl ChainConfig {
    /// Configured confirmation depth, or the recommended value for the chain
    pub fn confirmation_depth(&self) -> u64 {
        self.confirmation_blocks
            .unwrap_or_else(|| recommended_confirmations(self.chain_id))
    }

    pub fn contract(&self) -> Result<Address> {
        Address::from_str(&self.contract_address)
            .with_context(|| format!("Invalid contract address for chain {}", self.name))
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
