//! Configuration management for the Tesseract Batcher
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Largest batch the service builds unless configured otherwise
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub batcher: BatcherConfig,
    pub bridge: BridgeConfig,
    pub state: StateConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub denominations: HashMap<String, DenominationConfig>,
    pub validators: Vec<ValidatorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatcherConfig {
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub auto_batch: bool,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub contract_address: String,
    pub chain_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    pub snapshot_path: PathBuf,
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

/// Foreign-chain counterpart of a voucher denomination
#[derive(Debug, Clone, Deserialize)]
pub struct DenominationConfig {
    pub token_contract: String,
    pub symbol: String,
    pub conversion_factor: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    pub eth_address: String,
    pub power: u64,
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("TESSERACT_BATCHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml(input: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.batcher.max_batch_size == 0 {
            anyhow::bail!("batcher.max_batch_size must be positive");
        }

        if self.denominations.is_empty() {
            anyhow::bail!("At least one denomination must be configured");
        }

        parse_address(&self.bridge.contract_address)
            .with_context(|| "Invalid bridge contract address")?;

        for (denom, config) in &self.denominations {
            parse_address(&config.token_contract)
                .with_context(|| format!("Denomination {} has an invalid token contract", denom))?;
            if config.conversion_factor == 0 {
                anyhow::bail!("Denomination {} has a zero conversion factor", denom);
            }
        }

        if self.validators.is_empty() {
            anyhow::bail!("At least one validator must be configured");
        }
        for validator in &self.validators {
            parse_address(&validator.eth_address)
                .with_context(|| format!("Invalid validator address {}", validator.eth_address))?;
            if validator.power == 0 {
                tracing::warn!("Validator {} has zero power", validator.eth_address);
            }
        }

        Ok(())
    }

    /// Voucher denominations configured for batching, in stable order
    pub fn batch_denoms(&self) -> Vec<String> {
        let mut denoms: Vec<String> = self.denominations.keys().cloned().collect();
        denoms.sort();
        denoms
    }
}

/// Parse a hex Ethereum address
pub fn parse_address(input: &str) -> Result<Address> {
    Address::from_str(input.trim()).with_context(|| format!("Invalid address: {}", input))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
