//! Ledger connection configuration.
//!
//! [`LedgerConfig::from_env`] reads the connection settings shared by all
//! bots. Required variables fail fast; optional ones fall back to defaults.

use thiserror::Error;

use crate::address::Address;

/// Errors raised while loading configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    /// A variable is set but cannot be parsed.
    #[error("{var} invalid: '{value}'")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },

    /// Values parse individually but are inconsistent.
    #[error("configuration inconsistent: {0}")]
    Inconsistent(String),
}

/// Function signatures the ledger backend calls. Defaults match the sale
/// and token contracts the bots were written against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractMethods {
    pub balance_of: String,
    pub sale_ended: String,
    pub sale_end_time: String,
    pub pool_balance: String,
    pub disburse: String,
    pub transfer_event: String,
}

impl Default for ContractMethods {
    fn default() -> Self {
        Self {
            balance_of: "balanceOf(address)".to_string(),
            sale_ended: "preSaleEnded()".to_string(),
            sale_end_time: "preSaleEndTime()".to_string(),
            pool_balance: "dividendPoolGENc()".to_string(),
            disburse: "distributeDividendsAdjusted(address[],uint256[])".to_string(),
            transfer_event: "Transfer(address,address,uint256)".to_string(),
        }
    }
}

/// Connection settings for [`EvmLedger`](crate::EvmLedger).
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint (HTTP).
    pub rpc_url: String,
    /// Token contract (balances, transfer events).
    pub token_address: Address,
    /// Sale contract (sale status and end time).
    pub sale_address: Address,
    /// Contract holding the dividend pool and the disbursement entry point.
    pub payout_address: Address,
    /// Node-managed account that sends disbursement transactions.
    pub operator_address: Address,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Gas limit attached to disbursement transactions.
    pub gas_limit: u64,
    /// Delay between receipt polls in milliseconds.
    pub receipt_poll_ms: u64,
    /// Receipt polls before a disbursement is reported as timed out.
    pub receipt_max_polls: u32,
    /// Delay between transfer log polls in milliseconds.
    pub transfer_poll_ms: u64,
    /// Contract function signatures.
    pub methods: ContractMethods,
}

impl LedgerConfig {
    /// Creates a configuration with default timings.
    #[must_use]
    pub fn new(
        rpc_url: impl Into<String>,
        token_address: Address,
        sale_address: Address,
        payout_address: Address,
        operator_address: Address,
    ) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            token_address,
            sale_address,
            payout_address,
            operator_address,
            timeout_ms: 30_000,
            gas_limit: 3_000_000,
            receipt_poll_ms: 2_000,
            receipt_max_polls: 90,
            transfer_poll_ms: 5_000,
            methods: ContractMethods::default(),
        }
    }

    /// Loads the configuration from environment variables.
    ///
    /// Required: `LEDGER_RPC_URL`, `TOKEN_ADDRESS`, `SALE_ADDRESS`,
    /// `PAYOUT_ADDRESS`, `OPERATOR_ADDRESS`.
    ///
    /// Optional: `LEDGER_TIMEOUT_MS`, `DISBURSE_GAS_LIMIT`,
    /// `RECEIPT_POLL_MS`, `RECEIPT_MAX_POLLS`, `TRANSFER_POLL_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let rpc_url = std::env::var("LEDGER_RPC_URL")
            .map_err(|_| ConfigError::Missing("LEDGER_RPC_URL"))?;

        let mut config = Self::new(
            rpc_url,
            env_address("TOKEN_ADDRESS")?,
            env_address("SALE_ADDRESS")?,
            env_address("PAYOUT_ADDRESS")?,
            env_address("OPERATOR_ADDRESS")?,
        );

        config.timeout_ms = env_parse_or("LEDGER_TIMEOUT_MS", config.timeout_ms)?;
        config.gas_limit = env_parse_or("DISBURSE_GAS_LIMIT", config.gas_limit)?;
        config.receipt_poll_ms = env_parse_or("RECEIPT_POLL_MS", config.receipt_poll_ms)?;
        config.receipt_max_polls = env_parse_or("RECEIPT_MAX_POLLS", config.receipt_max_polls)?;
        config.transfer_poll_ms = env_parse_or("TRANSFER_POLL_MS", config.transfer_poll_ms)?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make the backend unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_url.trim().is_empty() {
            return Err(ConfigError::Inconsistent("rpc_url cannot be empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Inconsistent("timeout_ms cannot be 0".to_string()));
        }
        if self.receipt_max_polls == 0 {
            return Err(ConfigError::Inconsistent("receipt_max_polls cannot be 0".to_string()));
        }
        Ok(())
    }
}

fn env_address(var: &'static str) -> Result<Address, ConfigError> {
    let raw = std::env::var(var).map_err(|_| ConfigError::Missing(var))?;
    raw.parse().map_err(|_| ConfigError::Invalid { var, value: raw })
}

/// Parses an optional environment variable, falling back to `default` when unset.
pub fn env_parse_or<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}
