//! Engine configuration.
//!
//! [`EngineParams`] holds the numeric knobs of the cycle engine and is
//! copied into every component. [`DividendConfig`] adds the process-level
//! settings (paths, start-up retry, ledger backend choice) and is loaded
//! from environment variables by [`DividendConfig::from_env`].

use std::path::PathBuf;

use gen_common::{env_parse_or, ConfigError};

/// Seconds per hour.
pub const HOUR_SECS: u64 = 3_600;

// ════════════════════════════════════════════════════════════════════════════════
// ENGINE PARAMS
// ════════════════════════════════════════════════════════════════════════════════

/// Numeric parameters of the cycle engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineParams {
    /// Minimum balance (base units) to qualify for a snapshot.
    pub min_hold: u128,
    /// Cooldown after the sale ends before the first cycle may start.
    pub cooldown_hours: u64,
    /// Lower bound of the randomized payout window.
    pub payout_hours_min: u64,
    /// Upper bound (inclusive) of the randomized payout window.
    pub payout_hours_max: u64,
    /// Lower bound of the jittered monitor interval.
    pub monitor_interval_min_secs: u64,
    /// Upper bound (inclusive) of the jittered monitor interval.
    pub monitor_interval_max_secs: u64,
    /// Entries per disbursement transaction.
    pub chunk_size: usize,
    /// Balance growth (in percent of the baseline) that escalates the baseline.
    pub escalation_percent: u128,
    /// Highest progress tier.
    pub progress_cap: u8,
    /// Payout percentage at progress 0.
    pub base_payout_percent: u8,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            min_hold: 1,
            cooldown_hours: 24,
            payout_hours_min: 20,
            payout_hours_max: 28,
            monitor_interval_min_secs: 30,
            monitor_interval_max_secs: 180,
            chunk_size: 50,
            escalation_percent: 151,
            progress_cap: 8,
            base_payout_percent: 2,
        }
    }
}

impl EngineParams {
    /// Balance at or above which `baseline` is escalated.
    ///
    /// Returns `u128::MAX` when the threshold is not representable, so no
    /// balance can reach it.
    #[must_use]
    pub fn escalation_threshold(&self, baseline: u128) -> u128 {
        baseline.checked_mul(self.escalation_percent).map_or(u128::MAX, |v| v / 100)
    }

    /// Cooldown length in seconds.
    #[must_use]
    pub fn cooldown_secs(&self) -> u64 {
        self.cooldown_hours.saturating_mul(HOUR_SECS)
    }

    /// Rejects inconsistent parameter sets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.payout_hours_min == 0 || self.payout_hours_min > self.payout_hours_max {
            return Err(ConfigError::Inconsistent(format!(
                "payout hours range [{}, {}] invalid",
                self.payout_hours_min, self.payout_hours_max
            )));
        }
        if self.monitor_interval_min_secs == 0
            || self.monitor_interval_min_secs > self.monitor_interval_max_secs
        {
            return Err(ConfigError::Inconsistent(format!(
                "monitor interval range [{}, {}] invalid",
                self.monitor_interval_min_secs, self.monitor_interval_max_secs
            )));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Inconsistent("chunk size cannot be 0".to_string()));
        }
        if self.escalation_percent <= 100 {
            return Err(ConfigError::Inconsistent(format!(
                "escalation percent must exceed 100, got {}",
                self.escalation_percent
            )));
        }
        if u16::from(self.base_payout_percent) + u16::from(self.progress_cap) > 100 {
            return Err(ConfigError::Inconsistent(
                "base payout percent plus progress cap exceeds 100".to_string(),
            ));
        }
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// PROCESS CONFIG
// ════════════════════════════════════════════════════════════════════════════════

/// Full configuration of the dividend bot process.
#[derive(Debug, Clone)]
pub struct DividendConfig {
    /// Engine parameters.
    pub params: EngineParams,
    /// Directory holding the persisted JSON records.
    pub data_dir: PathBuf,
    /// Holder registry file written by the upstream tracker.
    pub registry_file: PathBuf,
    /// Wait between start-up gate checks and after failed steps.
    pub retry_secs: u64,
    /// Run against the in-memory ledger.
    pub use_mock_ledger: bool,
}

impl DividendConfig {
    /// Configuration rooted at `data_dir` with default parameters.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            params: EngineParams::default(),
            registry_file: data_dir.join(crate::registry::REGISTRY_FILENAME),
            data_dir,
            retry_secs: 300,
            use_mock_ledger: false,
        }
    }

    /// Loads the configuration from environment variables.
    ///
    /// `MIN_HOLD` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir: PathBuf = std::env::var("DIVIDEND_DATA_DIR")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let mut config = Self::with_data_dir(data_dir);

        if let Ok(path) = std::env::var("DIVIDEND_REGISTRY_FILE") {
            config.registry_file = path.into();
        }

        let raw_min = std::env::var("MIN_HOLD").map_err(|_| ConfigError::Missing("MIN_HOLD"))?;
        let p = &mut config.params;
        p.min_hold = raw_min
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var: "MIN_HOLD", value: raw_min.clone() })?;
        p.cooldown_hours = env_parse_or("COOLDOWN_HOURS", p.cooldown_hours)?;
        p.payout_hours_min = env_parse_or("PAYOUT_HOURS_MIN", p.payout_hours_min)?;
        p.payout_hours_max = env_parse_or("PAYOUT_HOURS_MAX", p.payout_hours_max)?;
        p.monitor_interval_min_secs =
            env_parse_or("MONITOR_INTERVAL_MIN_SECS", p.monitor_interval_min_secs)?;
        p.monitor_interval_max_secs =
            env_parse_or("MONITOR_INTERVAL_MAX_SECS", p.monitor_interval_max_secs)?;
        p.chunk_size = env_parse_or("DISBURSE_CHUNK_SIZE", p.chunk_size)?;
        p.escalation_percent = env_parse_or("ESCALATION_PERCENT", p.escalation_percent)?;
        p.progress_cap = env_parse_or("PROGRESS_CAP", p.progress_cap)?;
        p.base_payout_percent = env_parse_or("BASE_PAYOUT_PERCENT", p.base_payout_percent)?;

        config.retry_secs = env_parse_or("STARTUP_RETRY_SECS", config.retry_secs)?;
        config.use_mock_ledger = std::env::var("USE_MOCK_LEDGER")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        config.validate()?;
        Ok(config)
    }

    /// Validates paths and engine parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Inconsistent("data dir cannot be empty".to_string()));
        }
        if self.retry_secs == 0 {
            return Err(ConfigError::Inconsistent("retry secs cannot be 0".to_string()));
        }
        self.params.validate()
    }
}
