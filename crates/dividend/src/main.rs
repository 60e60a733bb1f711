//! # GEN Dividend Bot Entry Point
//!
//! ## Modes
//!
//! ### Run the engine
//! ```text
//! gen-dividend env
//! ```
//! Configuration comes from environment variables only:
//!
//! - `MIN_HOLD` (required): minimum qualifying balance
//! - `DIVIDEND_DATA_DIR`, `DIVIDEND_REGISTRY_FILE`
//! - `COOLDOWN_HOURS`, `PAYOUT_HOURS_MIN`, `PAYOUT_HOURS_MAX`
//! - `MONITOR_INTERVAL_MIN_SECS`, `MONITOR_INTERVAL_MAX_SECS`
//! - `DISBURSE_CHUNK_SIZE`, `ESCALATION_PERCENT`, `PROGRESS_CAP`, `BASE_PAYOUT_PERCENT`
//! - `STARTUP_RETRY_SECS`
//! - `USE_MOCK_LEDGER`: run against the in-memory ledger
//! - Ledger: `LEDGER_RPC_URL`, `TOKEN_ADDRESS`, `SALE_ADDRESS`, `PAYOUT_ADDRESS`,
//!   `OPERATOR_ADDRESS`, `LEDGER_TIMEOUT_MS`, `DISBURSE_GAS_LIMIT`,
//!   `RECEIPT_POLL_MS`, `RECEIPT_MAX_POLLS`, `TRANSFER_POLL_MS`
//!
//! ### Inspect persisted state
//! ```text
//! gen-dividend status <data-dir>
//! ```
//!
//! ## Shutdown
//! Ctrl+C notifies the cycle manager, which stops at its next wait point.
//! A ledger call in flight is awaited first.

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gen_common::{EvmLedger, Ledger, LedgerConfig, MockLedger};
use gen_dividend::{
    CycleManager, DividendConfig, JsonFileRegistry, StateStore, StatusReport, SystemClock,
};

/// Number of paid cycles listed by `status`.
const STATUS_RECENT_CYCLES: usize = 5;

enum Command {
    Run,
    Status(String),
}

impl Command {
    fn from_args() -> Result<Self, String> {
        let args: Vec<String> = env::args().collect();
        let prog = args.first().map(String::as_str).unwrap_or("gen-dividend");

        match args.get(1).map(String::as_str) {
            Some("env") => Ok(Self::Run),
            Some("status") => match args.get(2) {
                Some(dir) => Ok(Self::Status(dir.clone())),
                None => Err(usage_message(prog)),
            },
            _ => Err(usage_message(prog)),
        }
    }
}

fn usage_message(prog: &str) -> String {
    format!(
        "Usage:\n\
         \n\
         {prog} env                  run the cycle engine (config from environment)\n\
         {prog} status <data-dir>    print a summary of persisted state\n"
    )
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let command = match Command::from_args() {
        Ok(c) => c,
        Err(usage) => {
            error!("{}", usage);
            std::process::exit(1);
        }
    };

    let result = match command {
        Command::Status(dir) => print_status(&dir),
        Command::Run => run().await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn print_status(dir: &str) -> anyhow::Result<()> {
    if !std::path::Path::new(dir).is_dir() {
        bail!("data directory {} does not exist", dir);
    }
    let store = StateStore::open(dir).with_context(|| format!("opening {}", dir))?;
    print!("{}", StatusReport::collect(&store, STATUS_RECENT_CYCLES));
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = DividendConfig::from_env().context("configuration error")?;

    info!("═══════════════════════════════════════════════════════════════");
    info!("                    GEN Dividend Verifier                       ");
    info!("═══════════════════════════════════════════════════════════════");
    info!("Data dir:      {}", config.data_dir.display());
    info!("Registry:      {}", config.registry_file.display());
    info!("Min hold:      {}", config.params.min_hold);
    info!(
        "Payout hours:  {}..={}",
        config.params.payout_hours_min, config.params.payout_hours_max
    );
    info!("Mock ledger:   {}", config.use_mock_ledger);
    info!("═══════════════════════════════════════════════════════════════");

    let ledger: Arc<dyn Ledger> = if config.use_mock_ledger {
        info!("Using MockLedger (dry run)");
        Arc::new(MockLedger::new())
    } else {
        let ledger_config = LedgerConfig::from_env().context("ledger configuration error")?;
        info!("Ledger RPC:    {}", ledger_config.rpc_url);
        Arc::new(EvmLedger::new(ledger_config).context("failed to build ledger client")?)
    };

    let store = Arc::new(StateStore::open(&config.data_dir).context("failed to open state store")?);
    let registry = Arc::new(JsonFileRegistry::new(&config.registry_file));
    let manager = Arc::new(CycleManager::new(
        ledger,
        registry,
        store,
        Arc::new(SystemClock),
        config,
    ));

    let shutdown = Arc::new(Notify::new());
    let engine = {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.run(&shutdown).await })
    };

    info!("Verifier running. Press Ctrl+C to shutdown.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested..."),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }

    // Stored permit: the manager may be between wait points right now.
    shutdown.notify_one();
    if let Err(e) = engine.await {
        error!("engine task failed: {}", e);
    }

    info!("Verifier stopped cleanly");
    Ok(())
}
