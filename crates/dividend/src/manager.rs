//! # Cycle Manager
//!
//! Top-level state machine chaining snapshot, monitoring, payout and
//! disbursement.
//!
//! ## States
//!
//! ```text
//!  NoCycle ──(sale ended, cooldown)──▶ Active(n)
//!                                        │ window closed (once)
//!                                        ▼
//!                                  PayoutInProgress(n)
//!                                        │ disbursement returned
//!                                        ▼
//!                                  Completed(n) ──▶ Active(n+1) ──▶ …
//! ```
//!
//! There is no terminal state. On start-up an `active` cycle found in the
//! store is resumed instead of creating a new one.
//!
//! ## Failure Handling
//!
//! | Failure | Effect |
//! |---------|--------|
//! | precondition (sale, cooldown) | `info!`, re-check after `retry_secs` |
//! | pool read at finalize | `warn!`, cycle stays active, retried after `retry_secs` |
//! | store write | `error!`, retried after `retry_secs` |
//!
//! Nothing here stops the process; only shutdown does. A shutdown that
//! arrives while a cycle is being paid out is honored once it completes,
//! before the next snapshot is taken.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use gen_common::Ledger;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::DividendConfig;
use crate::disburse::{BatchDisburser, DisbursementReport};
use crate::error::CycleError;
use crate::monitor::{CycleMonitor, WatchOutcome};
use crate::payout::PayoutCalculator;
use crate::registry::HolderRegistry;
use crate::snapshot::SnapshotBuilder;
use crate::store::StateStore;
use crate::types::{Cycle, VerifierState};

/// Current lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    NoCycle,
    Active(u64),
    PayoutInProgress(u64),
    Completed(u64),
}

/// Result of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub number: u64,
    /// Holders left in the snapshot at close.
    pub holders_at_close: usize,
    /// Holders whose probation completed this cycle.
    pub probation_completed: usize,
    /// Payouts computed before scaling.
    pub requested: u128,
    pub report: DisbursementReport,
}

/// Drives cycles forever.
pub struct CycleManager {
    ledger: Arc<dyn Ledger>,
    registry: Arc<dyn HolderRegistry>,
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    config: DividendConfig,
    builder: SnapshotBuilder,
    calculator: PayoutCalculator,
    disburser: BatchDisburser,
    phase: RwLock<CyclePhase>,
}

impl CycleManager {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: Arc<dyn HolderRegistry>,
        store: Arc<StateStore>,
        clock: Arc<dyn Clock>,
        config: DividendConfig,
    ) -> Self {
        let params = config.params;
        Self {
            builder: SnapshotBuilder::new(ledger.clone(), store.clone(), clock.clone(), params),
            calculator: PayoutCalculator::new(store.clone(), params),
            disburser: BatchDisburser::new(ledger.clone(), store.clone(), params),
            ledger,
            registry,
            store,
            clock,
            config,
            phase: RwLock::new(CyclePhase::NoCycle),
        }
    }

    #[must_use]
    pub fn phase(&self) -> CyclePhase {
        *self.phase.read()
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.write() = phase;
    }

    /// Resumes the active cycle, or creates the next one.
    pub async fn attach_cycle(&self) -> Result<Cycle, CycleError> {
        if let Some(cycle) = self.store.active_cycle() {
            info!(cycle = cycle.number, "resuming cycle");
            return Ok(cycle);
        }
        self.builder.create_cycle(self.registry.as_ref()).await
    }

    /// Runs one cycle from attach to completion.
    ///
    /// Returns `Ok(None)` if shutdown was requested before the payout window
    /// closed; the cycle then stays active in the store.
    pub async fn run_cycle(&self, shutdown: &Notify) -> Result<Option<CycleSummary>, CycleError> {
        let mut cycle = self.attach_cycle().await?;
        self.set_phase(CyclePhase::Active(cycle.number));

        let mut state = self.store.load_verifier_state();
        let monitor = CycleMonitor::new(
            self.ledger.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.config.params,
        );

        match monitor.watch(&mut cycle, &mut state, shutdown).await {
            WatchOutcome::Shutdown => return Ok(None),
            WatchOutcome::WindowClosed => {}
        }

        self.finalize(&cycle, &mut state).await.map(Some)
    }

    /// Computes and disburses payouts for a closed cycle, then completes it.
    pub async fn finalize(
        &self,
        cycle: &Cycle,
        state: &mut VerifierState,
    ) -> Result<CycleSummary, CycleError> {
        self.set_phase(CyclePhase::PayoutInProgress(cycle.number));
        info!(cycle = cycle.number, "cycle ended, starting payouts");

        let pool_init = match self.ledger.pool_balance().await {
            Ok(p) => p,
            Err(e) => {
                self.set_phase(CyclePhase::Active(cycle.number));
                return Err(e.into());
            }
        };

        let plan = self.calculator.compute_payouts(cycle, state)?;
        let requested = plan.total();
        let probation_completed = plan.probation_completed.len();

        let report = if plan.payouts.is_empty() {
            DisbursementReport { pool_init, pool_left: pool_init, ..Default::default() }
        } else {
            self.disburser.disburse(cycle, plan.payouts, pool_init).await
        };

        self.complete(cycle.number, state)?;

        Ok(CycleSummary {
            number: cycle.number,
            holders_at_close: cycle.snapshot.len(),
            probation_completed,
            requested,
            report,
        })
    }

    fn complete(&self, number: u64, state: &mut VerifierState) -> Result<(), CycleError> {
        if !self.store.complete_cycle(number)? {
            warn!(cycle = number, "completed cycle missing from metadata");
        }
        state.telemetry.last_payout = self.clock.now();
        state.telemetry.last_cycle_nr = number;
        self.store.save_verifier_state(state)?;
        self.set_phase(CyclePhase::Completed(number));
        info!(cycle = number, "cycle completed, creating new snapshot");
        Ok(())
    }

    /// Runs cycles until `shutdown` is notified.
    pub async fn run(&self, shutdown: &Notify) {
        let retry = Duration::from_secs(self.config.retry_secs);

        loop {
            match self.run_cycle(shutdown).await {
                Ok(Some(summary)) => {
                    info!(
                        cycle = summary.number,
                        paid = summary.report.paid.len(),
                        paid_total = summary.report.paid_total(),
                        "cycle summary"
                    );
                    if shutdown_pending(shutdown) {
                        info!("cycle manager stopped after payout");
                        return;
                    }
                    continue;
                }
                Ok(None) => {
                    info!("cycle manager stopped");
                    return;
                }
                Err(CycleError::Precondition(reason)) => {
                    info!(
                        reason = %reason,
                        retry_secs = self.config.retry_secs,
                        "waiting to start cycle"
                    );
                }
                Err(CycleError::Ledger(e)) => {
                    warn!(
                        error = %e,
                        retry_secs = self.config.retry_secs,
                        "ledger unavailable, retrying"
                    );
                }
                Err(e) => {
                    error!(
                        error = %e,
                        retry_secs = self.config.retry_secs,
                        "cycle step failed, retrying"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                _ = shutdown.notified() => {
                    info!("cycle manager stopped");
                    return;
                }
            }
        }
    }
}

/// Consumes a stored shutdown permit without waiting.
fn shutdown_pending(shutdown: &Notify) -> bool {
    shutdown.notified().now_or_never().is_some()
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════
