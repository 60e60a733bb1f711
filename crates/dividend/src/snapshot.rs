//! # Snapshot Builder
//!
//! Creates the next [`Cycle`] from the holder registry and the persisted
//! verifier records.
//!
//! ## Preconditions
//!
//! | Condition | Applies to |
//! |-----------|------------|
//! | No cycle is `active` | every cycle |
//! | Sale has ended | first cycle |
//! | `now >= saleEndTime + cooldown` | first cycle |
//!
//! A refused precondition returns [`CycleError::Precondition`] without
//! touching any persisted state.
//!
//! ## Per-Holder Rules
//!
//! Every registry address is classified by [`classify`]:
//!
//! ```text
//! balance < min_hold ───────────────▶ BelowMinimum   (skipped, record untouched)
//! no record ────────────────────────▶ NewEntrant     (counting from this cycle)
//! record.ejectedAt set ─────────────▶ Requalified    (probation this cycle)
//! balance >= threshold(baseline) ───▶ Escalated      (baseline := balance)
//! balance <  baseline ──────────────▶ Ejected        (excluded)
//! otherwise ────────────────────────▶ Retained
//! ```
//!
//! A balance read failure skips that address for this snapshot only.
//!
//! ## Persistence Order
//!
//! Verifier state (with telemetry) is written first, then the cycle is
//! appended to the cycle list.

use std::collections::BTreeMap;
use std::sync::Arc;

use gen_common::{Address, Ledger};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{EngineParams, HOUR_SECS};
use crate::error::CycleError;
use crate::registry::HolderRegistry;
use crate::store::StateStore;
use crate::types::{Cycle, CycleStatus, HolderVerifierRecord, SnapshotEntry, VerifierState};

// ════════════════════════════════════════════════════════════════════════════════
// CLASSIFICATION
// ════════════════════════════════════════════════════════════════════════════════

/// Outcome of evaluating one registry address at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderDecision {
    /// Balance below the configured minimum.
    BelowMinimum,
    /// First qualification.
    NewEntrant,
    /// Previously ejected holder re-entering through probation.
    Requalified,
    /// Existing holder whose balance grew past the escalation threshold.
    Escalated,
    /// Existing holder with unchanged baseline.
    Retained,
    /// Existing holder below baseline.
    Ejected,
}

/// Classifies a holder from its current record and balance.
#[must_use]
pub fn classify(
    record: Option<&HolderVerifierRecord>,
    balance: u128,
    params: &EngineParams,
) -> HolderDecision {
    if balance < params.min_hold {
        return HolderDecision::BelowMinimum;
    }
    match record {
        None => HolderDecision::NewEntrant,
        Some(r) if r.is_ejected() => HolderDecision::Requalified,
        Some(r) if balance < r.initial_hold => HolderDecision::Ejected,
        Some(r) if balance >= params.escalation_threshold(r.initial_hold) => {
            HolderDecision::Escalated
        }
        Some(_) => HolderDecision::Retained,
    }
}

/// Applies `decision` to the verifier state.
///
/// Returns the snapshot entry when the holder is included.
pub fn apply_decision(
    state: &mut VerifierState,
    address: Address,
    balance: u128,
    cycle: u64,
    decision: HolderDecision,
) -> Option<SnapshotEntry> {
    match decision {
        HolderDecision::BelowMinimum => return None,
        HolderDecision::NewEntrant => {
            state.holders.insert(address, HolderVerifierRecord::new_entrant(balance, cycle));
        }
        HolderDecision::Requalified => {
            if let Some(r) = state.get_mut(&address) {
                r.requalify(balance, cycle);
            }
        }
        HolderDecision::Escalated => {
            if let Some(r) = state.get_mut(&address) {
                r.initial_hold = balance;
            }
        }
        HolderDecision::Ejected => {
            if let Some(r) = state.get_mut(&address) {
                r.eject(cycle);
            }
            return None;
        }
        HolderDecision::Retained => {}
    }

    state.get(&address).map(|r| SnapshotEntry { initial_hold: r.initial_hold })
}

// ════════════════════════════════════════════════════════════════════════════════
// BUILDER
// ════════════════════════════════════════════════════════════════════════════════

/// Builds new cycles.
pub struct SnapshotBuilder {
    ledger: Arc<dyn Ledger>,
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    params: EngineParams,
}

impl SnapshotBuilder {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<StateStore>,
        clock: Arc<dyn Clock>,
        params: EngineParams,
    ) -> Self {
        Self { ledger, store, clock, params }
    }

    /// Checks every precondition for creating the next cycle.
    pub async fn check_preconditions(&self) -> Result<(), CycleError> {
        let cycles = self.store.load_cycles();
        if let Some(active) = cycles.iter().find(|c| c.is_active()) {
            return Err(CycleError::Precondition(format!(
                "cycle #{} is still active",
                active.number
            )));
        }
        if !cycles.is_empty() {
            return Ok(());
        }

        if !self.ledger.is_sale_ended().await? {
            return Err(CycleError::Precondition("sale has not ended".to_string()));
        }

        let sale_end = self.ledger.sale_end_time().await?;
        let ready_at = sale_end.saturating_add(self.params.cooldown_secs());
        let now = self.clock.now();
        if now < ready_at {
            let remaining = ready_at - now;
            return Err(CycleError::Precondition(format!(
                "cooldown active: {} minutes remaining",
                remaining.div_ceil(60)
            )));
        }
        Ok(())
    }

    /// Creates and persists the next cycle.
    pub async fn create_cycle(&self, registry: &dyn HolderRegistry) -> Result<Cycle, CycleError> {
        self.check_preconditions().await?;

        let number = self.store.load_cycles().last().map_or(1, |c| c.number + 1);
        let start = self.clock.now();
        let hours = rand::thread_rng()
            .gen_range(self.params.payout_hours_min..=self.params.payout_hours_max);

        let mut state = self.store.load_verifier_state();
        let mut snapshot = BTreeMap::new();

        let candidates = registry.addresses();
        info!(cycle = number, candidates = candidates.len(), "building snapshot");

        for address in candidates {
            let balance = match self.ledger.balance_of(&address).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(
                        cycle = number,
                        address = %address,
                        error = %e,
                        "balance read failed, skipping"
                    );
                    continue;
                }
            };

            let decision = classify(state.get(&address), balance, &self.params);
            debug!(cycle = number, address = %address, balance, ?decision, "classified");
            if decision == HolderDecision::Ejected {
                info!(cycle = number, address = %address, balance, "holder ejected at snapshot");
            }
            if let Some(entry) = apply_decision(&mut state, address, balance, number, decision) {
                snapshot.insert(address, entry);
            }
        }

        let cycle = Cycle {
            number,
            start_timestamp: start,
            payout_until: start.saturating_add(hours.saturating_mul(HOUR_SECS)),
            payout_in_hours: hours,
            snapshot,
            status: CycleStatus::Active,
        };

        state.telemetry.last_cycle_nr = number;
        state.telemetry.last_snapshot = start;
        self.store.save_verifier_state(&state)?;
        self.store.append_cycle(&cycle)?;

        info!(
            cycle = number,
            qualified = cycle.snapshot.len(),
            payout_in_hours = hours,
            payout_until = cycle.payout_until,
            "snapshot created"
        );
        Ok(cycle)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════
