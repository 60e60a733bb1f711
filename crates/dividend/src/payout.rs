//! # Payout Calculator
//!
//! Computes per-holder payouts when a cycle closes.
//!
//! ## Progress Table (defaults)
//!
//! | Held cycles | Progress | Payout |
//! |-------------|----------|--------|
//! | 1–2         | 0        | 2%     |
//! | 3–4         | 1        | 3%     |
//! | 5–6         | 2        | 4%     |
//! | …           | …        | …      |
//! | 17+         | 8 (cap)  | 10%    |
//!
//! `amount = initialHold × (base + progress) / 100`, truncating.
//!
//! ## Probation
//!
//! A holder in probation at close has `holdProofCompleted` set to the cycle
//! number and gets no payout. Counting resumes with the next cycle.

use std::sync::Arc;

use gen_common::Address;
use tracing::{debug, info};

use crate::config::EngineParams;
use crate::error::CycleError;
use crate::store::StateStore;
use crate::types::{Cycle, HolderVerifierRecord, Payout, VerifierState};

/// Progress tier after `held_cycles` consecutive held cycles.
#[must_use]
pub fn progress_for(held_cycles: u64, cap: u8) -> u8 {
    let tier = held_cycles.saturating_sub(1) / 2;
    u8::try_from(tier).map_or(cap, |t| t.min(cap))
}

/// Payout for `initial_hold` at `progress`, truncating.
#[must_use]
pub fn payout_amount(initial_hold: u128, progress: u8, base_percent: u8) -> u128 {
    let pct = u128::from(base_percent) + u128::from(progress);
    initial_hold.saturating_mul(pct) / 100
}

/// Why a snapshot holder was not paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No verifier record exists.
    NoRecord,
    /// The record is ejected.
    Ejected,
    /// Probation was already resolved in this cycle.
    ProbationResolved,
    /// The record has no counting start.
    NotCounting,
}

/// Outcome of evaluating one snapshot holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutDecision {
    Pay(Payout),
    ProbationCompleted,
    Skipped(SkipReason),
}

/// Evaluates `record` at the close of `cycle`, updating it in place.
pub fn evaluate_holder(
    address: Address,
    record: &mut HolderVerifierRecord,
    cycle: u64,
    params: &EngineParams,
) -> PayoutDecision {
    if record.is_ejected() {
        return PayoutDecision::Skipped(SkipReason::Ejected);
    }

    if record.in_probation() {
        record.hold_proof_completed = Some(cycle);
        record.progress = 0;
        return PayoutDecision::ProbationCompleted;
    }

    if record.entry_cycle.is_none() && record.hold_proof_completed == Some(cycle) {
        return PayoutDecision::Skipped(SkipReason::ProbationResolved);
    }

    let Some(start) = record.counting_start() else {
        return PayoutDecision::Skipped(SkipReason::NotCounting);
    };

    let held = cycle.saturating_sub(start).saturating_add(1);
    record.progress = progress_for(held, params.progress_cap);

    PayoutDecision::Pay(Payout {
        address,
        amount: payout_amount(record.initial_hold, record.progress, params.base_payout_percent),
        progress: record.progress,
        initial_hold: record.initial_hold,
    })
}

/// Payouts computed for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayoutPlan {
    /// Payouts in snapshot (address) order.
    pub payouts: Vec<Payout>,
    /// Holders whose probation completed this cycle.
    pub probation_completed: Vec<Address>,
    pub skipped: usize,
}

impl PayoutPlan {
    /// Sum of requested amounts.
    #[must_use]
    pub fn total(&self) -> u128 {
        self.payouts.iter().fold(0u128, |acc, p| acc.saturating_add(p.amount))
    }
}

/// Computes payouts and persists record updates as they happen.
pub struct PayoutCalculator {
    store: Arc<StateStore>,
    params: EngineParams,
}

impl PayoutCalculator {
    #[must_use]
    pub fn new(store: Arc<StateStore>, params: EngineParams) -> Self {
        Self { store, params }
    }

    /// Evaluates every holder remaining in `cycle.snapshot`.
    pub fn compute_payouts(
        &self,
        cycle: &Cycle,
        state: &mut VerifierState,
    ) -> Result<PayoutPlan, CycleError> {
        let mut plan = PayoutPlan::default();

        for address in cycle.snapshot.keys() {
            let Some(record) = state.get_mut(address) else {
                debug!(cycle = cycle.number, address = %address, "no verifier record, skipping");
                plan.skipped += 1;
                continue;
            };

            match evaluate_holder(*address, record, cycle.number, &self.params) {
                PayoutDecision::Pay(p) => {
                    debug!(
                        cycle = cycle.number,
                        address = %address,
                        amount = p.amount,
                        progress = p.progress,
                        "payout computed"
                    );
                    plan.payouts.push(p);
                }
                PayoutDecision::ProbationCompleted => {
                    info!(cycle = cycle.number, address = %address, "hold proof completed");
                    plan.probation_completed.push(*address);
                }
                PayoutDecision::Skipped(reason) => {
                    debug!(cycle = cycle.number, address = %address, ?reason, "payout skipped");
                    plan.skipped += 1;
                    continue;
                }
            }
            self.store.save_verifier_state(state)?;
        }

        info!(
            cycle = cycle.number,
            payouts = plan.payouts.len(),
            requested = plan.total(),
            probation = plan.probation_completed.len(),
            "payouts computed"
        );
        Ok(plan)
    }
}
