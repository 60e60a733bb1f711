//! # Batch Disbursement Executor
//!
//! Pays a cycle's computed payouts out of the external pool in fixed-size
//! batches.
//!
//! ## Flow
//!
//! ```text
//! poolInit (read once by caller)
//!     │
//!     ▼
//! drop payouts already in the payout log for this cycle
//!     │
//!     ▼
//! scale_to_pool   (sum > poolLeft → every amount × poolLeft/sum, truncated)
//!     │
//!     ▼
//! for chunk in payouts.chunks(chunk_size) while poolLeft > 0:
//!     pack_chunk  (in order; an entry that would overflow poolLeft is skipped)
//!     ledger.disburse(chunk)
//!         Ok  → poolLeft -= subtotal, append chunk to payout log
//!         Err → error!, poolLeft unchanged, entries unpaid this cycle
//! ```
//!
//! ## No Implicit Retry
//!
//! A failed or skipped entry is never retried within the cycle. Restart
//! safety comes from the payout log: a re-run of the same cycle filters out
//! every `(cycle, address)` already logged before anything is submitted.
//!
//! ## Pool Conservation
//!
//! The sum logged as paid never exceeds `poolInit`: every submitted chunk
//! satisfies `subtotal <= poolLeft`, and `poolLeft` only decreases.

use std::sync::Arc;

use gen_common::{Address, Ledger};
use tracing::{error, info, warn};

use crate::config::EngineParams;
use crate::store::StateStore;
use crate::types::{Cycle, Payout, PayoutLogEntry};

// ════════════════════════════════════════════════════════════════════════════════
// ALLOCATION
// ════════════════════════════════════════════════════════════════════════════════

/// Scales every amount by `pool_left / sum` when the sum exceeds the pool.
///
/// The ratio is an `f64`; results are truncated toward zero. Returns `true`
/// if scaling was applied.
pub fn scale_to_pool(payouts: &mut [Payout], pool_left: u128) -> bool {
    let need = payouts.iter().fold(0u128, |acc, p| acc.saturating_add(p.amount));
    if need <= pool_left {
        return false;
    }

    let scale = pool_left as f64 / need as f64;
    for p in payouts.iter_mut() {
        p.amount = (p.amount as f64 * scale).floor() as u128;
    }
    true
}

/// Entries selected from one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedChunk {
    pub entries: Vec<Payout>,
    pub subtotal: u128,
    /// Entries that would have pushed the subtotal over the pool.
    pub skipped: Vec<Payout>,
}

/// Forward scan over `chunk`, keeping entries while the running subtotal
/// stays within `pool_left`.
#[must_use]
pub fn pack_chunk(chunk: &[Payout], pool_left: u128) -> PackedChunk {
    let mut packed = PackedChunk::default();
    for p in chunk {
        match packed.subtotal.checked_add(p.amount) {
            Some(next) if next <= pool_left => {
                packed.subtotal = next;
                packed.entries.push(*p);
            }
            _ => packed.skipped.push(*p),
        }
    }
    packed
}

// ════════════════════════════════════════════════════════════════════════════════
// REPORT
// ════════════════════════════════════════════════════════════════════════════════

/// Outcome of disbursing one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisbursementReport {
    pub pool_init: u128,
    pub pool_left: u128,
    /// Payouts dropped because the payout log already holds them.
    pub already_paid: usize,
    /// Whether amounts were scaled down to the pool.
    pub scaled: bool,
    /// Entries paid and logged in this run.
    pub paid: Vec<PayoutLogEntry>,
    /// Entries skipped by chunk packing or left when the pool ran out.
    pub unpaid: usize,
    /// Entries in chunks the ledger rejected.
    pub failed: usize,
    pub batches_sent: usize,
    pub batches_failed: usize,
}

impl DisbursementReport {
    /// Total paid in this run.
    #[must_use]
    pub fn paid_total(&self) -> u128 {
        self.paid.iter().map(|e| e.amount).sum()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// EXECUTOR
// ════════════════════════════════════════════════════════════════════════════════

/// Submits payout batches to the ledger and records confirmed ones.
pub struct BatchDisburser {
    ledger: Arc<dyn Ledger>,
    store: Arc<StateStore>,
    params: EngineParams,
}

impl BatchDisburser {
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, store: Arc<StateStore>, params: EngineParams) -> Self {
        Self { ledger, store, params }
    }

    /// Pays `payouts` for `cycle` out of a pool holding `pool_init`.
    ///
    /// Never fails: ledger and log write errors are logged per batch and
    /// the run continues with the next batch.
    pub async fn disburse(
        &self,
        cycle: &Cycle,
        payouts: Vec<Payout>,
        pool_init: u128,
    ) -> DisbursementReport {
        let mut report =
            DisbursementReport { pool_init, pool_left: pool_init, ..Default::default() };

        let logged = self.store.paid_in_cycle(cycle.number);
        let mut pending: Vec<Payout> = payouts
            .into_iter()
            .filter(|p| {
                let dup = logged.contains(&p.address);
                if dup {
                    report.already_paid += 1;
                }
                !dup
            })
            .collect();

        report.scaled = scale_to_pool(&mut pending, pool_init);
        if report.scaled {
            warn!(cycle = cycle.number, pool = pool_init, "pool insufficient, scaling payouts");
        }
        let before = pending.len();
        pending.retain(|p| p.amount > 0);
        report.unpaid += before - pending.len();

        let chunk_size = self.params.chunk_size.max(1);
        let mut chunks = pending.chunks(chunk_size).enumerate();

        while report.pool_left > 0 {
            let Some((index, chunk)) = chunks.next() else {
                break;
            };
            let batch = index + 1;
            let packed = pack_chunk(chunk, report.pool_left);
            report.unpaid += packed.skipped.len();
            if packed.entries.is_empty() {
                continue;
            }

            let addresses: Vec<Address> = packed.entries.iter().map(|p| p.address).collect();
            let amounts: Vec<u128> = packed.entries.iter().map(|p| p.amount).collect();

            match self.ledger.disburse(&addresses, &amounts).await {
                Ok(receipt) => {
                    report.pool_left -= packed.subtotal;
                    report.batches_sent += 1;
                    info!(
                        cycle = cycle.number,
                        batch,
                        users = packed.entries.len(),
                        subtotal = packed.subtotal,
                        tx = %receipt.tx_hash,
                        "batch sent"
                    );

                    let entries: Vec<PayoutLogEntry> = packed
                        .entries
                        .iter()
                        .map(|p| PayoutLogEntry::from_payout(cycle.number, p))
                        .collect();
                    if let Err(e) = self.store.append_payouts(&entries) {
                        error!(
                            cycle = cycle.number,
                            batch,
                            error = %e,
                            "failed to record paid batch"
                        );
                    }
                    report.paid.extend(entries);
                }
                Err(e) => {
                    error!(
                        cycle = cycle.number,
                        batch,
                        users = packed.entries.len(),
                        error = %e,
                        "batch failed"
                    );
                    report.batches_failed += 1;
                    report.failed += packed.entries.len();
                }
            }
        }

        // Chunks never reached because the pool ran out.
        report.unpaid += chunks.map(|(_, c)| c.len()).sum::<usize>();

        info!(
            cycle = cycle.number,
            pool_init,
            pool_left = report.pool_left,
            paid = report.paid.len(),
            paid_total = report.paid_total(),
            unpaid = report.unpaid,
            failed = report.failed,
            "disbursement finished"
        );
        report
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════
