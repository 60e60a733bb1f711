//! Read-only summary of persisted engine state, printed by
//! `gen-dividend status <data-dir>`.

use std::collections::BTreeMap;
use std::fmt;

use crate::store::StateStore;
use crate::types::{Cycle, Telemetry};

/// Active cycle overview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCycleStatus {
    pub number: u64,
    pub start_timestamp: u64,
    pub payout_until: u64,
    pub snapshot_size: usize,
}

/// Paid totals of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePaidStatus {
    pub cycle: u64,
    pub recipients: usize,
    pub total: u128,
}

/// Summary of the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub telemetry: Telemetry,
    pub holders: usize,
    pub ejected: usize,
    pub cycles: usize,
    pub active: Option<ActiveCycleStatus>,
    /// Most recent cycles with payouts, newest first.
    pub recent: Vec<CyclePaidStatus>,
}

impl StatusReport {
    /// Collects the report, listing at most `recent` cycles of payouts.
    #[must_use]
    pub fn collect(store: &StateStore, recent: usize) -> Self {
        let state = store.load_verifier_state();
        let cycles = store.load_cycles();

        let mut per_cycle: BTreeMap<u64, CyclePaidStatus> = BTreeMap::new();
        for entry in store.load_payout_log() {
            let row = per_cycle.entry(entry.cycle).or_insert(CyclePaidStatus {
                cycle: entry.cycle,
                recipients: 0,
                total: 0,
            });
            row.recipients += 1;
            row.total = row.total.saturating_add(entry.amount);
        }

        Self {
            telemetry: state.telemetry,
            holders: state.holders.len(),
            ejected: state.holders.values().filter(|r| r.is_ejected()).count(),
            cycles: cycles.len(),
            active: cycles.iter().find(|c| c.is_active()).map(active_status),
            recent: per_cycle.into_values().rev().take(recent).collect(),
        }
    }
}

fn active_status(c: &Cycle) -> ActiveCycleStatus {
    ActiveCycleStatus {
        number: c.number,
        start_timestamp: c.start_timestamp,
        payout_until: c.payout_until,
        snapshot_size: c.snapshot.len(),
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cycles:         {}", self.cycles)?;
        writeln!(f, "last cycle:     #{}", self.telemetry.last_cycle_nr)?;
        writeln!(f, "last snapshot:  {}", self.telemetry.last_snapshot)?;
        writeln!(f, "last payout:    {}", self.telemetry.last_payout)?;
        writeln!(f, "holders:        {} ({} ejected)", self.holders, self.ejected)?;
        match &self.active {
            Some(a) => writeln!(
                f,
                "active:         #{} ({} holders, window {}..{})",
                a.number, a.snapshot_size, a.start_timestamp, a.payout_until
            )?,
            None => writeln!(f, "active:         none")?,
        }
        for row in &self.recent {
            writeln!(
                f,
                "paid #{:<8} {} recipients, total {}",
                row.cycle, row.recipients, row.total
            )?;
        }
        Ok(())
    }
}
