//! # Persisted Record Types
//!
//! Data model of the cycle engine. Every type here is serialized to one of
//! the JSON documents owned by [`StateStore`](crate::store::StateStore).
//! Field names are camelCase on disk; amounts are decimal strings.
//!
//! ## Holder Lifecycle
//!
//! ```text
//!            first qualification
//!   (none) ─────────────────────────▶ Counting { entryCycle }
//!                                        │   ▲
//!                        balance < base  │   │ next cycle after probation
//!                                        ▼   │
//!                                     Ejected { ejectedAt }
//!                                        │
//!                 requalifies at snapshot│
//!                                        ▼
//!                         Probation { holdProofStart, holdProofCompleted = null }
//!                                        │
//!                     cycle close        │ holdProofCompleted = n, no payout
//!                                        ▼
//!                     Counting (start = holdProofCompleted + 1)
//! ```
//!
//! `ejectedAt` and `entryCycle` are never both set. A record is never
//! deleted; ejection only sets a field.

use std::collections::BTreeMap;

use gen_common::{amount_str, Address};
use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════════════════════
// HOLDER VERIFIER RECORD
// ════════════════════════════════════════════════════════════════════════════════

/// Per-holder eligibility state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderVerifierRecord {
    /// Baseline balance future balances are compared against.
    #[serde(with = "amount_str")]
    pub initial_hold: u128,
    /// Cycle in which the holder first qualified without probation.
    #[serde(default)]
    pub entry_cycle: Option<u64>,
    /// Cycle in which probation started after requalification.
    #[serde(default)]
    pub hold_proof_start: Option<u64>,
    /// Cycle in which probation was served.
    #[serde(default)]
    pub hold_proof_completed: Option<u64>,
    /// Payout escalation tier.
    #[serde(default)]
    pub progress: u8,
    /// Cycle in which the holder fell below baseline. Present only while disqualified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ejected_at: Option<u64>,
}

impl HolderVerifierRecord {
    /// Record for a holder qualifying for the first time in `cycle`.
    #[must_use]
    pub fn new_entrant(balance: u128, cycle: u64) -> Self {
        Self {
            initial_hold: balance,
            entry_cycle: Some(cycle),
            hold_proof_start: None,
            hold_proof_completed: None,
            progress: 0,
            ejected_at: None,
        }
    }

    /// Whether the holder is currently disqualified.
    #[must_use]
    pub fn is_ejected(&self) -> bool {
        self.ejected_at.is_some()
    }

    /// Whether the holder is serving probation (started, not yet completed).
    #[must_use]
    pub fn in_probation(&self) -> bool {
        self.hold_proof_start.is_some() && self.hold_proof_completed.is_none()
    }

    /// First cycle counted toward progress, if the holder is counting.
    #[must_use]
    pub fn counting_start(&self) -> Option<u64> {
        match (self.entry_cycle, self.hold_proof_completed) {
            (Some(entry), _) => Some(entry),
            (None, Some(completed)) => Some(completed + 1),
            (None, None) => None,
        }
    }

    /// Disqualifies the holder in `cycle`.
    pub fn eject(&mut self, cycle: u64) {
        self.ejected_at = Some(cycle);
        self.entry_cycle = None;
    }

    /// Readmits an ejected holder into probation with a fresh baseline.
    pub fn requalify(&mut self, balance: u128, cycle: u64) {
        self.ejected_at = None;
        self.entry_cycle = None;
        self.initial_hold = balance;
        self.hold_proof_start = Some(cycle);
        self.hold_proof_completed = None;
        self.progress = 0;
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// VERIFIER STATE
// ════════════════════════════════════════════════════════════════════════════════

/// Monitoring metadata. Never affects behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    /// Number of the most recently created or completed cycle.
    pub last_cycle_nr: u64,
    /// Epoch seconds of the last snapshot.
    pub last_snapshot: u64,
    /// Epoch seconds of the last completed payout.
    pub last_payout: u64,
}

/// All verifier records plus telemetry, stored as one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierState {
    #[serde(rename = "_telemetry", default)]
    pub telemetry: Telemetry,
    #[serde(flatten)]
    pub holders: BTreeMap<Address, HolderVerifierRecord>,
}

impl VerifierState {
    /// Record for `address`, if any.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&HolderVerifierRecord> {
        self.holders.get(address)
    }

    /// Mutable record for `address`, if any.
    pub fn get_mut(&mut self, address: &Address) -> Option<&mut HolderVerifierRecord> {
        self.holders.get_mut(address)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// CYCLE
// ════════════════════════════════════════════════════════════════════════════════

/// Lifecycle status of a persisted cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Active,
    Completed,
}

/// Frozen eligibility entry of one holder in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    #[serde(with = "amount_str")]
    pub initial_hold: u128,
}

/// One time-boxed distribution round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cycle {
    /// Unique, monotonically increasing, starts at 1.
    pub number: u64,
    /// Epoch seconds at snapshot time.
    pub start_timestamp: u64,
    /// Epoch seconds at which the payout window closes.
    pub payout_until: u64,
    /// Randomized window length that produced `payout_until`.
    #[serde(default)]
    pub payout_in_hours: u64,
    /// Eligible holders and their baselines.
    #[serde(default)]
    pub snapshot: BTreeMap<Address, SnapshotEntry>,
    pub status: CycleStatus,
}

impl Cycle {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == CycleStatus::Active
    }

    /// Whether the payout window has closed at `now`.
    #[must_use]
    pub fn window_closed(&self, now: u64) -> bool {
        now >= self.payout_until
    }

    /// Whether `address` is still in the snapshot.
    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.snapshot.contains_key(address)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// PAYOUTS
// ════════════════════════════════════════════════════════════════════════════════

/// A computed payout awaiting disbursement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payout {
    pub address: Address,
    pub amount: u128,
    pub progress: u8,
    pub initial_hold: u128,
}

/// Append-only record of a confirmed payout. Unique per `(cycle, address)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutLogEntry {
    pub cycle: u64,
    pub address: Address,
    #[serde(with = "amount_str")]
    pub amount: u128,
    pub progress: u8,
    #[serde(with = "amount_str")]
    pub initial_hold: u128,
}

impl PayoutLogEntry {
    /// Idempotence key.
    #[must_use]
    pub fn key(&self) -> (u64, Address) {
        (self.cycle, self.address)
    }

    /// Log entry for a payout confirmed in `cycle`.
    #[must_use]
    pub fn from_payout(cycle: u64, payout: &Payout) -> Self {
        Self {
            cycle,
            address: payout.address,
            amount: payout.amount,
            progress: payout.progress,
            initial_hold: payout.initial_hold,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════
