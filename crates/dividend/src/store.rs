//! # Persistent State Store
//!
//! Durable storage for the three records the engine owns. The store is the
//! single source of truth: in-memory state is rebuilt from it at start-up,
//! never the reverse.
//!
//! ## File Layout
//!
//! ```text
//! {data_dir}/
//! ├── verifier-state.json   # address → HolderVerifierRecord, plus "_telemetry"
//! ├── cycle-metadata.json   # ordered list of Cycle
//! └── cycle-payout.json     # append-only list of PayoutLogEntry
//! ```
//!
//! ## Durability
//!
//! Every write goes to `<name>.tmp`, is flushed with `sync_all()`, and is
//! then renamed over the target. A crash leaves either the old or the new
//! document, never a torn one.
//!
//! ## Invalid State
//!
//! A missing document loads as its empty default. A malformed document is
//! logged and also loads as its empty default; the engine keeps running
//! rather than refusing to start.
//!
//! ## Invariants Enforced Here
//!
//! - At most one cycle is `active`; [`StateStore::append_cycle`] refuses a new
//!   cycle while the last one is not completed.
//! - Cycle numbers are consecutive starting at 1.
//! - The payout log holds at most one entry per `(cycle, address)`.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use gen_common::Address;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Cycle, CycleStatus, PayoutLogEntry, SnapshotEntry, VerifierState};

// ════════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════════

/// Verifier records and telemetry.
pub const VERIFIER_FILENAME: &str = "verifier-state.json";
/// Cycle metadata list.
pub const CYCLES_FILENAME: &str = "cycle-metadata.json";
/// Payout log.
pub const PAYOUT_FILENAME: &str = "cycle-payout.json";

// ════════════════════════════════════════════════════════════════════════════════
// ERROR
// ════════════════════════════════════════════════════════════════════════════════

/// Errors from store writes. Reads never fail; they fall back to defaults.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File I/O failure.
    #[error("state store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Serialization failure.
    #[error("state store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A write would break a cycle invariant.
    #[error("cycle conflict: {0}")]
    Conflict(String),
}

// ════════════════════════════════════════════════════════════════════════════════
// STORE
// ════════════════════════════════════════════════════════════════════════════════

/// JSON-file backed state store.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    /// Serializes read-modify-write sequences on the same document.
    write_lock: Mutex<()>,
}

impl StateStore {
    /// Opens (and creates if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io { path: dir.clone(), source })?;
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn read_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let path = self.path(name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return T::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state unreadable, using empty default");
                return T::default();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state malformed, using empty default");
                T::default()
            }
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.path(name);
        let tmp = self.path(&format!("{}.tmp", name));
        let data = serde_json::to_vec_pretty(value)?;

        let io_err = |source: io::Error| StoreError::Io { path: path.clone(), source };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(io_err)?;
        file.write_all(&data).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp, &path).map_err(io_err)?;
        debug!(path = %path.display(), bytes = data.len(), "state written");
        Ok(())
    }

    // ── verifier state ──────────────────────────────────────────────────

    /// Loads verifier records and telemetry.
    #[must_use]
    pub fn load_verifier_state(&self) -> VerifierState {
        self.read_or_default(VERIFIER_FILENAME)
    }

    /// Replaces the verifier document.
    pub fn save_verifier_state(&self, state: &VerifierState) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.write_json(VERIFIER_FILENAME, state)
    }

    // ── cycles ──────────────────────────────────────────────────────────

    /// Loads the cycle list in creation order.
    #[must_use]
    pub fn load_cycles(&self) -> Vec<Cycle> {
        self.read_or_default(CYCLES_FILENAME)
    }

    /// The active cycle, if any.
    #[must_use]
    pub fn active_cycle(&self) -> Option<Cycle> {
        self.load_cycles().into_iter().find(Cycle::is_active)
    }

    /// Appends a newly created cycle.
    ///
    /// Fails with [`StoreError::Conflict`] if the last cycle is not
    /// completed or `cycle.number` is not the next number.
    pub fn append_cycle(&self, cycle: &Cycle) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut cycles: Vec<Cycle> = self.read_or_default(CYCLES_FILENAME);

        if let Some(active) = cycles.iter().find(|c| c.is_active()) {
            return Err(StoreError::Conflict(format!(
                "cycle #{} is still active",
                active.number
            )));
        }

        let expected = cycles.last().map_or(1, |c| c.number + 1);
        if cycle.number != expected {
            return Err(StoreError::Conflict(format!(
                "cycle number {} out of sequence, expected {}",
                cycle.number, expected
            )));
        }

        cycles.push(cycle.clone());
        self.write_json(CYCLES_FILENAME, &cycles)
    }

    /// Replaces the snapshot of cycle `number`. Returns `false` if unknown.
    pub fn update_cycle_snapshot(
        &self,
        number: u64,
        snapshot: &std::collections::BTreeMap<Address, SnapshotEntry>,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let mut cycles: Vec<Cycle> = self.read_or_default(CYCLES_FILENAME);
        match cycles.iter_mut().find(|c| c.number == number) {
            Some(c) => {
                c.snapshot = snapshot.clone();
                self.write_json(CYCLES_FILENAME, &cycles)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Marks cycle `number` completed. Returns `false` if unknown.
    pub fn complete_cycle(&self, number: u64) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let mut cycles: Vec<Cycle> = self.read_or_default(CYCLES_FILENAME);
        match cycles.iter_mut().find(|c| c.number == number) {
            Some(c) => {
                c.status = CycleStatus::Completed;
                self.write_json(CYCLES_FILENAME, &cycles)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── payout log ──────────────────────────────────────────────────────

    /// Loads the full payout log.
    #[must_use]
    pub fn load_payout_log(&self) -> Vec<PayoutLogEntry> {
        self.read_or_default(PAYOUT_FILENAME)
    }

    /// Addresses already logged as paid in `cycle`.
    #[must_use]
    pub fn paid_in_cycle(&self, cycle: u64) -> HashSet<Address> {
        self.load_payout_log()
            .into_iter()
            .filter(|e| e.cycle == cycle)
            .map(|e| e.address)
            .collect()
    }

    /// Appends entries whose `(cycle, address)` key is not yet logged.
    ///
    /// Returns the number of entries actually appended.
    pub fn append_payouts(&self, entries: &[PayoutLogEntry]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock();
        let mut log: Vec<PayoutLogEntry> = self.read_or_default(PAYOUT_FILENAME);
        let mut seen: HashSet<(u64, Address)> = log.iter().map(PayoutLogEntry::key).collect();

        let before = log.len();
        for entry in entries {
            if seen.insert(entry.key()) {
                log.push(entry.clone());
            }
        }

        let appended = log.len() - before;
        if appended > 0 {
            self.write_json(PAYOUT_FILENAME, &log)?;
        }
        Ok(appended)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════
