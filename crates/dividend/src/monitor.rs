//! # Cycle Monitor
//!
//! Re-verifies snapshot membership while a cycle's payout window is open.
//!
//! ## Event Loop
//!
//! ```text
//!                ┌──────────────────────────────────────────┐
//!                ▼                                          │
//!   window closed? ──yes──▶ drop subscription, mark done ──▶ WindowClosed
//!                │ no
//!                ▼
//!            run pass  (transfers arriving meanwhile collapse into it)
//!                │
//!                ▼
//!   select! ─┬─ jittered timer (capped at payoutUntil) ─────────┤
//!            ├─ transfer touching a snapshot address ───────────┘
//!            └─ shutdown ──────────────────────────────────────▶ Shutdown
//! ```
//!
//! ## Per-Pass Rules
//!
//! | Balance | Effect |
//! |---------|--------|
//! | `< snapshot baseline` | removed from snapshot, `ejectedAt = cycle` |
//! | `>= threshold(baseline)` | snapshot and verifier baseline := balance |
//! | read failed | unchanged, retried next pass |
//!
//! Verifier state and the cycle snapshot are persisted after every pass.
//!
//! ## Re-entrancy
//!
//! [`CycleFlags`] holds an `in_pass` guard and the `done` flag. A pass
//! requested while another is in flight is a no-op, and the hand-off to
//! payout fires once per attached monitor. Neither flag is persisted.
//!
//! ## Cancellation
//!
//! Shutdown is only observed between passes. A ledger call in flight is
//! always awaited.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use gen_common::{Address, Ledger, TransferStream};
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::EngineParams;
use crate::error::CycleError;
use crate::store::StateStore;
use crate::types::{Cycle, VerifierState};

// ════════════════════════════════════════════════════════════════════════════════
// FLAGS
// ════════════════════════════════════════════════════════════════════════════════

/// In-memory guard flags of one monitored cycle.
#[derive(Debug, Default)]
pub struct CycleFlags {
    in_pass: AtomicBool,
    done: AtomicBool,
    passes: AtomicU64,
}

/// Held for the duration of one pass.
#[derive(Debug)]
pub struct PassGuard<'a> {
    flags: &'a CycleFlags,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.flags.in_pass.store(false, Ordering::Release);
    }
}

impl CycleFlags {
    /// Claims the pass slot. `None` if a pass is already running.
    pub fn try_begin_pass(&self) -> Option<PassGuard<'_>> {
        self.in_pass
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard { flags: self })
    }

    /// Whether a pass is currently running.
    #[must_use]
    pub fn in_pass(&self) -> bool {
        self.in_pass.load(Ordering::Acquire)
    }

    /// Sets `done`. Returns `true` only for the call that set it.
    pub fn mark_done(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Number of completed passes.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// OUTCOMES
// ════════════════════════════════════════════════════════════════════════════════

/// Result of one monitor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub checked: usize,
    pub ejected: Vec<Address>,
    pub escalated: Vec<Address>,
    pub read_failures: usize,
}

/// Why [`CycleMonitor::watch`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// `now >= payoutUntil`; the cycle is ready for payout.
    WindowClosed,
    /// Shutdown was requested.
    Shutdown,
}

enum Wake {
    Timer,
    Transfer,
    Shutdown,
}

// ════════════════════════════════════════════════════════════════════════════════
// MONITOR
// ════════════════════════════════════════════════════════════════════════════════

/// Monitors one cycle at a time. Create a fresh monitor per attached cycle.
pub struct CycleMonitor {
    ledger: Arc<dyn Ledger>,
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    params: EngineParams,
    flags: CycleFlags,
}

impl CycleMonitor {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<StateStore>,
        clock: Arc<dyn Clock>,
        params: EngineParams,
    ) -> Self {
        Self { ledger, store, clock, params, flags: CycleFlags::default() }
    }

    #[must_use]
    pub fn flags(&self) -> &CycleFlags {
        &self.flags
    }

    /// Runs one verification pass over the snapshot and persists the result.
    ///
    /// Returns `Ok(None)` without doing anything if a pass is in flight or
    /// the cycle was already handed off.
    pub async fn run_pass(
        &self,
        cycle: &mut Cycle,
        state: &mut VerifierState,
    ) -> Result<Option<PassReport>, CycleError> {
        if self.flags.is_done() {
            return Ok(None);
        }
        let Some(_guard) = self.flags.try_begin_pass() else {
            debug!(cycle = cycle.number, "monitor pass already in flight");
            return Ok(None);
        };

        let mut report = PassReport::default();
        let addresses: Vec<Address> = cycle.snapshot.keys().copied().collect();

        for address in addresses {
            let balance = match self.ledger.balance_of(&address).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(
                        cycle = cycle.number,
                        address = %address,
                        error = %e,
                        "monitor balance read failed"
                    );
                    report.read_failures += 1;
                    continue;
                }
            };
            report.checked += 1;

            let Some(entry) = cycle.snapshot.get_mut(&address) else {
                continue;
            };

            if balance < entry.initial_hold {
                cycle.snapshot.remove(&address);
                match state.get_mut(&address) {
                    Some(r) => r.eject(cycle.number),
                    None => warn!(address = %address, "ejected holder has no verifier record"),
                }
                info!(cycle = cycle.number, address = %address, balance, "holder ejected");
                report.ejected.push(address);
            } else if balance >= self.params.escalation_threshold(entry.initial_hold) {
                debug!(
                    cycle = cycle.number,
                    address = %address,
                    from = entry.initial_hold,
                    to = balance,
                    "baseline escalated"
                );
                entry.initial_hold = balance;
                if let Some(r) = state.get_mut(&address) {
                    r.initial_hold = balance;
                }
                report.escalated.push(address);
            }
        }

        self.store.save_verifier_state(state)?;
        self.store.update_cycle_snapshot(cycle.number, &cycle.snapshot)?;
        self.flags.passes.fetch_add(1, Ordering::Relaxed);

        debug!(
            cycle = cycle.number,
            checked = report.checked,
            ejected = report.ejected.len(),
            escalated = report.escalated.len(),
            failures = report.read_failures,
            "monitor pass complete"
        );
        Ok(Some(report))
    }

    /// Monitors `cycle` until its payout window closes or shutdown is requested.
    ///
    /// Persistence failures of individual passes are logged and the loop
    /// continues; the next pass writes the full state again.
    pub async fn watch(
        &self,
        cycle: &mut Cycle,
        state: &mut VerifierState,
        shutdown: &Notify,
    ) -> WatchOutcome {
        let mut transfers = self.ledger.subscribe_transfers();
        let mut stream_open = true;
        info!(cycle = cycle.number, holders = cycle.snapshot.len(), "monitoring cycle");

        loop {
            let now = self.clock.now();
            if cycle.window_closed(now) {
                drop(transfers);
                if self.flags.mark_done() {
                    info!(cycle = cycle.number, "payout window closed");
                }
                return WatchOutcome::WindowClosed;
            }

            self.pass_collapsing_transfers(cycle, state, &mut transfers, &mut stream_open).await;

            let remaining = cycle.payout_until.saturating_sub(self.clock.now());
            let delay = self.jitter_secs().min(remaining);

            match self
                .wait_for_trigger(cycle, &mut transfers, &mut stream_open, shutdown, delay)
                .await
            {
                Wake::Timer => {}
                Wake::Transfer => {
                    info!(cycle = cycle.number, "transfer detected, validating balances");
                }
                Wake::Shutdown => {
                    info!(cycle = cycle.number, "monitor stopping on shutdown");
                    return WatchOutcome::Shutdown;
                }
            }
        }
    }

    fn jitter_secs(&self) -> u64 {
        let (min, max) =
            (self.params.monitor_interval_min_secs, self.params.monitor_interval_max_secs);
        rand::thread_rng().gen_range(min..=max)
    }

    /// Runs a pass while draining the transfer stream; events seen during
    /// the pass trigger nothing further.
    async fn pass_collapsing_transfers(
        &self,
        cycle: &mut Cycle,
        state: &mut VerifierState,
        transfers: &mut TransferStream,
        stream_open: &mut bool,
    ) {
        let number = cycle.number;
        let pass = self.run_pass(cycle, state);
        tokio::pin!(pass);

        let result = loop {
            tokio::select! {
                res = &mut pass => break res,
                ev = transfers.next(), if *stream_open => match ev {
                    Some(Ok(_)) => debug!(cycle = number, "transfer during pass collapsed"),
                    Some(Err(e)) => {
                        warn!(cycle = number, error = %e, "transfer subscription error");
                    }
                    None => {
                        warn!(cycle = number, "transfer subscription ended");
                        *stream_open = false;
                    }
                },
            }
        };

        if let Err(e) = result {
            error!(cycle = number, error = %e, "monitor pass failed to persist");
        }
    }

    async fn wait_for_trigger(
        &self,
        cycle: &Cycle,
        transfers: &mut TransferStream,
        stream_open: &mut bool,
        shutdown: &Notify,
        delay_secs: u64,
    ) -> Wake {
        let sleep = tokio::time::sleep(Duration::from_secs(delay_secs));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Wake::Timer,
                _ = shutdown.notified() => return Wake::Shutdown,
                ev = transfers.next(), if *stream_open => match ev {
                    Some(Ok(ev)) if ev.touches(|a| cycle.contains(a)) => return Wake::Transfer,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(cycle = cycle.number, error = %e, "transfer subscription error");
                    }
                    None => {
                        warn!(cycle = cycle.number, "transfer subscription ended");
                        *stream_open = false;
                    }
                },
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::types::{CycleStatus, HolderVerifierRecord, SnapshotEntry};
    use async_trait::async_trait;
    use gen_common::{LedgerError, MockLedger, TransferEvent, TxReceipt};
    use std::collections::BTreeMap;

    const START: u64 = 1_700_000_000;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        ledger: Arc<MockLedger>,
        store: Arc<StateStore>,
        monitor: CycleMonitor,
        cycle: Cycle,
        state: VerifierState,
    }

    /// Cycle 1 with holders 1..=3 at baseline 100, window `window_secs`.
    fn fixture(window_secs: u64, params: EngineParams) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MockLedger::new());
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let clock = Arc::new(TokioClock::starting_at(START));

        let mut snapshot = BTreeMap::new();
        let mut state = VerifierState::default();
        for b in 1..=3 {
            snapshot.insert(addr(b), SnapshotEntry { initial_hold: 100 });
            state.holders.insert(addr(b), HolderVerifierRecord::new_entrant(100, 1));
            ledger.set_balance(addr(b), 100);
        }
        let cycle = Cycle {
            number: 1,
            start_timestamp: START,
            payout_until: START + window_secs,
            payout_in_hours: 1,
            snapshot,
            status: CycleStatus::Active,
        };
        store.save_verifier_state(&state).unwrap();
        store.append_cycle(&cycle).unwrap();

        let monitor = CycleMonitor::new(ledger.clone(), store.clone(), clock, params);
        Fixture { _dir: dir, ledger, store, monitor, cycle, state }
    }

    /// Ledger whose balance reads take `read_delay` each.
    struct SlowLedger {
        inner: Arc<MockLedger>,
        read_delay: Duration,
    }

    #[async_trait]
    impl Ledger for SlowLedger {
        async fn balance_of(&self, address: &Address) -> Result<u128, LedgerError> {
            tokio::time::sleep(self.read_delay).await;
            self.inner.balance_of(address).await
        }

        async fn pool_balance(&self) -> Result<u128, LedgerError> {
            self.inner.pool_balance().await
        }

        async fn is_sale_ended(&self) -> Result<bool, LedgerError> {
            self.inner.is_sale_ended().await
        }

        async fn sale_end_time(&self) -> Result<u64, LedgerError> {
            self.inner.sale_end_time().await
        }

        async fn disburse(
            &self,
            addresses: &[Address],
            amounts: &[u128],
        ) -> Result<TxReceipt, LedgerError> {
            self.inner.disburse(addresses, amounts).await
        }

        fn subscribe_transfers(&self) -> TransferStream {
            self.inner.subscribe_transfers()
        }
    }

    // ── Test 1: escalation, ejection, failed read ──

    #[tokio::test(start_paused = true)]
    async fn pass_applies_rules_and_persists() {
        let mut f = fixture(3_600, EngineParams::default());
        f.ledger.set_balance(addr(1), 152);
        f.ledger.set_balance(addr(2), 80);
        f.ledger.fail_reads_for(addr(3));

        let report = f.monitor.run_pass(&mut f.cycle, &mut f.state).await.unwrap().unwrap();
        assert_eq!(report.escalated, vec![addr(1)]);
        assert_eq!(report.ejected, vec![addr(2)]);
        assert_eq!(report.read_failures, 1);

        assert_eq!(f.cycle.snapshot[&addr(1)].initial_hold, 152);
        assert!(!f.cycle.contains(&addr(2)));
        assert!(f.cycle.contains(&addr(3)));

        let state = f.store.load_verifier_state();
        let escalated = state.get(&addr(1)).unwrap();
        assert_eq!(escalated.initial_hold, 152);
        assert_eq!(escalated.ejected_at, None);
        assert_eq!(state.get(&addr(2)).unwrap().ejected_at, Some(1));
        assert_eq!(state.get(&addr(3)).unwrap().initial_hold, 100);

        let persisted = f.store.active_cycle().unwrap();
        assert_eq!(persisted.snapshot, f.cycle.snapshot);
        assert_eq!(f.monitor.flags().passes(), 1);
    }

    // ── Test 2: re-entrancy guard ──

    #[tokio::test(start_paused = true)]
    async fn concurrent_pass_is_noop() {
        let mut f = fixture(3_600, EngineParams::default());
        f.ledger.set_balance(addr(1), 10);

        let guard = f.monitor.flags().try_begin_pass().unwrap();
        assert!(f.monitor.flags().try_begin_pass().is_none());
        assert!(f.monitor.run_pass(&mut f.cycle, &mut f.state).await.unwrap().is_none());
        assert!(f.cycle.contains(&addr(1)));
        drop(guard);

        assert!(!f.monitor.flags().in_pass());
        assert!(f.monitor.run_pass(&mut f.cycle, &mut f.state).await.unwrap().is_some());
        assert!(!f.cycle.contains(&addr(1)));
    }

    #[test]
    fn done_fires_once() {
        let flags = CycleFlags::default();
        assert!(flags.mark_done());
        assert!(!flags.mark_done());
        assert!(flags.is_done());
    }

    // ── Test 3: window already closed ──

    #[tokio::test(start_paused = true)]
    async fn closed_window_returns_without_pass() {
        let mut f = fixture(0, EngineParams::default());
        let shutdown = Notify::new();

        let outcome = f.monitor.watch(&mut f.cycle, &mut f.state, &shutdown).await;
        assert_eq!(outcome, WatchOutcome::WindowClosed);
        assert_eq!(f.monitor.flags().passes(), 0);
        assert!(f.monitor.flags().is_done());
        assert_eq!(f.ledger.subscriber_count(), 0);
        assert!(f.monitor.run_pass(&mut f.cycle, &mut f.state).await.unwrap().is_none());
    }

    // ── Test 4: timer passes until window closes ──

    #[tokio::test(start_paused = true)]
    async fn timer_drives_passes_until_window_closes() {
        let params = EngineParams {
            monitor_interval_min_secs: 60,
            monitor_interval_max_secs: 60,
            ..EngineParams::default()
        };
        let mut f = fixture(600, params);
        let shutdown = Notify::new();

        let outcome = f.monitor.watch(&mut f.cycle, &mut f.state, &shutdown).await;
        assert_eq!(outcome, WatchOutcome::WindowClosed);
        // Passes at t = 0, 60, ..., 540.
        assert_eq!(f.monitor.flags().passes(), 10);
        assert_eq!(f.ledger.subscriber_count(), 0);
    }

    // ── Test 5: transfer-triggered pass ──

    #[tokio::test(start_paused = true)]
    async fn relevant_transfer_triggers_pass() {
        let params = EngineParams {
            monitor_interval_min_secs: 3_000,
            monitor_interval_max_secs: 3_000,
            ..EngineParams::default()
        };
        let mut f = fixture(36_000, params);
        let shutdown = Notify::new();
        let ledger = f.ledger.clone();
        let store = f.store.clone();

        let driver = async {
            tokio::time::sleep(Duration::from_secs(10)).await;

            // Unrelated transfer: no pass.
            ledger.emit_transfer(TransferEvent { from: addr(8), to: addr(9), value: 1 });
            tokio::time::sleep(Duration::from_secs(10)).await;

            ledger.set_balance(addr(2), 50);
            assert_eq!(
                ledger.emit_transfer(TransferEvent { from: addr(2), to: addr(9), value: 50 }),
                1
            );
            tokio::time::sleep(Duration::from_secs(10)).await;

            let snap = store.active_cycle().unwrap().snapshot;
            assert!(!snap.contains_key(&addr(2)));
            shutdown.notify_one();
        };

        let (outcome, ()) =
            tokio::join!(f.monitor.watch(&mut f.cycle, &mut f.state, &shutdown), driver);
        assert_eq!(outcome, WatchOutcome::Shutdown);
        assert_eq!(f.monitor.flags().passes(), 2);
        assert!(!f.monitor.flags().is_done());
    }

    // ── Test 6: transfers during a pass collapse into it ──

    #[tokio::test(start_paused = true)]
    async fn transfers_during_pass_collapse() {
        let params = EngineParams {
            monitor_interval_min_secs: 3_000,
            monitor_interval_max_secs: 3_000,
            ..EngineParams::default()
        };
        let mut f = fixture(36_000, params);
        let slow = Arc::new(SlowLedger {
            inner: f.ledger.clone(),
            read_delay: Duration::from_secs(10),
        });
        let clock = Arc::new(TokioClock::starting_at(START));
        let monitor = CycleMonitor::new(slow, f.store.clone(), clock, params);
        let shutdown = Notify::new();
        let ledger = f.ledger.clone();

        let driver = async {
            // First pass reads three holders over t = 0..30.
            tokio::time::sleep(Duration::from_secs(5)).await;
            for b in 1..=3 {
                assert!(monitor.flags().in_pass());
                ledger.emit_transfer(TransferEvent { from: addr(b), to: addr(9), value: 1 });
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
            assert!(!monitor.flags().in_pass());
            assert_eq!(monitor.flags().passes(), 1);

            // A transfer after the pass triggers exactly one more.
            ledger.emit_transfer(TransferEvent { from: addr(1), to: addr(9), value: 1 });
            tokio::time::sleep(Duration::from_secs(5)).await;
            assert!(monitor.flags().in_pass());
            tokio::time::sleep(Duration::from_secs(45)).await;
            assert_eq!(monitor.flags().passes(), 2);
            shutdown.notify_one();
        };

        let (outcome, ()) =
            tokio::join!(monitor.watch(&mut f.cycle, &mut f.state, &shutdown), driver);
        assert_eq!(outcome, WatchOutcome::Shutdown);
        assert_eq!(monitor.flags().passes(), 2);
        assert_eq!(f.cycle.snapshot.len(), 3);
    }
}
