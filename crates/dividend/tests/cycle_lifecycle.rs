//! End-to-end cycle lifecycle against the in-memory ledger.
//!
//! Every test runs on a paused tokio clock: monitor timers and payout
//! windows elapse instantly while keeping their relative order.

use std::sync::Arc;
use std::time::Duration;

use gen_common::{Address, MockLedger};
use gen_dividend::{
    Clock, CycleManager, CyclePhase, CycleStatus, DividendConfig, EngineParams, StateStore,
    StaticRegistry, TokioClock, HOUR_SECS,
};
use tokio::sync::Notify;

const START: u64 = 1_700_000_000;

fn addr(b: u8) -> Address {
    Address([b; 20])
}

fn params() -> EngineParams {
    EngineParams {
        min_hold: 10,
        payout_hours_min: 1,
        payout_hours_max: 1,
        monitor_interval_min_secs: 60,
        monitor_interval_max_secs: 60,
        ..EngineParams::default()
    }
}

struct Harness {
    dir: tempfile::TempDir,
    ledger: Arc<MockLedger>,
    store: Arc<StateStore>,
    clock: Arc<TokioClock>,
    registry: Arc<StaticRegistry>,
}

impl Harness {
    fn new(holders: &[(u8, u128)], pool: u128) -> Self {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {}", e));
        let ledger = Arc::new(MockLedger::new());
        ledger.set_pool(pool);
        for (b, balance) in holders {
            ledger.set_balance(addr(*b), *balance);
        }
        let store = Arc::new(
            StateStore::open(dir.path()).unwrap_or_else(|e| panic!("open store: {}", e)),
        );
        let registry = Arc::new(StaticRegistry::new(holders.iter().map(|(b, _)| addr(*b))));
        Self { dir, ledger, store, clock: Arc::new(TokioClock::starting_at(START)), registry }
    }

    fn manager(&self) -> CycleManager {
        let mut config = DividendConfig::with_data_dir(self.dir.path());
        config.params = params();
        config.retry_secs = 60;
        CycleManager::new(
            self.ledger.clone(),
            self.registry.clone(),
            self.store.clone(),
            self.clock.clone(),
            config,
        )
    }

    fn paid(&self, cycle: u64, b: u8) -> Option<u128> {
        self.store
            .load_payout_log()
            .into_iter()
            .find(|e| e.cycle == cycle && e.address == addr(b))
            .map(|e| e.amount)
    }
}

// ── Test 1: full three-cycle ejection / requalification story ──

#[tokio::test(start_paused = true)]
async fn ejection_probation_and_return_to_payout() {
    let h = Harness::new(&[(1, 100), (2, 1_000)], 1_000_000);
    let manager = h.manager();
    let shutdown = Notify::new();

    // Cycle 1: holder 1 drops below baseline mid-window.
    let ledger = h.ledger.clone();
    let drop_balance = async {
        tokio::time::sleep(Duration::from_secs(1_800)).await;
        ledger.set_balance(addr(1), 80);
    };
    let (c1, ()) = tokio::join!(manager.run_cycle(&shutdown), drop_balance);
    let c1 = c1
        .unwrap_or_else(|e| panic!("cycle 1: {}", e))
        .unwrap_or_else(|| panic!("no summary"));
    assert_eq!(c1.number, 1);
    assert_eq!(h.paid(1, 1), None);
    assert_eq!(h.paid(1, 2), Some(20));
    assert_eq!(h.store.load_verifier_state().get(&addr(1)).and_then(|r| r.ejected_at), Some(1));

    // Cycle 2: requalifies at 90, serves probation.
    h.ledger.set_balance(addr(1), 90);
    let c2 = manager.run_cycle(&shutdown).await.unwrap_or_else(|e| panic!("cycle 2: {}", e));
    assert_eq!(c2.map(|s| s.probation_completed), Some(1));
    assert_eq!(h.paid(2, 1), None);
    assert_eq!(h.paid(2, 2), Some(20));

    let rec = h
        .store
        .load_verifier_state()
        .get(&addr(1))
        .cloned()
        .unwrap_or_else(|| panic!("record"));
    assert_eq!(rec.initial_hold, 90);
    assert_eq!(rec.hold_proof_start, Some(2));
    assert_eq!(rec.hold_proof_completed, Some(2));
    assert_eq!(rec.ejected_at, None);

    // Cycle 3: first payout at 2%; holder 2 reaches progress 1.
    manager.run_cycle(&shutdown).await.unwrap_or_else(|e| panic!("cycle 3: {}", e));
    assert_eq!(h.paid(3, 1), Some(1));
    assert_eq!(h.paid(3, 2), Some(30));

    let cycles = h.store.load_cycles();
    assert_eq!(cycles.len(), 3);
    assert!(cycles.iter().all(|c| c.status == CycleStatus::Completed));
}

// ── Test 2: escalation during monitoring ──

#[tokio::test(start_paused = true)]
async fn escalation_raises_baseline_and_payout() {
    let h = Harness::new(&[(1, 100)], 1_000_000);
    let manager = h.manager();
    let shutdown = Notify::new();

    let ledger = h.ledger.clone();
    let grow = async {
        tokio::time::sleep(Duration::from_secs(900)).await;
        ledger.set_balance(addr(1), 152);
    };
    let (res, ()) = tokio::join!(manager.run_cycle(&shutdown), grow);
    res.unwrap_or_else(|e| panic!("cycle: {}", e));

    let rec = h
        .store
        .load_verifier_state()
        .get(&addr(1))
        .cloned()
        .unwrap_or_else(|| panic!("record"));
    assert_eq!(rec.initial_hold, 152);
    assert_eq!(rec.ejected_at, None);
    assert_eq!(h.store.load_cycles()[0].snapshot[&addr(1)].initial_hold, 152);
    assert_eq!(h.paid(1, 1), Some(3));
}

// ── Test 3: pool conservation under scaling ──

#[tokio::test(start_paused = true)]
async fn paid_total_never_exceeds_pool() {
    let holders: Vec<(u8, u128)> = (1..=120).map(|b| (b, 1_000 + u128::from(b) * 37)).collect();
    let h = Harness::new(&holders, 777);
    let manager = h.manager();

    let summary = manager
        .run_cycle(&Notify::new())
        .await
        .unwrap_or_else(|e| panic!("cycle: {}", e))
        .unwrap_or_else(|| panic!("no summary"));

    assert!(summary.report.scaled);
    assert!(summary.requested > 777);
    let logged: u128 = h.store.load_payout_log().iter().map(|e| e.amount).sum();
    assert!(logged <= 777);
    assert_eq!(logged, h.ledger.total_disbursed());
    // 120 holders in chunks of 50.
    assert_eq!(h.ledger.disbursements().len(), 3);
}

// ── Test 4: restart resumes the active cycle ──

#[tokio::test(start_paused = true)]
async fn restart_resumes_instead_of_creating() {
    let h = Harness::new(&[(1, 500)], 1_000_000);
    let shutdown = Notify::new();

    let first = h.manager();
    let stop = async {
        tokio::time::sleep(Duration::from_secs(600)).await;
        shutdown.notify_one();
    };
    let (res, ()) = tokio::join!(first.run_cycle(&shutdown), stop);
    assert!(res.unwrap_or_else(|e| panic!("first run: {}", e)).is_none());
    assert_eq!(first.phase(), CyclePhase::Active(1));
    drop(first);

    let second = h.manager();
    let summary = second
        .run_cycle(&shutdown)
        .await
        .unwrap_or_else(|e| panic!("second run: {}", e))
        .unwrap_or_else(|| panic!("no summary"));
    assert_eq!(summary.number, 1);
    assert_eq!(h.store.load_cycles().len(), 1);
    assert_eq!(h.paid(1, 1), Some(10));
    assert!(h.clock.now() >= START + HOUR_SECS);
}

// ── Test 5: run loop chains cycles with one active at a time ──

#[tokio::test(start_paused = true)]
async fn run_loop_chains_cycles_until_shutdown() {
    let h = Harness::new(&[(1, 1_000)], 1_000_000);
    let manager = h.manager();
    let shutdown = Notify::new();

    let store = h.store.clone();
    let observer = async {
        for _ in 0..7 {
            tokio::time::sleep(Duration::from_secs(1_800)).await;
            let active = store.load_cycles().iter().filter(|c| c.is_active()).count();
            assert!(active <= 1);
        }
        shutdown.notify_one();
    };
    tokio::join!(manager.run(&shutdown), observer);

    let cycles = h.store.load_cycles();
    let completed = cycles.iter().filter(|c| c.status == CycleStatus::Completed).count();
    assert_eq!(completed, 3);
    assert_eq!(cycles.iter().filter(|c| c.is_active()).count(), 1);
    assert_eq!(cycles.last().map(|c| c.number), Some(4));

    // Progress under continuous holding: cycles 1..3 pay 2%, 2%, 3%.
    let amounts: Vec<u128> = (1..=3).filter_map(|n| h.paid(n, 1)).collect();
    assert_eq!(amounts, vec![20, 20, 30]);

    let telemetry = h.store.load_verifier_state().telemetry;
    assert_eq!(telemetry.last_cycle_nr, 4);
}

// ── Test 6: waits out the first-cycle cooldown ──

#[tokio::test(start_paused = true)]
async fn waits_for_cooldown_before_first_cycle() {
    let h = Harness::new(&[(1, 1_000)], 1_000_000);
    // Sale ended one hour before start; default cooldown is 24h.
    h.ledger.set_sale(true, START - HOUR_SECS);
    let manager = h.manager();
    let shutdown = Notify::new();

    let store = h.store.clone();
    let observer = async {
        tokio::time::sleep(Duration::from_secs(22 * HOUR_SECS)).await;
        assert!(store.load_cycles().is_empty());
        tokio::time::sleep(Duration::from_secs(HOUR_SECS + HOUR_SECS / 2)).await;
        assert_eq!(store.load_cycles().len(), 1);
        shutdown.notify_one();
    };
    tokio::join!(manager.run(&shutdown), observer);
}
