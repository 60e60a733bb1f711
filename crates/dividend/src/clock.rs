//! Time sources.
//!
//! Cycle timestamps are epoch seconds. Components read time only through
//! [`Clock`] so that tests can pin or drive it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current epoch time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Manually driven clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(now: u64) -> Self {
        Self { now: AtomicU64::new(now) }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Epoch time derived from the tokio clock, anchored at a fixed epoch.
///
/// Under a paused tokio runtime this advances together with
/// `tokio::time::sleep`, which keeps timers and window checks consistent.
#[derive(Debug)]
pub struct TokioClock {
    anchor_epoch: u64,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    #[must_use]
    pub fn starting_at(epoch: u64) -> Self {
        Self { anchor_epoch: epoch, anchor: tokio::time::Instant::now() }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> u64 {
        self.anchor_epoch + self.anchor.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let c = ManualClock::new(100);
        assert_eq!(c.now(), 100);
        c.advance(5);
        assert_eq!(c.now(), 105);
        c.set(1);
        assert_eq!(c.now(), 1);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now() > 1_577_836_800);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let c = TokioClock::starting_at(1_000);
        assert_eq!(c.now(), 1_000);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(c.now(), 1_090);
    }
}
