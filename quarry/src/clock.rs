use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

/// Sentinel deadline meaning "no deadline"; sleepers park until woken.
pub const NEVER_NS: u64 = u64::MAX;

/// Monotonic time source for the whole engine.
///
/// Every time read and every timed wait in the engine goes through this
/// trait so that tests can single-step the system with [`ManualClock`]
/// instead of waiting on wall time.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Nanoseconds elapsed on this clock's monotonic timeline.
    fn now_ns(&self) -> u64;

    /// Sleep until `deadline_ns` on this clock's timeline.
    ///
    /// Returns immediately if the deadline has already passed.
    async fn sleep_until(&self, deadline_ns: u64);
}

/// Wall-clock implementation backed by `tokio::time`.
///
/// The timeline starts at zero when the clock is created.
#[derive(Debug)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: std::time::Instant::now(),
        })
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    async fn sleep_until(&self, deadline_ns: u64) {
        // Sleep in bounded chunks so a NEVER_NS deadline doesn't overflow
        // tokio's timer wheel.
        loop {
            let now = self.now_ns();
            if deadline_ns <= now {
                return;
            }
            let remaining = Duration::from_nanos(deadline_ns - now);
            tokio::time::sleep(remaining.min(Duration::from_secs(3600))).await;
        }
    }
}

/// Virtual clock for deterministic tests.
///
/// Time only moves when a test calls [`ManualClock::advance`] or
/// [`ManualClock::set_ns`]; both wake every pending sleeper so the engine's
/// delayed messages and consumer keep-alive timeouts fire in a controlled
/// order.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
    tick: Notify,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.now_ns
            .fetch_add(delta.as_nanos() as u64, Ordering::SeqCst);
        self.tick.notify_waiters();
    }

    /// Jump the clock to an absolute nanosecond value.
    ///
    /// Moving backwards is a test bug; the clock saturates at its current
    /// value instead.
    pub fn set_ns(&self, now_ns: u64) {
        self.now_ns.fetch_max(now_ns, Ordering::SeqCst);
        self.tick.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    async fn sleep_until(&self, deadline_ns: u64) {
        loop {
            if self.now_ns() >= deadline_ns {
                return;
            }
            let notified = self.tick.notified();
            // Re-check after registering so an advance between the check and
            // the await is not lost.
            if self.now_ns() >= deadline_ns {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_manual_clock_starts_at_zero() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ns(), 0);
    }

    #[tokio::test]
    async fn test_manual_clock_advance_wakes_sleeper() {
        let clock = ManualClock::new();
        let sleeper = {
            let clock = Arc::clone(&clock);
            tokio::spawn(async move { clock.sleep_until(5_000_000_000).await })
        };

        // Not enough time: the sleeper must stay parked.
        clock.advance(Duration::from_secs(2));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(3));
        timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("sleeper did not wake after clock advance")
            .unwrap();
    }

    #[tokio::test]
    async fn test_manual_clock_past_deadline_returns_immediately() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(10));
        timeout(Duration::from_millis(50), clock.sleep_until(1))
            .await
            .expect("sleep past deadline should not block");
    }

    #[tokio::test]
    async fn test_manual_clock_set_ns_never_rewinds() {
        let clock = ManualClock::new();
        clock.set_ns(1_000);
        clock.set_ns(500);
        assert_eq!(clock.now_ns(), 1_000);
    }

    #[tokio::test]
    async fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_ns();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = clock.now_ns();
        assert!(b > a);
    }
}
