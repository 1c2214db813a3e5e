use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::time::{self, Instant};

/// Time capability injected into the scheduler tasks. Production code uses
/// [`SystemClock`]; tests substitute a clock with a pinned wall time so
/// wall-dependent policies stay deterministic.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic now, for intervals and deadlines.
    fn monotonic(&self) -> Instant;

    /// Wall-clock now in the local timezone, for Times/AfterReset policies
    /// and display formatting.
    fn wall(&self) -> DateTime<Local>;

    /// Cancellable sleep; callers race this against their stop/config
    /// signals in a `select!`.
    async fn sleep(&self, duration: Duration);

    fn wall_epoch_ms(&self) -> i64 {
        self.wall().timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Local> {
        Local::now()
    }

    async fn sleep(&self, duration: Duration) {
        time::sleep(duration).await;
    }
}
