//! Wall clocks

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use syncsocket_core::LocalTime;

/// Source of local wall-clock time
pub trait WallClock: Send + Sync {
    fn now(&self) -> LocalTime;
}

/// Operating-system wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> LocalTime {
        // Before-epoch clocks report negative time rather than failing
        let millis = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_millis() as i64,
            Err(before) => -(before.duration().as_millis() as i64),
        };
        LocalTime::from_millis(millis)
    }
}

/// Manually driven clock, shared between clones
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: LocalTime) -> Self {
        ManualClock {
            millis: Arc::new(AtomicI64::new(start.as_millis())),
        }
    }

    pub fn set(&self, now: LocalTime) {
        self.millis.store(now.as_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now(&self) -> LocalTime {
        LocalTime::from_millis(self.millis.load(Ordering::SeqCst))
    }
}
