//! Time primitives for syncsocket
//!
//! Two clocks are in play:
//! - Remote time: the server's clock, as carried in timetickets
//! - Local time: this client's wall clock
//!
//! Both are milliseconds since the Unix epoch. A [`SyncResult`] relates them.

use std::ops::{Add, Sub};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Remote (server clock) time in milliseconds since the Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteTime(pub i64);

impl RemoteTime {
    #[inline]
    pub fn from_millis(millis: i64) -> Self {
        RemoteTime(millis)
    }

    #[inline]
    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Translate into local time given `adjust = remote - local` in ms
    #[inline]
    pub fn to_local(self, adjust: f64) -> LocalTime {
        LocalTime((self.0 as f64 - adjust).round() as i64)
    }
}

impl std::fmt::Debug for RemoteTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote({}ms)", self.0)
    }
}

/// Local wall-clock time in milliseconds since the Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalTime(pub i64);

impl LocalTime {
    #[inline]
    pub fn from_millis(millis: i64) -> Self {
        LocalTime(millis)
    }

    #[inline]
    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Signed distance `self - earlier` in ms
    #[inline]
    pub fn millis_since(self, earlier: LocalTime) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    #[inline]
    pub fn saturating_add(self, duration: Duration) -> Self {
        LocalTime(self.0.saturating_add(duration.as_millis() as i64))
    }
}

impl Add<Duration> for LocalTime {
    type Output = LocalTime;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        LocalTime(self.0 + rhs.as_millis() as i64)
    }
}

impl Sub<LocalTime> for LocalTime {
    type Output = Duration;

    /// Saturates at zero when `rhs` is later
    #[inline]
    fn sub(self, rhs: LocalTime) -> Self::Output {
        let diff = self.0 - rhs.0;
        if diff >= 0 {
            Duration::from_millis(diff as u64)
        } else {
            Duration::ZERO
        }
    }
}

impl std::fmt::Debug for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "local({}ms)", self.0)
    }
}

/// Outcome of one clock-offset measurement against a timeserver
///
/// Each successful result fully replaces the previous one; results are never
/// merged or averaged.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Whether the measurement converged
    pub successful: bool,
    /// Signed offset `remote - local` (ms)
    pub adjust: f64,
    /// Measurement uncertainty (ms, non-negative)
    pub error: f64,
}

impl SyncResult {
    pub fn success(adjust: f64, error: f64) -> Self {
        SyncResult {
            successful: true,
            adjust,
            error: error.abs(),
        }
    }

    pub fn failure(error: f64) -> Self {
        SyncResult {
            successful: false,
            adjust: 0.0,
            error: error.abs(),
        }
    }
}
