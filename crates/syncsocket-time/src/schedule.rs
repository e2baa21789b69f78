//! Fire planning - remote timeticket to local timer
//!
//! ```text
//! fire_in = (timeticket - adjust) - local_now
//! ```
//!
//! Simultaneity across clients is bounded by each client's last sync `error`.

use std::time::Duration;

use syncsocket_core::{LocalTime, RemoteTime, SyncResult};

/// What to do when the fire instant has already passed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LateFirePolicy {
    /// Fire at the next opportunity
    #[default]
    FireImmediately,
    /// Return to idle without firing
    Skip,
}

/// Planned handling of one scheduled fire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirePlan {
    /// Fire instant is ahead; arm a timer for `delay`
    Arm { delay: Duration, fire_at: LocalTime },
    /// Fire instant has passed; fire at once
    Late { late_by: Duration, fire_at: LocalTime },
    /// Fire instant has passed beyond tolerance; do not fire
    Skip { late_by: Duration, fire_at: LocalTime },
}

impl FirePlan {
    /// Timer delay to arm for this plan
    pub fn delay(&self) -> Duration {
        match self {
            FirePlan::Arm { delay, .. } => *delay,
            FirePlan::Late { .. } | FirePlan::Skip { .. } => Duration::ZERO,
        }
    }

    /// Does the fire callback run when the timer expires?
    pub fn fires(&self) -> bool {
        !matches!(self, FirePlan::Skip { .. })
    }

    pub fn fire_at(&self) -> LocalTime {
        match self {
            FirePlan::Arm { fire_at, .. }
            | FirePlan::Late { fire_at, .. }
            | FirePlan::Skip { fire_at, .. } => *fire_at,
        }
    }
}

/// Signed milliseconds from `now` until the local fire instant
pub fn fire_in_ms(ticket: RemoteTime, sync: &SyncResult, now: LocalTime) -> i64 {
    ticket.to_local(sync.adjust).millis_since(now)
}

/// Plan the local firing of `ticket`.
///
/// Lateness up to `tolerance` always fires; beyond it `policy` decides.
pub fn plan_fire(
    ticket: RemoteTime,
    sync: &SyncResult,
    now: LocalTime,
    policy: LateFirePolicy,
    tolerance: Duration,
) -> FirePlan {
    let fire_at = ticket.to_local(sync.adjust);
    let fire_in = fire_at.millis_since(now);

    if fire_in >= 0 {
        return FirePlan::Arm {
            delay: Duration::from_millis(fire_in as u64),
            fire_at,
        };
    }

    let late_by = Duration::from_millis(fire_in.unsigned_abs());
    if late_by <= tolerance || policy == LateFirePolicy::FireImmediately {
        FirePlan::Late { late_by, fire_at }
    } else {
        FirePlan::Skip { late_by, fire_at }
    }
}
