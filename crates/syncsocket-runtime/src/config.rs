//! Runtime configuration

use std::time::Duration;

use syncsocket_core::ChannelId;
use syncsocket_time::LateFirePolicy;

/// What a failed sync does once retries are used up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExhaustedPolicy {
    /// Drop the pending `synchronize`; the channel keeps its state and
    /// accepts events again
    Abandon,
    /// Leave `synchronize` pending; the channel rejects every further event
    StayPending,
}

/// Retry behaviour of the deferred `synchronize` transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncRetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
    pub on_exhausted: ExhaustedPolicy,
}

impl SyncRetryPolicy {
    /// One attempt, then stay pending forever
    pub fn never() -> Self {
        SyncRetryPolicy {
            max_attempts: 1,
            backoff: Duration::ZERO,
            on_exhausted: ExhaustedPolicy::StayPending,
        }
    }

    /// Is another attempt allowed after `attempt` failed?
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for SyncRetryPolicy {
    fn default() -> Self {
        SyncRetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            on_exhausted: ExhaustedPolicy::Abandon,
        }
    }
}

/// Channel engine configuration
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Run `synchronize` right after `service.initialize`
    pub sync_on_initialize: bool,
    /// Report `uninitialized` to the server when the channel is created
    pub report_initial_state: bool,
    pub sync_retry: SyncRetryPolicy,
    /// Handling of fire instants that already passed
    pub late_fire: LateFirePolicy,
    /// Lateness that still fires regardless of `late_fire`
    pub late_tolerance: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            sync_on_initialize: true,
            report_initial_state: true,
            sync_retry: SyncRetryPolicy::default(),
            late_fire: LateFirePolicy::FireImmediately,
            late_tolerance: Duration::ZERO,
        }
    }
}

impl ChannelConfig {
    /// Server drives every transition explicitly; late fires are dropped
    pub fn strict() -> Self {
        ChannelConfig {
            sync_on_initialize: false,
            report_initial_state: true,
            sync_retry: SyncRetryPolicy::default(),
            late_fire: LateFirePolicy::Skip,
            late_tolerance: Duration::from_millis(20),
        }
    }
}

/// Identity and privileges of a joined channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    pub channel_id: ChannelId,
    /// Fixed for the channel's lifetime
    pub can_publish: bool,
}

impl ChannelSpec {
    pub fn new(channel_id: impl Into<ChannelId>, can_publish: bool) -> Self {
        ChannelSpec {
            channel_id: channel_id.into(),
            can_publish,
        }
    }

    pub fn publisher(channel_id: impl Into<ChannelId>) -> Self {
        Self::new(channel_id, true)
    }

    pub fn subscriber(channel_id: impl Into<ChannelId>) -> Self {
        Self::new(channel_id, false)
    }
}

/// Connection configuration
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Sent to the server as `instanceId`
    pub instance_id: String,
    /// Applied to every channel opened on the connection
    pub channel: ChannelConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            instance_id: "syncsocket-instance".to_string(),
            channel: ChannelConfig::default(),
        }
    }
}
