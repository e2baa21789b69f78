//! Channel states
//!
//! A channel starts `uninitialized` and, once synchronized, cycles through
//! `idle -> ready -> scheduled -> idle` for the rest of its life.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Protocol state of a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Uninitialized,
    Unsynchronized,
    Idle,
    Ready,
    Scheduled,
}

impl ChannelState {
    pub const ALL: [ChannelState; 5] = [
        ChannelState::Uninitialized,
        ChannelState::Unsynchronized,
        ChannelState::Idle,
        ChannelState::Ready,
        ChannelState::Scheduled,
    ];

    /// Wire name, as reported in `service.reportstate`
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Uninitialized => "uninitialized",
            ChannelState::Unsynchronized => "unsynchronized",
            ChannelState::Idle => "idle",
            ChannelState::Ready => "ready",
            ChannelState::Scheduled => "scheduled",
        }
    }

    /// Has the channel completed at least one clock synchronization?
    pub fn is_synchronized(self) -> bool {
        matches!(
            self,
            ChannelState::Idle | ChannelState::Ready | ChannelState::Scheduled
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown channel state '{s}'"))
    }
}
