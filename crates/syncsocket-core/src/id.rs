//! Identity types for syncsocket
//!
//! Channels and timeservers are named by server-assigned strings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved channel carrying connection-level system messages
pub const SYSTEM_CHANNEL: &str = "_SYSTEM";

/// Channel identity - unique per connection
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        ChannelId(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Is this the connection-level `_SYSTEM` channel?
    #[inline]
    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_CHANNEL
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        ChannelId(id.to_owned())
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        ChannelId(id)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Timeserver identity handed out by the server on `initialize`
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeserverId(String);

impl TimeserverId {
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        TimeserverId(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TimeserverId {
    fn from(id: &str) -> Self {
        TimeserverId(id.to_owned())
    }
}

impl fmt::Debug for TimeserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timeserver({})", self.0)
    }
}

impl fmt::Display for TimeserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
