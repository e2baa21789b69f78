//! Channel notifications
//!
//! A closed set of typed notifications, delivered synchronously to every
//! registered observer in registration order.

use std::fmt;

use serde_json::Value;

use crate::{ChannelState, SyncResult};

/// Observable channel event
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// The channel completed a transition
    Transition { from: ChannelState, to: ChannelState },
    /// A clock sync succeeded and its result is now cached
    SyncSuccessful { adjust: f64, error: f64 },
    /// A clock sync attempt failed
    SyncFailed {
        error: f64,
        attempt: u32,
        will_retry: bool,
    },
    /// The server pushed the channel's initial state
    InitialState { data: Value },
    /// Recoverable, caller-facing error
    Error { reason: String },
}

impl Notification {
    pub fn sync_successful(result: &SyncResult) -> Self {
        Notification::SyncSuccessful {
            adjust: result.adjust,
            error: result.error,
        }
    }

    /// Stable name of this notification kind
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Transition { .. } => "transition",
            Notification::SyncSuccessful { .. } => "syncSuccessful",
            Notification::SyncFailed { .. } => "syncFailed",
            Notification::InitialState { .. } => "initialState",
            Notification::Error { .. } => "error",
        }
    }
}

/// Observer callback
pub type Observer = Box<dyn Fn(&Notification) + Send>;

/// Registered observers of one channel
#[derive(Default)]
pub struct NotificationHub {
    observers: Vec<Observer>,
}

impl NotificationHub {
    pub fn new() -> Self {
        NotificationHub {
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: Observer) {
        self.observers.push(observer);
    }

    pub fn emit(&self, notification: Notification) {
        for observer in &self.observers {
            observer(&notification);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationHub")
            .field("observers", &self.observers.len())
            .finish()
    }
}
