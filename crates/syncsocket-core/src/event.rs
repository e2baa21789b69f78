//! Protocol events
//!
//! Events drive the channel state machine. Most arrive from the server as
//! envelopes; `finalize` is raised locally by the fire timer and `cancel` by
//! the application.

use std::fmt;

use crate::{ChannelState, StateMachine, TransitionTable};

/// Event accepted by the channel state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolEvent {
    Initialize,
    Synchronize,
    Cancel,
    Prepare,
    Schedule,
    Finalize,
}

impl ProtocolEvent {
    pub const ALL: [ProtocolEvent; 6] = [
        ProtocolEvent::Initialize,
        ProtocolEvent::Synchronize,
        ProtocolEvent::Cancel,
        ProtocolEvent::Prepare,
        ProtocolEvent::Schedule,
        ProtocolEvent::Finalize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolEvent::Initialize => "initialize",
            ProtocolEvent::Synchronize => "synchronize",
            ProtocolEvent::Cancel => "cancel",
            ProtocolEvent::Prepare => "prepare",
            ProtocolEvent::Schedule => "schedule",
            ProtocolEvent::Finalize => "finalize",
        }
    }
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel state machine type
pub type ChannelMachine = StateMachine<ChannelState, ProtocolEvent>;

/// The fixed transition table of every channel
pub fn protocol_table() -> TransitionTable<ChannelState, ProtocolEvent> {
    use ChannelState::*;

    TransitionTable::new()
        .with(ProtocolEvent::Initialize, &[Uninitialized], Unsynchronized)
        .with(
            ProtocolEvent::Synchronize,
            &[Unsynchronized, Idle, Ready, Scheduled],
            Idle,
        )
        .with(ProtocolEvent::Cancel, &[Ready, Scheduled], Idle)
        .with(ProtocolEvent::Prepare, &[Idle], Ready)
        .with(ProtocolEvent::Schedule, &[Ready], Scheduled)
        .with(ProtocolEvent::Finalize, &[Scheduled], Idle)
}

/// A fresh channel state machine in `uninitialized`
pub fn channel_machine() -> ChannelMachine {
    StateMachine::new(protocol_table(), ChannelState::Uninitialized)
}
