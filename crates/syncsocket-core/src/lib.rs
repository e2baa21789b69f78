//! syncsocket Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout the syncsocket client:
//! - Identifiers (ChannelId, TimeserverId)
//! - Channel states and protocol events
//! - The deferrable state machine engine
//! - Clock-offset measurements and remote/local time
//! - Typed channel notifications

pub mod id;
pub mod time;
pub mod state;
pub mod event;
pub mod fsm;
pub mod notification;
pub mod error;

pub use id::*;
pub use time::*;
pub use state::*;
pub use event::*;
pub use fsm::*;
pub use notification::*;
pub use error::*;
