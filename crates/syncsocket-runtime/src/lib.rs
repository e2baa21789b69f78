//! syncsocket Runtime - channel protocol engine and its drivers
//!
//! Inbound envelope -> [`Connection::dispatch`] -> channel task ->
//! [`ChannelEngine::inject_message`] -> state machine -> effects (reports,
//! clock syncs, fire timers) executed by the channel task.
//!
//! The engine is synchronous and performs no I/O. A [`Channel`] owns one
//! engine inside one tokio task, which is the channel's single thread of
//! control.

pub mod config;
pub mod registry;
pub mod engine;
pub mod channel;
pub mod connection;

pub use config::*;
pub use registry::*;
pub use engine::*;
pub use channel::*;
pub use connection::*;
