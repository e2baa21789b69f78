//! syncsocket Transport - envelope plumbing between channels and a socket
//!
//! This crate provides:
//! - The outbound `EnvelopeSink` seam shared by every channel of a connection
//! - In-process mpsc sinks (envelopes or JSON text frames)
//! - An inbound loop decoding JSON text frames into envelopes
//!
//! Socket handling, reconnects and request correlation live outside.

pub mod sink;
pub mod json;

pub use sink::*;
pub use json::*;
