//! syncsocket Test Harness - simulation and end-to-end validation
//!
//! This crate provides:
//! - Recording sinks, scripted clock-offset providers and envelope builders
//! - A wall clock that follows tokio's (pausable) time
//! - A multi-client fire-spread simulator with skewed, drifting clocks
//! - End-to-end integration tests over the connection facade

pub mod harness;
pub mod simulator;
pub mod integration;

pub use harness::*;
pub use simulator::*;
pub use integration::*;
