//! syncsocket Time - local clocks and remote fire-time translation
//!
//! This crate provides:
//! - Wall clocks (system and manually driven)
//! - The clock-offset provider seam bound to a timeserver
//! - Fire planning: remote timeticket + offset -> local timer delay

pub mod clock;
pub mod offset;
pub mod schedule;

pub use clock::*;
pub use offset::*;
pub use schedule::*;
