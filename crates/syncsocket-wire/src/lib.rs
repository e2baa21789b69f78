//! syncsocket Wire - Envelope format and topic grammar
//!
//! Envelope = channel id + dot-delimited topic + JSON payload + optional headers
//!
//! Topic grammar (case-sensitive):
//! - `user.<appTopic>` (outbound publish)
//! - `user.<appTopic>.prepare` / `user.<appTopic>.schedule` (inbound control)
//! - `service.<operation>`

pub mod topic;
pub mod envelope;

pub use topic::*;
pub use envelope::*;
