#![forbid(unsafe_code)]

// roomcast - SFU signaling and session-coordination server

pub mod error;
pub mod media;
pub mod metrics;
pub mod registry;
pub mod room;
pub mod signaling;
