//! jamcore – activity execution engine for an edge/fog/cloud runtime
//!
//! This crate implements the part of a tiered distributed runtime that moves
//! activity invocations between tiers:
//! - Pooled activity table with a fixed number of live instances
//! - Compact command protocol for requests and replies
//! - Synchronous and asynchronous remote-execution runners with timeouts,
//!   lease-based result pulls and partial-reply aggregation
//! - Lock-free SPSC queues between activities and the I/O layer
//! - Inbound dispatcher and outbound pump over a pluggable transport

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core modules
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{Runtime, RuntimeConfig};

/// Current version of jamcore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the command wire protocol
pub const PROTOCOL_VERSION: &str = "1.0.0";
