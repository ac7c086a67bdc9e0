//! Per-session streaming.
//!
//! - [`bridge`] - blocking engine call to async token stream.
//! - [`session`] - the per-RPC turn loop.

pub mod bridge;
pub mod session;
