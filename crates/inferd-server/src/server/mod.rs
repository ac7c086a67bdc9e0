//! Server internals.
//!
//! ## Modules
//!
//! - [`config`] - CLI/environment configuration and validation.
//! - [`engine`] - the text-generation engine seam and its implementations.
//! - [`gate`] - accelerator mutual exclusion.
//! - [`prompt`] - transcript to prompt assembly.
//! - [`streaming`] - generation bridge and session controller.
//! - [`pool`] - session admission and drain.
//! - [`service`] - the tonic service implementation.
//! - [`registry`] - service registry clients.
//! - [`lifecycle`] - start-up, serving and ordered shutdown.
//! - [`telemetry`] - logging, tracing and metrics.

pub mod config;
pub mod engine;
pub mod gate;
pub mod lifecycle;
pub mod pool;
pub mod prompt;
pub mod registry;
pub mod service;
pub mod streaming;
pub mod telemetry;
