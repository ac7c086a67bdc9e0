//! Error types for the inference service.
//!
//! This module defines the central `Error` enum shared by the session
//! controller, the generation bridge, the registry client and the lifecycle
//! orchestration. It implements `From<Error>` for `tonic::Status` so failures
//! that end an RPC map onto appropriate gRPC codes.
//!
//! ## Error Cases
//! - `Assembly`: prompt templating failed. Recovered locally, never sent to
//!   clients.
//! - `Generation`: the engine failed while producing a turn. Reported in the
//!   `error` field of that turn's final chunk.
//! - `Registry`: a registration call failed. Logged only.
//! - `EngineLoad`: the generation engine could not be constructed.
//! - `ServiceShutdown`: the server is draining and refuses new sessions.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the inference service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Rendering the chat template failed.
    #[error("Prompt assembly failed: {reason}")]
    Assembly { reason: String },

    /// The engine raised while generating.
    #[error("Generation failed: {reason}")]
    Generation { reason: String },

    /// Registering with or deregistering from the service registry failed.
    #[error("Registry error: {reason}")]
    Registry { reason: String },

    /// The generation engine could not be loaded.
    #[error("Engine load failed: {reason}")]
    EngineLoad { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn generation(reason: impl Into<String>) -> Self {
        Self::Generation {
            reason: reason.into(),
        }
    }

    pub fn assembly(reason: impl Into<String>) -> Self {
        Self::Assembly {
            reason: reason.into(),
        }
    }

    pub fn registry(reason: impl Into<String>) -> Self {
        Self::Registry {
            reason: reason.into(),
        }
    }

    /// The message surfaced to clients in the `error` field of a final chunk.
    ///
    /// Generation errors carry the engine's own message verbatim.
    pub fn client_message(&self) -> String {
        match self {
            Self::Generation { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
            other => Status::internal(other.to_string()),
        }
    }
}
