//! Shared protocol bindings, errors and generation types.
//!
//! ## Submodules
//!
//! - [`error`] - Centralized service error type and its gRPC mapping.
//! - [`types`] - Sampling parameters and chat turn definitions.
//! - [`proto`] - Generated Protobuf service and message definitions.

pub mod error;
pub mod types;

pub use error::{Error, Result};

/// gRPC service and message definitions generated from
/// `proto/inference.proto`.
///
/// ## Service
///
/// - `StreamInference` - bidirectional stream of [`proto::InferenceRequest`]
///   fragments in and [`proto::InferenceResponse`] chunks out.
///
/// ## Invariants
///
/// - Every processed turn ends with exactly one chunk where `is_finished` is
///   set.
/// - `error` is only non-empty on a finished chunk.
pub mod proto {
    tonic::include_proto!("inference");

    /// Encoded descriptor set for server reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("inference_descriptor");

    impl InferenceResponse {
        /// A partial chunk carrying generated text.
        pub fn partial(chunk: impl Into<String>, generated_tokens: i32) -> Self {
            Self {
                chunk: chunk.into(),
                is_finished: false,
                error: String::new(),
                generated_tokens,
            }
        }

        /// The closing chunk of a turn that completed without error.
        pub fn finished(generated_tokens: i32) -> Self {
            Self {
                chunk: String::new(),
                is_finished: true,
                error: String::new(),
                generated_tokens,
            }
        }

        /// The closing chunk of a turn that failed.
        pub fn failed(error: impl Into<String>, generated_tokens: i32) -> Self {
            Self {
                chunk: String::new(),
                is_finished: true,
                error: error.into(),
                generated_tokens,
            }
        }
    }
}
