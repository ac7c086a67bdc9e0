/// Builds the gRPC client and server code for the `inference.proto` definition
/// using `tonic-prost-build`.
///
/// Besides the message and service bindings, an encoded file descriptor set is
/// written to `OUT_DIR/inference_descriptor.bin` so the server can expose gRPC
/// reflection.
///
/// # Files and Paths
///
/// - Proto file: `proto/inference.proto`
/// - Includes: `proto/`
///
/// # Panics
///
/// Panics if `OUT_DIR` is missing or code generation fails; both abort the
/// build with the generator's diagnostics.
///
/// # Output
///
/// Generated code is accessible in Rust via:
///
/// ```rust
/// pub mod proto {
///     tonic::include_proto!("inference");
/// }
/// ```
use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("inference_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    println!("cargo:rerun-if-changed=proto/inference.proto");

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/inference.proto"], &["proto"])
        .unwrap();
}
