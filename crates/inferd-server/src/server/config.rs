use anyhow::{Context, bail};
use clap::{ArgAction, Parser};
use core::{num::NonZeroU32, time::Duration};
use inferd_core::types::GenerationParams;
use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

/// Runtime configuration for the `inferd-server` binary.
///
/// Every value can be given as a CLI flag or through the environment (a
/// `.env` file in the working directory is loaded first). Defaults target a
/// small Qwen model on a single accelerator.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "inferd-server",
    version,
    about = "A gRPC service streaming LLM completions over bidirectional sessions"
)]
pub struct CliArgs {
    /// Name used for health reporting and service registration.
    ///
    /// Environment variable: `SERVER_NAME`
    #[arg(long, env = "SERVER_NAME", default_value_t = String::from("llm-inference"))]
    pub server_name: String,

    /// Deployment environment tag, sent to the registry.
    ///
    /// Environment variable: `ENVIRONMENT`
    #[arg(long, env = "ENVIRONMENT", default_value_t = String::from("development"))]
    pub environment: String,

    /// Host to bind the gRPC listener on.
    ///
    /// Environment variable: `LISTEN_HOST`
    #[arg(long, env = "LISTEN_HOST", default_value_t = String::from("0.0.0.0"))]
    pub listen_host: String,

    /// Port to bind the gRPC listener on.
    ///
    /// Environment variable: `GRPC_PORT`
    #[arg(long, env = "GRPC_PORT", default_value_t = 8083)]
    pub grpc_port: u16,

    /// Model identifier, resolved under `MODEL_DIR` unless `MODEL_PATH` is
    /// set.
    ///
    /// Environment variable: `MODEL_NAME`
    #[arg(long, env = "MODEL_NAME", default_value_t = String::from("Qwen/Qwen3-0.6B"))]
    pub model_name: String,

    /// Directory holding downloaded models.
    ///
    /// Environment variable: `MODEL_DIR`
    #[arg(long, env = "MODEL_DIR", default_value = "model")]
    pub model_dir: PathBuf,

    /// Explicit model file. Takes precedence over `MODEL_DIR/MODEL_NAME`.
    ///
    /// Environment variable: `MODEL_PATH`
    #[arg(long, env = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Upper bound on generated tokens per turn.
    ///
    /// Environment variable: `MAX_TOKENS`
    #[arg(long, env = "MAX_TOKENS", default_value_t = 100)]
    pub max_tokens: u32,

    /// Sampling temperature. `0` selects greedy decoding.
    ///
    /// Environment variable: `TEMPERATURE`
    #[arg(long, env = "TEMPERATURE", default_value_t = 0.7)]
    pub temperature: f32,

    /// Penalty for repeating recent tokens. `1.0` disables it.
    ///
    /// Environment variable: `REPETITION_PENALTY`
    #[arg(long, env = "REPETITION_PENALTY", default_value_t = 1.05)]
    pub repetition_penalty: f32,

    /// Nucleus sampling mass.
    ///
    /// Environment variable: `TOP_P`
    #[arg(long, env = "TOP_P", default_value_t = 0.7)]
    pub top_p: f32,

    /// Candidates kept before nucleus sampling.
    ///
    /// Environment variable: `TOP_K`
    #[arg(long, env = "TOP_K", default_value_t = 40)]
    pub top_k: u32,

    /// Maximum number of concurrently open sessions.
    ///
    /// Sessions beyond this bound wait for a slot before their stream is
    /// accepted. Generation itself is always serialized on the accelerator.
    ///
    /// Environment variable: `MAX_WORKERS`
    #[arg(long, env = "MAX_WORKERS", default_value_t = 10)]
    pub max_workers: usize,

    /// Outbound chunks buffered per session before the session waits on the
    /// client.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 32)]
    pub stream_buffer_size: usize,

    /// Seconds in-flight sessions get to finish after a termination signal.
    ///
    /// Environment variable: `SHUTDOWN_GRACE_SECS`
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Address advertised to the registry. Detected from the outbound route
    /// when unset.
    ///
    /// Environment variable: `ADVERTISE_IP`
    #[arg(long, env = "ADVERTISE_IP")]
    pub advertise_ip: Option<IpAddr>,

    /// Consul agent `host:port`.
    ///
    /// Environment variable: `CONSUL_ADDRESS`
    #[arg(long, env = "CONSUL_ADDRESS", default_value_t = String::from("localhost:8500"))]
    pub consul_address: String,

    /// Skip service registration entirely.
    ///
    /// Environment variable: `DISABLE_REGISTRY`
    #[arg(long, env = "DISABLE_REGISTRY", default_value_t = false, action = ArgAction::Set)]
    pub disable_registry: bool,

    /// Close the whole session when a turn fails instead of only reporting
    /// the error on that turn's final chunk.
    ///
    /// Environment variable: `CLOSE_ON_GENERATION_ERROR`
    #[arg(long, env = "CLOSE_ON_GENERATION_ERROR", default_value_t = false, action = ArgAction::Set)]
    pub close_on_generation_error: bool,

    /// Count `generated_tokens` across the whole session instead of per turn.
    ///
    /// Environment variable: `CUMULATIVE_TOKEN_COUNT`
    #[arg(long, env = "CUMULATIVE_TOKEN_COUNT", default_value_t = false, action = ArgAction::Set)]
    pub cumulative_token_count: bool,

    /// Apply a positive per-request `temperature` to that request's turn.
    ///
    /// Environment variable: `HONOR_TEMPERATURE_OVERRIDE`
    #[arg(long, env = "HONOR_TEMPERATURE_OVERRIDE", default_value_t = true, action = ArgAction::Set)]
    pub honor_temperature_override: bool,

    /// Model layers offloaded to the accelerator.
    ///
    /// Environment variable: `GPU_LAYERS`
    #[arg(long, env = "GPU_LAYERS", default_value_t = 99)]
    pub gpu_layers: u32,

    /// Context window in tokens (prompt plus completion).
    ///
    /// Environment variable: `CONTEXT_SIZE`
    #[arg(long, env = "CONTEXT_SIZE", default_value_t = 4096)]
    pub context_size: u32,
}

/// Per-session behaviour knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub close_on_generation_error: bool,
    pub cumulative_token_count: bool,
    pub honor_temperature_override: bool,
    pub stream_buffer_size: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            close_on_generation_error: false,
            cumulative_token_count: false,
            honor_temperature_override: true,
            stream_buffer_size: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub name: String,
    pub path: PathBuf,
    pub gpu_layers: u32,
    pub context_size: NonZeroU32,
}

impl ModelConfig {
    /// Resolves the configured path to a single model file.
    ///
    /// A directory is searched (non-recursively) for a `.gguf` file; the
    /// lexicographically first match wins.
    pub fn resolve_file(&self) -> anyhow::Result<PathBuf> {
        if self.path.is_file() {
            return Ok(self.path.clone());
        }
        if !self.path.is_dir() {
            bail!("model path {} does not exist", self.path.display());
        }
        first_gguf(&self.path)?.with_context(|| {
            format!("no .gguf model file found in {}", self.path.display())
        })
    }
}

fn first_gguf(dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let mut candidates = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
        })
        .collect::<Vec<_>>();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub enabled: bool,
    pub consul_address: String,
    pub advertise_ip: Option<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_name: String,
    pub environment: String,
    pub server_addr: String,
    pub port: u16,
    pub model: ModelConfig,
    pub generation: GenerationParams,
    pub session: SessionPolicy,
    pub max_workers: usize,
    pub shutdown_grace: Duration,
    pub registry: RegistryConfig,
}

impl ServerConfig {
    /// A configuration with every default, listening on `addr`. Registry
    /// calls are disabled.
    pub fn for_addr(addr: std::net::SocketAddr) -> Self {
        Self {
            server_name: "llm-inference".to_string(),
            environment: "development".to_string(),
            server_addr: addr.to_string(),
            port: addr.port(),
            model: ModelConfig {
                name: "Qwen/Qwen3-0.6B".to_string(),
                path: PathBuf::from("model/Qwen/Qwen3-0.6B"),
                gpu_layers: 99,
                context_size: NonZeroU32::new(4096).unwrap_or(NonZeroU32::MIN),
            },
            generation: GenerationParams::default(),
            session: SessionPolicy::default(),
            max_workers: 10,
            shutdown_grace: Duration::from_secs(5),
            registry: RegistryConfig {
                enabled: false,
                consul_address: "localhost:8500".to_string(),
                advertise_ip: None,
            },
        }
    }

    fn from_valid(args: CliArgs) -> Self {
        let model_path = args
            .model_path
            .unwrap_or_else(|| args.model_dir.join(&args.model_name));

        Self {
            server_addr: format!("{}:{}", args.listen_host, args.grpc_port),
            port: args.grpc_port,
            server_name: args.server_name,
            environment: args.environment,
            model: ModelConfig {
                name: args.model_name,
                path: model_path,
                gpu_layers: args.gpu_layers,
                context_size: NonZeroU32::new(args.context_size).unwrap_or(NonZeroU32::MIN),
            },
            generation: GenerationParams {
                max_new_tokens: args.max_tokens,
                temperature: args.temperature,
                repetition_penalty: args.repetition_penalty,
                top_p: args.top_p,
                top_k: args.top_k,
            },
            session: SessionPolicy {
                close_on_generation_error: args.close_on_generation_error,
                cumulative_token_count: args.cumulative_token_count,
                honor_temperature_override: args.honor_temperature_override,
                stream_buffer_size: args.stream_buffer_size,
            },
            max_workers: args.max_workers,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            registry: RegistryConfig {
                enabled: !args.disable_registry,
                consul_address: args.consul_address,
                advertise_ip: args.advertise_ip,
            },
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_workers == 0 {
            bail!("MAX_WORKERS must be greater than 0");
        }

        if args.max_tokens == 0 {
            bail!("MAX_TOKENS must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.context_size == 0 {
            bail!("CONTEXT_SIZE must be greater than 0");
        }

        if !(args.temperature >= 0.0 && args.temperature.is_finite()) {
            bail!("TEMPERATURE ({}) must be a finite value >= 0", args.temperature);
        }

        if !(args.top_p > 0.0 && args.top_p <= 1.0) {
            bail!("TOP_P ({}) must be in (0, 1]", args.top_p);
        }

        if !(args.repetition_penalty > 0.0 && args.repetition_penalty.is_finite()) {
            bail!(
                "REPETITION_PENALTY ({}) must be a finite value > 0",
                args.repetition_penalty
            );
        }

        if args.server_name.trim().is_empty() {
            bail!("SERVER_NAME must not be empty");
        }

        Ok(Self::from_valid(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, FromArgMatches};

    /// The CLI with every `env` fallback removed, so the host environment
    /// cannot leak into assertions.
    fn command() -> clap::Command {
        CliArgs::command().mut_args(|arg| arg.env(None::<&'static str>))
    }

    fn parse(extra: &[&str]) -> anyhow::Result<ServerConfig> {
        let mut argv = vec!["inferd-server"];
        argv.extend_from_slice(extra);
        let matches = command().try_get_matches_from(argv)?;
        ServerConfig::try_from(CliArgs::from_arg_matches(&matches)?)
    }

    #[test]
    fn env_fallbacks_are_stripped_for_tests() {
        assert!(command().get_arguments().all(|arg| arg.get_env().is_none()));
        assert!(
            CliArgs::command()
                .get_arguments()
                .any(|arg| arg.get_id() == "max_workers" && arg.get_env().is_some())
        );
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&["--model-path", "/models/qwen.gguf"]).unwrap();

        assert_eq!(config.server_addr, "0.0.0.0:8083");
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.generation, GenerationParams::default());
        assert_eq!(config.session, SessionPolicy::default());
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.model.path, PathBuf::from("/models/qwen.gguf"));
        assert!(config.registry.enabled);
    }

    #[test]
    fn model_path_defaults_to_dir_and_name() {
        let config = parse(&["--model-dir", "/srv/models", "--model-name", "qwen"]).unwrap();
        assert_eq!(config.model.path, PathBuf::from("/srv/models/qwen"));
    }

    #[test]
    fn policy_flags_take_explicit_values() {
        let config = parse(&[
            "--honor-temperature-override",
            "false",
            "--cumulative-token-count",
            "true",
            "--disable-registry",
            "true",
        ])
        .unwrap();

        assert!(!config.session.honor_temperature_override);
        assert!(config.session.cumulative_token_count);
        assert!(!config.registry.enabled);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse(&["--max-workers", "0"]).is_err());
        assert!(parse(&["--max-tokens", "0"]).is_err());
        assert!(parse(&["--stream-buffer-size", "0"]).is_err());
        assert!(parse(&["--top-p", "0"]).is_err());
        assert!(parse(&["--top-p", "1.5"]).is_err());
        assert!(parse(&["--temperature=-0.1"]).is_err());
        assert!(parse(&["--repetition-penalty", "0"]).is_err());
    }

    #[test]
    fn for_addr_disables_registry() {
        let config = ServerConfig::for_addr("127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.server_addr, "127.0.0.1:9000");
        assert!(!config.registry.enabled);
    }

    #[test]
    fn resolves_gguf_inside_directory() {
        let dir = std::env::temp_dir().join(format!("inferd-model-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b.gguf"), b"").unwrap();
        std::fs::write(dir.join("a.GGUF"), b"").unwrap();
        std::fs::write(dir.join("readme.md"), b"").unwrap();

        let model = ModelConfig {
            name: "m".into(),
            path: dir.clone(),
            gpu_layers: 0,
            context_size: NonZeroU32::MIN,
        };
        assert_eq!(model.resolve_file().unwrap(), dir.join("a.GGUF"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
