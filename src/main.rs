use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{LogFormat, LoggingConfig, RatewardenConfig, StoreBackend};
use ratewarden::ratelimit::{RateLimitStatus, RateLimiter, TracingSink};

/// Exit code reported by `check` when the last request was denied.
const EXIT_DENIED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about = "Inspect and exercise distributed rate limits")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Service configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Rate limit rules file (YAML), overrides the configured path
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    /// Counter store backend, overrides the configured backend
    #[arg(long, value_enum, global = true)]
    store: Option<StoreArg>,

    /// Redis URL, overrides the configured URL
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the admit decision, counting admitted requests
    Check {
        request_type: String,
        identifier: String,
        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
    /// Show the request count in the current window
    Count { request_type: String, identifier: String },
    /// Show seconds until the current window resets
    Ttl { request_type: String, identifier: String },
    /// Discard the counter
    Reset { request_type: String, identifier: String },
    /// Show count, quota and reset time together
    Status { request_type: String, identifier: String },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Check { .. } => "check",
            Commands::Count { .. } => "count",
            Commands::Ttl { .. } => "ttl",
            Commands::Reset { .. } => "reset",
            Commands::Status { .. } => "status",
        }
    }

    /// Whether the command only reads or clears counters left by others.
    fn inspects_existing_counters(&self) -> bool {
        !matches!(self, Commands::Check { .. })
    }
}

/// Refuse introspection against a store this process just created.
fn ensure_backend_supports(command: &Commands, backend: StoreBackend) -> anyhow::Result<()> {
    if backend == StoreBackend::Memory && command.inspects_existing_counters() {
        bail!(
            "'{}' needs a shared counter store; the memory store starts empty in every process (use --store redis)",
            command.name()
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreArg {
    Memory,
    Redis,
}

impl From<StoreArg> for StoreBackend {
    fn from(arg: StoreArg) -> Self {
        match arg {
            StoreArg::Memory => StoreBackend::Memory,
            StoreArg::Redis => StoreBackend::Redis,
        }
    }
}

#[derive(Serialize)]
struct CheckReport<'a> {
    request_type: &'a str,
    identifier: &'a str,
    request: u32,
    allowed: bool,
}

#[derive(Serialize)]
struct StatusReport {
    #[serde(flatten)]
    status: RateLimitStatus,
    resets_at: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = RatewardenConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(rules) = &cli.rules {
        config.rate_limiting.rules_path = Some(rules.display().to_string());
    }
    if let Some(store) = cli.store {
        config.store.backend = store.into();
    }
    if let Some(url) = &cli.redis_url {
        config.store.url = url.clone();
    }

    init_tracing(&config.logging)?;
    debug!(version = env!("CARGO_PKG_VERSION"), "Starting ratewarden");
    ensure_backend_supports(&cli.command, config.store.backend)?;

    let rules = config
        .rate_limiting
        .load_rules()
        .context("failed to load rate limit rules")?;
    info!(
        request_types = rules.request_types.len(),
        strategy = ?rules.strategy,
        "Rate limit rules loaded"
    );

    let store = ratewarden::store::connect(&config.store)
        .await
        .context("failed to open counter store")?;
    let limiter = RateLimiter::new(store, Some(Arc::new(TracingSink)), rules);

    run(&limiter, cli.command, cli.json).await
}

async fn run(limiter: &RateLimiter, command: Commands, json: bool) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Check {
            request_type,
            identifier,
            times,
        } => {
            let mut allowed = true;
            for request in 1..=times.max(1) {
                allowed = limiter.is_allowed(&request_type, &identifier).await;
                if json {
                    let report = CheckReport {
                        request_type: &request_type,
                        identifier: &identifier,
                        request,
                        allowed,
                    };
                    println!("{}", serde_json::to_string(&report)?);
                } else {
                    println!(
                        "request {}: {}",
                        request,
                        if allowed { "allowed" } else { "denied" }
                    );
                }
            }
            if allowed {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_DENIED))
            }
        }
        Commands::Count {
            request_type,
            identifier,
        } => {
            let count = limiter.get_current_count(&request_type, &identifier).await?;
            print_value(json, "current_count", count)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ttl {
            request_type,
            identifier,
        } => {
            let ttl = limiter
                .get_time_until_reset(&request_type, &identifier)
                .await?;
            print_value(json, "reset_after_seconds", ttl)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reset {
            request_type,
            identifier,
        } => {
            let removed = limiter.reset(&request_type, &identifier).await?;
            print_value(json, "removed", removed)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status {
            request_type,
            identifier,
        } => {
            let status = limiter.status(&request_type, &identifier).await?;
            print_status(json, status)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_value<T: Serialize + std::fmt::Display>(json: bool, name: &str, value: T) -> anyhow::Result<()> {
    if json {
        let mut object = serde_json::Map::new();
        object.insert(name.to_string(), serde_json::to_value(value)?);
        println!("{}", serde_json::Value::Object(object));
    } else {
        println!("{}", value);
    }
    Ok(())
}

fn print_status(json: bool, status: RateLimitStatus) -> anyhow::Result<()> {
    let resets_at = (status.reset_after_seconds > 0).then(|| {
        let seconds = i64::try_from(status.reset_after_seconds).unwrap_or(i64::MAX);
        (chrono::Utc::now() + chrono::Duration::seconds(seconds)).to_rfc3339()
    });

    if json {
        let report = StatusReport { status, resets_at };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("request type:  {}", status.request_type);
    println!("identifier:    {}", status.identifier);
    println!("count:         {}/{}", status.current_count, status.max_requests);
    println!("window:        {}s", status.window_seconds);
    println!("remaining:     {}", status.remaining);
    match resets_at {
        Some(at) => println!("resets in:     {}s ({})", status.reset_after_seconds, at),
        None => println!("resets in:     no active window"),
    }
    Ok(())
}

/// Initialize tracing; `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .map_err(|e| anyhow!("Invalid log level '{}': {}", logging.level, e))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_introspection_refused_on_memory_store() {
        for command in ["count", "ttl", "reset", "status"] {
            let cli = parse(&["ratewarden", command, "api", "u1", "--store", "memory"]);
            let err = ensure_backend_supports(&cli.command, StoreBackend::Memory).unwrap_err();
            assert!(err.to_string().contains(command));
            assert!(err.to_string().contains("--store redis"));
        }
    }

    #[test]
    fn test_introspection_allowed_on_redis_store() {
        for command in ["count", "ttl", "reset", "status"] {
            let cli = parse(&["ratewarden", command, "api", "u1"]);
            assert!(ensure_backend_supports(&cli.command, StoreBackend::Redis).is_ok());
        }
    }

    #[test]
    fn test_check_runs_on_any_store() {
        let cli = parse(&["ratewarden", "check", "api", "u1", "--times", "5"]);
        assert!(ensure_backend_supports(&cli.command, StoreBackend::Memory).is_ok());
        assert!(ensure_backend_supports(&cli.command, StoreBackend::Redis).is_ok());
    }
}
