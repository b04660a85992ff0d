//! HTTP-aware TCP Reverse Proxy
//!
//! A single-threaded, readiness-driven reverse proxy that multiplexes many
//! client connections over a fixed-size pool of upstream connections.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────┐
//!                       │                 REVERSE PROXY                 │
//!                       │                                               │
//!   Client Request      │  ┌──────────┐   ┌───────────┐   ┌─────────┐  │
//!   ────────────────────┼─▶│ listener │──▶│  reactor  │──▶│ message │  │
//!                       │  └──────────┘   │  (poll)   │   │assembler│  │
//!                       │                 └─────┬─────┘   └────┬────┘  │
//!                       │                       │              │       │
//!                       │                 ┌─────▼─────┐   ┌────▼────┐  │     Upstream
//!   Client Response     │                 │ registry  │   │upstream │──┼───▶ Target
//!   ◀───────────────────┼─────────────────│ (mappings)│   │  pool   │  │
//!                       │                 └───────────┘   └─────────┘  │
//!                       │                                               │
//!                       │  ┌─────────────────────────────────────────┐ │
//!                       │  │   config        observability (logs)    │ │
//!                       │  └─────────────────────────────────────────┘ │
//!                       └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use relay_proxy::config::{self, AdmissionPolicy, ProxyConfig};
use relay_proxy::observability;
use relay_proxy::Reactor;

#[derive(Parser)]
#[command(name = "relay-proxy")]
#[command(about = "HTTP-aware TCP reverse proxy with a fixed upstream pool", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8000 (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Upstream target address, e.g. 127.0.0.1:9000 (overrides config).
    #[arg(long)]
    upstream: Option<String>,

    /// Number of pooled upstream connections (overrides config).
    #[arg(long)]
    pool_size: Option<usize>,

    /// What to do with new clients when the pool is exhausted.
    #[arg(long, value_enum)]
    admission: Option<AdmissionArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AdmissionArg {
    /// Close the new client immediately.
    Reject,
    /// Hold the client until an upstream slot frees up.
    Queue,
}

impl From<AdmissionArg> for AdmissionPolicy {
    fn from(arg: AdmissionArg) -> Self {
        match arg {
            AdmissionArg::Reject => AdmissionPolicy::Reject,
            AdmissionArg::Queue => AdmissionPolicy::Queue,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match config::load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => ProxyConfig::default(),
    };

    // CLI flags win over file values.
    if let Some(listen) = cli.listen {
        config.listener.bind_address = listen;
    }
    if let Some(upstream) = cli.upstream {
        config.upstream.address = upstream;
    }
    if let Some(pool_size) = cli.pool_size {
        config.upstream.pool_size = pool_size;
    }
    if let Some(admission) = cli.admission {
        config.upstream.admission = admission.into();
    }

    observability::logging::init(&config.observability.log_filter);

    tracing::info!(
        listen = %config.listener.bind_address,
        upstream = %config.upstream.address,
        pool_size = config.upstream.pool_size,
        admission = ?config.upstream.admission,
        "configuration loaded"
    );

    if let Err(errors) = config::validation::validate_config(&config) {
        for error in &errors {
            tracing::error!(%error, "invalid configuration");
        }
        return ExitCode::FAILURE;
    }

    // Startup failures (bind, pool establishment) are fatal before serving.
    let mut reactor = match Reactor::new(&config) {
        Ok(reactor) => reactor,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    reactor.run();
    ExitCode::SUCCESS
}
