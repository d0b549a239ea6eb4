//! Nodium node service binary
//!
//! Wires the shared singletons together, starts the controller's
//! reconciliation loops and (optionally) the metrics endpoint, then
//! waits for ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use nodium::api::HttpApi;
use nodium::app::{metrics, Dispatcher};
use nodium::engine::{
    DefaultPolicyManager, MemoryInboundRegistry, MemoryOutboundRegistry, StatsRegistry,
};
use nodium::{Config, Controller, Limiter, Result, RuleManager};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set tracing subscriber");

    let config_path = args.config.unwrap_or_else(|| PathBuf::from("config.json"));
    let config = Config::load(&config_path)?;

    info!("Nodium v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))?;

    info!("Goodbye!");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let api = Arc::new(HttpApi::new(&config.api)?);
    let inbounds = Arc::new(MemoryInboundRegistry::new());
    let outbounds = Arc::new(MemoryOutboundRegistry::new());
    let stats = Arc::new(StatsRegistry::new());
    let limiter = Arc::new(Limiter::new());
    let rules = Arc::new(RuleManager::new());

    // The dispatcher shares the limiter and rule engine with the
    // controller; the embedding proxy engine drives it per connection.
    let _dispatcher = Arc::new(Dispatcher::new(
        outbounds.clone(),
        None,
        Arc::new(DefaultPolicyManager),
        stats.clone(),
        limiter.clone(),
        rules.clone(),
    ));

    let shutdown = CancellationToken::new();
    let metrics_task = match config
        .metrics_listen
        .as_deref()
        .map(|s| s.parse::<std::net::SocketAddr>())
    {
        Some(Ok(addr)) => {
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = metrics::serve_metrics(addr, token).await {
                    tracing::warn!("metrics server error: {}", e);
                }
            }))
        }
        Some(Err(e)) => {
            tracing::warn!("invalid metrics listen address: {}", e);
            None
        }
        None => None,
    };

    let controller = Arc::new(Controller::new(
        config, api, inbounds, outbounds, limiter, rules, stats, None,
    ));
    controller.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");

    controller.close().await;
    shutdown.cancel();
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self { config, version }
    }
}

fn print_help() {
    println!(
        r#"Nodium - control plane for a multi-tenant proxy node

USAGE:
    nodium [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file (default: config.json)
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    nodium -c config.json
    RUST_LOG=debug nodium -c config.json
"#
    );
}

fn print_version() {
    println!("Nodium v{}", env!("CARGO_PKG_VERSION"));
    println!("Control and data-plane glue for a multi-tenant proxy node");
}
