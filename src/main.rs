//! Resilient gateway CLI.
//!
//! ```text
//!   gateway --config gateway.toml run        background tasks + hot reload
//!   gateway --config gateway.toml detect     probe AI endpoints once
//!   gateway --config gateway.toml invoke '{"prompt":"hi"}'
//!   gateway --config gateway.toml get|set|delete <key> [value]
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use resilient_gateway::config::watcher::ConfigWatcher;
use resilient_gateway::config::{load_config, GatewayConfig};
use resilient_gateway::lifecycle::{SignalAction, Signals};
use resilient_gateway::observability::{logging, metrics};
use resilient_gateway::{
    CallContext, EndpointId, Gateway, GatewayError, InvokeRequest, RoutingPreference, Shutdown,
};

/// Tasks get this long to drain after shutdown is triggered.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Resilient gateway to external AI and storage services", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Per-call timeout for one-shot commands, in milliseconds.
    #[arg(long, global = true, default_value_t = 30_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until SIGINT/SIGTERM; SIGHUP reloads the config
    Run {
        /// Seconds between health summaries in the log
        #[arg(long, default_value_t = 30)]
        health_interval: u64,
    },
    /// Probe every AI endpoint and print capability
    Detect,
    /// Print a health snapshot as JSON
    Health,
    /// Send a JSON payload to the best available AI endpoint
    Invoke {
        payload: String,
        /// Only use the secondary AI endpoint
        #[arg(long)]
        force_secondary: bool,
    },
    /// Read a key from hybrid storage
    Get { key: String },
    /// Write a key to hybrid storage
    Set {
        key: String,
        value: String,
        /// Expiry in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Delete a key from hybrid storage
    Delete { key: String },
    /// Close an endpoint's breaker and forget its cached capability
    Reset { endpoint: String },
}

fn read_config(path: Option<&Path>) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(load_config(path)?),
        None => Ok(GatewayConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = read_config(cli.config.as_deref())?;
    logging::init_logging(&config.observability);

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let gateway = Arc::new(Gateway::new(config)?);
    let ctx = || CallContext::with_timeout(Duration::from_millis(cli.timeout_ms));

    match cli.command {
        Commands::Run { health_interval } => {
            run(gateway, cli.config, Duration::from_secs(health_interval.max(1))).await?;
        }
        Commands::Detect => {
            let results = gateway.detect_all(&ctx()).await;
            gateway.persist_capabilities().await;
            let mut results: Vec<_> = results.into_iter().collect();
            results.sort();
            for (endpoint, available) in results {
                println!("{endpoint}\t{}", if available { "available" } else { "unavailable" });
            }
        }
        Commands::Health => {
            println!("{}", serde_json::to_string_pretty(&gateway.health_snapshot())?);
        }
        Commands::Invoke {
            payload,
            force_secondary,
        } => {
            let mut request = InvokeRequest::new(serde_json::from_str(&payload)?);
            if force_secondary {
                request = request.with_preference(RoutingPreference::ForceSecondary);
            }
            let invocation = gateway.invoke_with(&ctx(), &request).await?;
            gateway.persist_capabilities().await;
            eprintln!(
                "endpoint={} status={} request_id={}",
                invocation.endpoint, invocation.response.status, invocation.request_id
            );
            println!("{}", String::from_utf8_lossy(&invocation.response.body));
        }
        Commands::Get { key } => match gateway.get(&ctx(), &key).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => {
                eprintln!("key not found: {key}");
                std::process::exit(1);
            }
        },
        Commands::Set { key, value, ttl } => {
            gateway
                .set(&ctx(), &key, value, ttl.map(Duration::from_secs))
                .await?;
        }
        Commands::Delete { key } => {
            gateway.delete(&ctx(), &key).await?;
        }
        Commands::Reset { endpoint } => {
            if !gateway.reset_endpoint(&EndpointId::new(&endpoint)) {
                eprintln!("unknown endpoint: {endpoint}");
                std::process::exit(1);
            }
            gateway.persist_capabilities().await;
        }
    }

    Ok(())
}

async fn run(
    gateway: Arc<Gateway>,
    config_path: Option<PathBuf>,
    health_interval: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("resilient-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    let shutdown = Shutdown::new();
    let handles = gateway.start(&shutdown);

    // Warm the capability cache before serving health summaries.
    let initial = gateway.detect_all(&shutdown.context()).await;
    tracing::info!(endpoints = initial.len(), "Initial capability detection finished");

    // The watcher must outlive the run loop for events to keep flowing.
    let (_watcher, reloader) = match &config_path {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            let gateway = gateway.clone();
            let reloader = tokio::spawn(async move {
                while let Some(config) = updates.recv().await {
                    if let Err(e) = gateway.reload(config) {
                        tracing::error!(error = %e, "Rejected reloaded configuration");
                    }
                }
            });
            (Some(watcher), Some(reloader))
        }
        None => (None, None),
    };

    let mut signals = Signals::new()?;
    let mut ticker = tokio::time::interval(health_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            action = signals.recv() => match action {
                SignalAction::Shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                SignalAction::Reload => {
                    let Some(path) = &config_path else {
                        tracing::warn!("SIGHUP received but no config file was given");
                        continue;
                    };
                    let reloaded = load_config(path)
                        .map_err(GatewayError::from)
                        .and_then(|config| gateway.reload(config));
                    if let Err(e) = reloaded {
                        tracing::error!(error = %e, "Config reload failed, keeping current configuration");
                    }
                }
            },
            _ = ticker.tick() => {
                let health = gateway.health_snapshot();
                for endpoint in &health.endpoints {
                    tracing::info!(
                        endpoint = %endpoint.endpoint,
                        state = %endpoint.state,
                        available = ?endpoint.available,
                        pool_in_use = endpoint.pool.in_use,
                        "Endpoint health"
                    );
                }
                for store in &health.storage {
                    tracing::info!(
                        tier = ?store.tier,
                        driver = %store.driver,
                        healthy = store.healthy,
                        "Storage health"
                    );
                }
            }
        }
    }

    shutdown.trigger();
    gateway.close();
    if let Some(reloader) = reloader {
        reloader.abort();
    }

    let drain = futures_util::future::join_all(handles);
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Background tasks did not stop in time");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
