use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use drover_config::{ConfigLoader, DroverConfig};
use drover_core::Event;
use drover_device::{DaemonClient, DeviceControl};
use drover_guard::ArtifactSweeper;
use drover_queue::{QueueClient, TaskQueue};
use drover_runtime::{FleetContext, HeartbeatService, TaskRunner, run_dispatch_bridge};
use drover_server::AppState;
use drover_tunnel::{Tunnel, TunnelSettings};

/// drover — local orchestration node for distributed device fleets.
#[derive(Parser)]
#[command(name = "drover", version, about)]
pub struct Cli {
    /// Path to drover.toml (default: ~/.drover/drover.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node: tunnel, heartbeat loop, task runner, status server.
    Start {
        /// Skip the HTTP status server.
        #[arg(long)]
        no_server: bool,
    },
    /// Query a running node's status API.
    Status,
    /// Print the resolved configuration.
    Config {
        /// Emit JSON instead of TOML.
        #[arg(long)]
        json: bool,
    },
    /// Print the version.
    Version,
}

impl Cli {
    pub async fn run(self) -> drover_core::Result<()> {
        let loader = ConfigLoader::load(self.config.as_deref())?;
        let config = loader.get();

        let log_level = config.logging.level.clone();
        if config.logging.format == "json" {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
                )
                .json()
                .with_target(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
                )
                .with_target(false)
                .init();
        }

        match self.command {
            Commands::Start { no_server } => cmd_start(config, no_server, loader).await,
            Commands::Status => cmd_status(config).await,
            Commands::Config { json } => cmd_config(config, json),
            Commands::Version => {
                println!("drover {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

async fn cmd_start(
    config: DroverConfig,
    no_server: bool,
    loader: ConfigLoader,
) -> drover_core::Result<()> {
    info!(node = %config.node.id, "drover node starting");

    let daemon: Arc<dyn DeviceControl> = Arc::new(DaemonClient::new(
        &config.daemon.base_url,
        config.daemon.request_timeout(),
    )?);
    let queue: Arc<dyn TaskQueue> = Arc::new(QueueClient::new(
        &config.queue.base_url,
        config.queue.api_key.clone(),
        config.queue.request_timeout(),
    )?);
    let ctx = FleetContext::new(config.clone(), daemon, queue);

    // Keep the watcher alive for the lifetime of the node so config
    // edits (peak hours, log level) hot-reload.
    let _watcher = loader.watch().ok();

    let tunnel_handle = if config.tunnel.enabled {
        let tunnel = Tunnel::new(
            TunnelSettings {
                url: config.tunnel.url.clone(),
                reconnect_max_delay: config.tunnel.reconnect_max_delay(),
                outbound_buffer: config.tunnel.outbound_buffer,
            },
            config.node.id.clone(),
            ctx.events.clone(),
        );
        let (handle, inbound) = tunnel.start();
        tokio::spawn(run_dispatch_bridge(ctx.events.clone(), inbound));
        Some(handle)
    } else {
        info!("tunnel disabled");
        None
    };

    let heartbeat = HeartbeatService::new(Arc::clone(&ctx), tunnel_handle);
    let stats = heartbeat.stats();
    tokio::spawn(Arc::clone(&heartbeat).run());

    let runner = TaskRunner::new(Arc::clone(&ctx));
    tokio::spawn(runner.run());

    let sweeper = Arc::new(ArtifactSweeper::new(
        config.retention.artifact_dir.clone(),
        config.retention.max_artifacts,
    ));
    tokio::spawn(Arc::clone(&sweeper).run(config.retention.sweep_interval()));

    if !no_server {
        let app_state = Arc::new(AppState {
            ctx: Arc::clone(&ctx),
            stats,
            started_at: Instant::now(),
        });
        let listen = config.server.listen.clone();
        let cors = config.server.cors;
        tokio::spawn(async move {
            if let Err(e) = drover_server::serve(app_state, &listen, cors).await {
                error!(error = %e, "status server failed");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    ctx.events.publish(Event::Shutdown);
    // Give the loops a beat to observe the event before the process exits.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

async fn cmd_status(config: DroverConfig) -> drover_core::Result<()> {
    let url = format!("http://{}/api/v1/status", config.server.listen);
    let response = reqwest::get(&url).await.map_err(|e| {
        drover_core::DroverError::Other(anyhow::anyhow!(
            "could not reach {url}: {e} — is the node running?"
        ))
    })?;
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| drover_core::DroverError::Other(anyhow::anyhow!("bad status payload: {e}")))?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn cmd_config(config: DroverConfig, json: bool) -> drover_core::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        let rendered = toml::to_string_pretty(&config)
            .map_err(|e| drover_core::DroverError::Config(e.to_string()))?;
        println!("{rendered}");
    }
    Ok(())
}
