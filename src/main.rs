//! Metron Binary Entry Point
//!
//! Runs the agent loop, the optional push pipeline and the scrape server.
//! Core functionality is provided by the `metron` library crate.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use metron::{
    Agent, CollectionScheduler, CollectorRegistry, PushPipeline, SelfMetrics,
    collector::host::{self, HostProbe},
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    exporter::prometheus,
    pipeline::http::HttpPushClient,
    server::{AppState, create_router},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Metron - metrics collection agent
#[derive(Parser, Debug)]
#[command(name = "metron", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "METRON_CONFIG")]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "METRON_BIND")]
    bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "METRON_PORT")]
    port: Option<u16>,

    /// Run one collection cycle, print exposition text and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,metron=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tracing::info!(path = %cli.config, "Loading configuration");
    let mut config = AppConfig::load(&cli.config)?;

    // CLI > ENV > config file
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate()?;

    let cancel = CancellationToken::new();
    let metrics = Arc::new(SelfMetrics::new());

    let probe = HostProbe::detect();
    tracing::info!(probe = ?probe, collectors = config.collectors.enabled_count(), "Host probe selected");
    let registry = Arc::new(
        CollectorRegistry::new()
            .with_module(host::host_module(probe, &config.collectors.to_host_options()))?,
    );

    let scheduler = CollectionScheduler::new(
        Arc::clone(&registry),
        config.scheduler.to_scheduler_config(),
        Arc::clone(&metrics),
    );
    let mut agent = Agent::new(Arc::new(scheduler), config.agent_options())
        .with_policy(config.sampling.to_policy()?);

    if cli.once {
        let report = agent.collect_once(&cancel).await?;
        print!("{}", prometheus::render(&report.measurements));
        registry.shutdown().await;
        return Ok(());
    }

    let mut sender: Option<JoinHandle<()>> = None;
    if config.push.enabled {
        let endpoint = config.push.endpoint_url()?;
        tracing::info!(endpoint = %endpoint, full_mode = %config.push.full_mode, "Push export enabled");
        let client = HttpPushClient::new(
            endpoint,
            config.push.resolved_headers(),
            config.push.request_timeout,
        )?;
        let pipeline = PushPipeline::new(
            "http-push",
            client,
            config.push.to_push_options(),
            config.retry.to_policy(),
            Arc::clone(&metrics),
            cancel.clone(),
        )?;
        sender = Some(Arc::clone(&pipeline.worker).spawn(cancel.clone()));
        agent = agent.with_exporter(pipeline.exporter);
    }

    let agent = Arc::new(agent);
    let agent_task = tokio::spawn({
        let agent = Arc::clone(&agent);
        let cancel = cancel.clone();
        async move { agent.run(cancel).await }
    });

    let app = create_router(AppState {
        agent,
        cancel: cancel.clone(),
    });
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "Scrape server listening");
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    if let Err(e) = agent_task.await {
        tracing::error!(error = %e, "Agent task failed");
    }
    if let Some(sender) = sender
        && let Err(e) = sender.await
    {
        tracing::error!(error = %e, "Sender task failed");
    }

    tracing::info!("Shutting down collectors");
    registry.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then cancel the root token.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        _ = terminate => tracing::info!("Received terminate signal"),
    }

    cancel.cancel();
}
