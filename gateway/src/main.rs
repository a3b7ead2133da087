#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard_gateway::balancer::Balancer;
use switchyard_gateway::breaker::BreakerClient;
use switchyard_gateway::config::GatewayConfig;
use switchyard_gateway::dispatcher::Dispatcher;
use switchyard_gateway::proxy;
use switchyard_gateway::registry::Registry;
use switchyard_gateway::server::{GatewayState, Server};
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchyard", about = "HTTP reverse-proxy gateway with self-registering backends")]
struct Cli {
    /// Path to gateway config file
    #[arg(short, long, default_value = "switchyard.toml")]
    config: PathBuf,

    /// Listen address (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    init_tracing();

    let config = GatewayConfig::load(&cli.config)?;
    let listen = cli.listen.unwrap_or_else(|| config.listen.clone());

    let registry = Arc::new(Registry::new());
    for (service, instances) in &config.services {
        for instance in instances {
            registry.register(service, instance.clone());
        }
    }

    let balancer = Arc::new(Balancer::new(config.strategy(), registry.clone()));
    let client = Arc::new(BreakerClient::new(
        config.breaker_settings(),
        config.retry(),
        config.request_timeout(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(balancer, client));
    let route = proxy::prefix_router(config.routes.clone());

    let state = GatewayState {
        registry: Some(registry),
        dispatcher,
        route,
    };

    let server = Server::bind(&listen).await?;
    tracing::info!(
        "server: gateway listening, addr={}, strategy={}, timeout={}s",
        server.local_addr(),
        config.strategy(),
        config.forward.request_timeout_secs,
    );

    let shutdown = Arc::new(Notify::new());
    let serve_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { server.serve(state, shutdown).await }
    });

    wait_for_shutdown().await;
    shutdown.notify_waiters();

    if let Err(e) = serve_handle.await? {
        tracing::error!("server: error during shutdown, {}", e);
    }
    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
