//! Process bootstrap: parse CLI flags over environment defaults, build the
//! Manager, bind the Gateway listener, and shut down cleanly on SIGINT.

use std::sync::Arc;

use clap::Parser;
use sandbox_core::Config;
use sandbox_core::SessionManager;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Sandbox Gateway: a multi-tenant Python execution server.
#[derive(Debug, Parser)]
#[command(name = "sandbox-gateway", version)]
struct Cli {
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long = "api-key")]
    api_key: Option<String>,

    #[arg(long = "max-kernels")]
    max_kernels: Option<usize>,

    #[arg(long = "kernel-timeout")]
    kernel_timeout: Option<u64>,

    #[arg(long = "pool-size")]
    pool_size: Option<usize>,
}

impl Cli {
    fn apply_over(self, mut config: Config) -> Config {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(api_key) = self.api_key {
            config.api_key = Some(api_key);
        }
        if let Some(max_kernels) = self.max_kernels {
            config.capacity_max = max_kernels;
        }
        if let Some(kernel_timeout) = self.kernel_timeout {
            config.idle_ttl = std::time::Duration::from_secs(kernel_timeout);
        }
        if let Some(pool_size) = self.pool_size {
            config.pool_target = pool_size;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "gateway startup failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.apply_over(Config::from_env());
    let addr = format!("{}:{}", config.host, config.port);
    let config = Arc::new(config);

    let manager = SessionManager::new((*config).clone());
    manager.start().await;

    let router = sandbox_gateway::build_router(Arc::clone(&manager), Arc::clone(&config));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "gateway listening");

    let shutdown_manager = Arc::clone(&manager);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received SIGINT, shutting down");
            shutdown_manager.stop().await;
        })
        .await?;

    Ok(())
}
