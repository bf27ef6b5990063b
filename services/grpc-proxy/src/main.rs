//! grpc-proxy binary.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use grpc_proxy::config::{self, Flags};
use grpc_proxy::Server;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let flags = Flags::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log_level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| flags.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(flags).await {
        error!(error = %format!("{e:#}"), "grpc-proxy failed");
        eprintln!("Error: {e:#}\n");
        let _ = Flags::command().print_help();
        std::process::exit(1);
    }

    Ok(())
}

async fn run(flags: Flags) -> Result<()> {
    let system_proxy = flags.system_proxy;

    let server = Server::new([config::from_flags(flags)]).context("Failed to configure proxy")?;
    let listening = server.listen().await.context("Failed to bind listener")?;
    let addr = listening.local_addr();
    info!(addr = %addr, "grpc-proxy listening");

    if system_proxy {
        info!(
            proxy = %format!("http://{addr}"),
            "System proxy is not changed automatically, point the OS HTTP(S) proxy here"
        );
    }

    listening.serve().await.context("Proxy stopped")?;
    Ok(())
}
