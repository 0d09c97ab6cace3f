use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use switchyard::admin::AdminServer;
use switchyard::config::Config;
use switchyard::server::Server;

#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(about = "A multi-protocol service-mesh sidecar proxy")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting switchyard");

    // Load configuration; a fatal configuration error refuses startup
    let config = Config::load(&args.config).await?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let prometheus = if config.metrics.enabled {
        Some(switchyard::metrics::install()?)
    } else {
        None
    };

    let server = Server::start(&config).await?;

    let admin_task = if config.admin.enabled {
        let admin = AdminServer::new(&config.admin, server.clone(), prometheus);
        Some(tokio::spawn(async move {
            if let Err(e) = admin.start().await {
                error!("Admin server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("switchyard started successfully");

    // Handle shutdown gracefully
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    if let Some(admin_task) = admin_task {
        admin_task.abort();
    }
    server.shutdown().await;

    info!("switchyard shutdown complete");
    Ok(())
}
