use anyhow::Context;
use clap::Parser;
use std::{path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::info;
use trustgate::{
    config::{create_default_config_file, AppConfig},
    database::SessionArchive,
    gateway::{router, spawn_sweeper, AppState},
    logging,
};

#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Trust and payment gateway in front of a merchant")]
struct Args {
    #[arg(short, long, default_value = "config.toml", env = "TRUSTGATE_CONFIG")]
    config: String,

    #[arg(short, long)]
    port: Option<u16>,

    /// Run without the session archive; terminal sessions are kept in memory only.
    #[arg(long)]
    no_archive: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if !Path::new(&args.config).exists() {
        create_default_config_file(&args.config)
            .with_context(|| format!("writing default config to {}", args.config))?;
    }

    let mut config = AppConfig::load_with_env_overrides(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;
    logging::init(&config.logging);

    let archive = if args.no_archive {
        None
    } else {
        Some(Arc::new(
            SessionArchive::new(&config.database.url, config.database.max_connections).await?,
        ))
    };

    let state = AppState::from_config(&config, archive)?;
    spawn_sweeper(
        state.clone(),
        Duration::from_secs(config.settlement.sweep_interval_seconds),
    );

    let address = config.get_server_address();
    let listener = TcpListener::bind(&address).await?;
    info!(
        address = %address,
        merchant = %config.merchant.upstream_url,
        networks = ?state.negotiator.networks(),
        "Gateway listening"
    );

    axum::serve(listener, router(state)).await?;

    Ok(())
}
