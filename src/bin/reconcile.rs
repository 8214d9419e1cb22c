use clap::Parser;
use std::time::Duration;
use tracing::{error, info, warn};
use trustgate::{
    config::AppConfig,
    database::SessionArchive,
    logging,
    settlement::{reconcile, SettlementClient},
};

#[derive(Parser)]
#[command(name = "reconcile")]
#[command(about = "Resolve archived settlements that timed out before reaching a terminal state")]
struct Args {
    #[arg(short, long, default_value = "config.toml", env = "TRUSTGATE_CONFIG")]
    config: String,

    /// Keep running, reconciling every N seconds.
    #[arg(long)]
    every: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::load_with_env_overrides(&args.config)?;
    config.validate()?;
    logging::init(&config.logging);

    let archive = SessionArchive::new(&config.database.url, config.database.max_connections).await?;
    let client = SettlementClient::from_config(&config.settlement)?;
    if config.settlement.status_url.is_none() {
        warn!("No settlement status service configured; timed-out settlements will stay unresolved");
    }

    let Some(every) = args.every else {
        let report = reconcile(&archive, &client).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(every));
    loop {
        ticker.tick().await;
        match reconcile(&archive, &client).await {
            Ok(report) => info!(
                examined = report.examined,
                confirmed = report.confirmed,
                failed = report.failed,
                unresolved = report.unresolved,
                "Reconciliation pass complete"
            ),
            Err(e) => error!(error = %e, "Reconciliation pass failed"),
        }
    }
}
