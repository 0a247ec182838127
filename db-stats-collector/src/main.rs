use std::time::Duration;

use anyhow::{Context, Error};
use chrono::Utc;
use db_stats_collector::{collector::DatabaseStatsCollector, config::Config};
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
pub async fn main() -> Result<(), Error> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().context("failed to load configuration from env")?;
    let settings = config
        .collector_settings()
        .context("invalid collector configuration")?;
    let collector = DatabaseStatsCollector::new(settings);

    if config.run_once {
        collector.run_once(Utc::now()).await?;
        return Ok(());
    }

    collector
        .run_forever(Duration::from_secs(config.run_interval_secs))
        .await;
    Ok(())
}
