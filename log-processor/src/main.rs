use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use chrono::Utc;
use common_s3::S3Impl;
use envconfig::Envconfig;
use log_processor::{config::Config, processor::LogProcessor};
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
        .processor_settings()
        .context("invalid plugin configuration")?;
    let store = Arc::new(S3Impl::from_config(&config.s3).await);
    let processor = LogProcessor::new(store, settings);

    if config.run_once {
        let summary = processor.run_once(Utc::now()).await?;
        info!(
            "Processed {} of {} files ({} failed), report: {:?}",
            summary.files_processed,
            summary.files_to_process,
            summary.files_failed,
            summary.artifact
        );
        return Ok(());
    }

    processor
        .run_forever(Duration::from_secs(config.run_interval_secs))
        .await;
    Ok(())
}
