use std::sync::Arc;

use access_log_delivery::{config::Config, delivery::AccessLogDelivery};
use anyhow::{Context, Error};
use chrono::Utc;
use common_s3::S3Impl;
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
    let store = Arc::new(S3Impl::from_config(&config.s3).await);
    let delivery = AccessLogDelivery::new(store, config.delivery_settings());

    if config.run_once {
        let summary = delivery.run_once(Utc::now()).await?;
        info!(
            "Processed {} of {} files ({} failed), delivered {} ({} failed)",
            summary.files_processed,
            summary.files_to_process,
            summary.files_failed,
            summary.delivered,
            summary.delivery_failures
        );
        return Ok(());
    }

    delivery.run_forever().await;
    Ok(())
}
