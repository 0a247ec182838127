use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use common_logs::collate::{multiprocess_collate, Processor};
use common_logs::metrics_consts::LEDGER_SIZE_GAUGE;
use common_logs::settings::FormatType;
use common_logs::stream::get_object_lines;
use common_logs::window::{enumerate_work, LookbackWindow};
use common_logs::{LedgerStore, SourceIdentity};
use common_s3::ObjectStore;
use metrics::{counter, gauge, histogram};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::aggregate::{accumulate, project};
use crate::error::ProcessorError;
use crate::metrics_consts::{REPORT_ROWS_GAUGE, RUNS_COUNTER, RUN_DURATION_HISTOGRAM};
use crate::output::{to_csv, to_json, JsonGroup};
use crate::plugins::{PartialStatistics, PluginSet, PluginSettings};
use crate::publish::Publisher;

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Where the processed files list and the reports live
    pub account: String,
    pub container: String,
    pub processed_files_object_name: String,
    pub window: LookbackWindow,
    pub worker_count: usize,
    pub format: FormatType,
    pub time_zone: Tz,
    pub plugins: PluginSettings,
}

/// What a run did, for logging and tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub files_to_process: usize,
    pub files_processed: usize,
    pub files_failed: usize,
    /// Name of the uploaded report, if the run had anything to do
    pub artifact: Option<String>,
}

/// One map worker: fetches a log object and hands its lines to the owning plugin
struct PluginWorker {
    store: Arc<dyn ObjectStore>,
    plugins: PluginSet,
}

#[async_trait]
impl Processor for PluginWorker {
    type Item = SourceIdentity;
    type Output = PartialStatistics;

    async fn process(&mut self, item: &SourceIdentity) -> anyhow::Result<PartialStatistics> {
        let plugin = self.plugins.get(&item.plugin_name)?;
        info!(plugin = %item.plugin_name, "Processing {}", item.object_path());

        let lines = get_object_lines(
            self.store.as_ref(),
            &item.account,
            &item.container,
            &item.object_name,
            item.is_compressed(),
        )
        .await
        .with_context(|| format!("failed to fetch {}", item.object_path()))?;

        // parsing is CPU bound, keep it off the async workers
        let identity = item.clone();
        let partial = tokio::task::spawn_blocking(move || {
            plugin.parse(
                lines,
                &identity.account,
                &identity.container,
                &identity.object_name,
            )
        })
        .await
        .context("parser task failed")?
        .with_context(|| format!("failed to parse {}", item.object_path()))?;
        Ok(partial)
    }
}

/// Turns raw logs into hourly per-account reports, one run at a time.
///
/// Only one processor may run against a given processed files list at a time.
pub struct LogProcessor {
    store: Arc<dyn ObjectStore>,
    settings: ProcessorSettings,
    ledger_store: LedgerStore,
    publisher: Publisher,
}

impl LogProcessor {
    pub fn new(store: Arc<dyn ObjectStore>, settings: ProcessorSettings) -> Self {
        let ledger_store = LedgerStore::new(
            store.clone(),
            settings.account.clone(),
            settings.container.clone(),
            settings.processed_files_object_name.clone(),
        );
        let publisher = Publisher::new(
            store.clone(),
            settings.account.clone(),
            settings.container.clone(),
            settings.time_zone,
        );
        Self {
            store,
            settings,
            ledger_store,
            publisher,
        }
    }

    /// Process every unprocessed log in the lookback window ending at `now`, publish
    /// one report and record what was processed.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunSummary, ProcessorError> {
        let started = Instant::now();
        info!("Beginning log processing");
        let result = self.process(now).await;
        let outcome = match &result {
            Ok(summary) if summary.artifact.is_some() => "published",
            Ok(_) => "idle",
            Err(_) => "failed",
        };
        counter!(RUNS_COUNTER, "outcome" => outcome).increment(1);
        histogram!(RUN_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
        info!(
            "Log processing done ({:.2} minutes)",
            started.elapsed().as_secs_f64() / 60.0
        );
        result
    }

    async fn process(&self, now: DateTime<Utc>) -> Result<RunSummary, ProcessorError> {
        let settings = &self.settings;
        let bounds = settings.window.bounds(now, settings.time_zone);

        let mut ledger = self.ledger_store.load().await?;
        gauge!(LEDGER_SIZE_GAUGE).set(ledger.len() as f64);

        let work = enumerate_work(
            self.store.as_ref(),
            &settings.plugins.sources(),
            &bounds,
            &ledger,
        )
        .await
        .map_err(ProcessorError::Listing)?;
        info!("loaded {} files to process", work.len());
        if work.is_empty() {
            return Ok(RunSummary::default());
        }
        let files_to_process = work.len();

        // map
        let collated = multiprocess_collate(work, settings.worker_count, |_| PluginWorker {
            store: self.store.clone(),
            plugins: settings.plugins.build(),
        })
        .await;
        let files_processed = collated.succeeded.len();
        let files_failed = collated.failed.len();

        // reduce
        let plugins = settings.plugins.build();
        let mapping = plugins.keylist_mapping();
        let aggregate = accumulate(&mut ledger, collated.succeeded);
        let buckets = project(&aggregate, &mapping);
        drop(aggregate);
        gauge!(REPORT_ROWS_GAUGE).set(buckets.len() as f64);

        // output
        let body = match settings.format {
            FormatType::Csv => to_csv(&buckets, &mapping)?,
            FormatType::Json => {
                let groups: Vec<JsonGroup> = plugins
                    .iter()
                    .map(|plugin| JsonGroup {
                        name: plugin.json_group().to_string(),
                        mapping: plugin.keylist_mapping(),
                    })
                    .collect();
                to_json(&buckets, &groups, settings.time_zone)?
            }
        };
        let artifact = self.publisher.publish(&body, settings.format, now).await?;

        self.ledger_store.save(&ledger).await?;
        gauge!(LEDGER_SIZE_GAUGE).set(ledger.len() as f64);

        Ok(RunSummary {
            files_to_process,
            files_processed,
            files_failed,
            artifact: Some(artifact),
        })
    }

    /// Run forever, at most once per `interval`. A failed run is logged and the next
    /// one is attempted on schedule.
    pub async fn run_forever(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_once(Utc::now()).await {
                Ok(summary) => info!(
                    "Run finished: {} to process, {} processed, {} failed",
                    summary.files_to_process, summary.files_processed, summary.files_failed
                ),
                Err(e) => error!("Run once failed: {}", e),
            }
        }
    }
}
