use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use common_logs::access_line::AccessLogParser;
use common_logs::collate::{multiprocess_collate, Processor};
use common_logs::file_buffer::FileBuffer;
use common_logs::settings::is_true_value;
use common_logs::stream::get_object_lines;
use common_logs::window::{enumerate_work, LogSource, LookbackWindow};
use common_logs::{LedgerStore, SourceIdentity};
use common_s3::{ObjectStore, S3Error};
use flate2::{write::GzEncoder, Compression};
use metrics::{counter, histogram};
use moka::sync::Cache;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::metrics_consts::{
    CONTAINER_FLAG_LOOKUPS_COUNTER, DELIVERY_FAILURES_COUNTER, FILES_DELIVERED_COUNTER,
    RUN_DURATION_HISTOGRAM,
};

/// Name recorded in the processed files list for delivered logs
pub const DELIVERY_PLUGIN_NAME: &str = "access_log_delivery";

/// Upper bound on cached per-container opt-in flags
const FLAG_CACHE_CAPACITY: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Where the processed files list lives
    pub account: String,
    pub container: String,
    pub processed_files_object_name: String,
    pub source_account: String,
    pub source_container: String,
    /// Container in each customer account that receives its logs
    pub target_container: String,
    /// Container metadata key opting a container into delivery, lowercase
    pub metadata_key: String,
    pub server_name: String,
    pub working_dir: PathBuf,
    pub buffer_limit: usize,
    pub lock_timeout: Duration,
    pub hidden_ips: Vec<String>,
    pub frequency: Duration,
    pub worker_count: usize,
    pub window: LookbackWindow,
    pub time_zone: Tz,
}

/// Per-container "deliver my logs" flag, read from container metadata and cached
/// for one run interval
#[derive(Clone)]
pub struct ContainerFlags {
    store: Arc<dyn ObjectStore>,
    metadata_key: String,
    cache: Cache<(String, String), bool>,
}

impl ContainerFlags {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        metadata_key: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(FLAG_CACHE_CAPACITY)
            .build();
        Self {
            store,
            metadata_key: metadata_key.into().to_lowercase(),
            cache,
        }
    }

    pub async fn save_logs(&self, account: &str, container: &str) -> Result<bool, S3Error> {
        let key = (account.to_string(), container.to_string());
        if let Some(flag) = self.cache.get(&key) {
            return Ok(flag);
        }
        counter!(CONTAINER_FLAG_LOOKUPS_COUNTER).increment(1);
        let metadata = self.store.get_container_metadata(account, container).await?;
        let flag = metadata
            .iter()
            .find(|(k, _)| k.to_lowercase() == self.metadata_key)
            .is_some_and(|(_, v)| is_true_value(v));
        self.cache.insert(key, flag);
        Ok(flag)
    }
}

impl std::fmt::Debug for ContainerFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerFlags")
            .field("metadata_key", &self.metadata_key)
            .field("cache", &"<moka cache>")
            .finish()
    }
}

/// A name that's safe to use as one directory level under the working dir
fn is_plain_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Splits one source log into per-container CLF files under the working dir
struct DeliveryWorker {
    store: Arc<dyn ObjectStore>,
    parser: AccessLogParser,
    flags: ContainerFlags,
    working_dir: PathBuf,
    hidden_ips: Arc<Vec<String>>,
    buffer_limit: usize,
    lock_timeout: Duration,
}

#[async_trait]
impl Processor for DeliveryWorker {
    type Item = SourceIdentity;
    type Output = BTreeSet<PathBuf>;

    async fn process(&mut self, item: &SourceIdentity) -> anyhow::Result<BTreeSet<PathBuf>> {
        let parts: Vec<&str> = item.object_name.splitn(5, '/').collect();
        let [year, month, day, hour, _] = parts[..] else {
            info!("Odd object name: {}. Skipping", item.object_name);
            return Ok(BTreeSet::new());
        };
        debug!("Processing {}", item.object_path());

        let lines = get_object_lines(
            self.store.as_ref(),
            &item.account,
            &item.container,
            &item.object_name,
            item.is_compressed(),
        )
        .await
        .with_context(|| format!("failed to fetch {}", item.object_path()))?;

        let mut entries = Vec::new();
        for raw in lines {
            let raw = raw.with_context(|| format!("failed to read {}", item.object_path()))?;
            let Ok(line) = self.parser.parse(&raw) else {
                continue;
            };
            if line.is_internal() {
                continue;
            }
            let Some(container) = line.container.clone() else {
                continue;
            };
            if !is_plain_component(&line.account) || !is_plain_component(&container) {
                continue;
            }
            let clf = line.to_clf(&self.hidden_ips);
            entries.push((line.account, container, clf));
        }

        let mut writes = Vec::with_capacity(entries.len());
        for (account, container, clf) in entries {
            if !self.flags.save_logs(&account, &container).await? {
                continue;
            }
            let path = self
                .working_dir
                .join(&account)
                .join(&container)
                .join(year)
                .join(month)
                .join(day)
                .join(hour);
            writes.push((path, clf));
        }

        let (limit, lock_timeout) = (self.buffer_limit, self.lock_timeout);
        let files = tokio::task::spawn_blocking(move || {
            let mut buffer = FileBuffer::new(limit, lock_timeout);
            let mut files = BTreeSet::new();
            for (path, clf) in writes {
                files.insert(path.clone());
                buffer.write(path, clf)?;
            }
            buffer.flush()?;
            Ok::<_, anyhow::Error>(files)
        })
        .await
        .context("file buffer task failed")??;
        Ok(files)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub files_to_process: usize,
    pub files_processed: usize,
    pub files_failed: usize,
    pub delivered: usize,
    pub delivery_failures: usize,
}

/// Splits proxy access logs by account and container and delivers each
/// opted-in container's share into its account.
pub struct AccessLogDelivery {
    store: Arc<dyn ObjectStore>,
    settings: DeliverySettings,
    ledger_store: LedgerStore,
    flags: ContainerFlags,
}

impl AccessLogDelivery {
    pub fn new(store: Arc<dyn ObjectStore>, settings: DeliverySettings) -> Self {
        let ledger_store = LedgerStore::new(
            store.clone(),
            settings.account.clone(),
            settings.container.clone(),
            settings.processed_files_object_name.clone(),
        );
        let flags = ContainerFlags::new(store.clone(), &settings.metadata_key, settings.frequency);
        Self {
            store,
            settings,
            ledger_store,
            flags,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DeliverySummary, DeliveryError> {
        let started = Instant::now();
        info!("Beginning log processing");
        let result = self.process(now).await;
        histogram!(RUN_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
        info!(
            "Log processing done ({:.2} minutes)",
            started.elapsed().as_secs_f64() / 60.0
        );
        result
    }

    async fn process(&self, now: DateTime<Utc>) -> Result<DeliverySummary, DeliveryError> {
        let settings = &self.settings;
        let mut ledger = self.ledger_store.load().await?;

        let source = LogSource {
            plugin_name: DELIVERY_PLUGIN_NAME.to_string(),
            account: settings.source_account.clone(),
            container: settings.source_container.clone(),
        };
        let bounds = settings.window.bounds(now, settings.time_zone);
        let work = enumerate_work(self.store.as_ref(), &[source], &bounds, &ledger)
            .await
            .map_err(DeliveryError::Listing)?;
        if work.is_empty() {
            return Ok(DeliverySummary::default());
        }
        let mut summary = DeliverySummary {
            files_to_process: work.len(),
            ..Default::default()
        };

        // map
        let hidden_ips = Arc::new(settings.hidden_ips.clone());
        let collated = multiprocess_collate(work, settings.worker_count, |_| DeliveryWorker {
            store: self.store.clone(),
            parser: AccessLogParser::new(settings.server_name.clone()),
            flags: self.flags.clone(),
            working_dir: settings.working_dir.clone(),
            hidden_ips: hidden_ips.clone(),
            buffer_limit: settings.buffer_limit,
            lock_timeout: settings.lock_timeout,
        })
        .await;
        summary.files_processed = collated.succeeded.len();
        summary.files_failed = collated.failed.len();

        // reduce
        let mut to_upload = BTreeSet::new();
        for (identity, files) in collated.succeeded {
            ledger.insert(identity);
            to_upload.extend(files);
        }
        for path in to_upload {
            match self.deliver(&path).await {
                Ok(()) => {
                    counter!(FILES_DELIVERED_COUNTER).increment(1);
                    summary.delivered += 1;
                }
                Err(e) => {
                    counter!(DELIVERY_FAILURES_COUNTER).increment(1);
                    error!("Could not upload {}: {:#}", path.display(), e);
                    summary.delivery_failures += 1;
                }
            }
        }

        self.ledger_store.save(&ledger).await?;
        Ok(summary)
    }

    /// Upload one working file as `<container>/YYYY/MM/DD/HH/<uuid>.log.gz` into its
    /// account's target container, then remove it
    async fn deliver(&self, path: &Path) -> anyhow::Result<()> {
        let relative = path.strip_prefix(&self.settings.working_dir)?;
        let mut components = relative.iter().filter_map(|c| c.to_str());
        let account = components
            .next()
            .ok_or_else(|| anyhow!("no account in {}", path.display()))?;
        let rest: Vec<&str> = components.collect();
        let name = format!("{}/{}.log.gz", rest.join("/"), Uuid::new_v4().simple());

        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        let compressed = encoder.finish()?;

        self.store
            .put_object(account, &self.settings.target_container, &name, compressed)
            .await?;
        tokio::fs::remove_file(path).await?;
        debug!("Uploaded {} to account {}", path.display(), account);
        Ok(())
    }

    pub async fn run_forever(&self) {
        let mut ticker = tokio::time::interval(self.settings.frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once(Utc::now()).await {
                error!("Run once failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use common_s3::MemoryObjectStore;

    use super::*;

    #[test]
    fn test_plain_components() {
        assert!(is_plain_component("AUTH_a1"));
        assert!(!is_plain_component(".."));
        assert!(!is_plain_component("."));
        assert!(!is_plain_component("a/b"));
        assert!(!is_plain_component(""));
    }

    #[tokio::test]
    async fn test_container_flags_are_cached() {
        let store = MemoryObjectStore::new();
        store.set_container_metadata(
            "a1",
            "c1",
            HashMap::from([(
                "X-Container-Meta-Access-Log-Delivery".to_string(),
                "yes".to_string(),
            )]),
        );
        let flags = ContainerFlags::new(
            Arc::new(store.clone()),
            "x-container-meta-access-log-delivery",
            Duration::from_secs(3600),
        );

        assert!(flags.save_logs("a1", "c1").await.unwrap());
        assert!(!flags.save_logs("a1", "c2").await.unwrap());

        // the cached answer wins until the ttl runs out
        store.set_container_metadata("a1", "c1", HashMap::new());
        assert!(flags.save_logs("a1", "c1").await.unwrap());
    }
}
