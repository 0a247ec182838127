use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use metrics::{counter, histogram};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::broker::{BrokerError, ShardBroker};
use crate::metrics_consts::{
    COLLECTION_DURATION_HISTOGRAM, DEVICES_SKIPPED_COUNTER, SHARDS_SCANNED_COUNTER,
    SHARDS_SKIPPED_COUNTER,
};

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("io error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("unknown stats type: {0}")]
    UnknownStatsType(String),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CollectorError + '_ {
    move |source| CollectorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsType {
    Account,
    Container,
}

impl StatsType {
    /// Directory under each device holding this kind of shard
    pub fn data_dir(&self) -> &'static str {
        match self {
            StatsType::Account => "accounts",
            StatsType::Container => "containers",
        }
    }

    /// strftime pattern for the output file name, the content hash gets appended
    pub fn filename_format(&self) -> &'static str {
        match self {
            StatsType::Account => "stats-%Y%m%d%H_",
            StatsType::Container => "container-stats-%Y%m%d%H_",
        }
    }
}

impl fmt::Display for StatsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsType::Account => write!(f, "account"),
            StatsType::Container => write!(f, "container"),
        }
    }
}

impl FromStr for StatsType {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "account" => Ok(StatsType::Account),
            "container" => Ok(StatsType::Container),
            other => Err(CollectorError::UnknownStatsType(other.to_string())),
        }
    }
}

/// `web-index` -> `X-Container-Meta-Web-Index`, matching how header names are stored
pub fn metadata_header(key: &str) -> String {
    let mut titled = String::with_capacity(key.len());
    let mut word_start = true;
    for c in key.trim().chars() {
        if c.is_alphabetic() {
            if word_start {
                titled.extend(c.to_uppercase());
            } else {
                titled.extend(c.to_lowercase());
            }
            word_start = false;
        } else {
            titled.push(c);
            word_start = true;
        }
    }
    format!("X-Container-Meta-{titled}")
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub stats_type: StatsType,
    pub devices: PathBuf,
    pub mount_check: bool,
    pub log_dir: PathBuf,
    /// Raw keys, e.g. `web-index`
    pub metadata_keys: Vec<String>,
    pub time_zone: Tz,
}

/// Scans every local account or container shard into one stats file in the log dir.
///
/// The file is written under a scratch directory next to its destination and only
/// renamed into place, as `<prefix><sha256 of rows>`, once every shard has been read.
#[derive(Debug)]
pub struct DatabaseStatsCollector {
    settings: CollectorSettings,
    metadata_headers: Vec<String>,
}

impl DatabaseStatsCollector {
    pub fn new(settings: CollectorSettings) -> Self {
        let metadata_headers = settings
            .metadata_keys
            .iter()
            .filter(|key| !key.trim().is_empty())
            .map(|key| metadata_header(key))
            .collect();
        Self {
            settings,
            metadata_headers,
        }
    }

    pub fn header(&self) -> String {
        match self.settings.stats_type {
            StatsType::Account => String::new(),
            StatsType::Container => {
                let mut header = "Account Hash,Container Name,Object Count,Bytes Used".to_string();
                for key in &self.metadata_headers {
                    header.push(',');
                    header.push_str(key);
                }
                header.push('\n');
                header
            }
        }
    }

    /// One output row for a shard, or None if the shard is deleted
    pub async fn shard_line(&self, db_path: &Path) -> Result<Option<String>, BrokerError> {
        let mut broker = ShardBroker::open(db_path).await?;
        let line = match self.settings.stats_type {
            StatsType::Account => {
                let stat = broker.account_stat().await?;
                (!stat.is_deleted()).then(|| {
                    format!(
                        "\"{}\",{},{},{}\n",
                        stat.account,
                        stat.container_count.unwrap_or(0),
                        stat.object_count,
                        stat.bytes_used
                    )
                })
            }
            StatsType::Container => {
                let stat = broker.container_stat().await?;
                if stat.is_deleted() {
                    None
                } else {
                    let mut line = format!(
                        "\"{}\",\"{}\",{},{}",
                        stat.account,
                        quote_container(&stat.container),
                        stat.object_count,
                        stat.bytes_used
                    );
                    if !self.metadata_headers.is_empty() {
                        let metadata =
                            stat.metadata_values()
                                .map_err(|source| BrokerError::Metadata {
                                    path: db_path.to_path_buf(),
                                    source,
                                })?;
                        for key in &self.metadata_headers {
                            line.push(',');
                            if metadata.contains_key(key) {
                                line.push('1');
                            }
                        }
                    }
                    line.push('\n');
                    Some(line)
                }
            }
        };
        broker.close().await?;
        Ok(line)
    }

    /// Every `*.db` under each mounted device's data dir, deepest first
    fn shard_paths(&self) -> Result<Vec<PathBuf>, CollectorError> {
        let devices = &self.settings.devices;
        let mut names: Vec<String> = fs::read_dir(devices)
            .map_err(io_error(devices))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();

        let mut paths = Vec::new();
        for device in names {
            if self.settings.mount_check && !is_mounted(devices, &device) {
                counter!(DEVICES_SKIPPED_COUNTER, "reason" => "unmounted").increment(1);
                error!("Device {} is not mounted, skipping.", device);
                continue;
            }
            let db_dir = devices.join(&device).join(self.settings.stats_type.data_dir());
            if !db_dir.exists() {
                counter!(DEVICES_SKIPPED_COUNTER, "reason" => "missing").increment(1);
                debug!("Path {} does not exist, skipping.", db_dir.display());
                continue;
            }
            paths.extend(
                WalkDir::new(&db_dir)
                    .contents_first(true)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "db"))
                    .map(|e| e.into_path()),
            );
        }
        Ok(paths)
    }

    /// Collect once. Returns the path of the stats file written.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<PathBuf, CollectorError> {
        let stats_type = self.settings.stats_type;
        info!("Gathering {} stats", stats_type);
        let started = Instant::now();
        let result = self.find_and_process(now).await;
        histogram!(COLLECTION_DURATION_HISTOGRAM, "stats_type" => stats_type.to_string())
            .record(started.elapsed().as_secs_f64());
        info!(
            "Gathering {} stats complete ({:.2} minutes)",
            stats_type,
            started.elapsed().as_secs_f64() / 60.0
        );
        result
    }

    async fn find_and_process(&self, now: DateTime<Utc>) -> Result<PathBuf, CollectorError> {
        let settings = &self.settings;
        let log_dir = &settings.log_dir;
        fs::create_dir_all(log_dir).map_err(io_error(log_dir))?;

        let base_name = now
            .with_timezone(&settings.time_zone)
            .format(settings.stats_type.filename_format())
            .to_string();
        // removed on drop, whichever way this returns
        let working_dir = tempfile::Builder::new()
            .prefix(&format!(".{}-stats_tmp", settings.stats_type))
            .tempdir_in(log_dir)
            .map_err(io_error(log_dir))?;
        let tmp_path = working_dir.path().join(&base_name);

        let file = File::create(&tmp_path).map_err(io_error(&tmp_path))?;
        let mut out = BufWriter::new(file);
        out.write_all(self.header().as_bytes())
            .map_err(io_error(&tmp_path))?;

        let mut hasher = Sha256::new();
        for db_path in self.shard_paths()? {
            match self.shard_line(&db_path).await {
                Ok(Some(line)) => {
                    counter!(SHARDS_SCANNED_COUNTER).increment(1);
                    out.write_all(line.as_bytes())
                        .map_err(io_error(&tmp_path))?;
                    hasher.update(line.as_bytes());
                }
                Ok(None) => {
                    counter!(SHARDS_SKIPPED_COUNTER, "reason" => "deleted").increment(1);
                }
                Err(e) => {
                    counter!(SHARDS_SKIPPED_COUNTER, "reason" => "error").increment(1);
                    info!("{}", e);
                }
            }
        }
        out.flush().map_err(io_error(&tmp_path))?;
        drop(out);

        let hash = hasher.finalize();
        let destination = log_dir.join(format!("{base_name}{hash:x}"));
        fs::rename(&tmp_path, &destination).map_err(io_error(&destination))?;
        info!("Wrote {}", destination.display());
        Ok(destination)
    }

    pub async fn run_forever(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once(Utc::now()).await {
                error!("Gathering {} stats failed: {}", self.settings.stats_type, e);
            }
        }
    }
}

/// URL-quote a container name, leaving `/` alone
fn quote_container(name: &str) -> String {
    name.split('/')
        .map(|part| urlencoding::encode(part).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// A device is mounted when it sits on a different filesystem than its parent,
/// or is the root of the same one
#[cfg(unix)]
fn is_mounted(devices: &Path, device: &str) -> bool {
    use std::os::unix::fs::MetadataExt;

    if device.contains('/') || device == "." || device == ".." {
        return false;
    }
    let (Ok(path), Ok(parent)) = (fs::metadata(devices.join(device)), fs::metadata(devices)) else {
        return false;
    };
    path.dev() != parent.dev() || path.ino() == parent.ino()
}

#[cfg(not(unix))]
fn is_mounted(devices: &Path, device: &str) -> bool {
    devices.join(device).is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector(stats_type: StatsType, keys: &[&str]) -> DatabaseStatsCollector {
        DatabaseStatsCollector::new(CollectorSettings {
            stats_type,
            devices: PathBuf::from("/srv/node"),
            mount_check: false,
            log_dir: PathBuf::from("/var/log/swift"),
            metadata_keys: keys.iter().map(|k| k.to_string()).collect(),
            time_zone: Tz::UTC,
        })
    }

    #[test]
    fn test_metadata_header() {
        assert_eq!(metadata_header("title"), "X-Container-Meta-Title");
        assert_eq!(metadata_header(" web-index "), "X-Container-Meta-Web-Index");
        assert_eq!(metadata_header("ACCESS_log"), "X-Container-Meta-Access_Log");
    }

    #[test]
    fn test_headers() {
        assert_eq!(collector(StatsType::Account, &["title"]).header(), "");
        assert_eq!(
            collector(StatsType::Container, &[]).header(),
            "Account Hash,Container Name,Object Count,Bytes Used\n"
        );
        assert_eq!(
            collector(StatsType::Container, &["title", "", "web-index"]).header(),
            "Account Hash,Container Name,Object Count,Bytes Used,X-Container-Meta-Title,X-Container-Meta-Web-Index\n"
        );
    }

    #[test]
    fn test_stats_type() {
        assert_eq!("Account".parse::<StatsType>().unwrap(), StatsType::Account);
        assert_eq!("container".parse::<StatsType>().unwrap(), StatsType::Container);
        assert!("object".parse::<StatsType>().is_err());
        assert_eq!(StatsType::Container.data_dir(), "containers");
    }

    #[test]
    fn test_quote_container() {
        assert_eq!(quote_container("plain"), "plain");
        assert_eq!(quote_container("with space/and,comma"), "with%20space/and%2Ccomma");
    }

    #[cfg(unix)]
    #[test]
    fn test_plain_directory_is_not_mounted() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sda")).unwrap();
        assert!(!is_mounted(dir.path(), "sda"));
        assert!(!is_mounted(dir.path(), "missing"));
        assert!(!is_mounted(dir.path(), "sda/x"));
    }
}
