use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use common_logs::settings::{parse_time_zone, split_list};
use common_logs::window::LookbackWindow;
use common_s3::S3Config;
use envconfig::Envconfig;

use crate::delivery::DeliverySettings;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Account holding this service's processed files list
    #[envconfig(from = "LOG_DELIVERY_ACCOUNT")]
    pub log_delivery_account: String,

    #[envconfig(from = "CONTAINER_NAME", default = "access_log_delivery_data")]
    pub container_name: String,

    #[envconfig(from = "PROCESSED_FILES_OBJECT_NAME", default = "processed_files.json.gz")]
    pub processed_files_object_name: String,

    // Defaults to LOG_DELIVERY_ACCOUNT
    #[envconfig(from = "LOG_SOURCE_ACCOUNT")]
    pub log_source_account: Option<String>,

    #[envconfig(from = "LOG_SOURCE_CONTAINER", default = "log_data")]
    pub log_source_container: String,

    #[envconfig(from = "TARGET_CONTAINER", default = ".ACCESS_LOGS")]
    pub target_container: String,

    #[envconfig(
        from = "METADATA_KEY",
        default = "x-container-meta-access-log-delivery"
    )]
    pub metadata_key: String,

    #[envconfig(from = "SERVER_NAME", default = "proxy-server")]
    pub server_name: String,

    #[envconfig(from = "WORKING_DIR", default = "/tmp/swift")]
    pub working_dir: String,

    #[envconfig(from = "BUFFER_LIMIT", default = "10485760")]
    pub buffer_limit: usize,

    #[envconfig(from = "LOCK_TIMEOUT_MS", default = "10000")]
    pub lock_timeout_ms: u64,

    #[envconfig(from = "HIDDEN_IPS", default = "")]
    pub hidden_ips: String,

    #[envconfig(from = "FREQUENCY_SECS", default = "3600")]
    pub frequency_secs: u64,

    #[envconfig(from = "WORKER_COUNT", default = "1")]
    pub worker_count: usize,

    #[envconfig(from = "LOOKBACK_HOURS", default = "120")]
    pub lookback_hours: u32,

    #[envconfig(from = "LOOKBACK_WINDOW")]
    pub lookback_window: Option<u32>,

    #[envconfig(from = "TIME_ZONE", default = "UTC")]
    pub time_zone: String,

    #[envconfig(from = "RUN_ONCE", default = "false")]
    pub run_once: bool,

    #[envconfig(nested = true)]
    pub s3: S3Config,
}

impl Config {
    pub fn working_dir(&self) -> PathBuf {
        let trimmed = self.working_dir.trim_end_matches('/');
        if trimmed.is_empty() {
            PathBuf::from("/")
        } else {
            PathBuf::from(trimmed)
        }
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            account: self.log_delivery_account.clone(),
            container: self.container_name.clone(),
            processed_files_object_name: self.processed_files_object_name.clone(),
            source_account: self
                .log_source_account
                .clone()
                .unwrap_or_else(|| self.log_delivery_account.clone()),
            source_container: self.log_source_container.clone(),
            target_container: self.target_container.clone(),
            metadata_key: self.metadata_key.to_lowercase(),
            server_name: self.server_name.clone(),
            working_dir: self.working_dir(),
            buffer_limit: self.buffer_limit,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            hidden_ips: split_list(&self.hidden_ips),
            frequency: Duration::from_secs(self.frequency_secs),
            worker_count: self.worker_count,
            window: LookbackWindow::new(
                self.lookback_hours,
                self.lookback_window.unwrap_or(self.lookback_hours),
            ),
            time_zone: parse_time_zone("time_zone", &self.time_zone, Tz::UTC),
        }
    }
}
