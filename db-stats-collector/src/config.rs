use std::path::PathBuf;

use chrono_tz::Tz;
use common_logs::settings::{is_true_value, parse_time_zone, split_list};
use envconfig::Envconfig;

use crate::collector::{CollectorError, CollectorSettings, StatsType};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // account or container
    #[envconfig(from = "STATS_TYPE", default = "account")]
    pub stats_type: String,

    #[envconfig(from = "DEVICES", default = "/srv/node")]
    pub devices: String,

    #[envconfig(from = "MOUNT_CHECK", default = "true")]
    pub mount_check: String,

    #[envconfig(from = "LOG_DIR", default = "/var/log/swift")]
    pub log_dir: String,

    // container stats only, comma separated
    #[envconfig(from = "METADATA_KEYS", default = "")]
    pub metadata_keys: String,

    #[envconfig(from = "TIME_ZONE", default = "UTC")]
    pub time_zone: String,

    #[envconfig(from = "RUN_ONCE", default = "false")]
    pub run_once: bool,

    #[envconfig(from = "RUN_INTERVAL_SECS", default = "3600")]
    pub run_interval_secs: u64,
}

impl Config {
    pub fn collector_settings(&self) -> Result<CollectorSettings, CollectorError> {
        Ok(CollectorSettings {
            stats_type: self.stats_type.parse()?,
            devices: PathBuf::from(&self.devices),
            mount_check: is_true_value(&self.mount_check),
            log_dir: PathBuf::from(&self.log_dir),
            metadata_keys: split_list(&self.metadata_keys),
            time_zone: parse_time_zone("time_zone", &self.time_zone, Tz::UTC),
        })
    }
}
