use std::collections::BTreeSet;

use chrono_tz::Tz;
use common_logs::settings::{parse_time_zone, split_list, FormatType};
use common_logs::window::LookbackWindow;
use common_s3::S3Config;
use envconfig::Envconfig;

use crate::plugins::{AccessPluginConfig, PluginError, PluginKind, PluginSettings, PluginSpec};
use crate::processor::ProcessorSettings;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Account holding the processed files list and the published reports
    #[envconfig(from = "LOG_PROCESSOR_ACCOUNT")]
    pub log_processor_account: String,

    #[envconfig(from = "CONTAINER_NAME", default = "log_processing_data")]
    pub container_name: String,

    #[envconfig(from = "PROCESSED_FILES_OBJECT_NAME", default = "processed_files.json.gz")]
    pub processed_files_object_name: String,

    // 0 means look at every log ever written
    #[envconfig(from = "LOOKBACK_HOURS", default = "120")]
    pub lookback_hours: u32,

    // Defaults to LOOKBACK_HOURS, 0 means no end bound
    #[envconfig(from = "LOOKBACK_WINDOW")]
    pub lookback_window: Option<u32>,

    #[envconfig(from = "WORKER_COUNT", default = "1")]
    pub worker_count: usize,

    #[envconfig(from = "TIME_ZONE", default = "UTC")]
    pub time_zone: String,

    #[envconfig(from = "FORMAT_TYPE", default = "csv")]
    pub format_type: String,

    // comma separated, in the order their fields are grouped in JSON output
    #[envconfig(from = "ENABLED_PLUGINS", default = "stats,access")]
    pub enabled_plugins: String,

    // Source account for proxy access logs, defaults to LOG_PROCESSOR_ACCOUNT
    #[envconfig(from = "ACCESS_LOG_ACCOUNT")]
    pub access_log_account: Option<String>,

    #[envconfig(from = "ACCESS_LOG_CONTAINER", default = "log_data")]
    pub access_log_container: String,

    // Source account for account stats, defaults to LOG_PROCESSOR_ACCOUNT
    #[envconfig(from = "STATS_LOG_ACCOUNT")]
    pub stats_log_account: Option<String>,

    #[envconfig(from = "STATS_LOG_CONTAINER", default = "account_stats")]
    pub stats_log_container: String,

    #[envconfig(from = "SERVER_NAME", default = "proxy-server")]
    pub server_name: String,

    #[envconfig(from = "LB_PRIVATE_IPS", default = "")]
    pub lb_private_ips: String,

    #[envconfig(from = "SERVICE_IPS", default = "")]
    pub service_ips: String,

    #[envconfig(from = "WARN_PERCENT", default = "0.8")]
    pub warn_percent: f64,

    #[envconfig(from = "RUN_ONCE", default = "false")]
    pub run_once: bool,

    #[envconfig(from = "RUN_INTERVAL_SECS", default = "3600")]
    pub run_interval_secs: u64,

    #[envconfig(nested = true)]
    pub s3: S3Config,
}

impl Config {
    pub fn time_zone(&self) -> Tz {
        parse_time_zone("time_zone", &self.time_zone, Tz::UTC)
    }

    pub fn format_type(&self) -> FormatType {
        FormatType::parse_or("format_type", &self.format_type, FormatType::Csv)
    }

    pub fn lookback(&self) -> LookbackWindow {
        LookbackWindow::new(
            self.lookback_hours,
            self.lookback_window.unwrap_or(self.lookback_hours),
        )
    }

    pub fn plugin_settings(&self) -> Result<PluginSettings, PluginError> {
        let mut seen = BTreeSet::new();
        let enabled = split_list(&self.enabled_plugins)
            .iter()
            .map(|name| {
                let kind: PluginKind = name.parse()?;
                if !seen.insert(kind) {
                    return Err(PluginError::DuplicatePlugin(kind.name()));
                }
                let (account, container) = match kind {
                    PluginKind::Access => (&self.access_log_account, &self.access_log_container),
                    PluginKind::Stats => (&self.stats_log_account, &self.stats_log_container),
                };
                Ok(PluginSpec {
                    kind,
                    account: account
                        .clone()
                        .unwrap_or_else(|| self.log_processor_account.clone()),
                    container: container.clone(),
                })
            })
            .collect::<Result<Vec<_>, PluginError>>()?;

        Ok(PluginSettings {
            enabled,
            access: AccessPluginConfig {
                server_name: self.server_name.clone(),
                lb_private_ips: split_list(&self.lb_private_ips),
                service_ips: split_list(&self.service_ips),
                warn_percent: self.warn_percent,
            },
            time_zone: self.time_zone(),
        })
    }

    pub fn processor_settings(&self) -> Result<ProcessorSettings, PluginError> {
        Ok(ProcessorSettings {
            account: self.log_processor_account.clone(),
            container: self.container_name.clone(),
            processed_files_object_name: self.processed_files_object_name.clone(),
            window: self.lookback(),
            worker_count: self.worker_count,
            format: self.format_type(),
            time_zone: self.time_zone(),
            plugins: self.plugin_settings()?,
        })
    }
}
