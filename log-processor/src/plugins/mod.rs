use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, TimeZone, Timelike};
use chrono_tz::Tz;
use common_logs::stream::LineStream;
use common_logs::window::LogSource;
use thiserror::Error;

use crate::keylist::KeylistMapping;

pub mod access;
pub mod stats;

pub use access::{AccessPlugin, AccessPluginConfig};
pub use stats::StatsPlugin;

/// Per-account, per-hour bucket every statistic is summed into
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey {
    pub account: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl AggregationKey {
    pub fn new(account: impl Into<String>, year: i32, month: u32, day: u32, hour: u32) -> Self {
        Self {
            account: account.into(),
            year,
            month,
            day,
            hour,
        }
    }

    pub fn from_datetime<T: Datelike + Timelike>(account: impl Into<String>, t: &T) -> Self {
        Self::new(account, t.year(), t.month(), t.day(), t.hour())
    }

    /// `YYYY/MM/DD HH:00:00`
    pub fn data_ts(&self) -> String {
        format!(
            "{:04}/{:02}/{:02} {:02}:00:00",
            self.year, self.month, self.day, self.hour
        )
    }

    /// The bucket's start as a zoned time. Hours skipped by a DST change have no
    /// local time and yield None.
    pub fn local_start(&self, tz: Tz) -> Option<DateTime<Tz>> {
        let naive = NaiveDate::from_ymd_opt(self.year, self.month, self.day)?
            .and_hms_opt(self.hour, 0, 0)?;
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(t) => Some(t),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            LocalResult::None => None,
        }
    }
}

/// Raw, plugin-defined field name to its running value
pub type RawStats = BTreeMap<String, u64>;

/// What one plugin extracted from one log object
pub type PartialStatistics = BTreeMap<AggregationKey, RawStats>;

pub(crate) fn add_raw(stats: &mut RawStats, field: impl Into<String>, value: u64) {
    *stats.entry(field.into()).or_insert(0) += value;
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("unexpected object name {0}")]
    BadObjectName(String),
    #[error("failed reading log data: {0}")]
    Read(#[from] io::Error),
    #[error("no plugin named {0}")]
    UnknownPlugin(String),
    #[error("plugin {0} is enabled more than once")]
    DuplicatePlugin(&'static str),
}

/// A log format the processor knows how to turn into hourly statistics
pub trait LogPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Name of the object grouping this plugin's fields in JSON output
    fn json_group(&self) -> &'static str;

    /// Extract hourly statistics from one log object
    fn parse(
        &self,
        lines: LineStream,
        account: &str,
        container: &str,
        object_name: &str,
    ) -> Result<PartialStatistics, PluginError>;

    /// Output fields this plugin contributes, and the raw fields behind them
    fn keylist_mapping(&self) -> KeylistMapping;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PluginKind {
    Access,
    Stats,
}

impl PluginKind {
    pub fn name(&self) -> &'static str {
        match self {
            PluginKind::Access => "access",
            PluginKind::Stats => "stats",
        }
    }
}

impl FromStr for PluginKind {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(PluginKind::Access),
            "stats" => Ok(PluginKind::Stats),
            other => Err(PluginError::UnknownPlugin(other.to_string())),
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One enabled plugin and the container its logs are read from
#[derive(Debug, Clone)]
pub struct PluginSpec {
    pub kind: PluginKind,
    pub account: String,
    pub container: String,
}

/// Everything needed to build plugin instances. Cheap to clone, so every map
/// worker can build its own set.
#[derive(Debug, Clone)]
pub struct PluginSettings {
    pub enabled: Vec<PluginSpec>,
    pub access: AccessPluginConfig,
    pub time_zone: Tz,
}

impl PluginSettings {
    pub fn build(&self) -> PluginSet {
        let plugins = self
            .enabled
            .iter()
            .map(|spec| {
                let plugin: Arc<dyn LogPlugin> = match spec.kind {
                    PluginKind::Access => {
                        Arc::new(AccessPlugin::new(self.access.clone(), self.time_zone))
                    }
                    PluginKind::Stats => Arc::new(StatsPlugin::new()),
                };
                (spec.kind, plugin)
            })
            .collect();
        PluginSet { plugins }
    }

    pub fn sources(&self) -> Vec<LogSource> {
        self.enabled
            .iter()
            .map(|spec| LogSource {
                plugin_name: spec.kind.name().to_string(),
                account: spec.account.clone(),
                container: spec.container.clone(),
            })
            .collect()
    }
}

/// Instantiated plugins, in configuration order
#[derive(Clone)]
pub struct PluginSet {
    plugins: Vec<(PluginKind, Arc<dyn LogPlugin>)>,
}

impl PluginSet {
    pub fn get(&self, name: &str) -> Result<Arc<dyn LogPlugin>, PluginError> {
        self.plugins
            .iter()
            .find(|(kind, _)| kind.name() == name)
            .map(|(_, plugin)| plugin.clone())
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn LogPlugin>> {
        self.plugins.iter().map(|(_, plugin)| plugin)
    }

    /// Every plugin's mapping merged into one
    pub fn keylist_mapping(&self) -> KeylistMapping {
        let mut mapping = KeylistMapping::new();
        for plugin in self.iter() {
            mapping.merge(plugin.keylist_mapping());
        }
        mapping
    }
}
