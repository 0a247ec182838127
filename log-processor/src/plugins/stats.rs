use common_logs::stream::LineStream;
use tracing::debug;

use super::{add_raw, AggregationKey, LogPlugin, PartialStatistics, PluginError};
use crate::keylist::KeylistMapping;

const FIELDS: [&str; 4] = ["bytes_used", "container_count", "object_count", "replica_count"];

/// Account usage from the account stats collector's CSV output
#[derive(Debug, Default)]
pub struct StatsPlugin;

impl StatsPlugin {
    pub fn new() -> Self {
        Self
    }
}

/// `"account",container_count,object_count,bytes_used`, quotes optional on every field
fn parse_line(line: &str) -> Option<(String, u64, u64, u64)> {
    let mut fields = line.split(',').map(|f| f.trim_matches('"'));
    let account = fields.next()?.to_string();
    let mut number = || fields.next()?.parse::<u64>().ok();
    Some((account, number()?, number()?, number()?))
}

/// Objects are named `YYYY/MM/DD/HH/<file>` by the collector upload
fn hour_of(object_name: &str) -> Option<(i32, u32, u32, u32)> {
    let parts: Vec<&str> = object_name.split('/').collect();
    let [year, month, day, hour, _] = parts[..] else {
        return None;
    };
    Some((
        year.parse().ok()?,
        month.parse().ok()?,
        day.parse().ok()?,
        hour.parse().ok()?,
    ))
}

impl LogPlugin for StatsPlugin {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn json_group(&self) -> &'static str {
        "account_stats"
    }

    fn parse(
        &self,
        lines: LineStream,
        _account: &str,
        _container: &str,
        object_name: &str,
    ) -> Result<PartialStatistics, PluginError> {
        let (year, month, day, hour) = hour_of(object_name)
            .ok_or_else(|| PluginError::BadObjectName(object_name.to_string()))?;

        let mut totals = PartialStatistics::new();
        for line in lines {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let Some((account, container_count, object_count, bytes_used)) = parse_line(&line)
            else {
                debug!("Bad line data: {line:?}");
                continue;
            };
            let stats = totals
                .entry(AggregationKey::new(account, year, month, day, hour))
                .or_default();
            add_raw(stats, "replica_count", 1);
            add_raw(stats, "container_count", container_count);
            add_raw(stats, "object_count", object_count);
            add_raw(stats, "bytes_used", bytes_used);
        }
        Ok(totals)
    }

    fn keylist_mapping(&self) -> KeylistMapping {
        FIELDS
            .into_iter()
            .fold(KeylistMapping::new(), |mapping, field| mapping.single(field, field))
    }
}
