use std::collections::BTreeMap;

use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::aggregate::AggregatedBuckets;
use crate::keylist::KeylistMapping;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("csv serialization failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("json serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv writer failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Header `data_ts,account,<output fields sorted>`, then one row per bucket.
/// Rows are separated by newlines with no newline after the last one.
pub fn to_csv(
    buckets: &AggregatedBuckets,
    mapping: &KeylistMapping,
) -> Result<Vec<u8>, OutputError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(Vec::new());

    let fields: Vec<&str> = mapping.output_fields().collect();
    let mut header = vec!["data_ts", "account"];
    header.extend(&fields);
    writer.write_record(&header)?;

    for (key, values) in buckets {
        let mut row = vec![key.data_ts(), key.account.clone()];
        row.extend(
            fields
                .iter()
                .map(|field| values.get(*field).copied().unwrap_or(0).to_string()),
        );
        writer.write_record(&row)?;
    }

    let mut body = writer.into_inner().map_err(|e| e.into_error())?;
    if body.last() == Some(&b'\n') {
        body.pop();
    }
    Ok(body)
}

/// One plugin's share of the output fields, used to group them in JSON output
#[derive(Debug, Clone)]
pub struct JsonGroup {
    pub name: String,
    pub mapping: KeylistMapping,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    time_zone: &'a str,
    stats_data: BTreeMap<&'a str, BTreeMap<String, BTreeMap<&'a str, BTreeMap<&'a str, u128>>>>,
}

/// `{"time_zone": ..., "stats_data": {account: {"YYYY/MM/DD HH:00:00 +zzzz": {group: {field: value}}}}}`
///
/// A field declared by several plugins lands in the first group that declares it.
pub fn to_json(
    buckets: &AggregatedBuckets,
    groups: &[JsonGroup],
    tz: Tz,
) -> Result<Vec<u8>, OutputError> {
    let mut stats_data: BTreeMap<&str, BTreeMap<String, _>> = BTreeMap::new();
    for (key, values) in buckets {
        let Some(start) = key.local_start(tz) else {
            warn!(
                "Skipping {} at {}: hour does not exist in {}",
                key.account,
                key.data_ts(),
                tz
            );
            continue;
        };
        let mut hourly: BTreeMap<&str, BTreeMap<&str, u128>> = groups
            .iter()
            .map(|group| (group.name.as_str(), BTreeMap::new()))
            .collect();
        for (field, value) in values {
            let owner = groups.iter().find(|group| group.mapping.contains(field));
            if let Some(group) = owner {
                hourly
                    .entry(group.name.as_str())
                    .or_default()
                    .insert(field.as_str(), *value);
            }
        }
        stats_data
            .entry(key.account.as_str())
            .or_default()
            .insert(start.format("%Y/%m/%d %H:00:00 %z").to_string(), hourly);
    }

    let report = JsonReport {
        time_zone: tz.name(),
        stats_data,
    };
    Ok(serde_json::to_vec_pretty(&report)?)
}
