//! Reduce stage: sum partial statistics per bucket, then project raw fields onto the
//! public output fields.

use std::collections::{BTreeMap, BTreeSet};

use common_logs::{Ledger, SourceIdentity};
use tracing::warn;

use crate::keylist::{KeylistMapping, MappingTarget};
use crate::plugins::{AggregationKey, PartialStatistics};

/// Summed raw fields per bucket. Sums are u128 so adding u64 partials can't overflow
/// in practice.
pub type RawAggregate = BTreeMap<AggregationKey, BTreeMap<String, u128>>;

/// Final per-bucket values, one entry per output field of the mapping
pub type AggregatedBuckets = BTreeMap<AggregationKey, BTreeMap<String, u128>>;

/// Sum every partial result into per-bucket totals, recording each contributing
/// identity in `ledger`. This is the only place an input becomes "processed".
pub fn accumulate<I>(ledger: &mut Ledger, results: I) -> RawAggregate
where
    I: IntoIterator<Item = (SourceIdentity, PartialStatistics)>,
{
    let mut aggregate = RawAggregate::new();
    for (identity, partial) in results {
        // the identity includes the plugin, so a new plugin reprocesses old logs
        ledger.insert(identity);
        for (key, fields) in partial {
            let bucket = aggregate.entry(key).or_default();
            for (field, value) in fields {
                *bucket.entry(field).or_insert(0) += u128::from(value);
            }
        }
    }
    aggregate
}

/// Compute every output field for every bucket. A raw field a bucket never saw
/// counts as 0.
pub fn project(aggregate: &RawAggregate, mapping: &KeylistMapping) -> AggregatedBuckets {
    warn_unseen_fields(aggregate, mapping);
    aggregate
        .iter()
        .map(|(key, raw)| {
            let values = mapping
                .iter()
                .map(|(output, target)| {
                    let value: u128 = target
                        .raw_fields()
                        .map(|field| raw.get(field).copied().unwrap_or(0))
                        .sum();
                    (output.to_string(), value)
                })
                .collect();
            (key.clone(), values)
        })
        .collect()
}

/// A single-field mapping whose raw field shows up nowhere usually means a plugin
/// and the mapping disagree on field names
fn warn_unseen_fields(aggregate: &RawAggregate, mapping: &KeylistMapping) {
    if aggregate.is_empty() {
        return;
    }
    let seen: BTreeSet<&str> = aggregate
        .values()
        .flat_map(|raw| raw.keys().map(String::as_str))
        .collect();
    for (output, target) in mapping.iter() {
        if let MappingTarget::Single(field) = target {
            if !seen.contains(field.as_str()) {
                warn!(
                    output_field = output,
                    raw_field = field.as_str(),
                    "raw field never reported by any plugin, output will be 0"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;

    use super::*;

    fn identity(plugin: &str, name: &str) -> SourceIdentity {
        SourceIdentity::new(plugin, "stats", "logs", name)
    }

    fn partial(entries: &[(&str, u32, &[(&str, u64)])]) -> PartialStatistics {
        entries
            .iter()
            .map(|(account, hour, fields)| {
                (
                    AggregationKey::new(*account, 2024, 1, 1, *hour),
                    fields.iter().map(|(f, v)| (f.to_string(), *v)).collect(),
                )
            })
            .collect()
    }

    fn inputs() -> Vec<(SourceIdentity, PartialStatistics)> {
        vec![
            (
                identity("access", "1"),
                partial(&[("a1", 5, &[("GET", 5), ("PUT", 2)])]),
            ),
            (
                identity("access", "2"),
                partial(&[("a1", 5, &[("GET", 1)]), ("a2", 6, &[("PUT", 7)])]),
            ),
            (
                identity("stats", "3"),
                partial(&[("a1", 5, &[("object_count", 3), ("bytes_used", 120)])]),
            ),
            (
                identity("stats", "4"),
                partial(&[("a2", 6, &[("bytes_used", u64::MAX)])]),
            ),
            (
                identity("stats", "5"),
                partial(&[("a2", 6, &[("bytes_used", u64::MAX)])]),
            ),
        ]
    }

    #[test]
    fn test_accumulate_sums_and_records_identities() {
        let mut ledger = Ledger::new();
        let aggregate = accumulate(&mut ledger, inputs());

        assert_eq!(ledger.len(), 5);
        let a1 = &aggregate[&AggregationKey::new("a1", 2024, 1, 1, 5)];
        assert_eq!(a1["GET"], 6);
        assert_eq!(a1["PUT"], 2);
        assert_eq!(a1["object_count"], 3);
        let a2 = &aggregate[&AggregationKey::new("a2", 2024, 1, 1, 6)];
        assert_eq!(a2["bytes_used"], 2 * u128::from(u64::MAX));
    }

    #[test]
    fn test_order_does_not_change_result() {
        let expected = accumulate(&mut Ledger::new(), inputs());
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut shuffled = inputs();
            shuffled.shuffle(&mut rng);
            let mut ledger = Ledger::new();
            assert_eq!(accumulate(&mut ledger, shuffled), expected);
            assert_eq!(ledger.len(), 5);
        }
    }

    #[test]
    fn test_projection_treats_missing_raw_fields_as_zero() {
        let mut mapping = KeylistMapping::new()
            .single("object_count", "object_count")
            .single("never_seen", "nothing_reports_this");
        mapping.add_to_set("requests", "GET");
        mapping.add_to_set("requests", "PUT");

        let aggregate = accumulate(&mut Ledger::new(), inputs());
        let projected = project(&aggregate, &mapping);

        // a2 only ever saw PUT, so only one of the two raw fields is present
        let a2 = &projected[&AggregationKey::new("a2", 2024, 1, 1, 6)];
        assert_eq!(a2["requests"], 7);
        assert_eq!(a2["object_count"], 0);
        assert_eq!(a2["never_seen"], 0);
        assert_eq!(a2.len(), 3);

        let a1 = &projected[&AggregationKey::new("a1", 2024, 1, 1, 5)];
        assert_eq!(a1["requests"], 8);
        assert_eq!(a1["object_count"], 3);
    }

    #[test]
    fn test_projection_of_nothing_is_empty() {
        let mapping = KeylistMapping::new().single("x", "x");
        assert!(project(&RawAggregate::new(), &mapping).is_empty());
    }
}
