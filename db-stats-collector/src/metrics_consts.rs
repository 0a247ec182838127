/// Histogram for the wall time of one collection, labelled with `stats_type`
pub const COLLECTION_DURATION_HISTOGRAM: &str = "db_stats_collection_duration_seconds";

/// Counter for shards that produced a stats row
pub const SHARDS_SCANNED_COUNTER: &str = "db_stats_shards_scanned_total";

/// Counter for shards left out, labelled with `reason` (deleted/error)
pub const SHARDS_SKIPPED_COUNTER: &str = "db_stats_shards_skipped_total";

/// Counter for devices left out, labelled with `reason` (unmounted/missing)
pub const DEVICES_SKIPPED_COUNTER: &str = "db_stats_devices_skipped_total";
