/// Histogram for the wall time of one delivery run
pub const RUN_DURATION_HISTOGRAM: &str = "access_log_delivery_run_duration_seconds";

/// Counter for per-container files uploaded into customer accounts
pub const FILES_DELIVERED_COUNTER: &str = "access_log_delivery_files_delivered_total";

/// Counter for per-container files that failed to upload and were left on disk
pub const DELIVERY_FAILURES_COUNTER: &str = "access_log_delivery_failures_total";

/// Counter for container metadata reads that missed the flag cache
pub const CONTAINER_FLAG_LOOKUPS_COUNTER: &str = "access_log_delivery_container_flag_lookups_total";
