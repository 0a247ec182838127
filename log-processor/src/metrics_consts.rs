/// Counter for completed runs, labelled with `outcome` (published/idle/failed)
pub const RUNS_COUNTER: &str = "log_processor_runs_total";

/// Histogram for the wall time of one run
pub const RUN_DURATION_HISTOGRAM: &str = "log_processor_run_duration_seconds";

/// Counter for reports uploaded, labelled with `format`
pub const ARTIFACTS_PUBLISHED_COUNTER: &str = "log_processor_artifacts_published_total";

/// Gauge for account-hour rows in the last published report
pub const REPORT_ROWS_GAUGE: &str = "log_processor_report_rows";
