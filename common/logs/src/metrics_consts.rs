// ==== Work enumeration and map stage ====
/// Counter for log objects found in the lookback window and not yet processed
pub const FILES_ENUMERATED_COUNTER: &str = "log_files_enumerated_total";

/// Counter for log objects a worker parsed successfully
pub const FILES_PROCESSED_COUNTER: &str = "log_files_processed_total";

/// Counter for log objects dropped because fetching or parsing failed
pub const FILES_FAILED_COUNTER: &str = "log_files_failed_total";

/// Histogram for the time a worker spent on one log object
pub const FILE_PROCESSING_DURATION_HISTOGRAM: &str = "log_file_processing_duration_seconds";

// ==== Ledger ====
/// Gauge for the number of identities in the processed files list
pub const LEDGER_SIZE_GAUGE: &str = "processed_files_ledger_size";

// ==== Buffered writer ====
/// Counter for file lock attempts that timed out during a flush
pub const FILE_LOCK_TIMEOUT_COUNTER: &str = "file_buffer_lock_timeouts_total";

/// Counter for bytes appended to destination files
pub const FILE_BUFFER_BYTES_WRITTEN_COUNTER: &str = "file_buffer_bytes_written_total";
