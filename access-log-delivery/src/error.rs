use common_logs::LedgerError;
use common_s3::S3Error;
use thiserror::Error;

/// Failures that abort a delivery run before anything is recorded as processed
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("failed to list source logs: {0}")]
    Listing(#[source] S3Error),
}
