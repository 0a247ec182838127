use common_logs::LedgerError;
use common_s3::S3Error;
use thiserror::Error;

use crate::output::OutputError;
use crate::publish::PublishError;

/// Failures that abort a whole run. Nothing is published and the processed files
/// list is left as it was.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("failed to list log objects: {0}")]
    Listing(#[source] S3Error),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}
