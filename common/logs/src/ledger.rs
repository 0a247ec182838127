use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::sync::Arc;

use common_s3::{ObjectStore, S3Error};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use thiserror::Error;
use tracing::{debug, info};

use crate::SourceIdentity;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("processed files list {name} could not be read: {source}")]
    Unavailable { name: String, source: S3Error },
    #[error("processed files list {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },
    #[error("processed files list {name} could not be stored: {source}")]
    Store { name: String, source: S3Error },
    #[error("failed to encode processed files list: {0}")]
    Encode(#[from] std::io::Error),
}

/// The set of inputs that have already been folded into a published artifact.
///
/// The set grows without bound. There is no safe way to decide when an entry can be
/// dropped (the lookback settings can change between runs), so pruning is left to
/// operators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    processed: BTreeSet<SourceIdentity>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, identity: &SourceIdentity) -> bool {
        self.processed.contains(identity)
    }

    /// Returns false if the identity was already recorded
    pub fn insert(&mut self, identity: SourceIdentity) -> bool {
        self.processed.insert(identity)
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }

    /// Gzipped JSON array, sorted, so equal ledgers encode to equal bytes
    pub fn to_blob(&self) -> Result<Vec<u8>, LedgerError> {
        let json = serde_json::to_vec(&self.processed)
            .map_err(|e| LedgerError::Encode(std::io::Error::other(e)))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    pub fn from_blob(name: &str, blob: &[u8]) -> Result<Self, LedgerError> {
        let corrupt = |reason: String| LedgerError::Corrupt {
            name: name.to_string(),
            reason,
        };
        let mut json = Vec::new();
        GzDecoder::new(blob)
            .read_to_end(&mut json)
            .map_err(|e| corrupt(e.to_string()))?;
        let processed = serde_json::from_slice(&json).map_err(|e| corrupt(e.to_string()))?;
        Ok(Self { processed })
    }
}

impl FromIterator<SourceIdentity> for Ledger {
    fn from_iter<T: IntoIterator<Item = SourceIdentity>>(iter: T) -> Self {
        Self {
            processed: iter.into_iter().collect(),
        }
    }
}

/// Where a ledger lives: one object, read once per run and replaced wholesale at the end.
///
/// Only one daemon per pipeline may run at a time; concurrent runs would race on the
/// final overwrite and one run's additions would be lost.
#[derive(Clone)]
pub struct LedgerStore {
    store: Arc<dyn ObjectStore>,
    account: String,
    container: String,
    object_name: String,
}

impl LedgerStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        account: impl Into<String>,
        container: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            account: account.into(),
            container: container.into(),
            object_name: object_name.into(),
        }
    }

    fn name(&self) -> String {
        format!("{}/{}/{}", self.account, self.container, self.object_name)
    }

    /// A missing ledger is an empty one; any other read failure means we don't know
    /// what has been processed, and the caller must not proceed.
    pub async fn load(&self) -> Result<Ledger, LedgerError> {
        let blob = match self
            .store
            .get_object(&self.account, &self.container, &self.object_name)
            .await
        {
            Ok(blob) => blob,
            Err(S3Error::NotFound(_)) => {
                info!("No processed files list at {}, starting empty", self.name());
                return Ok(Ledger::new());
            }
            Err(source) => {
                return Err(LedgerError::Unavailable {
                    name: self.name(),
                    source,
                })
            }
        };
        let ledger = Ledger::from_blob(&self.name(), &blob)?;
        debug!("found {} processed files", ledger.len());
        Ok(ledger)
    }

    pub async fn save(&self, ledger: &Ledger) -> Result<(), LedgerError> {
        let blob = ledger.to_blob()?;
        self.store
            .put_object(&self.account, &self.container, &self.object_name, blob)
            .await
            .map_err(|source| LedgerError::Store {
                name: self.name(),
                source,
            })?;
        debug!("stored {} processed files to {}", ledger.len(), self.name());
        Ok(())
    }
}
