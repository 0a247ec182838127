use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use common_logs::settings::FormatType;
use common_s3::{ObjectStore, S3Error};
use flate2::{write::GzEncoder, Compression};
use metrics::counter;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::metrics_consts::ARTIFACTS_PUBLISHED_COUNTER;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("destination {account}/{container} is not available")]
    ContainerUnavailable { account: String, container: String },
    #[error("failed to compress output: {0}")]
    Compress(#[from] std::io::Error),
    #[error("failed to upload {name}: {source}")]
    Upload { name: String, source: S3Error },
}

/// SHA-256 of the uncompressed body, hex encoded
pub fn fingerprint(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("{hash:x}")
}

/// `YYYY/MM/DD/HH/<fingerprint>.<csv|json>.gz`, the hour being `now` in `tz`
pub fn artifact_name(now: DateTime<Utc>, tz: Tz, fingerprint: &str, format: FormatType) -> String {
    format!(
        "{}{fingerprint}.{}.gz",
        now.with_timezone(&tz).format("%Y/%m/%d/%H/"),
        format.extension()
    )
}

/// Gzip with a fixed header (no mtime, no name), so equal bodies compress to equal bytes
pub fn gzip(body: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

/// Uploads finished reports under content-derived names
#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn ObjectStore>,
    account: String,
    container: String,
    time_zone: Tz,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        account: impl Into<String>,
        container: impl Into<String>,
        time_zone: Tz,
    ) -> Self {
        Self {
            store,
            account: account.into(),
            container: container.into(),
            time_zone,
        }
    }

    /// Upload `body` in one put. Returns the artifact name. Publishing the same body
    /// within the same hour lands on the same name.
    pub async fn publish(
        &self,
        body: &[u8],
        format: FormatType,
        now: DateTime<Utc>,
    ) -> Result<String, PublishError> {
        let name = artifact_name(now, self.time_zone, &fingerprint(body), format);
        let compressed = gzip(body)?;

        let available = self
            .store
            .ensure_container(&self.account, &self.container)
            .await
            .map_err(|source| PublishError::Upload {
                name: name.clone(),
                source,
            })?;
        if !available {
            return Err(PublishError::ContainerUnavailable {
                account: self.account.clone(),
                container: self.container.clone(),
            });
        }

        self.store
            .put_object(&self.account, &self.container, &name, compressed)
            .await
            .map_err(|source| PublishError::Upload {
                name: name.clone(),
                source,
            })?;
        counter!(ARTIFACTS_PUBLISHED_COUNTER, "format" => format.extension()).increment(1);
        info!("Published {}/{}/{}", self.account, self.container, name);
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use chrono::TimeZone;
    use common_s3::MemoryObjectStore;
    use flate2::read::GzDecoder;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 23, 15, 0).unwrap()
    }

    #[test]
    fn test_artifact_name() {
        let fp = fingerprint(b"abc");
        assert_eq!(
            fp,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            artifact_name(now(), Tz::UTC, &fp, FormatType::Csv),
            format!("2024/01/01/23/{fp}.csv.gz")
        );
        // 23:15 UTC is already the next day in Tokyo
        assert_eq!(
            artifact_name(now(), Tz::Asia__Tokyo, "f", FormatType::Json),
            "2024/01/02/08/f.json.gz"
        );
    }

    #[tokio::test]
    async fn test_publish_is_deterministic() {
        let store = MemoryObjectStore::new();
        let publisher = Publisher::new(
            Arc::new(store.clone()),
            "stats",
            "log_processing_data",
            Tz::UTC,
        );
        let body = b"data_ts,account,x\n2024/01/01 05:00:00,a1,1";

        let first = publisher.publish(body, FormatType::Csv, now()).await.unwrap();
        let first_bytes = store.object("stats", "log_processing_data", &first).unwrap();
        let second = publisher.publish(body, FormatType::Csv, now()).await.unwrap();
        let second_bytes = store.object("stats", "log_processing_data", &second).unwrap();

        assert_eq!(first, second);
        assert_eq!(first_bytes, second_bytes);
        assert_eq!(store.object_names("stats", "log_processing_data"), vec![first]);

        let mut decoded = Vec::new();
        GzDecoder::new(first_bytes.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let store = MemoryObjectStore::new();
        store.fail_puts(true);
        let publisher = Publisher::new(Arc::new(store.clone()), "stats", "out", Tz::UTC);

        let result = publisher.publish(b"x", FormatType::Json, now()).await;
        assert!(matches!(result, Err(PublishError::ContainerUnavailable { .. })));
        assert!(store.object_names("stats", "out").is_empty());
    }
}
