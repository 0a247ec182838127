//! Object storage client abstraction for the log pipeline services
//!
//! Objects are addressed by `(account, container, name)`, the way the log producers
//! lay them out. The real implementation maps every account into one S3 bucket using
//! `<account>/<container>/<name>` keys; a container is just a key prefix there.
//!
//! Follows the common-redis pattern: trait-based design with a manual in-memory
//! implementation that's always available for testing.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as AwsS3SdkClient;
use envconfig::Envconfig;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the sidecar object holding a container's metadata as a JSON object.
/// Listings never return it.
pub const CONTAINER_METADATA_OBJECT: &str = ".container-metadata.json";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum S3Error {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("S3 operation failed: {0}")]
    OperationFailed(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

impl From<aws_sdk_s3::Error> for S3Error {
    fn from(err: aws_sdk_s3::Error) -> Self {
        S3Error::OperationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for S3Error {
    fn from(err: serde_json::Error) -> Self {
        S3Error::ParseError(err.to_string())
    }
}

/// Object storage contract consumed by the pipeline. Retries are the implementation's
/// concern; callers treat every error as final for the current attempt.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List object names in a container in lexicographic order, restricted to
    /// `marker < name < end_marker` when the bounds are given.
    async fn list_objects(
        &self,
        account: &str,
        container: &str,
        marker: Option<&str>,
        end_marker: Option<&str>,
    ) -> Result<Vec<String>, S3Error>;

    /// Fetch the raw bytes of an object
    async fn get_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Vec<u8>, S3Error>;

    /// Single-shot upload; the object becomes visible to readers all at once or not at all
    async fn put_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        body: Vec<u8>,
    ) -> Result<(), S3Error>;

    /// Make sure the destination container can receive objects
    async fn ensure_container(&self, account: &str, container: &str) -> Result<bool, S3Error>;

    async fn get_container_metadata(
        &self,
        account: &str,
        container: &str,
    ) -> Result<HashMap<String, String>, S3Error>;
}

/// Connection settings shared by every service that talks to the log bucket
#[derive(Envconfig, Clone, Debug)]
pub struct S3Config {
    #[envconfig(from = "S3_BUCKET", default = "swift-logs")]
    pub s3_bucket: String,

    #[envconfig(from = "S3_REGION", default = "us-east-1")]
    pub s3_region: String,

    // Set for MinIO and other S3-compatible stores; enables path-style addressing
    #[envconfig(from = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,
}

/// Real S3 implementation
pub struct S3Impl {
    client: AwsS3SdkClient,
    bucket: String,
}

impl S3Impl {
    pub fn new(client: AwsS3SdkClient, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn from_config(config: &S3Config) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.s3_region.clone()));

        if let Some(endpoint) = &config.s3_endpoint {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.s3_endpoint.is_some() {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self::new(
            AwsS3SdkClient::from_conf(s3_config_builder.build()),
            config.s3_bucket.clone(),
        )
    }

    fn container_prefix(account: &str, container: &str) -> String {
        format!("{account}/{container}/")
    }

    fn object_key(account: &str, container: &str, name: &str) -> String {
        format!("{account}/{container}/{name}")
    }
}

#[async_trait]
impl ObjectStore for S3Impl {
    async fn list_objects(
        &self,
        account: &str,
        container: &str,
        marker: Option<&str>,
        end_marker: Option<&str>,
    ) -> Result<Vec<String>, S3Error> {
        let prefix = Self::container_prefix(account, container);
        debug!(
            "Listing keys in bucket {} with prefix {}",
            self.bucket, prefix
        );
        let mut names = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut cmd = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix.clone());
            if let Some(marker) = marker {
                cmd = cmd.start_after(format!("{prefix}{marker}"));
            }
            if let Some(token) = continuation_token {
                cmd = cmd.continuation_token(token);
            }
            let output = cmd.send().await.map_err(|e| {
                S3Error::OperationFailed(format!("Failed to list objects under {prefix}: {e}"))
            })?;

            let mut past_end = false;
            for key in output.contents.unwrap_or_default().into_iter().filter_map(|o| o.key) {
                let Some(name) = key.strip_prefix(&prefix) else {
                    continue;
                };
                if name == CONTAINER_METADATA_OBJECT {
                    continue;
                }
                // keys come back in lexicographic order, so nothing after this can match
                if end_marker.is_some_and(|end| name >= end) {
                    past_end = true;
                    break;
                }
                names.push(name.to_string());
            }

            match output.next_continuation_token {
                Some(token) if !past_end => continuation_token = Some(token),
                _ => break,
            }
        }
        Ok(names)
    }

    async fn get_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Vec<u8>, S3Error> {
        let key = Self::object_key(account, container, name);
        let get_object_output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let error_message = format!("Failed to get object from S3: {e}");
                if let aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_) =
                    e.into_service_error()
                {
                    S3Error::NotFound(key.clone())
                } else {
                    S3Error::OperationFailed(error_message)
                }
            })?;

        let body_bytes =
            get_object_output.body.collect().await.map_err(|e| {
                S3Error::OperationFailed(format!("Failed to read S3 object body: {e}"))
            })?;

        Ok(body_bytes.to_vec())
    }

    async fn put_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        body: Vec<u8>,
    ) -> Result<(), S3Error> {
        let key = Self::object_key(account, container, name);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body.into())
            .send()
            .await
            .map_err(|e| {
                S3Error::OperationFailed(format!("Failed to upload to S3 key {key}: {e}"))
            })?;
        debug!("Uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn ensure_container(&self, account: &str, container: &str) -> Result<bool, S3Error> {
        // containers are key prefixes, so all we can check is the bucket itself
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(
                    "Bucket {} unavailable for {}/{}: {}",
                    self.bucket, account, container, e
                );
                Ok(false)
            }
        }
    }

    async fn get_container_metadata(
        &self,
        account: &str,
        container: &str,
    ) -> Result<HashMap<String, String>, S3Error> {
        match self
            .get_object(account, container, CONTAINER_METADATA_OBJECT)
            .await
        {
            Ok(body) => Ok(serde_json::from_slice(&body)?),
            Err(S3Error::NotFound(_)) => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }
}

type ObjectKey = (String, String, String);

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectKey, Vec<u8>>,
    containers: BTreeSet<(String, String)>,
    metadata: HashMap<(String, String), HashMap<String, String>>,
    failing_listings: HashSet<(String, String)>,
    failing_gets: HashSet<ObjectKey>,
    failing_puts: bool,
    put_count: usize,
}

/// In-memory object store for testing - always available, no conditional compilation needed.
/// Clones share the same underlying state.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    state: Arc<RwLock<MemoryState>>,
}

fn key(account: &str, container: &str, name: &str) -> ObjectKey {
    (account.to_string(), container.to_string(), name.to_string())
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        // a poisoned lock only means a test panicked mid-write; the data is still usable
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        body: impl Into<Vec<u8>>,
    ) {
        let mut state = self.write();
        state
            .containers
            .insert((account.to_string(), container.to_string()));
        state.objects.insert(key(account, container, name), body.into());
    }

    pub fn object(&self, account: &str, container: &str, name: &str) -> Option<Vec<u8>> {
        self.read().objects.get(&key(account, container, name)).cloned()
    }

    /// All object names currently stored in a container, in lexicographic order
    pub fn object_names(&self, account: &str, container: &str) -> Vec<String> {
        self.read()
            .objects
            .keys()
            .filter(|(a, c, _)| a == account && c == container)
            .map(|(_, _, n)| n.clone())
            .collect()
    }

    pub fn set_container_metadata(
        &self,
        account: &str,
        container: &str,
        metadata: HashMap<String, String>,
    ) {
        self.write()
            .metadata
            .insert((account.to_string(), container.to_string()), metadata);
    }

    /// Make every listing of this container fail
    pub fn fail_listing(&self, account: &str, container: &str) {
        self.write()
            .failing_listings
            .insert((account.to_string(), container.to_string()));
    }

    /// Make every fetch of this object fail with a non-404 error
    pub fn fail_get(&self, account: &str, container: &str, name: &str) {
        self.write().failing_gets.insert(key(account, container, name));
    }

    pub fn fail_puts(&self, failing: bool) {
        self.write().failing_puts = failing;
    }

    /// Number of successful uploads so far
    pub fn put_count(&self) -> usize {
        self.read().put_count
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_objects(
        &self,
        account: &str,
        container: &str,
        marker: Option<&str>,
        end_marker: Option<&str>,
    ) -> Result<Vec<String>, S3Error> {
        let state = self.read();
        if state
            .failing_listings
            .contains(&(account.to_string(), container.to_string()))
        {
            return Err(S3Error::OperationFailed(format!(
                "listing {account}/{container} failed"
            )));
        }
        Ok(state
            .objects
            .keys()
            .filter(|(a, c, _)| a == account && c == container)
            .map(|(_, _, n)| n)
            .filter(|n| marker.map_or(true, |m| n.as_str() > m))
            .filter(|n| end_marker.map_or(true, |e| n.as_str() < e))
            .cloned()
            .collect())
    }

    async fn get_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Vec<u8>, S3Error> {
        let state = self.read();
        let object_key = key(account, container, name);
        if state.failing_gets.contains(&object_key) {
            return Err(S3Error::OperationFailed(format!(
                "fetching {account}/{container}/{name} failed"
            )));
        }
        state
            .objects
            .get(&object_key)
            .cloned()
            .ok_or_else(|| S3Error::NotFound(format!("{account}/{container}/{name}")))
    }

    async fn put_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        body: Vec<u8>,
    ) -> Result<(), S3Error> {
        let mut state = self.write();
        if state.failing_puts {
            return Err(S3Error::OperationFailed(format!(
                "uploading {account}/{container}/{name} failed"
            )));
        }
        state
            .containers
            .insert((account.to_string(), container.to_string()));
        state.objects.insert(key(account, container, name), body);
        state.put_count += 1;
        Ok(())
    }

    async fn ensure_container(&self, account: &str, container: &str) -> Result<bool, S3Error> {
        let mut state = self.write();
        if state.failing_puts {
            return Ok(false);
        }
        state
            .containers
            .insert((account.to_string(), container.to_string()));
        Ok(true)
    }

    async fn get_container_metadata(
        &self,
        account: &str,
        container: &str,
    ) -> Result<HashMap<String, String>, S3Error> {
        Ok(self
            .read()
            .metadata
            .get(&(account.to_string(), container.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
