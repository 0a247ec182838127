use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, FromRow};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("error accessing db {path}: {source}")]
    Sqlite { path: PathBuf, source: sqlx::Error },
    #[error("bad metadata in {path}: {source}")]
    Metadata {
        path: PathBuf,
        source: serde_json::Error,
    },
}

const ACCOUNT_STAT_COLUMNS: &str = "
    account,
    container_count,
    object_count,
    bytes_used,
    COALESCE(CAST(put_timestamp AS REAL), 0.0) AS put_timestamp,
    COALESCE(CAST(delete_timestamp AS REAL), 0.0) AS delete_timestamp,
    COALESCE(status, '') AS status
";

const CONTAINER_STAT_COLUMNS: &str = "
    account,
    container,
    object_count,
    bytes_used,
    COALESCE(CAST(put_timestamp AS REAL), 0.0) AS put_timestamp,
    COALESCE(CAST(delete_timestamp AS REAL), 0.0) AS delete_timestamp,
    COALESCE(metadata, '') AS metadata
";

/// The single row of an account shard's `account_stat` table
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct AccountStat {
    pub account: String,
    pub container_count: Option<i64>,
    pub object_count: i64,
    pub bytes_used: i64,
    pub put_timestamp: f64,
    pub delete_timestamp: f64,
    pub status: String,
}

impl AccountStat {
    pub fn is_deleted(&self) -> bool {
        self.status == "DELETED"
            || (self.container_count.unwrap_or(0) == 0
                && self.delete_timestamp > self.put_timestamp)
    }
}

/// The single row of a container shard's `container_stat` table
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ContainerStat {
    pub account: String,
    pub container: String,
    pub object_count: i64,
    pub bytes_used: i64,
    pub put_timestamp: f64,
    pub delete_timestamp: f64,
    /// JSON object of `key -> [value, timestamp]`
    pub metadata: String,
}

impl ContainerStat {
    pub fn is_deleted(&self) -> bool {
        self.object_count == 0 && self.delete_timestamp > self.put_timestamp
    }

    /// Metadata keys with a non-empty value. An empty column means no metadata.
    pub fn metadata_values(&self) -> Result<HashMap<String, String>, serde_json::Error> {
        if self.metadata.trim().is_empty() {
            return Ok(HashMap::new());
        }
        let raw: HashMap<String, Value> = serde_json::from_str(&self.metadata)?;
        Ok(raw
            .into_iter()
            .filter_map(|(key, entry)| {
                let value = match entry {
                    Value::Array(parts) => parts.into_iter().next()?,
                    other => other,
                };
                match value {
                    Value::String(s) if !s.is_empty() => Some((key, s)),
                    _ => None,
                }
            })
            .collect())
    }
}

/// Read-only handle on one account or container shard database
pub struct ShardBroker {
    path: PathBuf,
    conn: SqliteConnection,
}

impl ShardBroker {
    pub async fn open(path: &Path) -> Result<Self, BrokerError> {
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|source| BrokerError::Sqlite {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    fn sqlite_error(&self) -> impl FnOnce(sqlx::Error) -> BrokerError + '_ {
        move |source| BrokerError::Sqlite {
            path: self.path.clone(),
            source,
        }
    }

    pub async fn account_stat(&mut self) -> Result<AccountStat, BrokerError> {
        let query = format!("SELECT {ACCOUNT_STAT_COLUMNS} FROM account_stat");
        let row = sqlx::query_as::<_, AccountStat>(&query)
            .fetch_one(&mut self.conn)
            .await;
        row.map_err(self.sqlite_error())
    }

    pub async fn container_stat(&mut self) -> Result<ContainerStat, BrokerError> {
        let query = format!("SELECT {CONTAINER_STAT_COLUMNS} FROM container_stat");
        let row = sqlx::query_as::<_, ContainerStat>(&query)
            .fetch_one(&mut self.conn)
            .await;
        row.map_err(self.sqlite_error())
    }

    pub async fn close(self) -> Result<(), BrokerError> {
        let path = self.path;
        self.conn
            .close()
            .await
            .map_err(|source| BrokerError::Sqlite { path, source })
    }
}
