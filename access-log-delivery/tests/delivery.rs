use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use access_log_delivery::delivery::{AccessLogDelivery, DeliverySettings, DELIVERY_PLUGIN_NAME};
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use common_logs::window::LookbackWindow;
use common_logs::{Ledger, LedgerStore, SourceIdentity};
use common_s3::MemoryObjectStore;
use flate2::read::GzDecoder;
use tempfile::TempDir;

const ACCOUNT: &str = "AUTH_logs";
const DATA_CONTAINER: &str = "access_log_delivery_data";
const SOURCE_CONTAINER: &str = "log_data";
const TARGET: &str = ".ACCESS_LOGS";
const FLAG: &str = "x-container-meta-access-log-delivery";

fn access_line(client_ip: &str, path: &str, log_source: Option<&str>) -> String {
    let mut fields = vec![
        "x",
        "proxy-server",
        client_ip,
        "4.5.6.7",
        "01/Jan/2024/05/30/15",
        "GET",
        path,
        "HTTP/1.0",
        "200",
        "-",
        "curl/7.0",
        "AUTH_tk",
        "6",
        "95",
        "-",
        "tx123",
        "-",
        "0.0050",
    ];
    if let Some(source) = log_source {
        fields.push(source);
    }
    format!("Jan  1 05:30:15 {}", fields.join(" "))
}

fn settings(working_dir: &Path) -> DeliverySettings {
    DeliverySettings {
        account: ACCOUNT.to_string(),
        container: DATA_CONTAINER.to_string(),
        processed_files_object_name: "processed_files.json.gz".to_string(),
        source_account: ACCOUNT.to_string(),
        source_container: SOURCE_CONTAINER.to_string(),
        target_container: TARGET.to_string(),
        metadata_key: FLAG.to_string(),
        server_name: "proxy-server".to_string(),
        working_dir: working_dir.to_path_buf(),
        buffer_limit: 1024,
        lock_timeout: Duration::from_millis(100),
        hidden_ips: vec!["9.9.9.9".to_string()],
        frequency: Duration::from_secs(3600),
        worker_count: 2,
        window: LookbackWindow::new(0, 0),
        time_zone: Tz::UTC,
    }
}

fn opt_in(store: &MemoryObjectStore, account: &str, container: &str, value: &str) {
    store.set_container_metadata(
        account,
        container,
        HashMap::from([(FLAG.to_string(), value.to_string())]),
    );
}

fn gunzip(body: &[u8]) -> String {
    let mut out = String::new();
    GzDecoder::new(body).read_to_string(&mut out).unwrap();
    out
}

fn delivered(store: &MemoryObjectStore, account: &str) -> Vec<(String, String)> {
    store
        .object_names(account, TARGET)
        .into_iter()
        .map(|name| {
            let body = store.object(account, TARGET, &name).unwrap();
            (name, gunzip(&body))
        })
        .collect()
}

fn source(object_name: &str) -> SourceIdentity {
    SourceIdentity::new(DELIVERY_PLUGIN_NAME, ACCOUNT, SOURCE_CONTAINER, object_name)
}

async fn processed(store: &MemoryObjectStore) -> Ledger {
    LedgerStore::new(
        Arc::new(store.clone()),
        ACCOUNT,
        DATA_CONTAINER,
        "processed_files.json.gz",
    )
    .load()
    .await
    .unwrap()
}

#[tokio::test]
async fn test_delivers_opted_in_containers() {
    let dir = TempDir::new().unwrap();
    let store = MemoryObjectStore::new();
    opt_in(&store, "a1", "c1", "True");
    opt_in(&store, "a2", "c1", "no");

    let lines = [
        access_line("1.2.3.4", "/v1/a1/c1/o1", None),
        access_line("9.9.9.9", "/v1/a1/c1/o2?foo=bar", Some("-")),
        // internal traffic is never delivered
        access_line("1.2.3.4", "/v1/a1/c1/o3", Some("container_sync")),
        access_line("1.2.3.4", "/v1/a2/c1/o1", None),
        // account level requests have no container to deliver into
        access_line("1.2.3.4", "/v1/a1", None),
        "garbage".to_string(),
    ];
    store.insert_object(
        ACCOUNT,
        SOURCE_CONTAINER,
        "2024/01/01/05/proxy.log",
        lines.join("\n"),
    );

    let delivery = AccessLogDelivery::new(Arc::new(store.clone()), settings(dir.path()));
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 7, 0, 0).unwrap();
    let summary = delivery.run_once(now).await.unwrap();
    assert_eq!(summary.files_to_process, 1);
    assert_eq!(summary.files_processed, 1);
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.delivery_failures, 0);

    let objects = delivered(&store, "a1");
    assert_eq!(objects.len(), 1);
    let (name, body) = &objects[0];
    assert!(name.starts_with("c1/2024/01/01/05/"));
    assert!(name.ends_with(".log.gz"));
    // uuid4 hex
    assert_eq!(name.len(), "c1/2024/01/01/05/".len() + 32 + ".log.gz".len());
    assert_eq!(
        body,
        "1.2.3.4 - - [01/01/2024:05:30:15 +0000] \"GET /v1/a1/c1/o1 HTTP/1.0\" 200 95 \"-\" \"curl/7.0\"\n\
         0.0.0.0 - - [01/01/2024:05:30:15 +0000] \"GET /v1/a1/c1/o2?foo=bar HTTP/1.0\" 200 95 \"-\" \"curl/7.0\"\n"
    );
    assert!(delivered(&store, "a2").is_empty());

    // uploaded files are removed from the working dir
    assert!(!dir.path().join("a1/c1/2024/01/01/05").exists());

    let ledger = processed(&store).await;
    assert_eq!(ledger.len(), 1);
    assert!(ledger.contains(&source("2024/01/01/05/proxy.log")));

    // nothing new to do on the next run
    let summary = delivery.run_once(now).await.unwrap();
    assert_eq!(summary.files_to_process, 0);
    assert_eq!(delivered(&store, "a1").len(), 1);
}

#[tokio::test]
async fn test_odd_object_names_are_marked_processed() {
    let dir = TempDir::new().unwrap();
    let store = MemoryObjectStore::new();
    opt_in(&store, "a1", "c1", "yes");
    store.insert_object(
        ACCOUNT,
        SOURCE_CONTAINER,
        "not-a-dated-name.log",
        access_line("1.2.3.4", "/v1/a1/c1/o1", None),
    );

    let delivery = AccessLogDelivery::new(Arc::new(store.clone()), settings(dir.path()));
    let summary = delivery.run_once(Utc::now()).await.unwrap();
    assert_eq!(summary.files_processed, 1);
    assert_eq!(summary.delivered, 0);
    assert!(delivered(&store, "a1").is_empty());
    assert_eq!(processed(&store).await.len(), 1);
}

#[tokio::test]
async fn test_failed_fetch_is_retried_next_run() {
    let dir = TempDir::new().unwrap();
    let store = MemoryObjectStore::new();
    opt_in(&store, "a1", "c1", "1");
    store.insert_object(
        ACCOUNT,
        SOURCE_CONTAINER,
        "2024/01/01/05/one.log",
        access_line("1.2.3.4", "/v1/a1/c1/o1", None),
    );
    store.insert_object(
        ACCOUNT,
        SOURCE_CONTAINER,
        "2024/01/01/06/two.log",
        access_line("1.2.3.4", "/v1/a1/c1/o2", None),
    );
    store.fail_get(ACCOUNT, SOURCE_CONTAINER, "2024/01/01/06/two.log");

    let delivery = AccessLogDelivery::new(Arc::new(store.clone()), settings(dir.path()));
    let summary = delivery.run_once(Utc::now()).await.unwrap();
    assert_eq!(summary.files_to_process, 2);
    assert_eq!(summary.files_processed, 1);
    assert_eq!(summary.files_failed, 1);
    assert_eq!(delivered(&store, "a1").len(), 1);

    let ledger = processed(&store).await;
    assert_eq!(ledger.len(), 1);
    assert!(ledger.contains(&source("2024/01/01/05/one.log")));
    assert!(!ledger.contains(&source("2024/01/01/06/two.log")));

    let summary = delivery.run_once(Utc::now()).await.unwrap();
    assert_eq!(summary.files_to_process, 1);
    assert_eq!(summary.files_failed, 1);
}

#[tokio::test]
async fn test_listing_failure_aborts_run() {
    let dir = TempDir::new().unwrap();
    let store = MemoryObjectStore::new();
    store.fail_listing(ACCOUNT, SOURCE_CONTAINER);

    let delivery = AccessLogDelivery::new(Arc::new(store.clone()), settings(dir.path()));
    assert!(delivery.run_once(Utc::now()).await.is_err());
    assert_eq!(store.put_count(), 0);
}
