use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client as AwsS3SdkClient;
use common_s3::{ObjectStore, S3Error, S3Impl};

const TEST_BUCKET: &str = "test-bucket";
const S3_ENDPOINT: &str = "http://127.0.0.1:19000"; // MinIO

async fn create_test_store() -> (S3Impl, AwsS3SdkClient) {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .endpoint_url(S3_ENDPOINT)
        .region(Region::new("us-east-1"))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            "object_storage_root_user",
            "object_storage_root_password",
            None,
            None,
            "test",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&config)
        .force_path_style(true)
        .build();
    let aws_client = AwsS3SdkClient::from_conf(s3_config);
    let store = S3Impl::new(aws_client.clone(), TEST_BUCKET);
    (store, aws_client)
}

async fn ensure_bucket_exists(client: &AwsS3SdkClient) {
    // Try to create bucket, ignore if it already exists
    client.create_bucket().bucket(TEST_BUCKET).send().await.ok();
}

#[tokio::test]
#[ignore = "requires MinIO on 127.0.0.1:19000"]
async fn test_s3_put_list_get_round_trip() {
    let (store, aws_client) = create_test_store().await;
    ensure_bucket_exists(&aws_client).await;

    assert!(store.ensure_container("it-acct", "logs").await.unwrap());

    for name in ["2024/01/01/04/a", "2024/01/01/05/a", "2024/01/01/06/a"] {
        store
            .put_object("it-acct", "logs", name, name.as_bytes().to_vec())
            .await
            .unwrap();
    }

    let names = store
        .list_objects("it-acct", "logs", Some("2024/01/01/05"), Some("2024/01/01/06"))
        .await
        .unwrap();
    assert_eq!(names, vec!["2024/01/01/05/a"]);

    let body = store
        .get_object("it-acct", "logs", "2024/01/01/05/a")
        .await
        .unwrap();
    assert_eq!(body, b"2024/01/01/05/a");
}

#[tokio::test]
#[ignore = "requires MinIO on 127.0.0.1:19000"]
async fn test_s3_missing_object_is_not_found() {
    let (store, aws_client) = create_test_store().await;
    ensure_bucket_exists(&aws_client).await;

    let result = store.get_object("it-acct", "logs", "does/not/exist").await;
    assert!(matches!(result, Err(S3Error::NotFound(_))));

    let metadata = store
        .get_container_metadata("it-acct", "no-metadata")
        .await
        .unwrap();
    assert!(metadata.is_empty());
}
