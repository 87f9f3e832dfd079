//! Path translation over a seeded user store.

#![allow(deprecated)]

use sluice_kernel::store::hash_password_with_cost;
use sluice_kernel::translate::translate_s3_path;
use sluice_kernel::{
    FilesystemConfig, FilesystemProvider, MemoryStore, SqliteStore, TranslateError, TranslateRequest, User,
    translate_path,
};

fn user(name: &str, filesystem: FilesystemConfig) -> User {
    let mut user = User::new(name, format!("/srv/{name}"));
    user.password_hash = hash_password_with_cost("secret", 4).unwrap();
    user.filesystem = filesystem;
    user
}

fn seeded() -> MemoryStore {
    let store = MemoryStore::new();
    store.add_user(user("s3user", FilesystemConfig::s3("bucket", "users/test1/", "us-west-1")));
    store.add_user(user("gcsuser", FilesystemConfig::gcs("gbucket", "data")));
    store.add_user(user("localuser", FilesystemConfig::local()));
    store
}

#[tokio::test]
async fn test_translate_s3_path() {
    let store = seeded();
    let response = translate_path(&store, TranslateRequest::new("s3user", "secret", "dir/test.csv"))
        .await
        .unwrap();
    assert_eq!(response.provider, FilesystemProvider::S3);
    assert_eq!(response.region.as_deref(), Some("us-west-1"));
    assert_eq!(response.bucket, "bucket");
    assert_eq!(response.key, "/users/test1/dir/test.csv");
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        serde_json::json!({
            "provider": "s3",
            "region": "us-west-1",
            "bucket": "bucket",
            "key": "/users/test1/dir/test.csv",
        })
    );
}

#[tokio::test]
async fn test_translate_rejects_traversal() {
    let store = seeded();
    for path in ["../test12/x.csv", "/../../etc/passwd", "a/../../test12"] {
        let err = translate_path(&store, TranslateRequest::new("s3user", "secret", path))
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::FilePathInvalid), "{path}: {err}");
        assert_eq!(err.status(), 400);
    }
}

#[tokio::test]
async fn test_translate_credentials() {
    let store = seeded();
    let err = translate_path(&store, TranslateRequest::new("s3user", "wrong", "a.csv"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Access Denied");
    assert_eq!(err.status(), 403);

    let err = translate_path(&store, TranslateRequest::new("nobody", "secret", "a.csv"))
        .await
        .unwrap_err();
    assert_eq!(err.status(), 404);
}

#[tokio::test]
async fn test_translate_provider_support() {
    let store = seeded();
    let gcs = translate_path(&store, TranslateRequest::new("gcsuser", "secret", "x/y"))
        .await
        .unwrap();
    assert_eq!(gcs.key, "/data/x/y");
    assert_eq!(gcs.region, None);

    let err = translate_path(&store, TranslateRequest::new("localuser", "secret", "a.csv"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "filesystem is not supported");

    let err = translate_s3_path(&store, TranslateRequest::new("gcsuser", "secret", "x/y"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "filesystem is not s3");
    assert!(
        translate_s3_path(&store, TranslateRequest::new("s3user", "secret", "x"))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_translate_over_sqlite_store() {
    let db = SqliteStore::in_memory().unwrap();
    db.upsert_user(&user("s3user", FilesystemConfig::s3("bucket", "users/test1", "")))
        .unwrap();
    let response = translate_path(&db, TranslateRequest::new("s3user", "secret", "/a.csv"))
        .await
        .unwrap();
    assert_eq!(response.key, "/users/test1/a.csv");
    assert_eq!(response.region, None);
}
