//! The migration gate: version recording on open, refusal while upgrade
//! steps are pending, and the explicit migrate command.

mod common;

use khoj_rag::error::Error;
use khoj_rag::store::ENGINE_VERSION;

#[tokio::test]
async fn new_database_records_current_version() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;
    assert_eq!(client.store().engine_version(), ENGINE_VERSION);
    client.close().await;

    // Re-open at the same version: no error, version unchanged.
    let client = common::client_builder(dir.path(), common::test_config())
        .build()
        .await
        .unwrap();
    assert_eq!(client.store().engine_version(), ENGINE_VERSION);
    client.close().await;
}

#[tokio::test]
async fn version_bump_without_pending_steps_updates_silently() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;
    // Newer than every registered upgrade step.
    client.store().set_engine_version("100.0.0").await.unwrap();
    client.close().await;

    let client = common::client_builder(dir.path(), common::test_config())
        .build()
        .await
        .unwrap();
    // 100.0.0 >= current, so nothing happens and nothing errors.
    assert_eq!(client.store().engine_version(), "100.0.0");
    client.close().await;
}

#[tokio::test]
async fn pending_steps_block_open_until_migrate() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;
    client.store().set_engine_version("0.19.0").await.unwrap();
    client.close().await;

    // Open refuses: registered steps target versions above 0.19.0.
    let err = common::client_builder(dir.path(), common::test_config())
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MigrationRequired(_)), "got {err:?}");

    // Read-only open refuses too.
    let err = common::client_builder(dir.path(), common::test_config())
        .read_only(true)
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MigrationRequired(_)));

    // skip_migration_check bypasses the gate without migrating.
    let client = common::client_builder(dir.path(), common::test_config())
        .skip_migration_check(true)
        .build()
        .await
        .unwrap();
    assert_eq!(client.store().engine_version(), "0.19.0");

    // Explicit migrate applies the pending steps and stamps the version.
    let applied = client.migrate().await.unwrap();
    assert!(!applied.is_empty());
    for description in &applied {
        assert!(!description.is_empty());
    }
    assert_eq!(client.store().engine_version(), ENGINE_VERSION);
    client.close().await;

    // Subsequent plain open succeeds.
    let client = common::client_builder(dir.path(), common::test_config())
        .build()
        .await
        .unwrap();
    client.close().await;
}

#[tokio::test]
async fn migrate_with_nothing_pending_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;
    let applied = client.migrate().await.unwrap();
    assert!(applied.is_empty());
    client.close().await;
}

#[tokio::test]
async fn migrate_refused_on_read_only_store() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;
    client.store().set_engine_version("0.19.0").await.unwrap();
    client.close().await;

    let client = common::client_builder(dir.path(), common::test_config())
        .read_only(true)
        .skip_migration_check(true)
        .build()
        .await
        .unwrap();
    let err = client.migrate().await.unwrap_err();
    assert!(matches!(err, Error::ReadOnly));
    client.close().await;
}

#[tokio::test]
async fn embedder_dim_mismatch_refuses_open() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;
    client.close().await;

    let mut config = common::test_config();
    config.embeddings.vector_dim = 128;
    // The builder catches the embedder/config mismatch first, so pair the
    // config with a matching embedder dim to reach the stored-settings check.
    struct WideStub;
    #[async_trait::async_trait]
    impl khoj_rag::embeddings::Embedder for WideStub {
        async fn embed_documents(
            &self,
            texts: &[String],
        ) -> khoj_rag::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1; 128]).collect())
        }
        fn vector_dim(&self) -> usize {
            128
        }
        fn model_name(&self) -> &str {
            common::STUB_MODEL
        }
    }

    let err = khoj_rag::client::RagClient::builder(dir.path())
        .config(config)
        .embedder(std::sync::Arc::new(WideStub))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigValidation(_)), "got {err:?}");
}
