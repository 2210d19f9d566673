//! Read-only stores reject every mutation fast and still serve reads.

mod common;

use khoj_rag::client::{DocumentUpdate, SearchOptions};
use khoj_rag::error::Error;
use khoj_rag::search::SearchType;

async fn seeded_read_only(
    dir: &std::path::Path,
) -> (khoj_rag::client::RagClient, String) {
    let client = common::open_client(dir).await;
    let doc = client
        .create_document(
            "Python is a programming language. It is widely used for web development.",
            Some("test://python"),
            Some("Python Guide"),
            None,
        )
        .await
        .unwrap();
    let id = doc.id.clone().unwrap();
    client.close().await;

    let read_only = common::client_builder(dir, common::test_config())
        .read_only(true)
        .build()
        .await
        .unwrap();
    (read_only, id)
}

#[tokio::test]
async fn reads_and_search_work_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let (client, id) = seeded_read_only(dir.path()).await;

    let doc = client.get_document_by_id(&id).await.unwrap().unwrap();
    assert_eq!(doc.title.as_deref(), Some("Python Guide"));

    for mode in [SearchType::Vector, SearchType::Fts, SearchType::Hybrid] {
        let results = client
            .search(
                "Python",
                &SearchOptions {
                    limit: Some(3),
                    search_type: mode,
                    filter: None,
                },
            )
            .await
            .unwrap();
        assert!(!results.is_empty(), "no results in {mode:?} mode");
        assert!(results[0].content.contains("Python"));
    }
    client.close().await;
}

#[tokio::test]
async fn mutations_fail_fast_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let (client, id) = seeded_read_only(dir.path()).await;

    let err = client
        .create_document("nope", None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly), "create: {err:?}");

    let err = client
        .update_document_fields(
            &id,
            DocumentUpdate {
                title: Some("New title".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly), "update: {err:?}");

    let err = client.delete_document(&id).await.unwrap_err();
    assert!(matches!(err, Error::ReadOnly), "delete: {err:?}");

    let err = client.vacuum(Some(0)).await.unwrap_err();
    assert!(matches!(err, Error::ReadOnly), "vacuum: {err:?}");

    let err = client.store().create_vector_index().await.unwrap_err();
    assert!(matches!(err, Error::ReadOnly), "index: {err:?}");

    // Nothing changed.
    let documents = client.list_documents(None, None, None).await.unwrap();
    assert_eq!(documents.len(), 1);
    client.close().await;
}
