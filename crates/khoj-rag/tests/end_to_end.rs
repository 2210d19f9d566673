//! End-to-end ingestion and search scenarios against a real store.

mod common;

use std::sync::Arc;

use khoj_rag::client::SearchOptions;
use khoj_rag::search::SearchType;
use khoj_rag::types::Chunk;

#[tokio::test]
async fn created_document_is_found_with_title() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;

    let doc = client
        .create_document(
            "Python is a programming language. It is widely used for web development.",
            Some("test://python"),
            Some("Python Guide"),
            None,
        )
        .await
        .unwrap();
    assert!(doc.id.is_some());

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
        assert!(!results.is_empty(), "{mode:?} returned nothing");
        let top = &results[0];
        assert!(top.content.contains("Python"), "{mode:?}: {:?}", top.content);
        assert_eq!(top.document_title.as_deref(), Some("Python Guide"));
        assert_eq!(top.document_uri.as_deref(), Some("test://python"));
        assert!(top.score >= 0.0 && top.score <= 1.0);
    }
    client.close().await;
}

#[tokio::test]
async fn exact_content_match_ranks_top_in_every_mode() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;

    client
        .create_document("The quick brown fox jumps over the lazy dog.", None, None, None)
        .await
        .unwrap();
    client
        .create_document("Entirely unrelated text about databases.", None, None, None)
        .await
        .unwrap();
    client
        .create_document("Another passage concerning astronomy and stars.", None, None, None)
        .await
        .unwrap();

    let query = "The quick brown fox jumps over the lazy dog.";
    for mode in [SearchType::Vector, SearchType::Fts, SearchType::Hybrid] {
        let results = client
            .search(
                query,
                &SearchOptions {
                    limit: Some(3),
                    search_type: mode,
                    filter: None,
                },
            )
            .await
            .unwrap();
        let top3: Vec<&str> = results.iter().take(3).map(|r| r.content.as_str()).collect();
        assert!(
            top3.iter().any(|c| c.contains("quick brown fox")),
            "{mode:?} top-3 missed the exact match: {top3:?}"
        );
    }
    client.close().await;
}

#[tokio::test]
async fn document_filter_restricts_results() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;

    let python = client
        .create_document(
            "Python is a programming language used for web development.",
            Some("test://python"),
            Some("Python Guide"),
            None,
        )
        .await
        .unwrap();
    client
        .create_document(
            "Rust is a programming language focused on safety.",
            Some("test://rust"),
            Some("Rust Guide"),
            None,
        )
        .await
        .unwrap();

    let results = client
        .search(
            "programming language",
            &SearchOptions {
                limit: Some(10),
                search_type: SearchType::Hybrid,
                filter: Some("title = 'Python Guide'".into()),
            },
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
    for result in &results {
        assert_eq!(result.document_id, python.id);
    }

    // A filter matching nothing returns nothing.
    let results = client
        .search(
            "programming language",
            &SearchOptions {
                limit: Some(10),
                search_type: SearchType::Hybrid,
                filter: Some("title = 'No Such Guide'".into()),
            },
        )
        .await
        .unwrap();
    assert!(results.is_empty());

    // Malformed filters are rejected, not passed through.
    let err = client
        .search(
            "anything",
            &SearchOptions {
                limit: Some(5),
                search_type: SearchType::Hybrid,
                filter: Some("title = 'x'; DROP TABLE documents".into()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, khoj_rag::error::Error::InvalidInput(_)));
    client.close().await;
}

#[tokio::test]
async fn citation_indices_are_stable_across_calls() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;

    client
        .create_document(
            "Python is a programming language. It is widely used for web development.",
            Some("test://python"),
            Some("Python Guide"),
            None,
        )
        .await
        .unwrap();

    let options = SearchOptions {
        limit: Some(5),
        search_type: SearchType::Hybrid,
        filter: None,
    };
    let first = client.search("Python programming", &options).await.unwrap();
    let first_citations = client.cite(&first);

    let second = client.search("web development", &options).await.unwrap();
    let second_citations = client.cite(&second);

    let shared: Vec<_> = second_citations
        .iter()
        .filter(|c| first_citations.iter().any(|f| f.chunk_id == c.chunk_id))
        .collect();
    assert!(!shared.is_empty(), "expected overlapping chunks");
    for citation in shared {
        let original = first_citations
            .iter()
            .find(|f| f.chunk_id == citation.chunk_id)
            .unwrap();
        assert_eq!(citation.index, original.index);
    }

    // Registry serializes as a plain JSON object.
    let json: serde_json::Value =
        serde_json::from_str(&client.citation_registry_json().unwrap()).unwrap();
    assert!(json.is_object());
    client.close().await;
}

#[tokio::test]
async fn upsert_by_uri_compares_md5() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;

    let file = dir.path().join("notes.md");
    std::fs::write(&file, "# Notes\n\nOriginal body.\n").unwrap();

    let first = client
        .create_document_from_file(&file, Some("Notes"), None)
        .await
        .unwrap();
    let first_id = first.id.clone().unwrap();
    assert!(first.metadata.contains_key("md5"));
    assert_eq!(
        first.metadata["contentType"],
        serde_json::Value::String("text/markdown".into())
    );

    // Unchanged file: same document, no rechunk.
    let chunks_before = client
        .chunk_repository()
        .get_by_document_id(&first_id, None, None)
        .await
        .unwrap();
    let again = client
        .create_document_from_file(&file, Some("Notes"), None)
        .await
        .unwrap();
    assert_eq!(again.id.as_deref(), Some(first_id.as_str()));
    let chunks_after = client
        .chunk_repository()
        .get_by_document_id(&first_id, None, None)
        .await
        .unwrap();
    assert_eq!(
        chunks_before.iter().map(|c| &c.id).collect::<Vec<_>>(),
        chunks_after.iter().map(|c| &c.id).collect::<Vec<_>>()
    );

    // Changed content under the same uri: updated in place, rechunked.
    std::fs::write(&file, "# Notes\n\nRewritten body about gardening.\n").unwrap();
    let updated = client
        .create_document_from_file(&file, Some("Notes"), None)
        .await
        .unwrap();
    assert_eq!(updated.id.as_deref(), Some(first_id.as_str()));
    assert!(updated.content.contains("gardening"));
    let documents = client.list_documents(None, None, None).await.unwrap();
    assert_eq!(documents.len(), 1);
    client.close().await;
}

#[tokio::test]
async fn transient_embedding_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::client_builder(dir.path(), common::test_config())
        .create(true)
        .embedder(Arc::new(common::StubEmbedder::failing(2)))
        .build()
        .await
        .unwrap();

    // Two transient failures, third attempt succeeds.
    let doc = client
        .create_document("Retry survives transient failures.", None, None, None)
        .await
        .unwrap();
    assert!(doc.id.is_some());
    client.close().await;
}

#[tokio::test]
async fn ann_index_requires_enough_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;
    client
        .create_document("Just one small document.", None, None, None)
        .await
        .unwrap();
    // Below the row threshold: a no-op, not an error.
    assert!(!client.create_vector_index().await.unwrap());
    client.close().await;
}

#[tokio::test]
async fn content_fts_column_carries_heading_context() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;

    let mut chunk = Chunk::new("This is the raw chunk content.");
    chunk.metadata.headings = Some(vec!["Chapter 1".into(), "Section 1.1".into()]);
    client
        .import_document("body", vec![chunk], None, None, None, None, None)
        .await
        .unwrap();

    // Keyword search matches on the heading even though the returned
    // content stays raw.
    let results = client
        .search(
            "Chapter",
            &SearchOptions {
                limit: Some(1),
                search_type: SearchType::Fts,
                filter: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].content, "This is the raw chunk content.");
    client.close().await;
}

#[tokio::test]
async fn chunk_pagination_is_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;

    let chunks: Vec<Chunk> = (0..5)
        .map(|i| Chunk::new(format!("Chunk number {i}.")).with_order(i))
        .collect();
    let doc = client
        .import_document("five chunks", chunks, None, None, None, None, None)
        .await
        .unwrap();
    let doc_id = doc.id.unwrap();

    let repo = client.chunk_repository();
    assert_eq!(repo.count_by_document_id(&doc_id).await.unwrap(), 5);

    let all = repo.get_by_document_id(&doc_id, None, None).await.unwrap();
    assert_eq!(all.len(), 5);
    for (i, chunk) in all.iter().enumerate() {
        assert_eq!(chunk.order, i as u32);
    }

    let first_two = repo
        .get_by_document_id(&doc_id, Some(2), None)
        .await
        .unwrap();
    assert_eq!(first_two.len(), 2);
    assert_eq!(first_two[0].id, all[0].id);

    let next_two = repo
        .get_by_document_id(&doc_id, Some(2), Some(2))
        .await
        .unwrap();
    assert_eq!(next_two[0].id, all[2].id);

    let beyond = repo
        .get_by_document_id(&doc_id, Some(10), Some(100))
        .await
        .unwrap();
    assert!(beyond.is_empty());
    client.close().await;
}

#[tokio::test]
async fn rebuild_modes_preserve_documents() {
    let dir = tempfile::tempdir().unwrap();
    let client = common::open_client(dir.path()).await;

    let doc = client
        .create_document(
            "# Guide\n\nA body about rebuilding databases.",
            Some("test://rebuild"),
            Some("Rebuild Guide"),
            None,
        )
        .await
        .unwrap();
    let doc_id = doc.id.unwrap();

    for mode in [
        khoj_rag::client::RebuildMode::EmbedOnly,
        khoj_rag::client::RebuildMode::Rechunk,
        khoj_rag::client::RebuildMode::Full,
    ] {
        let processed = client.rebuild(mode).await.unwrap();
        assert_eq!(processed, vec![doc_id.clone()], "{mode:?}");
        let chunks = client
            .chunk_repository()
            .get_by_document_id(&doc_id, None, None)
            .await
            .unwrap();
        assert!(!chunks.is_empty(), "{mode:?} left no chunks");
    }
    client.close().await;
}
