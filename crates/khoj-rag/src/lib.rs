pub mod chunker;
pub mod citations;
pub mod client;
pub mod config;
pub mod converter;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod expansion;
pub mod reranking;
pub mod repository;
pub mod search;
pub mod store;
pub mod tokens;
pub mod types;

// Re-export primary types for convenience
pub use chunker::{Chunker, ChunkerConfig};
pub use citations::CitationRegistry;
pub use client::{DocumentUpdate, RagClient, RagClientBuilder, RebuildMode, SearchOptions};
pub use config::RagConfig;
pub use converter::{Converter, MarkdownConverter};
pub use document::{DocItem, ItemLabel, StructuredDocument};
pub use embeddings::{Embedder, ImageEmbedder};
pub use error::{Error, Result};
pub use reranking::Reranker;
pub use search::SearchType;
pub use store::{OpenOptions, Store, ENGINE_VERSION};
pub use types::{BoundingBox, Chunk, ChunkMetadata, Citation, Document, SearchResult};

pub use uuid::Uuid;
