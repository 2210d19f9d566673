use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chunker::ChunkerConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RagConfig {
    pub storage: StorageConfig,
    pub embeddings: EmbeddingConfig,
    pub multimodal: MultimodalConfig,
    pub processing: ProcessingConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub auto_vacuum: bool,
    /// History older than this is pruned by a default vacuum.
    pub vacuum_retention_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("khoj-rag");
        Self {
            data_dir,
            auto_vacuum: true,
            vacuum_retention_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub vector_dim: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model: "qwen3-embedding:4b".to_string(),
            vector_dim: 2560,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultimodalConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub vector_dim: usize,
    /// Images per embedding request.
    pub embed_batch_size: usize,
}

impl Default for MultimodalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:8000".to_string(),
            model: "Qwen/Qwen3-VL-Embedding-2B".to_string(),
            vector_dim: 2048,
            embed_batch_size: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    #[serde(flatten)]
    pub chunker: ChunkerConfig,
    /// Path to a HuggingFace `tokenizer.json`; the heuristic counter is
    /// used when unset.
    pub tokenizer_file: Option<PathBuf>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            tokenizer_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    L2,
    Dot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub limit: usize,
    /// Items/chunks of surrounding context added on each side during
    /// expansion; 0 disables expansion.
    pub context_radius: usize,
    pub max_context_items: usize,
    pub max_context_chars: usize,
    pub vector_index_metric: DistanceMetric,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            context_radius: 0,
            max_context_items: 10,
            max_context_chars: 10_000,
            vector_index_metric: DistanceMetric::Cosine,
        }
    }
}

impl RagConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.embeddings.vector_dim == 0 {
            return Err("embeddings.vector_dim must be > 0".into());
        }
        if self.processing.chunker.max_tokens == 0 {
            return Err("processing.max_tokens must be > 0".into());
        }
        if self.search.limit == 0 {
            return Err("search.limit must be > 0".into());
        }
        if self.search.max_context_items == 0 {
            return Err("search.max_context_items must be > 0".into());
        }
        if self.multimodal.enabled && self.multimodal.vector_dim == 0 {
            return Err("multimodal.vector_dim must be > 0".into());
        }
        Ok(())
    }

    /// Load from a JSON file; missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file: {e}"))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| format!("failed to parse config: {e}"))?;
        config.validate()?;
        Ok(config)
    }
}
