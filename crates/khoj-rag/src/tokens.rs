use std::path::Path;

use crate::error::{Error, Result};

/// Token counting abstraction used by the chunker to enforce its budget.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Four-characters-per-token approximation. Used when no tokenizer file is
/// configured; close enough for budget enforcement on western text.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            0
        } else {
            chars.div_ceil(4)
        }
    }
}

/// Exact counting through a HuggingFace tokenizer file (`tokenizer.json`).
pub struct HfTokenCounter {
    tokenizer: tokenizers::Tokenizer,
}

impl HfTokenCounter {
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| Error::InvalidInput(format!("failed to load tokenizer: {e}")))?;
        Ok(Self { tokenizer })
    }
}

impl TokenCounter for HfTokenCounter {
    fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            // Encoding failures fall back to the heuristic rather than
            // aborting a chunking run.
            Err(_) => HeuristicCounter.count(text),
        }
    }
}
