//! Runtime options, deserialized from the protocol `init` arguments or built
//! from CLI flags. Every field has a default so `init` with no args works.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    chunking::{
        DEFAULT_MIN_WINDOW_SIZE,
        DEFAULT_WINDOW_SIZE,
        Overlap,
    },
    store::Modality,
};

/// Quiet period before a scheduled save runs, in milliseconds.
pub const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 5000;

/// Maximum candidate text length handed to the reranker, in characters.
pub const DEFAULT_RERANK_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    /// Name of the active collection and stem of the durable file.
    pub db_name: String,
    /// Where the durable file lives; defaults to the resolved data dir.
    pub storage_dir: Option<PathBuf>,
    /// Window size in tokens.
    pub chunk_size: usize,
    /// Minimum emitted window size in tokens.
    pub min_chunk_size: usize,
    /// Overlap between adjacent windows.
    pub overlap: Overlap,
    /// Quiet period before a debounced save fires.
    pub save_debounce_ms: u64,
    /// File extensions ingested per modality (lowercase, no dot).
    pub extensions: BTreeMap<Modality, Vec<String>>,
    pub embedding: ProviderOptions,
    pub rerank: RerankOptions,
}

impl Default for Options {
    fn default() -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert(
            Modality::Text,
            vec!["md".to_string(), "markdown".to_string(), "txt".to_string()],
        );
        extensions.insert(
            Modality::Image,
            vec![
                "png".to_string(),
                "jpg".to_string(),
                "jpeg".to_string(),
                "webp".to_string(),
            ],
        );

        Self {
            db_name: "nectar".to_string(),
            storage_dir: None,
            chunk_size: DEFAULT_WINDOW_SIZE,
            min_chunk_size: DEFAULT_MIN_WINDOW_SIZE,
            overlap: Overlap::default(),
            save_debounce_ms: DEFAULT_SAVE_DEBOUNCE_MS,
            extensions,
            embedding: ProviderOptions::default(),
            rerank: RerankOptions::default(),
        }
    }
}

impl Options {
    /// Map a file extension (lowercase, no dot) to its configured modality.
    pub fn modality_for_extension(&self, ext: &str) -> Option<Modality> {
        self.extensions
            .iter()
            .find(|(_, exts)| exts.iter().any(|e| e == ext))
            .map(|(modality, _)| *modality)
    }
}

/// Embedding provider endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderOptions {
    /// Base URL of an OpenAI-style embedding service.
    pub endpoint: String,
    pub text_model: String,
    /// Image embedding model; the image modality is unavailable without one.
    pub image_model: Option<String>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/v1".to_string(),
            text_model: "nomic-embed-text".to_string(),
            image_model: None,
        }
    }
}

/// Second-stage reranker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RerankOptions {
    pub enabled: bool,
    /// Base URL of the rerank service; falls back to the embedding endpoint.
    pub endpoint: Option<String>,
    pub model: String,
    /// Candidate text is truncated to this many characters before scoring.
    pub max_chars: usize,
}

impl Default for RerankOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            model: "bge-reranker-v2-m3".to_string(),
            max_chars: DEFAULT_RERANK_MAX_CHARS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_init_args_yield_defaults() {
        let options: Options = serde_json::from_str("{}").unwrap();
        assert_eq!(options.db_name, "nectar");
        assert_eq!(options.chunk_size, DEFAULT_WINDOW_SIZE);
        assert_eq!(options.save_debounce_ms, DEFAULT_SAVE_DEBOUNCE_MS);
        assert!(!options.rerank.enabled);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let options: Options = serde_json::from_value(serde_json::json!({
            "dbName": "notes",
            "chunkSize": 256,
            "overlap": 32,
            "rerank": { "enabled": true }
        }))
        .unwrap();

        assert_eq!(options.db_name, "notes");
        assert_eq!(options.chunk_size, 256);
        assert_eq!(options.overlap, Overlap::Tokens(32));
        assert_eq!(options.min_chunk_size, DEFAULT_MIN_WINDOW_SIZE);
        assert!(options.rerank.enabled);
        assert_eq!(options.rerank.max_chars, DEFAULT_RERANK_MAX_CHARS);
    }

    #[test]
    fn extension_classification() {
        let options = Options::default();
        assert_eq!(
            options.modality_for_extension("md"),
            Some(Modality::Text)
        );
        assert_eq!(
            options.modality_for_extension("png"),
            Some(Modality::Image)
        );
        assert_eq!(options.modality_for_extension("exe"), None);
    }
}
