//! External collaborator seams: embedding providers, the reranker, and the
//! document extractor.
//!
//! The core never runs a model itself. Vectors and relevance scores come from
//! HTTP services speaking the common `/embeddings` and `/rerank` shapes, and
//! text comes from an extractor. Each seam is a trait so tests (and other
//! deployments) can swap the implementation.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    config::ProviderOptions,
    error::{Error, Result},
    store::Modality,
};

/// Turns text (or an image path) into a fixed-length vector.
///
/// One provider covers one modality; dimensionality is the provider's choice
/// and the store never inspects it.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, input: &str, modality: Modality) -> Result<Vec<f32>>;
}

/// Scores a `(query, candidate)` pair for second-stage relevance.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(&self, query: &str, candidate: &str) -> Result<f32>;
}

/// Text and companion data pulled out of a file.
#[derive(Debug, Clone, Default)]
pub struct Extracted {
    pub text: String,
    pub images: Vec<std::path::PathBuf>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Turns an arbitrary file into raw text plus optional images/metadata.
///
/// Extraction failures yield empty text rather than an error; the caller
/// tolerates empty text by producing zero chunks and zero insertions.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Extracted;
}

/// Reads the file as UTF-8 text. Anything unreadable extracts to nothing.
#[derive(Debug, Default)]
pub struct PlainTextExtractor;

impl DocumentExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Extracted {
        match std::fs::read_to_string(path) {
            Ok(text) => Extracted {
                text,
                ..Default::default()
            },
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "extraction failed, treating file as empty"
                );
                Extracted::default()
            }
        }
    }
}

type ProviderFactory =
    Box<dyn Fn(Modality) -> Result<Arc<dyn EmbeddingProvider>> + Send + Sync>;

/// Lazily initializes one embedding provider per modality and caches it.
///
/// The factory runs the first time a modality is requested and never again
/// for that modality; an already-cached handle is always reused.
pub struct ProviderRegistry {
    factory: ProviderFactory,
    handles: Mutex<HashMap<Modality, Arc<dyn EmbeddingProvider>>>,
}

impl ProviderRegistry {
    pub fn new(factory: ProviderFactory) -> Self {
        Self {
            factory,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Registry backed by HTTP providers built from `options`.
    ///
    /// The text modality is always available; the image modality only when an
    /// image model is configured — requesting it otherwise fails that call
    /// with a configuration error, not the process.
    pub fn http(options: ProviderOptions) -> Self {
        let client = reqwest::Client::new();

        Self::new(Box::new(move |modality| {
            let model = match modality {
                Modality::Text => options.text_model.clone(),
                Modality::Image => {
                    options.image_model.clone().ok_or_else(|| {
                        Error::Config(
                            "no image model configured".to_string(),
                        )
                    })?
                }
            };

            Ok(Arc::new(HttpEmbeddingProvider {
                client: client.clone(),
                endpoint: options.endpoint.clone(),
                model,
            }) as Arc<dyn EmbeddingProvider>)
        }))
    }

    /// Pre-seed a modality, bypassing the factory. Used by tests.
    pub fn with_provider(
        self,
        modality: Modality,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        self.handles
            .lock()
            .expect("provider registry lock poisoned")
            .insert(modality, provider);
        self
    }

    fn provider_for(
        &self,
        modality: Modality,
    ) -> Result<Arc<dyn EmbeddingProvider>> {
        let mut handles = self
            .handles
            .lock()
            .expect("provider registry lock poisoned");

        if let Some(handle) = handles.get(&modality) {
            return Ok(handle.clone());
        }

        let handle = (self.factory)(modality)?;
        handles.insert(modality, handle.clone());
        tracing::debug!(%modality, "initialized embedding provider");
        Ok(handle)
    }

    pub async fn embed(
        &self,
        input: &str,
        modality: Modality,
    ) -> Result<Vec<f32>> {
        let provider = self.provider_for(modality)?;
        provider.embed(input, modality).await
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry").finish_non_exhaustive()
    }
}

/// OpenAI-style `POST {endpoint}/embeddings` provider.
struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(
        &self,
        input: &str,
        _modality: Modality,
    ) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.endpoint.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": [input],
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("request failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Embedding(format!("provider error: {e}")))?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("bad response: {e}")))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| {
                Error::Embedding("provider returned no embedding".to_string())
            })
    }
}

/// `POST {endpoint}/rerank` relevance scorer (Jina/Cohere shape).
pub struct HttpReranker {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpReranker {
    pub fn new(endpoint: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            model,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    relevance_score: f32,
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, candidate: &str) -> Result<f32> {
        let url = format!("{}/rerank", self.endpoint.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": [candidate],
            "top_n": 1,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Rerank(format!("request failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Rerank(format!("provider error: {e}")))?;

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| Error::Rerank(format!("bad response: {e}")))?;

        parsed
            .results
            .first()
            .map(|r| r.relevance_score)
            .ok_or_else(|| {
                Error::Rerank("provider returned no score".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingProvider;

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed(
            &self,
            input: &str,
            _modality: Modality,
        ) -> Result<Vec<f32>> {
            Ok(vec![input.len() as f32])
        }
    }

    fn counting_registry() -> (ProviderRegistry, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = ProviderRegistry::new(Box::new(move |_modality| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingProvider) as Arc<dyn EmbeddingProvider>)
        }));
        (registry, calls)
    }

    #[tokio::test]
    async fn registry_initializes_each_modality_once() {
        let (registry, calls) = counting_registry();

        registry.embed("one", Modality::Text).await.unwrap();
        registry.embed("two", Modality::Text).await.unwrap();
        registry.embed("three", Modality::Text).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registry.embed("img", Modality::Image).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsupported_modality_fails_that_call_only() {
        let registry = ProviderRegistry::new(Box::new(|modality| {
            match modality {
                Modality::Text => {
                    Ok(Arc::new(CountingProvider)
                        as Arc<dyn EmbeddingProvider>)
                }
                Modality::Image => Err(Error::Config(
                    "no image model configured".to_string(),
                )),
            }
        }));

        assert!(registry.embed("x", Modality::Image).await.is_err());
        // The text path still works afterwards.
        assert!(registry.embed("x", Modality::Text).await.is_ok());
    }

    #[test]
    fn plain_text_extractor_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("note.md");
        std::fs::write(&path, "# Title\n\nBody.").unwrap();

        let extracted = PlainTextExtractor.extract(&path);
        assert!(extracted.text.contains("Body."));
    }

    #[test]
    fn plain_text_extractor_failure_yields_empty_text() {
        let extracted =
            PlainTextExtractor.extract(Path::new("/no/such/file.md"));
        assert!(extracted.text.is_empty());
    }
}
