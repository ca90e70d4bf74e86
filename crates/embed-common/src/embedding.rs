/// Embedding model handle and loader.
///
/// `TextEncoder` is the opaque text -> vector function the service exposes. It owns no
/// concurrency logic: construction is guarded by [`crate::lazy::LazyModel`], and callers are
/// expected to run `encode` on a blocking thread because inference is CPU-bound.
///
/// The production implementation wraps fastembed's `TextEmbedding` (ONNX runtime). Documents
/// and queries share the same encode path, so both live in one vector space.
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::CommonError;

/// A loaded embedding model producing vectors of a fixed dimension.
pub trait TextEncoder: Send + Sync {
    /// Encode a single text. The returned vector always has `dimension()` elements.
    fn encode(&self, text: &str) -> Result<Vec<f32>, CommonError>;

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Builds a [`TextEncoder`]. Called at most once per successful initialization, always from a
/// blocking thread.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self) -> Result<Arc<dyn TextEncoder>, CommonError>;
}

impl<F> ModelLoader for F
where
    F: Fn() -> Result<Arc<dyn TextEncoder>, CommonError> + Send + Sync + 'static,
{
    fn load(&self) -> Result<Arc<dyn TextEncoder>, CommonError> {
        self()
    }
}

/// Models the server knows how to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingModelKind {
    AllMiniLmL6V2,
    BgeSmallEnV15,
    NomicEmbedTextV15,
}

impl EmbeddingModelKind {
    pub fn dimension(self) -> usize {
        match self {
            Self::AllMiniLmL6V2 | Self::BgeSmallEnV15 => 384,
            Self::NomicEmbedTextV15 => 768,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::AllMiniLmL6V2 => "all-MiniLM-L6-v2",
            Self::BgeSmallEnV15 => "bge-small-en-v1.5",
            Self::NomicEmbedTextV15 => "nomic-embed-text-v1.5",
        }
    }

    fn fastembed_model(self) -> fastembed::EmbeddingModel {
        match self {
            Self::AllMiniLmL6V2 => fastembed::EmbeddingModel::AllMiniLML6V2,
            Self::BgeSmallEnV15 => fastembed::EmbeddingModel::BGESmallENV15,
            Self::NomicEmbedTextV15 => fastembed::EmbeddingModel::NomicEmbedTextV15,
        }
    }
}

impl FromStr for EmbeddingModelKind {
    type Err = CommonError;

    /// Accepts the Hugging Face style names, with or without the organisation prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let name = name.rsplit('/').next().unwrap_or(name).to_ascii_lowercase();
        match name.as_str() {
            "all-minilm-l6-v2" => Ok(Self::AllMiniLmL6V2),
            "bge-small-en-v1.5" => Ok(Self::BgeSmallEnV15),
            "nomic-embed-text-v1.5" => Ok(Self::NomicEmbedTextV15),
            _ => Err(CommonError::Config(format!("unsupported embedding model: {s}"))),
        }
    }
}

/// fastembed-backed [`TextEncoder`].
pub struct FastEmbedModel {
    kind: EmbeddingModelKind,
    model: fastembed::TextEmbedding,
}

impl TextEncoder for FastEmbedModel {
    fn encode(&self, text: &str) -> Result<Vec<f32>, CommonError> {
        let mut results = self
            .model
            .embed(vec![text], None)
            .map_err(|e| CommonError::Encoding(e.to_string()))?;
        let embedding = results
            .pop()
            .ok_or_else(|| CommonError::Encoding("empty embedding result".to_string()))?;
        check_dimension(embedding, self.kind.dimension())
    }

    fn dimension(&self) -> usize {
        self.kind.dimension()
    }

    fn model_name(&self) -> &str {
        self.kind.name()
    }
}

/// Loads a [`FastEmbedModel`]. Downloads the model files on first run.
#[derive(Debug, Clone)]
pub struct FastEmbedLoader {
    pub kind: EmbeddingModelKind,
    pub cache_dir: Option<PathBuf>,
    pub show_download_progress: bool,
}

impl FastEmbedLoader {
    pub fn new(kind: EmbeddingModelKind) -> Self {
        Self {
            kind,
            cache_dir: None,
            show_download_progress: false,
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: Option<PathBuf>) -> Self {
        self.cache_dir = cache_dir;
        self
    }
}

impl ModelLoader for FastEmbedLoader {
    fn load(&self) -> Result<Arc<dyn TextEncoder>, CommonError> {
        let mut options = fastembed::InitOptions::new(self.kind.fastembed_model())
            .with_show_download_progress(self.show_download_progress);
        if let Some(dir) = &self.cache_dir {
            options = options.with_cache_dir(dir.clone());
        }
        let model = fastembed::TextEmbedding::try_new(options).map_err(|e| {
            CommonError::ModelInit(format!("{} initialization failed: {e}", self.kind.name()))
        })?;
        Ok(Arc::new(FastEmbedModel {
            kind: self.kind,
            model,
        }))
    }
}

/// Rejects vectors whose length differs from the model's declared dimension.
pub fn check_dimension(embedding: Vec<f32>, expected: usize) -> Result<Vec<f32>, CommonError> {
    if embedding.len() != expected {
        return Err(CommonError::Encoding(format!(
            "embedding dimension mismatch: expected {expected}, got {}",
            embedding.len()
        )));
    }
    Ok(embedding)
}
