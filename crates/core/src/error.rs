use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("tokenizer init failed: {0}")]
    Tokenizer(String),

    #[error("embedding service error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("multimodal OCR failed: {0}")]
    OcrFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("index write failed: {0}")]
    IndexWrite(#[from] IndexError),
}

/// Failures while loading or writing a persisted index generation. A load
/// failure means "not ready", never a crash: the caller keeps serving the
/// previous generation if one is loaded.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index artifact missing: {0}")]
    Missing(String),

    #[error("index artifact corrupt: {0}")]
    Corrupt(String),

    #[error("index generation inconsistent: {0}")]
    Inconsistent(String),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("invalid response from embedding service: {0}")]
    InvalidResponse(String),
}

/// Per-query failures. An embedding-service outage is deliberately absent:
/// the retriever degrades that case to lexical-only ranking instead.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("query is empty")]
    EmptyQuery,
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
