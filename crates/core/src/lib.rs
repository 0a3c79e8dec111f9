pub mod chunker;
pub mod classifier;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod models;
pub mod retrieval;

pub use chunker::{merge_orphans, Chunker, TokenCounter};
pub use classifier::{classify_page, heading_level, is_heading, is_table_text, table_to_markdown};
pub use embeddings::{Embedder, EmbeddingConfig, OpenAiEmbedder, DEFAULT_EMBED_BATCH};
pub use error::{EmbeddingError, IndexError, IngestError, Result, SearchError};
pub use extractor::{
    DecodedPage, HttpOcrEngine, LopdfDecoder, OcrEngine, PageDecoder, TableCandidate,
};
pub use index::bm25::{tokenize, Bm25Index};
pub use index::hnsw::{HnswIndex, HnswParams};
pub use index::store::{IndexHandle, IndexManifest, SearchIndex};
pub use index::EmbeddingMatrix;
pub use ingest::{ingest, IngestionReport};
pub use models::{
    Chunk, ChunkerConfig, ExtractionStatus, Heading, LabeledRun, PageStructure, RetrievalConfig,
    RetrievalResult, TableBlock, TextRun,
};
pub use retrieval::HybridRetriever;
