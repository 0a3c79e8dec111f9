use crate::chunker::Chunker;
use crate::classifier::classify_page;
use crate::embeddings::{Embedder, DEFAULT_EMBED_BATCH};
use crate::error::IngestError;
use crate::extractor::{OcrEngine, PageDecoder};
use crate::index::bm25::{tokenize, Bm25Index};
use crate::index::hnsw::{HnswIndex, HnswParams};
use crate::index::store::{IndexManifest, SearchIndex};
use crate::index::EmbeddingMatrix;
use crate::models::{Chunk, ChunkerConfig, ExtractionStatus, PageStructure};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub doc_id: String,
    pub checksum: String,
    pub page_count: usize,
    pub chunk_count: usize,
    /// Pages whose extraction was degraded or failed, in page order.
    pub degraded_pages: Vec<u32>,
    pub created_at: DateTime<Utc>,
}

/// Full ingestion run: decode → classify → chunk → index → persist.
///
/// Always rebuilds from scratch and atomically replaces `output_dir`; any
/// failure before the final swap leaves the prior generation untouched.
pub async fn ingest(
    pdf_path: &Path,
    output_dir: &Path,
    decoder: &dyn PageDecoder,
    ocr: Option<&dyn OcrEngine>,
    embedder: &dyn Embedder,
    config: ChunkerConfig,
) -> Result<IngestionReport, IngestError> {
    let doc_id = derive_doc_id(pdf_path)?;
    let checksum = digest_file(pdf_path)?;

    let decoded = decoder.decode_pages(pdf_path)?;
    let page_count = decoded.len();

    let mut degraded_pages = Vec::new();
    let pages: Vec<PageStructure> = decoded
        .into_iter()
        .map(|page| {
            let structure = classify_page(page, pdf_path, ocr);
            if structure.extraction != ExtractionStatus::Full {
                degraded_pages.push(structure.page);
            }
            structure
        })
        .collect();
    if !degraded_pages.is_empty() {
        warn!(pages = ?degraded_pages, "pages with degraded extraction");
    }

    let chunker = Chunker::new(config)?;
    let chunks = chunker.chunk_pages(&doc_id, &pages);
    log_chunk_stats(&chunks);

    let corpus: Vec<Vec<String>> = chunks.iter().map(|chunk| tokenize(&chunk.text)).collect();
    let bm25 = Bm25Index::fit(&corpus);

    let embeddings = embed_chunks(embedder, &chunks).await?;
    let hnsw = HnswIndex::build(&embeddings, HnswParams::default());

    let created_at = Utc::now();
    let manifest = IndexManifest {
        doc_id: doc_id.clone(),
        checksum: checksum.clone(),
        chunk_count: chunks.len(),
        embedding_dim: embeddings.dim(),
        created_at,
    };
    let chunk_count = chunks.len();

    let index = SearchIndex {
        chunks,
        bm25,
        hnsw,
        embeddings,
        manifest,
    };
    index.persist(output_dir)?;

    Ok(IngestionReport {
        doc_id,
        checksum,
        page_count,
        chunk_count,
        degraded_pages,
        created_at,
    })
}

/// Embeds chunk texts in order-preserving batches. One failed batch fails
/// the run after a single retry, so a partial index is never persisted.
async fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: &[Chunk],
) -> Result<EmbeddingMatrix, IngestError> {
    let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
    let mut rows = Vec::with_capacity(texts.len());

    for batch in texts.chunks(DEFAULT_EMBED_BATCH) {
        let vectors = match embedder.embed_batch(batch).await {
            Ok(vectors) => vectors,
            Err(error) => {
                warn!(%error, "embedding batch failed, retrying once");
                embedder.embed_batch(batch).await?
            }
        };
        rows.extend(vectors);
        info!(embedded = rows.len(), total = texts.len(), "embedded chunk batch");
    }

    Ok(EmbeddingMatrix::from_rows(rows)?)
}

fn derive_doc_id(path: &Path) -> Result<String, IngestError> {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| {
            IngestError::InvalidArgument(format!("path missing filename: {}", path.display()))
        })?;

    let mut id = String::with_capacity(stem.len());
    for character in stem.chars() {
        if character.is_ascii_alphanumeric() {
            id.push(character.to_ascii_lowercase());
        } else if !id.ends_with('-') {
            id.push('-');
        }
    }
    let id = id.trim_matches('-').to_string();

    if id.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "cannot derive document id from {}",
            path.display()
        )));
    }
    Ok(id)
}

fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn log_chunk_stats(chunks: &[Chunk]) {
    if chunks.is_empty() {
        info!("document produced no chunks");
        return;
    }

    let min = chunks.iter().map(|chunk| chunk.token_count).min().unwrap_or(0);
    let max = chunks.iter().map(|chunk| chunk.token_count).max().unwrap_or(0);
    let total: usize = chunks.iter().map(|chunk| chunk.token_count).sum();
    info!(
        chunks = chunks.len(),
        min_tokens = min,
        max_tokens = max,
        mean_tokens = total / chunks.len(),
        "chunking finished"
    );
}
