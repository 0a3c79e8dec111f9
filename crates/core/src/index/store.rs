use crate::error::IndexError;
use crate::index::bm25::Bm25Index;
use crate::index::hnsw::HnswIndex;
use crate::index::EmbeddingMatrix;
use crate::models::Chunk;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

const META_FILE: &str = "meta.json";
const BM25_FILE: &str = "bm25.json";
const HNSW_FILE: &str = "hnsw.json";
const EMBEDDINGS_FILE: &str = "embeddings.bin";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub doc_id: String,
    pub checksum: String,
    pub chunk_count: usize,
    pub embedding_dim: usize,
    pub created_at: DateTime<Utc>,
}

/// One loaded index generation: chunk metadata, both retrieval structures,
/// and the raw embedding matrix. Read-only for the lifetime of a serving
/// process; a new ingestion run replaces the whole generation.
pub struct SearchIndex {
    pub chunks: Vec<Chunk>,
    pub bm25: Bm25Index,
    pub hnsw: HnswIndex,
    pub embeddings: EmbeddingMatrix,
    pub manifest: IndexManifest,
}

impl SearchIndex {
    /// Writes the generation into `dir`, staging everything in a sibling
    /// directory first so readers of `dir` never observe a partial state:
    /// the prior generation is replaced only after every artifact is on disk.
    pub fn persist(&self, dir: &Path) -> Result<(), IndexError> {
        let name = dir
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                IndexError::Inconsistent(format!("output dir has no name: {}", dir.display()))
            })?;
        let staging = dir.with_file_name(format!("{name}.staging"));
        let retired = dir.with_file_name(format!("{name}.old"));

        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        write_json(&staging.join(META_FILE), &self.chunks)?;
        write_json(&staging.join(BM25_FILE), &self.bm25)?;
        write_json(&staging.join(HNSW_FILE), &self.hnsw)?;
        write_matrix(&staging.join(EMBEDDINGS_FILE), &self.embeddings)?;
        write_json(&staging.join(MANIFEST_FILE), &self.manifest)?;

        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        if dir.exists() {
            fs::rename(dir, &retired)?;
        }
        fs::rename(&staging, dir)?;
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }

        info!(
            dir = %dir.display(),
            chunks = self.manifest.chunk_count,
            "index generation persisted"
        );
        Ok(())
    }

    /// Loads a generation read-only, validating that the artifacts belong
    /// together before anything is served from them.
    pub fn load(dir: &Path) -> Result<Self, IndexError> {
        let chunks: Vec<Chunk> = read_json(&dir.join(META_FILE))?;
        let bm25: Bm25Index = read_json(&dir.join(BM25_FILE))?;
        let hnsw: HnswIndex = read_json(&dir.join(HNSW_FILE))?;
        let embeddings = read_matrix(&dir.join(EMBEDDINGS_FILE))?;
        let manifest: IndexManifest = read_json(&dir.join(MANIFEST_FILE))?;

        let counts = [
            chunks.len(),
            bm25.len(),
            hnsw.len(),
            embeddings.len(),
            manifest.chunk_count,
        ];
        if counts.iter().any(|count| *count != chunks.len()) {
            return Err(IndexError::Inconsistent(format!(
                "artifact counts disagree: chunks={} bm25={} hnsw={} embeddings={} manifest={}",
                counts[0], counts[1], counts[2], counts[3], counts[4]
            )));
        }
        if embeddings.dim() != manifest.embedding_dim {
            return Err(IndexError::Inconsistent(format!(
                "embedding dim {} does not match manifest {}",
                embeddings.dim(),
                manifest.embedding_dim
            )));
        }

        Ok(Self {
            chunks,
            bm25,
            hnsw,
            embeddings,
            manifest,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), IndexError> {
    let bytes = serde_json::to_vec(value)?;
    fs::write(path, bytes)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, IndexError> {
    if !path.exists() {
        return Err(IndexError::Missing(path.display().to_string()));
    }
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|error| IndexError::Corrupt(format!("{}: {error}", path.display())))
}

/// Row-major little-endian f32 with a `[u32 count, u32 dim]` header.
fn write_matrix(path: &Path, matrix: &EmbeddingMatrix) -> Result<(), IndexError> {
    let mut bytes = Vec::with_capacity(8 + matrix.raw().len() * 4);
    bytes.extend_from_slice(&(matrix.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(matrix.dim() as u32).to_le_bytes());
    for value in matrix.raw() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    fs::write(path, bytes)?;
    Ok(())
}

fn read_matrix(path: &Path) -> Result<EmbeddingMatrix, IndexError> {
    if !path.exists() {
        return Err(IndexError::Missing(path.display().to_string()));
    }
    let bytes = fs::read(path)?;
    if bytes.len() < 8 {
        return Err(IndexError::Corrupt(format!(
            "{}: truncated header",
            path.display()
        )));
    }

    let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let dim = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let body = &bytes[8..];
    if body.len() != count * dim * 4 {
        return Err(IndexError::Corrupt(format!(
            "{}: expected {} matrix values, found {} bytes",
            path.display(),
            count * dim,
            body.len()
        )));
    }

    let data = body
        .chunks_exact(4)
        .map(|quad| f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
        .collect();
    let matrix = EmbeddingMatrix::from_raw(dim, data)?;
    if matrix.len() != count {
        return Err(IndexError::Corrupt(format!(
            "{}: header count {count} does not match {} rows",
            path.display(),
            matrix.len()
        )));
    }
    Ok(matrix)
}

/// Shared, swappable reference to the current index generation. Retrievals
/// clone the `Arc` once and keep observing one consistent generation even if
/// a reload swaps the handle mid-flight.
#[derive(Default)]
pub struct IndexHandle {
    inner: RwLock<Option<Arc<SearchIndex>>>,
}

impl IndexHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<SearchIndex>> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn swap(&self, index: Arc<SearchIndex>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = Some(index),
            Err(poisoned) => *poisoned.into_inner() = Some(index),
        }
    }

    /// Loads a generation from disk and swaps it in. On failure the handle is
    /// untouched: the previous generation, if any, keeps serving.
    pub fn reload_from(&self, dir: &Path) -> Result<usize, IndexError> {
        let index = SearchIndex::load(dir)?;
        let count = index.chunks.len();
        self.swap(Arc::new(index));
        Ok(count)
    }
}
