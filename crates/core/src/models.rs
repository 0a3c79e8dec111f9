use serde::{Deserialize, Serialize};

/// A positioned text run with font metrics, as produced by the page decoder.
/// Ephemeral: consumed by the structural classifier and not persisted.
#[derive(Debug, Clone)]
pub struct TextRun {
    pub text: String,
    pub font_size: f32,
    pub bold: bool,
    pub page: u32,
}

/// A text run after classification. Heading and table runs are excluded from
/// chunk body text; `ocr` marks text recovered by the OCR fallback.
#[derive(Debug, Clone)]
pub struct LabeledRun {
    pub text: String,
    pub heading: bool,
    pub table: bool,
    pub ocr: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heading {
    pub text: String,
    /// 1 (top) through 3 (leaf), from font size tiers.
    pub level: u8,
    pub page: u32,
}

/// A detected table normalized to a flat markdown grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableBlock {
    pub markdown: String,
    pub rows: usize,
    pub cols: usize,
    pub page: u32,
}

/// Outcome of structural extraction for one page. Degradation is explicit
/// rather than silently substituting empty content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionStatus {
    Full,
    Degraded { reason: String },
    Failed { reason: String },
}

/// Per-page aggregate produced by the structural classifier and consumed by
/// the chunker. Created once per page per ingestion run, immutable after.
#[derive(Debug, Clone)]
pub struct PageStructure {
    pub page: u32,
    pub runs: Vec<LabeledRun>,
    pub headings: Vec<Heading>,
    pub tables: Vec<TableBlock>,
    pub extraction: ExtractionStatus,
}

/// A token-bounded contiguous span of document text with page-range and
/// heading-path provenance. Immutable once the chunker finalizes its output.
///
/// Invariant: `token_count` lies in `[min_tokens, max_tokens]` unless
/// `is_table` is set or the chunk is an unmergeable remainder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_index: usize,
    pub doc_id: String,
    /// Inclusive page range `[start, end]`.
    pub pages: [u32; 2],
    /// Root-to-leaf section headings, at most 3 entries.
    pub headings_path: Vec<String>,
    pub text: String,
    pub token_count: usize,
    #[serde(default)]
    pub is_table: bool,
}

/// One fused retrieval hit with provenance. Ranks are 1-based positions in
/// the source lists, absent when the chunk did not appear in that list.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub chunk_index: usize,
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub vector_rank: Option<usize>,
    pub headings_path: Vec<String>,
    pub pages: [u32; 2],
    pub text: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_tokens: 400,
            max_tokens: 1200,
            overlap_tokens: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Candidates taken from the lexical index (positive scores only).
    pub lexical_top: usize,
    /// Candidates taken from the vector index.
    pub vector_top: usize,
    /// Candidates surviving rank fusion.
    pub fused_top: usize,
    /// Final result count when the caller does not override it.
    pub default_k: usize,
    /// Rank-discount constant of reciprocal rank fusion.
    pub rrf_k: f64,
    /// Relevance-filter score needed to keep a candidate.
    pub keep_score: i32,
    /// Score that admits a single candidate when nothing reached `keep_score`.
    pub weak_score: i32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            lexical_top: 50,
            vector_top: 30,
            fused_top: 12,
            default_k: 6,
            rrf_k: 60.0,
            keep_score: 2,
            weak_score: 1,
        }
    }
}
