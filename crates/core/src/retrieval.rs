use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::index::bm25::tokenize;
use crate::index::store::SearchIndex;
use crate::models::{RetrievalConfig, RetrievalResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Layer-0 beam width for ANN queries; comfortably above the candidate count.
const EF_SEARCH: usize = 64;

struct QueryExpansion {
    trigger: &'static str,
    terms: &'static str,
}

/// Ordered synonym table; the first trigger contained in the query appends
/// its block once, and no further expansion applies.
const EXPANSIONS: &[QueryExpansion] = &[
    QueryExpansion {
        trigger: "vacation",
        terms: "vacation annual leave time off rest relaxation",
    },
    QueryExpansion {
        trigger: "sick leave",
        terms: "sick leave illness medical health certificate",
    },
    QueryExpansion {
        trigger: "maternity",
        terms: "maternity leave pregnancy birth adoptive",
    },
    QueryExpansion {
        trigger: "performance",
        terms: "performance evaluation appraisal review management assessment",
    },
    QueryExpansion {
        trigger: "benefits",
        terms: "benefits compensation salary reward package allowance",
    },
    QueryExpansion {
        trigger: "termination",
        terms: "termination dismissal resignation cessation employment end",
    },
    QueryExpansion {
        trigger: "working hours",
        terms: "working hours schedule time attendance shift",
    },
    QueryExpansion {
        trigger: "disciplinary",
        terms: "disciplinary procedure misconduct relations employee",
    },
    QueryExpansion {
        trigger: "probation",
        terms: "probation probationary period employment orientation new",
    },
    QueryExpansion {
        trigger: "probationary",
        terms: "probation probationary period employment orientation new",
    },
];

struct RelevanceBucket {
    trigger: &'static str,
    keywords: &'static [&'static str],
}

/// Ordered topic buckets for the relevance filter, matched against the
/// original (non-expanded) query; first match wins.
const RELEVANCE: &[RelevanceBucket] = &[
    RelevanceBucket {
        trigger: "vacation",
        keywords: &["leave", "vacation", "annual", "time off", "attendance", "rest"],
    },
    RelevanceBucket {
        trigger: "sick",
        keywords: &["sick", "illness", "medical", "health", "leave", "certificate"],
    },
    RelevanceBucket {
        trigger: "maternity",
        keywords: &["maternity", "pregnancy", "leave", "birth", "adoptive"],
    },
    RelevanceBucket {
        trigger: "performance",
        keywords: &["performance", "evaluation", "appraisal", "review", "management"],
    },
    RelevanceBucket {
        trigger: "benefits",
        keywords: &["benefits", "compensation", "salary", "reward", "package", "allowance"],
    },
    RelevanceBucket {
        trigger: "termination",
        keywords: &["termination", "dismissal", "resignation", "cessation", "employment", "end"],
    },
    RelevanceBucket {
        trigger: "working hours",
        keywords: &["hours", "work", "schedule", "time", "attendance", "shift"],
    },
    RelevanceBucket {
        trigger: "disciplinary",
        keywords: &["disciplinary", "misconduct", "procedure", "relations", "employee"],
    },
    RelevanceBucket {
        trigger: "probation",
        keywords: &["probation", "probationary", "period", "employment", "orientation", "new"],
    },
    RelevanceBucket {
        trigger: "offered",
        keywords: &["benefits", "compensation", "salary", "reward", "package"],
    },
];

/// Appends the first matching synonym block to the query.
fn expand_query(query: &str) -> String {
    let lowered = query.to_lowercase();
    for expansion in EXPANSIONS {
        if lowered.contains(expansion.trigger) {
            return format!("{query} {}", expansion.terms);
        }
    }
    query.to_string()
}

#[derive(Debug, Clone)]
struct Candidate {
    ordinal: usize,
    score: f64,
    lexical_rank: Option<usize>,
    vector_rank: Option<usize>,
}

/// Reciprocal rank fusion of the two candidate lists. Every chunk present in
/// either list scores `sum over lists of 1/(k + rank)`; ties resolve by
/// ascending ordinal so fusion is deterministic.
fn fuse(
    lexical: &[(usize, f64)],
    vector: &[(usize, f64)],
    rrf_k: f64,
    top: usize,
) -> Vec<Candidate> {
    let mut merged: HashMap<usize, Candidate> = HashMap::new();

    for (position, (ordinal, _)) in lexical.iter().enumerate() {
        let rank = position + 1;
        let entry = merged.entry(*ordinal).or_insert(Candidate {
            ordinal: *ordinal,
            score: 0.0,
            lexical_rank: None,
            vector_rank: None,
        });
        entry.lexical_rank = Some(rank);
        entry.score += 1.0 / (rrf_k + rank as f64);
    }

    for (position, (ordinal, _)) in vector.iter().enumerate() {
        let rank = position + 1;
        let entry = merged.entry(*ordinal).or_insert(Candidate {
            ordinal: *ordinal,
            score: 0.0,
            lexical_rank: None,
            vector_rank: None,
        });
        entry.vector_rank = Some(rank);
        entry.score += 1.0 / (rrf_k + rank as f64);
    }

    let mut fused: Vec<Candidate> = merged.into_values().collect();
    fused.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.ordinal.cmp(&right.ordinal))
    });
    fused.truncate(top);
    fused
}

/// Serving-time hybrid retriever over one immutable index generation.
/// Safe for unsynchronized concurrent use; the only await is the embedding
/// service round trip, and its failure degrades the query to lexical-only
/// ranking instead of failing it.
pub struct HybridRetriever {
    index: Arc<SearchIndex>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(index: Arc<SearchIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self::with_config(index, embedder, RetrievalConfig::default())
    }

    pub fn with_config(
        index: Arc<SearchIndex>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            config,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        if self.index.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let expanded = expand_query(query);
        let lexical = self
            .index
            .bm25
            .top_n(&tokenize(&expanded), self.config.lexical_top);
        let vector = self.vector_candidates(&expanded).await;

        let fused = fuse(&lexical, &vector, self.config.rrf_k, self.config.fused_top);
        let kept = self.filter_relevant(query, fused);

        Ok(kept
            .into_iter()
            .take(k)
            .map(|candidate| self.materialize(candidate))
            .collect())
    }

    /// Nearest chunks by embedding similarity (`1/(1+distance)`), descending.
    /// Any embedding failure returns an empty list so the query proceeds on
    /// lexical evidence alone.
    async fn vector_candidates(&self, query: &str) -> Vec<(usize, f64)> {
        if self.index.hnsw.is_empty() {
            return Vec::new();
        }

        let vector = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(error) => {
                warn!(%error, "query embedding failed; degrading to lexical-only ranking");
                return Vec::new();
            }
        };
        if vector.len() != self.index.embeddings.dim() {
            warn!(
                got = vector.len(),
                expected = self.index.embeddings.dim(),
                "query embedding dimension mismatch; degrading to lexical-only ranking"
            );
            return Vec::new();
        }

        self.index
            .hnsw
            .search(
                &self.index.embeddings,
                &vector,
                self.config.vector_top,
                EF_SEARCH,
            )
            .into_iter()
            .map(|(ordinal, distance)| (ordinal, 1.0 / (1.0 + f64::from(distance))))
            .collect()
    }

    /// Keyword relevance filter over the fused candidates. A single topic
    /// bucket is chosen from the original query; no match means no filtering.
    fn filter_relevant(&self, original_query: &str, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let lowered = original_query.to_lowercase();
        let Some(bucket) = RELEVANCE
            .iter()
            .find(|bucket| lowered.contains(bucket.trigger))
        else {
            return candidates;
        };

        let mut kept: Vec<Candidate> = Vec::new();
        for candidate in &candidates {
            let chunk = &self.index.chunks[candidate.ordinal];
            let text = chunk.text.to_lowercase();
            let headings = chunk.headings_path.join(" ").to_lowercase();

            let mut score = 0;
            for keyword in bucket.keywords {
                if text.contains(keyword) {
                    score += 2;
                } else if headings.contains(keyword) {
                    score += 1;
                }
            }

            if score >= self.config.keep_score {
                kept.push(candidate.clone());
            } else if score >= self.config.weak_score && kept.is_empty() {
                // One weak match is admitted only while nothing stronger has
                // been seen; it stays even if strong matches follow.
                kept.push(candidate.clone());
            }
        }

        if kept.is_empty() {
            candidates
                .into_iter()
                .take(self.config.default_k)
                .collect()
        } else {
            kept
        }
    }

    fn materialize(&self, candidate: Candidate) -> RetrievalResult {
        let chunk = &self.index.chunks[candidate.ordinal];
        RetrievalResult {
            chunk_index: candidate.ordinal,
            score: candidate.score,
            lexical_rank: candidate.lexical_rank,
            vector_rank: candidate.vector_rank,
            headings_path: chunk.headings_path.clone(),
            pages: chunk.pages,
            text: chunk.text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::Embedder;
    use crate::error::EmbeddingError;
    use crate::index::bm25::Bm25Index;
    use crate::index::hnsw::{HnswIndex, HnswParams};
    use crate::index::store::{IndexManifest, SearchIndex};
    use crate::index::EmbeddingMatrix;
    use crate::models::Chunk;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Embeds by counting topic words, so related texts land near each other.
    struct KeywordEmbedder;

    fn keyword_vector(text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        ["vacation", "leave", "termination", "cafeteria"]
            .iter()
            .map(|word| lowered.matches(word).count() as f32)
            .collect()
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|text| keyword_vector(text)).collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::InvalidResponse("offline".to_string()))
        }
    }

    fn chunk(ordinal: usize, pages: [u32; 2], path: &[&str], text: &str) -> Chunk {
        Chunk {
            chunk_index: ordinal,
            doc_id: "handbook".to_string(),
            pages,
            headings_path: path.iter().map(|entry| entry.to_string()).collect(),
            text: text.to_string(),
            token_count: tokenize(text).len(),
            is_table: false,
        }
    }

    fn handbook_index() -> Arc<SearchIndex> {
        let chunks = vec![
            chunk(
                0,
                [10, 12],
                &["ANNUAL LEAVE"],
                "Employees receive twenty five vacation days per year. Annual leave accrues \
                 monthly and unused vacation may carry over with approval.",
            ),
            chunk(
                1,
                [40, 41],
                &["TERMINATION"],
                "Termination of employment requires written notice. Dismissal procedures and \
                 final settlement are described here.",
            ),
            chunk(
                2,
                [90, 91],
                &[],
                "The cafeteria menu rotates weekly with seasonal produce and daily soups.",
            ),
        ];
        let corpus: Vec<Vec<String>> = chunks.iter().map(|chunk| tokenize(&chunk.text)).collect();
        let bm25 = Bm25Index::fit(&corpus);
        let rows: Vec<Vec<f32>> = chunks.iter().map(|chunk| keyword_vector(&chunk.text)).collect();
        let embeddings = EmbeddingMatrix::from_rows(rows).expect("uniform rows");
        let hnsw = HnswIndex::build(&embeddings, HnswParams::default());

        Arc::new(SearchIndex {
            manifest: IndexManifest {
                doc_id: "handbook".to_string(),
                checksum: "test".to_string(),
                chunk_count: chunks.len(),
                embedding_dim: embeddings.dim(),
                created_at: Utc::now(),
            },
            chunks,
            bm25,
            hnsw,
            embeddings,
        })
    }

    #[test]
    fn expansion_appends_first_matching_block_only() {
        let expanded = expand_query("How many vacation days before sick leave kicks in?");
        assert!(expanded.starts_with("How many vacation days"));
        assert!(expanded.ends_with("vacation annual leave time off rest relaxation"));
        assert!(!expanded.contains("illness"));
    }

    #[test]
    fn unmatched_query_is_not_expanded() {
        assert_eq!(expand_query("cafeteria menu"), "cafeteria menu");
    }

    #[test]
    fn rrf_scores_are_the_reciprocal_rank_sums() {
        let lexical = vec![(7usize, 3.0), (3, 2.0)];
        let vector = vec![(3usize, 0.9), (5, 0.8)];

        let fused = fuse(&lexical, &vector, 60.0, 12);

        // Chunk 3: rank 2 lexical + rank 1 vector.
        assert_eq!(fused[0].ordinal, 3);
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-12);
        assert_eq!(fused[0].lexical_rank, Some(2));
        assert_eq!(fused[0].vector_rank, Some(1));
        // Single-list entries carry one rank and a missing one.
        let lone = fused.iter().find(|c| c.ordinal == 5).expect("present");
        assert_eq!(lone.lexical_rank, None);
        assert_eq!(lone.vector_rank, Some(2));
    }

    #[test]
    fn item_in_both_lists_outranks_single_list_item_at_same_rank() {
        let lexical = vec![(1usize, 5.0), (2, 4.0)];
        let vector = vec![(2usize, 0.9), (9, 0.8)];

        let fused = fuse(&lexical, &vector, 60.0, 12);

        assert_eq!(fused[0].ordinal, 2);
        assert!(fused[0].score > fused[1].score);
    }

    #[test]
    fn equal_scores_tie_break_by_ascending_ordinal() {
        let lexical = vec![(8usize, 1.0)];
        let vector = vec![(2usize, 1.0)];

        let fused = fuse(&lexical, &vector, 60.0, 12);

        assert_eq!(fused[0].ordinal, 2);
        assert_eq!(fused[1].ordinal, 8);
        assert_eq!(fused[0].score, fused[1].score);
    }

    #[tokio::test]
    async fn vacation_query_returns_the_leave_chunk_first() {
        let retriever = HybridRetriever::new(handbook_index(), Arc::new(KeywordEmbedder));

        let results = retriever
            .retrieve("How many vacation days do I get?", 6)
            .await
            .expect("query succeeds");

        assert!(!results.is_empty());
        assert_eq!(results[0].chunk_index, 0);
        assert_eq!(results[0].pages, [10, 12]);
        assert_eq!(results[0].headings_path, vec!["ANNUAL LEAVE"]);
        // The filler chunk has no leave vocabulary and is filtered out.
        assert!(results.iter().all(|result| result.chunk_index != 2));
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_lexical_only() {
        let retriever = HybridRetriever::new(handbook_index(), Arc::new(FailingEmbedder));

        let results = retriever
            .retrieve("How many vacation days do I get?", 6)
            .await
            .expect("query still succeeds");

        assert!(!results.is_empty());
        assert_eq!(results[0].chunk_index, 0);
        assert!(results.iter().all(|result| result.vector_rank.is_none()));
    }

    #[tokio::test]
    async fn query_without_topic_bucket_skips_filtering() {
        let retriever = HybridRetriever::new(handbook_index(), Arc::new(KeywordEmbedder));

        let results = retriever
            .retrieve("what does the cafeteria serve", 6)
            .await
            .expect("query succeeds");

        assert!(!results.is_empty());
        assert_eq!(results[0].chunk_index, 2);
    }

    #[tokio::test]
    async fn empty_corpus_returns_empty_results() {
        let empty = Arc::new(SearchIndex {
            chunks: Vec::new(),
            bm25: Bm25Index::fit(&[]),
            hnsw: HnswIndex::build(&EmbeddingMatrix::empty(), HnswParams::default()),
            embeddings: EmbeddingMatrix::empty(),
            manifest: IndexManifest {
                doc_id: "empty".to_string(),
                checksum: "0".to_string(),
                chunk_count: 0,
                embedding_dim: 0,
                created_at: Utc::now(),
            },
        });
        let retriever = HybridRetriever::new(empty, Arc::new(KeywordEmbedder));

        let results = retriever
            .retrieve("anything at all", 6)
            .await
            .expect("query succeeds");
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let retriever = HybridRetriever::new(handbook_index(), Arc::new(KeywordEmbedder));
        let error = retriever.retrieve("   ", 6).await.err().expect("rejected");
        assert!(matches!(error, SearchError::EmptyQuery));
    }

    #[tokio::test]
    async fn requested_k_caps_the_result_count() {
        let retriever = HybridRetriever::new(handbook_index(), Arc::new(KeywordEmbedder));

        let results = retriever
            .retrieve("leave and termination and cafeteria policies", 1)
            .await
            .expect("query succeeds");
        assert_eq!(results.len(), 1);
    }
}
