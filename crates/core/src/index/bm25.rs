use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const K1: f64 = 1.5;
const B: f64 = 0.75;
/// Floor factor applied to negative idf values, as a fraction of the mean idf.
const EPSILON: f64 = 0.25;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w+\b").expect("word pattern is valid"));

/// Lowercased word-boundary tokens, the shared tokenization for corpus and
/// queries.
pub fn tokenize(text: &str) -> Vec<String> {
    WORD_RE
        .find_iter(&text.to_lowercase())
        .map(|word| word.as_str().to_string())
        .collect()
}

/// BM25-Okapi sparse index over chunk texts, keyed by chunk ordinal.
/// Read-only after `fit`; negative idf terms are floored to a fraction of the
/// mean idf so very common terms still contribute a small positive weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Index {
    k1: f64,
    b: f64,
    corpus_size: usize,
    avgdl: f64,
    doc_len: Vec<usize>,
    term_freqs: Vec<HashMap<String, u32>>,
    idf: HashMap<String, f64>,
}

impl Bm25Index {
    pub fn fit(corpus: &[Vec<String>]) -> Self {
        let corpus_size = corpus.len();
        let doc_len: Vec<usize> = corpus.iter().map(Vec::len).collect();
        let total: usize = doc_len.iter().sum();
        let avgdl = if corpus_size == 0 {
            0.0
        } else {
            total as f64 / corpus_size as f64
        };

        let mut term_freqs = Vec::with_capacity(corpus_size);
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for tokens in corpus {
            let mut freqs: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(freqs);
        }

        let mut idf: HashMap<String, f64> = HashMap::with_capacity(doc_freq.len());
        let mut idf_sum = 0.0;
        let mut negative: Vec<String> = Vec::new();
        for (term, freq) in &doc_freq {
            let value = ((corpus_size as f64 - *freq as f64 + 0.5) / (*freq as f64 + 0.5)).ln();
            idf_sum += value;
            if value < 0.0 {
                negative.push(term.clone());
            }
            idf.insert(term.clone(), value);
        }
        if !idf.is_empty() {
            let floor = EPSILON * (idf_sum / idf.len() as f64);
            for term in negative {
                idf.insert(term, floor);
            }
        }

        Self {
            k1: K1,
            b: B,
            corpus_size,
            avgdl,
            doc_len,
            term_freqs,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.corpus_size
    }

    pub fn is_empty(&self) -> bool {
        self.corpus_size == 0
    }

    /// BM25 score of every chunk against the query tokens, indexed by ordinal.
    pub fn scores(&self, query: &[String]) -> Vec<f64> {
        let mut scores = vec![0.0; self.corpus_size];
        if self.avgdl == 0.0 {
            return scores;
        }

        for term in query {
            let Some(idf) = self.idf.get(term) else {
                continue;
            };
            for (ordinal, freqs) in self.term_freqs.iter().enumerate() {
                let frequency = f64::from(freqs.get(term).copied().unwrap_or(0));
                if frequency == 0.0 {
                    continue;
                }
                let norm = self.k1
                    * (1.0 - self.b + self.b * self.doc_len[ordinal] as f64 / self.avgdl);
                scores[ordinal] += idf * frequency * (self.k1 + 1.0) / (frequency + norm);
            }
        }

        scores
    }

    /// Top `n` chunks with strictly positive score, descending; ties resolve
    /// by ascending ordinal.
    pub fn top_n(&self, query: &[String], n: usize) -> Vec<(usize, f64)> {
        let mut ranked: Vec<(usize, f64)> = self
            .scores(query)
            .into_iter()
            .enumerate()
            .filter(|(_, score)| *score > 0.0)
            .collect();

        ranked.sort_by(|left, right| {
            right
                .1
                .total_cmp(&left.1)
                .then_with(|| left.0.cmp(&right.0))
        });
        ranked.truncate(n);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<Vec<String>> {
        [
            "employees accrue annual leave and vacation days monthly",
            "termination of employment requires notice in writing",
            "the cafeteria menu rotates weekly with seasonal produce",
        ]
        .iter()
        .map(|text| tokenize(text))
        .collect()
    }

    #[test]
    fn tokenize_lowercases_on_word_boundaries() {
        assert_eq!(
            tokenize("Annual Leave: 25 days/year!"),
            vec!["annual", "leave", "25", "days", "year"]
        );
    }

    #[test]
    fn matching_terms_rank_the_right_chunk_first() {
        let index = Bm25Index::fit(&corpus());
        let top = index.top_n(&tokenize("how many vacation days"), 10);

        assert!(!top.is_empty());
        assert_eq!(top[0].0, 0);
        assert!(top[0].1 > 0.0);
    }

    #[test]
    fn absent_terms_produce_no_candidates() {
        let index = Bm25Index::fit(&corpus());
        assert!(index.top_n(&tokenize("zeppelin"), 10).is_empty());
    }

    #[test]
    fn empty_corpus_scores_nothing() {
        let index = Bm25Index::fit(&[]);
        assert!(index.is_empty());
        assert!(index.scores(&tokenize("anything")).is_empty());
        assert!(index.top_n(&tokenize("anything"), 5).is_empty());
    }

    #[test]
    fn common_term_idf_is_floored_not_negative() {
        // "the" appears in every document; its raw idf would be negative.
        let corpus: Vec<Vec<String>> = [
            "the policy covers the leave entitlement",
            "the handbook describes the termination steps",
            "the appendix lists the holidays",
        ]
        .iter()
        .map(|text| tokenize(text))
        .collect();
        let index = Bm25Index::fit(&corpus);

        let scores = index.scores(&tokenize("the"));
        assert!(scores.iter().all(|score| *score > 0.0));
    }

    #[test]
    fn serialization_round_trips_scoring() {
        let index = Bm25Index::fit(&corpus());
        let encoded = serde_json::to_string(&index).expect("serializes");
        let decoded: Bm25Index = serde_json::from_str(&encoded).expect("deserializes");

        let query = tokenize("vacation days");
        assert_eq!(index.scores(&query), decoded.scores(&query));
    }
}
