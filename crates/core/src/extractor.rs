use crate::error::IngestError;
use crate::models::TextRun;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Font size reported when the decoder has no metrics for a run. Sits exactly
/// on the large-font threshold so it never passes the typographic heading test.
const FALLBACK_FONT_SIZE: f32 = 11.0;

/// A raw table candidate from the decoder: rows of cell texts, not yet
/// normalized. The structural classifier turns candidates into [`crate::TableBlock`]s.
#[derive(Debug, Clone)]
pub struct TableCandidate {
    pub page: u32,
    pub cells: Vec<Vec<String>>,
}

/// One decoded page: ordered text runs plus any table candidates the backend
/// could detect. Pages with no extractable text still appear, with empty runs,
/// so the classifier can attempt OCR recovery.
#[derive(Debug, Clone)]
pub struct DecodedPage {
    pub number: u32,
    pub runs: Vec<TextRun>,
    pub table_candidates: Vec<TableCandidate>,
}

/// Raw document decoding seam. Internals of the backend are not part of this
/// crate's contract; only the decoded output feeds the classifier heuristics.
pub trait PageDecoder {
    fn decode_pages(&self, path: &Path) -> Result<Vec<DecodedPage>, IngestError>;
}

/// Best-effort decoder over lopdf. The backend exposes no font metrics or
/// table geometry, so every run carries the fallback size and heading
/// detection falls through to the lexical patterns.
#[derive(Default)]
pub struct LopdfDecoder;

impl PageDecoder for LopdfDecoder {
    fn decode_pages(&self, path: &Path) -> Result<Vec<DecodedPage>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            // A page whose text stream cannot be decoded degrades to an empty
            // run list; the classifier marks it and tries OCR.
            let text = document.extract_text(&[page_no]).unwrap_or_default();

            let runs = text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| TextRun {
                    text: line.to_string(),
                    font_size: FALLBACK_FONT_SIZE,
                    bold: false,
                    page: page_no,
                })
                .collect();

            pages.push(DecodedPage {
                number: page_no,
                runs,
                table_candidates: Vec::new(),
            });
        }

        Ok(pages)
    }
}

/// Optical-character-recognition collaborator for pages whose extracted text
/// is below the degradation threshold.
pub trait OcrEngine {
    /// Returns recovered text for the page, `Ok(None)` when the engine has
    /// nothing to offer for it.
    fn recover_page(&self, path: &Path, page: u32) -> Result<Option<String>, IngestError>;
}

#[derive(Debug, Clone, Serialize)]
struct OcrRequest {
    pdf_base64: String,
    source_path: String,
    page: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    pages: Option<Vec<OcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// OCR over an HTTP endpoint, configured from `PDF_OCR_ENDPOINT` and
/// (optionally) `PDF_OCR_API_KEY`.
#[derive(Debug, Clone)]
pub struct HttpOcrEngine {
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOcrEngine {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
        }
    }

    /// `None` when no endpoint is configured; ingestion then runs without an
    /// OCR fallback and degraded pages stay empty.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("PDF_OCR_ENDPOINT").ok()?;
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }

        let api_key = std::env::var("PDF_OCR_API_KEY").ok().and_then(|value| {
            let key = value.trim().to_string();
            if key.is_empty() {
                None
            } else {
                Some(key)
            }
        });

        Some(Self { endpoint, api_key })
    }

    fn recover_page_blocking(&self, path: &Path, page: u32) -> Result<Option<String>, IngestError> {
        let pdf = std::fs::read(path).map_err(IngestError::Io)?;
        let payload = OcrRequest {
            pdf_base64: STANDARD.encode(pdf),
            source_path: path.to_string_lossy().to_string(),
            page,
        };

        let mut request = Client::new()
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;

        if !response.status().is_success() {
            return Err(IngestError::OcrFailed(format!(
                "OCR request to {} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: OcrResponse = response.json()?;
        Ok(select_page_text(&payload, page))
    }
}

impl OcrEngine for HttpOcrEngine {
    fn recover_page(&self, path: &Path, page: u32) -> Result<Option<String>, IngestError> {
        tokio::task::block_in_place(|| self.recover_page_blocking(path, page))
    }
}

fn select_page_text(payload: &OcrResponse, page: u32) -> Option<String> {
    if let Some(listed) = &payload.pages {
        let matched = listed
            .iter()
            .filter(|entry| entry.page.unwrap_or(1) == page)
            .filter_map(|entry| entry.text.as_deref())
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>();

        if !matched.is_empty() {
            return Some(matched.join("\n"));
        }
    }

    payload
        .text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
