use crate::extractor::{DecodedPage, OcrEngine, TableCandidate};
use crate::models::{ExtractionStatus, Heading, LabeledRun, PageStructure, TableBlock, TextRun};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tracing::warn;

/// Font size above which a run counts as large type.
const LARGE_FONT: f32 = 11.0;
/// Pattern-matched lines longer than this are not headings.
const MAX_HEADING_CHARS: usize = 80;
/// Typographic-only headings must be shorter than this.
const MAX_SHORT_HEADING_CHARS: usize = 50;
/// Pages with less aggregate text than this are degraded and sent to OCR.
const MIN_PAGE_CHARS: usize = 50;

static HEADING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^\d+\.\d+\s+",              // 4.2, 1.1
        r"^SECTION\s+\d+",            // SECTION 1
        r"^\d+\.\d+\.\d+\s+",         // 4.2.1
        r"^[A-Z][A-Z\s/&-]+$",        // ALL CAPS line
        r"^\d+\.\s+[A-Z]",            // 1. SOMETHING
        r"^Policy\s+(Statement|Guidelines)",
        r"^Application$",
        r"^Procedure$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("heading pattern is valid"))
    .collect()
});

static TABLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\|\s*\w+\s*\|",             // pipe-separated cells
        r"\t\w+\t",                   // tab-separated cells
        r"^\s*\d+\.\d+\s+\d+\.\d+",   // numeric columns
        r"^\s*[A-Z][a-z]+\s+\d+",     // label followed by numbers
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("table pattern is valid"))
    .collect()
});

/// Heading decision over typographic and lexical signals.
pub fn is_heading(run: &TextRun) -> bool {
    let large = run.font_size > LARGE_FONT;
    let pattern = HEADING_PATTERNS
        .iter()
        .any(|regex| regex.is_match(&run.text));
    let chars = run.text.chars().count();

    (run.bold && (large || pattern))
        || (pattern && chars < MAX_HEADING_CHARS)
        || (large && run.bold && chars < MAX_SHORT_HEADING_CHARS)
}

/// Hierarchy level from font size tiers.
pub fn heading_level(font_size: f32) -> u8 {
    if font_size >= 16.0 {
        1
    } else if font_size >= 14.0 {
        2
    } else {
        3
    }
}

/// Whether a run's text looks like table content: separator patterns or
/// repeated multi-space gaps.
pub fn is_table_text(text: &str) -> bool {
    let has_pattern = TABLE_PATTERNS.iter().any(|regex| regex.is_match(text));
    let uniform_spacing = text.split('\t').count() > 2 || text.matches("  ").count() > 2;

    has_pattern || uniform_spacing
}

/// Serializes extracted cells into a flat markdown grid: header row,
/// separator row, data rows.
pub fn table_to_markdown(cells: &[Vec<String>]) -> String {
    let Some(header) = cells.first() else {
        return String::new();
    };

    let mut lines = Vec::with_capacity(cells.len() + 1);
    lines.push(format!(
        "| {} |",
        header
            .iter()
            .map(|cell| cell.trim())
            .collect::<Vec<_>>()
            .join(" | ")
    ));
    lines.push(format!(
        "| {} |",
        header.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
    ));
    for row in &cells[1..] {
        lines.push(format!(
            "| {} |",
            row.iter().map(|cell| cell.trim()).collect::<Vec<_>>().join(" | ")
        ));
    }

    lines.join("\n")
}

fn normalize_table(candidate: &TableCandidate) -> Option<TableBlock> {
    // A table needs at least a header row and one data row.
    if candidate.cells.len() < 2 {
        return None;
    }

    Some(TableBlock {
        markdown: table_to_markdown(&candidate.cells),
        rows: candidate.cells.len(),
        cols: candidate.cells.first().map(Vec::len).unwrap_or(0),
        page: candidate.page,
    })
}

/// Labels a decoded page's runs, collects headings and tables, and applies
/// the OCR fallback when the page carries almost no extracted text.
///
/// Classification never fails: a page the heuristics cannot make sense of
/// comes back with `ExtractionStatus::Failed` and whatever structure was
/// salvageable, so one bad page cannot abort an ingestion run.
pub fn classify_page(
    decoded: DecodedPage,
    path: &Path,
    ocr: Option<&dyn OcrEngine>,
) -> PageStructure {
    let page = decoded.number;
    let mut runs = Vec::with_capacity(decoded.runs.len());
    let mut headings = Vec::new();

    for run in &decoded.runs {
        let text = run.text.trim();
        if text.is_empty() {
            continue;
        }

        let heading = is_heading(run);
        if heading {
            headings.push(Heading {
                text: text.to_string(),
                level: heading_level(run.font_size),
                page,
            });
        }

        runs.push(LabeledRun {
            text: text.to_string(),
            heading,
            table: is_table_text(text),
            ocr: false,
        });
    }

    let tables = decoded
        .table_candidates
        .iter()
        .filter_map(normalize_table)
        .collect();

    let total_chars: usize = runs.iter().map(|run| run.text.len()).sum();
    let extraction = if total_chars >= MIN_PAGE_CHARS {
        ExtractionStatus::Full
    } else {
        recover_degraded_page(path, page, ocr, &mut runs)
    };

    PageStructure {
        page,
        runs,
        headings,
        tables,
        extraction,
    }
}

fn recover_degraded_page(
    path: &Path,
    page: u32,
    ocr: Option<&dyn OcrEngine>,
    runs: &mut Vec<LabeledRun>,
) -> ExtractionStatus {
    let Some(engine) = ocr else {
        return ExtractionStatus::Failed {
            reason: "minimal text and no OCR engine configured".to_string(),
        };
    };

    match engine.recover_page(path, page) {
        Ok(Some(text)) => {
            runs.push(LabeledRun {
                text,
                heading: false,
                table: false,
                ocr: true,
            });
            ExtractionStatus::Degraded {
                reason: "minimal text; OCR supplement applied".to_string(),
            }
        }
        Ok(None) => ExtractionStatus::Failed {
            reason: "minimal text; OCR returned nothing".to_string(),
        },
        Err(error) => {
            warn!(page, %error, "OCR recovery failed");
            ExtractionStatus::Failed {
                reason: format!("minimal text; OCR failed: {error}"),
            }
        }
    }
}
