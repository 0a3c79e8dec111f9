use clap::{Parser, Subcommand};
use pdf_rag_core::{
    ingest, ChunkerConfig, EmbeddingConfig, HttpOcrEngine, HybridRetriever, IndexHandle,
    LopdfDecoder, OcrEngine, OpenAiEmbedder,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the persisted index generation.
    #[arg(long, default_value = "index", global = true)]
    index_dir: String,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one PDF: parse, chunk, build both indexes, replace the index dir.
    Ingest {
        /// Path to the source PDF.
        #[arg(long)]
        pdf: String,

        /// Lower token bound per chunk.
        #[arg(long, default_value = "400")]
        min_tokens: usize,

        /// Upper token bound per chunk.
        #[arg(long, default_value = "1200")]
        max_tokens: usize,

        /// Overlap carried between adjacent chunks.
        #[arg(long, default_value = "100")]
        overlap_tokens: usize,
    },
    /// Run a hybrid query against the loaded index.
    Search {
        /// Natural-language question.
        #[arg(long)]
        query: String,

        /// Number of fused results to return.
        #[arg(long, default_value = "6")]
        top_k: usize,

        /// Print full chunk texts instead of a preview.
        #[arg(long, default_value_t = false)]
        full_text: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let embedder = OpenAiEmbedder::new(EmbeddingConfig::from_env())
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;

    match cli.command {
        Command::Ingest {
            pdf,
            min_tokens,
            max_tokens,
            overlap_tokens,
        } => {
            let decoder = LopdfDecoder;
            let ocr = HttpOcrEngine::from_env();
            let config = ChunkerConfig {
                min_tokens,
                max_tokens,
                overlap_tokens,
            };

            let report = ingest(
                Path::new(&pdf),
                Path::new(&cli.index_dir),
                &decoder,
                ocr.as_ref().map(|engine| engine as &dyn OcrEngine),
                &embedder,
                config,
            )
            .await
            .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            if !report.degraded_pages.is_empty() {
                println!(
                    "degraded pages: {}",
                    report
                        .degraded_pages
                        .iter()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            println!(
                "{}: {} pages -> {} chunks at {}",
                report.doc_id,
                report.page_count,
                report.chunk_count,
                report.created_at.to_rfc3339()
            );
        }
        Command::Search {
            query,
            top_k,
            full_text,
        } => {
            let handle = IndexHandle::new();
            let chunk_count = match handle.reload_from(Path::new(&cli.index_dir)) {
                Ok(count) => count,
                Err(error) => {
                    println!("index not ready: {error}");
                    return Ok(());
                }
            };
            info!(chunks = chunk_count, "index generation loaded");

            let Some(index) = handle.current() else {
                println!("index not ready");
                return Ok(());
            };
            let retriever = HybridRetriever::new(index, Arc::new(embedder));

            let results = retriever
                .retrieve(&query, top_k)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            if results.is_empty() {
                println!("no results");
            }
            for result in results {
                let path = if result.headings_path.is_empty() {
                    "General".to_string()
                } else {
                    result.headings_path.join(" > ")
                };
                println!(
                    "[chunk {}] score={:.5} pages={}-{} path={}",
                    result.chunk_index, result.score, result.pages[0], result.pages[1], path
                );
                if full_text {
                    println!("{}\n", result.text);
                } else {
                    let preview: String = result.text.chars().take(240).collect();
                    println!("  {preview}\n");
                }
            }
        }
    }

    Ok(())
}
