//! Operator CLI: extraction, SQL loading, indexing, and serving

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tenk_agent::extraction::{DocType, DocumentProcessor, ProcessOptions, VlmExtractor};
use tenk_agent::index::{EmbeddingService, GraphStore, Indexer, SqliteVectorIndex, VectorIndex};
use tenk_agent::llm::{HttpLlmClient, LlmClient, MockLlmClient};
use tenk_agent::store::{RelationalStore, SqlLoader};
use tenk_agent::{Agent, AgentConfig, ResponseCache};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit code for validation errors
const EXIT_VALIDATION: i32 = 2;
/// Exit code for partial failures
const EXIT_PARTIAL: i32 = 3;

#[derive(Parser)]
#[command(name = "tenk-agent", version, about = "Financial filings agent backend")]
struct Cli {
    /// Path to a TOML/JSON/YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract structured JSON from raw PDFs
    Extract {
        /// Directory of raw PDFs
        #[arg(long)]
        raw_dir: Option<String>,
        /// Directory for extraction JSON and the manifest
        #[arg(long)]
        extracted_dir: Option<String>,
        /// Comma-separated doc types to process (filing,reference)
        #[arg(long)]
        doc_types: Option<String>,
        /// Re-extract even if the manifest says the document is done
        #[arg(long)]
        force: bool,
        /// Re-extract only documents whose content hash changed
        #[arg(long)]
        if_changed: bool,
        /// Report what would happen without extracting
        #[arg(long)]
        dry_run: bool,
        /// Print the manifest status and exit
        #[arg(long)]
        status: bool,
        /// Process a single document id
        #[arg(long)]
        doc: Option<String>,
    },
    /// Load consolidated extractions into the relational store
    LoadSql {
        #[arg(long)]
        extracted_dir: Option<String>,
        /// Restrict to one ticker
        #[arg(long)]
        ticker: Option<String>,
        /// Validate and report without writing
        #[arg(long)]
        dry_run: bool,
        /// Validate records only
        #[arg(long)]
        validate_only: bool,
        /// Reload documents even if already loaded
        #[arg(long)]
        force: bool,
    },
    /// Build the vector index and knowledge graph
    Index {
        /// Skip extraction, index existing records only
        #[arg(long)]
        index_only: bool,
        /// Rebuild the index even for indexed documents
        #[arg(long)]
        reindex: bool,
        /// Index a single document id
        #[arg(long)]
        index_doc: Option<String>,
    },
    /// Serve the agent API
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match AgentConfig::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to load config {}: {}", path.display(), err);
                std::process::exit(EXIT_VALIDATION);
            }
        },
        None => AgentConfig::from_env().unwrap_or_default(),
    };
    config.apply_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(config.log_level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = config.validate() {
        eprintln!("invalid configuration: {}", err);
        std::process::exit(EXIT_VALIDATION);
    }

    let code = match run(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            eprintln!("error: {}", err);
            1
        }
    };
    std::process::exit(code);
}

fn build_llm(config: &AgentConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    Ok(if config.llm_is_mock() {
        Arc::new(MockLlmClient::new(&config.embedding))
    } else {
        Arc::new(HttpLlmClient::new(config.llm.clone())?)
    })
}

fn processor(config: &AgentConfig, llm: Arc<dyn LlmClient>) -> DocumentProcessor {
    let extractor = VlmExtractor::new(llm, config.llm.vlm_model.clone());
    DocumentProcessor::new(config.extraction.clone(), extractor)
}

async fn run(command: Command, mut config: AgentConfig) -> anyhow::Result<i32> {
    match command {
        Command::Extract {
            raw_dir,
            extracted_dir,
            doc_types,
            force,
            if_changed,
            dry_run,
            status,
            doc,
        } => {
            if let Some(dir) = raw_dir {
                config.extraction.raw_dir = dir;
            }
            if let Some(dir) = extracted_dir {
                config.extraction.extracted_dir = dir;
            }

            let llm = build_llm(&config)?;
            let processor = processor(&config, llm);

            if status {
                for line in processor.status()? {
                    println!(
                        "{:<40} hash={} indexed={} chunks={:?} cost=${:.4}",
                        line.document_id,
                        &line.file_hash[..8.min(line.file_hash.len())],
                        line.indexed_to_vi,
                        line.chunk_count,
                        line.extraction_cost
                    );
                }
                return Ok(0);
            }

            let filter: Option<Vec<DocType>> = doc_types.map(|kinds| {
                kinds
                    .split(',')
                    .filter_map(|k| match k.trim() {
                        "filing" => Some(DocType::Filing),
                        "reference" => Some(DocType::Reference),
                        _ => None,
                    })
                    .collect()
            });
            let opts = ProcessOptions {
                force,
                if_changed,
                dry_run,
            };

            if let Some(document_id) = doc {
                let path = find_pdf(&config.extraction.raw_dir, &document_id)?;
                let outcome = processor.process(&path, opts).await?;
                info!("{:?}", outcome);
                return Ok(0);
            }

            let summary = processor.process_all(filter.as_deref(), opts).await?;
            println!(
                "extracted={} skipped={} failed={}",
                summary.extracted, summary.skipped, summary.failed
            );
            Ok(if summary.failed > 0 { EXIT_PARTIAL } else { 0 })
        }

        Command::LoadSql {
            extracted_dir,
            ticker,
            dry_run,
            validate_only,
            force: _,
        } => {
            if let Some(dir) = extracted_dir {
                config.extraction.extracted_dir = dir;
            }

            let llm = build_llm(&config)?;
            let processor = processor(&config, llm);
            let records = processor.load_all_records()?;

            let store = Arc::new(
                RelationalStore::new(&config.stores.relational_db, config.stores.max_connections)
                    .await?,
            );
            let loader = SqlLoader::new(store);

            let results = loader
                .load_all(&records, ticker.as_deref(), dry_run || validate_only)
                .await?;

            let mut failed = 0;
            for (document_id, outcome) in &results {
                match outcome {
                    Ok(summary) => println!(
                        "{}: metrics={} segments={} regions={} risks={} warnings={}",
                        document_id,
                        summary.metric_rows,
                        summary.segment_rows,
                        summary.geographic_rows,
                        summary.risk_rows,
                        summary.warnings.len()
                    ),
                    Err(err) => {
                        failed += 1;
                        println!("{}: FAILED ({})", document_id, err);
                    }
                }
            }
            Ok(if failed == results.len() && failed > 0 {
                EXIT_VALIDATION
            } else if failed > 0 {
                EXIT_PARTIAL
            } else {
                0
            })
        }

        Command::Index {
            index_only,
            reindex,
            index_doc,
        } => {
            let llm = build_llm(&config)?;
            let processor = processor(&config, llm.clone());

            if !index_only {
                let summary = processor
                    .process_all(
                        None,
                        ProcessOptions {
                            if_changed: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(
                    extracted = summary.extracted,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "extraction pass complete"
                );
            }

            let mut records = processor.load_all_records()?;
            if let Some(document_id) = &index_doc {
                records.retain(|r| &r.metadata.document_id == document_id);
                if records.is_empty() {
                    eprintln!("document not found in manifest: {}", document_id);
                    return Ok(EXIT_VALIDATION);
                }
            }

            let vector_index: Arc<dyn VectorIndex> = Arc::new(
                SqliteVectorIndex::new(
                    &config.stores.index_db,
                    config.embedding.dimension,
                    config.rag.hybrid_alpha,
                    config.stores.max_connections,
                )
                .await?,
            );
            let graph = Arc::new(
                GraphStore::new(&config.stores.index_db, config.stores.max_connections).await?,
            );
            let embeddings = EmbeddingService::new(llm, &config.embedding);
            let indexer = Indexer::new(
                embeddings,
                vector_index,
                graph,
                config.extraction.extracted_dir.clone(),
            );

            let summary = indexer.index_all(&records, reindex).await?;
            println!(
                "indexed={} skipped={} chunks={}",
                summary.indexed_documents, summary.skipped_documents, summary.total_chunks
            );

            // Cached answers citing re-indexed documents are stale.
            if summary.indexed_documents > 0 {
                let cache =
                    ResponseCache::new(&config.stores.cache_db, config.cache.clone()).await?;
                for record in &records {
                    cache
                        .invalidate_by_document(&record.metadata.document_id)
                        .await?;
                }
            }
            Ok(0)
        }

        Command::Serve { addr } => {
            let agent = Arc::new(Agent::new(config).await?);
            let router = tenk_agent::api::router(agent);
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(addr, "serving agent API");
            axum::serve(listener, router).await?;
            Ok(0)
        }
    }
}

/// Locate the PDF in the raw directory whose document id matches
fn find_pdf(raw_dir: &str, document_id: &str) -> anyhow::Result<PathBuf> {
    for entry in std::fs::read_dir(raw_dir)? {
        let path = entry?.path();
        if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
            && tenk_agent::extraction::processor::document_id_from_path(&path) == document_id
        {
            return Ok(path);
        }
    }
    anyhow::bail!("no PDF found for document id {}", document_id)
}
