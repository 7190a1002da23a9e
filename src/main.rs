//! Document Benchmark CLI
//!
//! Benchmarks categorizer/extractor model candidates against a labeled
//! document corpus.
//!
//! ## Quick Start
//!
//! ```bash
//! # Create (and review) ground truth with the configured models
//! ./document-benchmark ground-truth \
//!     --positive ./corpus/invoices \
//!     --negative ./corpus/other \
//!     --document-type invoice
//!
//! # Benchmark categorizer families, each candidate in its own worker process
//! ./document-benchmark run \
//!     --positive ./corpus/invoices \
//!     --negative ./corpus/other \
//!     --document-type invoice \
//!     --categorizer qwen2.5-vl,mlx-community/gemma-3-4b-it-4bit \
//!     --timeout 30
//!
//! # Combined scoring, then drop every downloaded model except the winner
//! ./document-benchmark run ... --mode combined --extractor qwen2.5 --cleanup
//! ```
//!
//! ## Configuration
//!
//! Settings live in `benchmark.toml` (see the sample in the repository root).
//! Command-line flags override the config file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashSet;
use std::ffi::OsString;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use document_benchmark::benchmark::{
    AutoApprove, Leaderboard, Orchestrator, RunSettings, StdinGate, VerificationGate,
};
use document_benchmark::cleanup::cleanup;
use document_benchmark::config::{
    resolve_token, BenchmarkConfig, DocumentType, EvaluationMode, FileSecretStore,
    InferenceTimeout, SecretStore,
};
use document_benchmark::detector::{CandidateModels, OpenAiHost};
use document_benchmark::discovery::{
    diagonal_pairs, is_concrete, resolve_candidates, RegistryClient, ResolvedModel, SearchFilters,
};
use document_benchmark::resources::{available_memory, estimate_memory, format_bytes};
use document_benchmark::worker::{self, LoadError, WorkerRunner, WORKER_EXIT_LOAD_FAILED};

/// Scoring mode for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum ModeArg {
    /// Categorization only (1 point per document)
    #[default]
    Categorizer,
    /// Categorization plus field extraction (2 points per document)
    Combined,
}

impl From<ModeArg> for EvaluationMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Categorizer => EvaluationMode::Categorizer,
            ModeArg::Combined => EvaluationMode::Combined,
        }
    }
}

fn parse_document_type(s: &str) -> Result<DocumentType, String> {
    DocumentType::from_str(s).ok_or_else(|| {
        let known: Vec<_> = DocumentType::all().iter().map(|t| t.name()).collect();
        format!("unknown document type '{}' (expected one of: {})", s, known.join(", "))
    })
}

fn parse_timeout(s: &str) -> Result<InferenceTimeout, String> {
    s.parse::<u64>()
        .ok()
        .and_then(InferenceTimeout::from_secs)
        .ok_or_else(|| format!("timeout must be 10, 30 or 60 seconds, got '{}'", s))
}

#[derive(Parser)]
#[command(name = "document-benchmark")]
#[command(about = "Benchmark document categorizer and extractor models")]
#[command(version)]
struct Cli {
    /// Path to benchmark config file (TOML), defaults to ./benchmark.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the benchmark over every candidate
    ///
    /// Ground truth is generated first when missing. Results are printed,
    /// never persisted.
    Run {
        /// Directory of documents that should match the document type
        #[arg(short, long)]
        positive: PathBuf,

        /// Directory of documents that should not match
        #[arg(short, long)]
        negative: PathBuf,

        /// Target document type: invoice, prescription, lab-report
        #[arg(short, long, value_parser = parse_document_type)]
        document_type: DocumentType,

        /// Per-document inference timeout in seconds (10, 30 or 60)
        #[arg(short, long, default_value = "30", value_parser = parse_timeout)]
        timeout: InferenceTimeout,

        /// Scoring mode
        #[arg(short, long, value_enum, default_value = "categorizer")]
        mode: ModeArg,

        /// Categorizer candidates (comma-separated, concrete or family), overrides config
        #[arg(long, value_delimiter = ',')]
        categorizer: Option<Vec<String>>,

        /// Extractor candidates (comma-separated, concrete or family), overrides config
        #[arg(long, value_delimiter = ',')]
        extractor: Option<Vec<String>>,

        /// Evaluate at most this many candidates (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_candidates: usize,

        /// Run candidates inside this process instead of isolated workers
        #[arg(long)]
        in_process: bool,

        /// Rebuild all ground truth even where sidecars exist
        #[arg(long)]
        regenerate_ground_truth: bool,

        /// Skip the ground truth review pause
        #[arg(short, long)]
        yes: bool,

        /// Print results as JSON on stdout instead of the table
        #[arg(long)]
        json: bool,

        /// List every lost point per candidate
        #[arg(long)]
        details: bool,

        /// Delete cached models except the winner and the configured models
        #[arg(long)]
        cleanup: bool,
    },

    /// Generate ground truth sidecars with the configured models
    GroundTruth {
        #[arg(short, long)]
        positive: PathBuf,

        #[arg(short, long)]
        negative: PathBuf,

        #[arg(short, long, value_parser = parse_document_type)]
        document_type: DocumentType,

        #[arg(short, long, default_value = "30", value_parser = parse_timeout)]
        timeout: InferenceTimeout,

        /// Rebuild all sidecars, including verified ones
        #[arg(long)]
        regenerate: bool,
    },

    /// Search the model registry
    Search {
        /// Name or family to search for
        query: String,

        /// Capability tag filter (e.g. "image-text-to-text")
        #[arg(long)]
        capability: Option<String>,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Delete cached model artifacts
    Cleanup {
        /// Models to delete (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        models: Vec<String>,

        /// Models to keep in addition to the configured ones (comma-separated)
        #[arg(long, value_delimiter = ',')]
        keep: Vec<String>,
    },

    /// Store the registry token
    Login {
        /// Token; read from stdin when omitted
        token: Option<String>,
    },

    /// Evaluate one candidate (spawned by `run`)
    #[command(hide = true)]
    Worker { input: PathBuf, output: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            positive,
            negative,
            document_type,
            timeout,
            mode,
            categorizer,
            extractor,
            max_candidates,
            in_process,
            regenerate_ground_truth,
            yes,
            json,
            details,
            cleanup,
        } => {
            let options = RunOptions {
                settings: RunSettings {
                    document_type,
                    mode: mode.into(),
                    timeout: timeout.as_duration(),
                },
                categorizers: categorizer.unwrap_or_else(|| config.models.categorizer_candidates.clone()),
                extractors: extractor.unwrap_or_else(|| config.models.extractor_candidates.clone()),
                max_candidates,
                isolated: !in_process,
                regenerate: regenerate_ground_truth,
                review: !yes,
                json,
                details,
                cleanup,
            };
            run_benchmark(&config, cli.config.as_deref(), &positive, &negative, options).await?;
        }

        Commands::GroundTruth {
            positive,
            negative,
            document_type,
            timeout,
            regenerate,
        } => {
            generate_ground_truth(&config, &positive, &negative, document_type, timeout, regenerate)
                .await?;
        }

        Commands::Search {
            query,
            capability,
            limit,
        } => {
            search(&config, &query, capability, limit).await?;
        }

        Commands::Cleanup { models, keep } => {
            let mut keep: HashSet<String> = keep.into_iter().collect();
            keep.extend(config.configured_models());
            run_cleanup(&config, &models, &keep)?;
        }

        Commands::Login { token } => {
            login(&config, token)?;
        }

        Commands::Worker { input, output } => {
            let host = OpenAiHost::from_config(&config.inference)?;
            if let Err(e) = worker::serve(&input, &output, &host).await {
                eprintln!("  [worker] {:#}", e);
                let code = if e.downcast_ref::<LoadError>().is_some() {
                    WORKER_EXIT_LOAD_FAILED
                } else {
                    1
                };
                std::process::exit(code);
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<BenchmarkConfig> {
    match path {
        Some(path) => BenchmarkConfig::load(path),
        None => BenchmarkConfig::load_default(),
    }
}

struct RunOptions {
    settings: RunSettings,
    categorizers: Vec<String>,
    extractors: Vec<String>,
    max_candidates: usize,
    isolated: bool,
    regenerate: bool,
    review: bool,
    json: bool,
    details: bool,
    cleanup: bool,
}

/// Run the benchmark over all candidates
async fn run_benchmark(
    config: &BenchmarkConfig,
    config_path: Option<&Path>,
    positive: &Path,
    negative: &Path,
    options: RunOptions,
) -> Result<()> {
    eprintln!("╔══════════════════════════════════════════════════════════════╗");
    eprintln!("║                  DOCUMENT MODEL BENCHMARK                    ║");
    eprintln!("╚══════════════════════════════════════════════════════════════╝\n");

    let settings = options.settings;
    eprintln!(
        "  Type: {} - {}",
        settings.document_type.name(),
        settings.document_type.description()
    );
    eprintln!(
        "  Mode: {} | timeout {}s | {}",
        settings.mode.name(),
        settings.timeout.as_secs(),
        if options.isolated { "isolated workers" } else { "in-process" }
    );
    eprintln!("  Memory available to candidates: {}", format_bytes(available_memory()));

    let host = OpenAiHost::from_config(&config.inference)?;
    let mut orchestrator = Orchestrator::new(settings, &host);
    if options.isolated {
        orchestrator = orchestrator.with_worker(worker_runner(config, config_path)?);
    }

    eprintln!("\nLoading corpus...");
    let corpus = orchestrator.enumerate(positive, negative)?;
    eprintln!(
        "  Loaded: {} documents [{} positive + {} negative]",
        corpus.len(),
        corpus.positive_count(),
        corpus.negative_count()
    );

    // Discovery failures end the run before any model is loaded
    eprintln!("\nResolving candidates...");
    let candidates = build_candidates(
        config,
        &options.categorizers,
        &options.extractors,
        settings.mode,
        options.max_candidates,
    )
    .await?;
    for candidate in &candidates {
        eprintln!(
            "  - {} (~{}){}",
            candidate.label(),
            format_bytes(estimate_memory(&candidate.identifiers())),
            if candidate.gated { " [gated]" } else { "" }
        );
    }

    let gate: &dyn VerificationGate = if options.review { &StdinGate } else { &AutoApprove };
    let truths = orchestrator
        .ground_truth(&corpus, &configured_candidate(config), options.regenerate, gate)
        .await?;

    let leaderboard = orchestrator.evaluate(&corpus, &truths, &candidates).await?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&leaderboard)?);
    } else {
        leaderboard.print();
        if options.details {
            leaderboard.print_misses();
        }
    }

    if options.cleanup {
        cleanup_after_run(config, &leaderboard)?;
    }

    Ok(())
}

fn worker_runner(config: &BenchmarkConfig, config_path: Option<&Path>) -> Result<WorkerRunner> {
    let mut args: Vec<OsString> = Vec::new();
    if let Some(path) = config_path {
        args.push("--config".into());
        args.push(path.into());
    }
    args.push("worker".into());

    Ok(WorkerRunner::current_exe(args)?
        .with_load_allowance(Duration::from_secs(config.inference.load_allowance_secs))
        .with_grace_period(Duration::from_secs(config.inference.grace_period_secs)))
}

/// The models currently in use, which also generate ground truth
fn configured_candidate(config: &BenchmarkConfig) -> CandidateModels {
    match &config.models.extractor {
        Some(extractor) => CandidateModels::pair(&config.models.categorizer, extractor),
        None => CandidateModels::categorizer_only(&config.models.categorizer),
    }
}

fn registry_client(config: &BenchmarkConfig) -> Result<RegistryClient> {
    let token = match FileSecretStore::default_location() {
        Ok(store) => resolve_token(&store, &config.registry.account)?,
        Err(e) => {
            tracing::debug!("No secret store: {:#}", e);
            None
        }
    };
    Ok(RegistryClient::connect(&config.registry.endpoint, token)?)
}

/// Resolve candidate entries into the ordered candidate list
async fn build_candidates(
    config: &BenchmarkConfig,
    categorizers: &[String],
    extractors: &[String],
    mode: EvaluationMode,
    max_candidates: usize,
) -> Result<Vec<CandidateModels>> {
    if categorizers.is_empty() {
        anyhow::bail!("No categorizer candidates. Pass --categorizer or set models.categorizer_candidates");
    }

    let client = registry_client(config)?;
    let categorizer_filters = SearchFilters {
        capability: Some(config.registry.categorizer_filter.clone()),
        limit: config.registry.discovery_limit,
    };
    let mut categorizer_pool =
        resolve_candidates(&client, categorizers, &categorizer_filters, config.registry.skip_gated).await?;
    annotate_gated(&client, categorizers, &mut categorizer_pool).await;

    let mut candidates: Vec<CandidateModels> = match mode {
        EvaluationMode::Combined if !extractors.is_empty() => {
            let extractor_filters = SearchFilters {
                capability: config.registry.extractor_filter.clone(),
                limit: config.registry.discovery_limit,
            };
            let mut extractor_pool =
                resolve_candidates(&client, extractors, &extractor_filters, config.registry.skip_gated)
                    .await?;
            annotate_gated(&client, extractors, &mut extractor_pool).await;

            diagonal_pairs(&categorizer_pool, &extractor_pool)
                .into_iter()
                .map(|(categorizer, extractor)| CandidateModels {
                    gated: categorizer.gated || extractor.gated,
                    ..CandidateModels::pair(categorizer.id, extractor.id)
                })
                .collect()
        }
        // Without extractor candidates each categorizer also extracts
        _ => categorizer_pool
            .into_iter()
            .map(|model| CandidateModels {
                gated: model.gated,
                ..CandidateModels::categorizer_only(model.id)
            })
            .collect(),
    };

    if max_candidates > 0 && candidates.len() > max_candidates {
        tracing::info!("Limiting {} candidates to {}", candidates.len(), max_candidates);
        candidates.truncate(max_candidates);
    }
    Ok(candidates)
}

/// Flag concrete entries that need registry approval; lookups are best effort
async fn annotate_gated(client: &RegistryClient, entries: &[String], pool: &mut [ResolvedModel]) {
    for model in pool.iter_mut() {
        if !entries.contains(&model.id) || !is_concrete(&model.id) {
            continue;
        }
        match client.is_gated(&model.id).await {
            Ok(gated) => model.gated = gated,
            Err(e) => tracing::debug!("Gated lookup for {} failed: {}", model.id, e),
        }
    }
}

async fn generate_ground_truth(
    config: &BenchmarkConfig,
    positive: &Path,
    negative: &Path,
    document_type: DocumentType,
    timeout: InferenceTimeout,
    regenerate: bool,
) -> Result<()> {
    let host = OpenAiHost::from_config(&config.inference)?;
    let settings = RunSettings {
        document_type,
        mode: EvaluationMode::Combined,
        timeout: timeout.as_duration(),
    };
    let mut orchestrator = Orchestrator::new(settings, &host);

    let corpus = orchestrator.enumerate(positive, negative)?;
    let truths = orchestrator
        .ground_truth(&corpus, &configured_candidate(config), regenerate, &StdinGate)
        .await?;

    let verified = truths.iter().filter(|t| t.metadata.verified).count();
    println!(
        "Ground truth ready: {} documents ({} verified)",
        truths.len(),
        verified
    );
    Ok(())
}

async fn search(config: &BenchmarkConfig, query: &str, capability: Option<String>, limit: usize) -> Result<()> {
    let client = registry_client(config)?;
    let filters = SearchFilters { capability, limit };
    let models = client.search_models(query, &filters).await?;

    if models.is_empty() {
        println!("No models found for '{}'", query);
        return Ok(());
    }

    println!(
        "{:<56} {:>12} {:>8} {:>10}  {}",
        "Model", "Downloads", "Gated", "Est. Mem", "Pipeline"
    );
    println!("{}", "─".repeat(110));
    for model in &models {
        println!(
            "{:<56} {:>12} {:>8} {:>10}  {}",
            model.id,
            model.downloads,
            if model.gated { "yes" } else { "no" },
            format_bytes(estimate_memory(&[model.id.as_str()])),
            model.pipeline_tag.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn cleanup_after_run(config: &BenchmarkConfig, leaderboard: &Leaderboard) -> Result<()> {
    let mut keep: HashSet<String> = config.configured_models().into_iter().collect();
    if let Some(winner) = leaderboard.winner() {
        keep.extend(winner.model_identifiers.iter().cloned());
    }
    run_cleanup(config, &leaderboard.used_models(), &keep)
}

fn run_cleanup(config: &BenchmarkConfig, used: &[String], keep: &HashSet<String>) -> Result<()> {
    let cache_root = config
        .cache
        .resolve_dir()
        .context("No model cache directory; set cache.dir in benchmark.toml")?;

    eprintln!("\nCleaning model cache {:?}...", cache_root);
    let report = cleanup(&cache_root, used, keep);
    for (model, bytes) in &report.removed {
        eprintln!("  ✓ {} ({})", model, format_bytes(*bytes));
    }
    for (model, error) in &report.failed {
        eprintln!("  ✗ {}: {}", model, error);
    }
    eprintln!("  {}", report.format_summary());
    Ok(())
}

fn login(config: &BenchmarkConfig, token: Option<String>) -> Result<()> {
    let token = match token {
        Some(token) => token,
        None => {
            eprint!("Registry token: ");
            std::io::stderr().flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            line
        }
    };
    let token = token.trim();
    if token.is_empty() {
        anyhow::bail!("Empty token");
    }

    let store = FileSecretStore::default_location()?;
    store.set_token(&config.registry.account, token)?;
    println!("Token stored for account '{}'", config.registry.account);
    Ok(())
}
