//! CLI entry point for the embedding search engine.
//!
//! Loads JSON Lines embeddings into a [`Dispatcher`] and exposes search,
//! clustering, device and status commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use embedsearch::compute::{self, Accelerator};
use embedsearch::io::{ExitCode, JsonResponse, OutputFormat, ResponseMeta, load_records};
use embedsearch::{AsyncSearcher, ClusteringParams, Dispatcher, NodeId, SearchOutcome, Settings};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Embedding similarity search
#[derive(Parser)]
#[command(
    name = "embedsearch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Embedding similarity search with background clustering",
    next_line_help = true,
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Set up .embedsearch directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    #[command(about = "Display active settings")]
    Config,

    #[command(about = "Probe the compute device and print its capabilities")]
    Devices,

    #[command(about = "Cluster a JSON Lines embeddings file and print cluster summaries")]
    Cluster {
        /// Embeddings file, one {"id", "vector"} object per line
        input: PathBuf,

        /// Cluster count (0 derives it from the corpus size)
        #[arg(short, long, default_value_t = 0)]
        k: usize,
    },

    #[command(about = "Search a JSON Lines embeddings file")]
    Search {
        /// Embeddings file, one {"id", "vector"} object per line
        input: PathBuf,

        /// Query vector as a JSON array
        #[arg(short, long, conflicts_with = "query_id")]
        query: Option<String>,

        /// Use the stored vector of this id as the query
        #[arg(long)]
        query_id: Option<String>,

        /// Number of results (defaults to search.default_k)
        #[arg(short)]
        k: Option<usize>,

        /// Run a clustering pass before searching
        #[arg(long)]
        cluster: bool,
    },

    #[command(about = "Load an embeddings file and print dispatcher status")]
    Status {
        input: PathBuf,

        /// Run a clustering pass before reporting
        #[arg(long)]
        cluster: bool,
    },

    #[command(about = "Compare brute-force and clustered search on synthetic data")]
    Bench {
        #[arg(long, default_value_t = 20_000)]
        embeddings: usize,

        #[arg(long, default_value_t = 128)]
        dims: usize,

        #[arg(long, default_value_t = 100)]
        queries: usize,

        #[arg(short, default_value_t = 10)]
        k: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let format = OutputFormat::from_json_flag(cli.json);

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path).unwrap_or_else(|e| {
            eprintln!("Configuration error loading from {}: {e}", path.display());
            std::process::exit(ExitCode::ConfigError.into());
        }),
        None => Settings::load().unwrap_or_else(|e| {
            eprintln!("Configuration error: {e}");
            Settings::default()
        }),
    };
    init_logging(&settings);

    let code = match run(cli.command, settings, format).await {
        Ok(code) => code,
        Err(e) => {
            if format.is_json() {
                let response = JsonResponse::error(ExitCode::GeneralError, &format!("{e:#}"), vec![]);
                print_json(&response);
            } else {
                eprintln!("Error: {e:#}");
            }
            ExitCode::GeneralError
        }
    };
    std::process::exit(code.into());
}

fn init_logging(settings: &Settings) {
    let level = settings
        .logging
        .level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands, settings: Settings, format: OutputFormat) -> Result<ExitCode> {
    match command {
        Commands::Init { force } => {
            let path = Settings::init_config_file(".", force)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("Created configuration file at: {}", path.display());
            println!("Edit this file to customize your settings.");
            Ok(ExitCode::Success)
        }

        Commands::Config => {
            if format.is_json() {
                print_json(&JsonResponse::success(&settings));
            } else {
                println!("{}", toml::to_string_pretty(&settings)?);
            }
            Ok(ExitCode::Success)
        }

        Commands::Devices => {
            let device = compute::probe_or_unavailable(&settings.compute);
            if format.is_json() {
                #[derive(Serialize)]
                struct Devices {
                    available: bool,
                    info: compute::DeviceInfo,
                    memory: compute::MemoryInfo,
                }
                print_json(&JsonResponse::success(Devices {
                    available: device.is_available(),
                    info: device.info(),
                    memory: device.memory_info(),
                }));
            } else {
                let info = device.info();
                println!("Backend:          {}", info.backend);
                println!("Available:        {}", device.is_available());
                println!("Name:             {}", info.name);
                println!("Compute units:    {}", info.compute_units);
                println!("Threads/group:    {}", info.max_threads_per_group);
                println!("Memory:           {} MB", info.total_memory / (1024 * 1024));
                println!("Max buffer:       {} MB", info.max_buffer_length / (1024 * 1024));
                println!("Unified memory:   {}", info.unified_memory);
                println!("Matrix kernels:   {}", info.supports_matrix);
            }
            Ok(if device.is_available() {
                ExitCode::Success
            } else {
                ExitCode::ComputeError
            })
        }

        Commands::Cluster { input, k } => {
            let dispatcher = load_dispatcher(settings, &input)?;
            let clustering = &dispatcher.settings().clustering;
            let params = ClusteringParams {
                k,
                max_iterations: clustering.max_iterations,
                tolerance: clustering.tolerance,
            };
            let start = Instant::now();
            let summaries = match dispatcher.run_clustering(params) {
                Ok(summaries) => summaries,
                Err(e) => {
                    let code = ExitCode::from_admin_error(&e);
                    if format.is_json() {
                        print_json(&JsonResponse::error(code, &e.to_string(), vec![]));
                    } else {
                        eprintln!("Error: {e}");
                    }
                    return Ok(code);
                }
            };

            if format.is_json() {
                let meta = ResponseMeta::now(Some(start.elapsed().as_millis() as u64));
                print_json(&JsonResponse::success(&summaries).with_meta(meta));
            } else {
                println!(
                    "{} clusters over {} embeddings in {:.2?}",
                    summaries.len(),
                    dispatcher.len(),
                    start.elapsed()
                );
                for summary in &summaries {
                    println!("  cluster {:>4}  size {:>8}", summary.cluster_id, summary.size);
                }
            }
            Ok(ExitCode::Success)
        }

        Commands::Search {
            input,
            query,
            query_id,
            k,
            cluster,
        } => {
            let dispatcher = Arc::new(load_dispatcher(settings, &input)?);
            let query = match (query, query_id) {
                (Some(raw), _) => serde_json::from_str::<Vec<f32>>(&raw)
                    .context("--query must be a JSON array of numbers")?,
                (None, Some(id)) => raw_vector(&dispatcher, &input, &id)?,
                (None, None) => anyhow::bail!("either --query or --query-id is required"),
            };
            if cluster {
                dispatcher.tick();
            }

            let k = k.unwrap_or(dispatcher.settings().search.default_k);
            let searcher = AsyncSearcher::from_dispatcher(Arc::clone(&dispatcher));
            match searcher.search(query, k).await {
                Ok(outcome) => {
                    print_outcome(&outcome, format);
                    Ok(ExitCode::from_results(&outcome.results))
                }
                Err(e) => {
                    if format.is_json() {
                        print_json(&JsonResponse::from_error(&e));
                    } else {
                        eprintln!("Error: {e}");
                    }
                    Ok(ExitCode::from_error(&e))
                }
            }
        }

        Commands::Status { input, cluster } => {
            let dispatcher = load_dispatcher(settings, &input)?;
            if cluster {
                dispatcher.tick();
            }
            let status = dispatcher.status();
            if format.is_json() {
                print_json(&JsonResponse::success(&status));
            } else {
                println!("State:            {:?}", status.state);
                println!("Next search mode: {}", status.mode);
                println!("Corpus size:      {}", status.corpus_size);
                println!("Threshold:        {}", status.threshold);
                println!("Backend:          {}", status.backend);
                println!("Clusters:         {}", status.clusters);
                println!("Pending:          {}", status.pending_embeddings);
                if let Some(duration) = status.last_clustering_duration {
                    println!("Last clustering:  {duration:.2?}");
                }
                if let Some(error) = &status.last_clustering_error {
                    println!("Last error:       {error}");
                }
            }
            Ok(ExitCode::Success)
        }

        Commands::Bench {
            embeddings,
            dims,
            queries,
            k,
        } => {
            bench(settings, embeddings, dims, queries, k)?;
            Ok(ExitCode::Success)
        }
    }
}

/// Builds a dispatcher sized to the input file's dimension.
fn load_dispatcher(mut settings: Settings, input: &Path) -> Result<Dispatcher> {
    let records = load_records(input)?;
    if let Some(first) = records.first() {
        settings.index.dimensions = first.vector.len();
    }

    let dispatcher = Dispatcher::from_settings(settings)?;
    let (ids, vectors): (Vec<NodeId>, Vec<Vec<f32>>) =
        records.into_iter().map(|r| (r.id, r.vector)).unzip();
    dispatcher
        .insert_batch(&ids, &vectors)
        .with_context(|| format!("loading {}", input.display()))?;
    tracing::info!(embeddings = dispatcher.len(), "loaded corpus");
    Ok(dispatcher)
}

/// Raw vector of `id` from the input file.
fn raw_vector(dispatcher: &Dispatcher, input: &Path, id: &str) -> Result<Vec<f32>> {
    let id = NodeId::new(id);
    if !dispatcher.contains(&id) {
        anyhow::bail!("id '{id}' not found in {}", input.display());
    }
    load_records(input)?
        .into_iter()
        .find(|record| record.id == id)
        .map(|record| record.vector)
        .with_context(|| format!("id '{id}' not found in {}", input.display()))
}

fn print_outcome(outcome: &SearchOutcome, format: OutputFormat) {
    if format.is_json() {
        let meta = ResponseMeta::now(Some(outcome.diagnostics.duration.as_millis() as u64));
        print_json(&JsonResponse::success(outcome).with_meta(meta));
        return;
    }

    let d = &outcome.diagnostics;
    match d.fallback_reason {
        Some(reason) => println!(
            "{} search ({reason}) over {} candidates on {} in {:.2?}",
            d.mode, d.candidates, d.backend, d.duration
        ),
        None => println!(
            "{} search over {} candidates in {} clusters on {} in {:.2?}",
            d.mode, d.candidates, d.clusters_searched, d.backend, d.duration
        ),
    }
    for (rank, hit) in outcome.results.iter().enumerate() {
        println!("{:>4}. {:<40} {:.6}", rank + 1, hit.id, hit.score);
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error serializing output: {e}"),
    }
}

fn bench(mut settings: Settings, n: usize, dims: usize, queries: usize, k: usize) -> Result<()> {
    settings.index.dimensions = dims;
    settings.clustering.min_embeddings = settings.clustering.min_embeddings.min(n);
    let dispatcher = Dispatcher::from_settings(settings)?;

    let mut rng = StdRng::seed_from_u64(42);
    let random_vector = |rng: &mut StdRng| -> Vec<f32> {
        (0..dims).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect()
    };
    for i in 0..n {
        dispatcher.insert(NodeId::new(format!("v{i}")), &random_vector(&mut rng))?;
    }
    let queries: Vec<Vec<f32>> = (0..queries).map(|_| random_vector(&mut rng)).collect();

    let time_queries = |label: &str| -> Result<()> {
        let start = Instant::now();
        let mut candidates = 0;
        for query in &queries {
            candidates += dispatcher.search(query, k)?.diagnostics.candidates;
        }
        let elapsed = start.elapsed();
        println!(
            "{label:<12} {:>8.2?}/query  {:>10} candidates/query",
            elapsed / queries.len().max(1) as u32,
            candidates / queries.len().max(1)
        );
        Ok(())
    };

    println!("{n} embeddings x {dims} dims, k = {k}");
    time_queries("brute force")?;

    let start = Instant::now();
    if dispatcher.tick() {
        println!("clustering   {:>8.2?}", start.elapsed());
        time_queries("clustered")?;
    } else {
        println!("clustering skipped (disabled or corpus below threshold)");
    }
    Ok(())
}
