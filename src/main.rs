//! CLI entry point for the corpus atlas.
//!
//! Provides commands for ingesting text, searching, exporting the layout and
//! serving the HTTP API.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use serde::Serialize;

use corpus_atlas::chunking::Chunker;
use corpus_atlas::embedding::create_generator;
use corpus_atlas::io::progress::{IngestProgress, SourceTally, with_spinner};
use corpus_atlas::io::{ExitCode, JsonResponse, OutputFormat};
use corpus_atlas::service::ingest_text;
use corpus_atlas::{
    Corpus, CorpusError, IngestReport, LayoutDims, ProjectionMethod, Settings, logging,
};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Incremental semantic map of a text corpus
#[derive(Parser)]
#[command(
    name = "atlas",
    version = env!("CARGO_PKG_VERSION"),
    about = "Incremental semantic map of a text corpus",
    long_about = "Ingest text, search it by meaning and export a continuously refined 2-D/3-D layout.",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Quick Start:\n  $ atlas init\n  $ atlas ingest notes.txt\n  $ atlas search \"whale ship sea\"\n  $ atlas points --json > points.json"
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Set up .atlas directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    #[command(about = "Display active settings")]
    Config,

    #[command(
        about = "Chunk, embed and insert text files",
        after_help = "Examples:\n  atlas ingest notes.txt\n  atlas ingest a.txt b.txt\n  atlas ingest - --source clipboard < text.txt"
    )]
    Ingest {
        /// Files to ingest; `-` reads standard input
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Source label (defaults to the file name); only with a single path
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        json: bool,
    },

    #[command(about = "Find the chunks nearest to a query")]
    Search {
        query: String,

        /// Number of results
        #[arg(short, default_value = "10")]
        k: usize,

        /// Coordinates from the corpus `layout` or a `pca` of the hits
        #[arg(long, default_value = "layout")]
        method: ProjectionMethod,

        /// 2 or 3; defaults to the corpus layout
        #[arg(long)]
        dims: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    #[command(about = "Export every placed point with its coordinates")]
    Points {
        #[arg(long)]
        json: bool,
    },

    #[command(about = "Run a global layout settle now")]
    Settle {
        #[arg(long)]
        json: bool,
    },

    #[command(about = "Show corpus statistics")]
    Status {
        #[arg(long)]
        json: bool,
    },

    #[command(about = "Delete every chunk and start an empty corpus")]
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },

    #[cfg(feature = "http-server")]
    #[command(about = "Serve the JSON API")]
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if !matches!(cli.command, Commands::Init { .. })
        && let Err(warning) = Settings::check_init()
    {
        eprintln!("Warning: {warning}");
        eprintln!("Using default configuration for now.");
    }

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
    logging::init(&settings.logging);

    let code = match run(cli.command, settings).await {
        Ok(code) => code,
        Err(e) => match e.downcast_ref::<CorpusError>() {
            Some(error) => {
                eprintln!("Error: {error}");
                for suggestion in error.recovery_suggestions() {
                    eprintln!("  - {suggestion}");
                }
                ExitCode::from_error(error)
            }
            None => {
                eprintln!("Error: {e:#}");
                ExitCode::GeneralError
            }
        },
    };
    std::process::exit(code.into());
}

async fn run(command: Commands, settings: Settings) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Init { force } => {
            let path = Settings::init_config_file(force).map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("Created configuration file at: {}", path.display());
            println!("Edit this file to customize your settings.");
            Ok(ExitCode::Success)
        }

        Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(ExitCode::Success)
        }

        Commands::Ingest {
            paths,
            source,
            json,
        } => {
            if source.is_some() && paths.len() > 1 {
                anyhow::bail!("--source can only be used with a single path");
            }
            blocking(move || ingest(&settings, &paths, source, json)).await
        }

        Commands::Search {
            query,
            k,
            method,
            dims,
            json,
        } => {
            blocking(move || {
                let embedder = create_generator(&settings.embedding)?;
                let corpus = open(&settings)?;
                let vector = embedder.embed(&query)?;
                let dims = match dims {
                    Some(dims) => LayoutDims::try_from(dims)?,
                    None => corpus.read().layout().dims(),
                };
                let hits = corpus.search_projected(&vector, k, method, dims)?;
                if OutputFormat::from_json_flag(json).is_json() {
                    print_json(&hits)?;
                } else if hits.is_empty() {
                    println!("No results.");
                } else {
                    for hit in &hits {
                        println!(
                            "{:>6}  {:.4}  {}#{}  {}",
                            hit.id,
                            hit.score.get(),
                            hit.source,
                            hit.chunk_index,
                            hit.preview.replace('\n', " ")
                        );
                    }
                }
                Ok(ExitCode::Success)
            })
            .await
        }

        Commands::Points { json } => {
            blocking(move || {
                let points = open(&settings)?.points();
                if OutputFormat::from_json_flag(json).is_json() {
                    print_json(&points)?;
                } else {
                    for point in &points {
                        let coords: Vec<String> =
                            point.coords.iter().map(|c| format!("{c:.4}")).collect();
                        println!(
                            "{:>6}  [{}]  {:?}  {}#{}",
                            point.id,
                            coords.join(", "),
                            point.state,
                            point.source,
                            point.chunk_index
                        );
                    }
                }
                Ok(ExitCode::Success)
            })
            .await
        }

        Commands::Settle { json } => {
            blocking(move || {
                let corpus = open(&settings)?;
                let outcome = with_spinner("Settling layout", || corpus.settle_now())?;
                if json {
                    print_json(&outcome)?;
                } else {
                    println!(
                        "Settled {} points over {} edges in {} ms",
                        outcome.points, outcome.edges, outcome.elapsed_ms
                    );
                    if !outcome.corrupted.is_empty() {
                        println!("Frozen after divergence: {:?}", outcome.corrupted);
                    }
                }
                Ok(ExitCode::Success)
            })
            .await
        }

        Commands::Status { json } => {
            blocking(move || {
                let stats = open(&settings)?.stats();
                if json {
                    print_json(&stats)?;
                } else {
                    println!("Corpus:        {}", settings.data_path.display());
                    println!("Chunks:        {}", stats.chunks);
                    match stats.dimension {
                        Some(dim) => println!("Dimension:     {dim}"),
                        None => println!("Dimension:     (empty)"),
                    }
                    println!("Metric:        {}", stats.metric);
                    println!("Layout dims:   {}", stats.layout_dims);
                    println!("Settled:       {}", stats.settled);
                    println!("Local only:    {}", stats.locally_placed);
                    println!("Edges:         {}", stats.edges);
                    println!("Generation:    {}", stats.generation);
                }
                Ok(ExitCode::Success)
            })
            .await
        }

        Commands::Reset { yes } => {
            if !yes {
                eprintln!("Refusing to reset without --yes");
                return Ok(ExitCode::GeneralError);
            }
            blocking(move || {
                open(&settings)?.reset()?;
                println!("Corpus reset.");
                Ok(ExitCode::Success)
            })
            .await
        }

        #[cfg(feature = "http-server")]
        Commands::Serve { bind } => {
            let mut settings = settings;
            if let Some(bind) = bind {
                settings.server.bind = bind;
            }
            corpus_atlas::http::serve(settings).await?;
            Ok(ExitCode::Success)
        }
    }
}

fn ingest(
    settings: &Settings,
    paths: &[PathBuf],
    source: Option<String>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let embedder = create_generator(&settings.embedding)?;
    let chunker = Chunker::from_config(&settings.chunking);
    let corpus = open(settings)?;

    let mut progress = IngestProgress::new(paths.len(), !json);
    let mut report = IngestReport::default();
    for path in paths {
        let text = read_input(path)?;
        let label = source.clone().unwrap_or_else(|| source_label(path));
        progress.start_source(&label);
        let source_report = ingest_text(&corpus, embedder.as_ref(), &chunker, &label, &text)?;
        progress.finish_source(&label, &source_report);
        report.merge(source_report);
    }
    let tally = progress.finish();

    if json {
        #[derive(Serialize)]
        struct IngestOutput {
            ingested: usize,
            failures: Vec<String>,
            corrupted: usize,
            total_chunks: usize,
            sources: Vec<SourceTally>,
        }
        print_json(&IngestOutput {
            sources: tally.sources,
            ingested: report.ingested.len(),
            failures: report
                .failures
                .iter()
                .map(|f| format!("{}#{}: {}", f.source, f.chunk_index, f.error))
                .collect(),
            corrupted: report.corrupted.len(),
            total_chunks: corpus.read().len(),
        })?;
    } else {
        println!(
            "Ingested {} chunks from {} sources ({} in corpus)",
            tally.inserted,
            tally.sources.len(),
            corpus.read().len()
        );
        for partial in tally.incomplete() {
            eprintln!(
                "  {}: {} chunks stored, {} failed",
                partial.source, partial.inserted, partial.failed
            );
        }
        for failure in &report.failures {
            eprintln!(
                "  failed {}#{}: {}",
                failure.source, failure.chunk_index, failure.error
            );
        }
    }

    Ok(if report.failures.is_empty() {
        ExitCode::Success
    } else {
        ExitCode::PartialIngest
    })
}

fn open(settings: &Settings) -> anyhow::Result<Corpus> {
    Corpus::open(settings).with_context(|| {
        format!("failed to open corpus at {}", settings.data_path.display())
    })
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("failed to read stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn source_label(path: &Path) -> String {
    if path == Path::new("-") {
        return "stdin".to_string();
    }
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_json<T: Serialize>(data: T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&JsonResponse::success(data))?
    );
    Ok(())
}

async fn blocking<F>(task: F) -> anyhow::Result<ExitCode>
where
    F: FnOnce() -> anyhow::Result<ExitCode> + Send + 'static,
{
    tokio::task::spawn_blocking(task).await?
}
