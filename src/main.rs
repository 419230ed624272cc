//! seqindex command-line binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use seqindex::builder::IndexBuilder;
use seqindex::config::{AppConfig, LogFormat};
use seqindex::corpus::{Corpus, CsvOptions};
use seqindex::filter::WindowRange;
use seqindex::index::Collection;
use seqindex::normalize::Point;
use seqindex::query::{QueryEngine, QueryMode};
use seqindex::session::{Session, SketchInput, SubmitRequest};
use seqindex::storage::{create_storage, StorageBackend};

#[derive(Parser, Debug)]
#[command(name = "seqindex", author, version, about = "Sketch-to-subsequence search over time series")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index every window of a series table
    Build {
        /// CSV with a date column and one column per series
        #[arg(long, conflicts_with = "random_walk")]
        csv: Option<PathBuf>,
        /// Index N seeded random walks instead of a CSV
        #[arg(long, value_name = "N")]
        random_walk: Option<usize>,
        #[arg(long, default_value = "365")]
        length: usize,
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Comma-separated window sizes, e.g. 7,14,30
        #[arg(long, value_delimiter = ',')]
        window_sizes: Option<Vec<usize>>,
        /// Drop series with any missing value
        #[arg(long)]
        drop_incomplete: bool,
        /// Clear the collection before building
        #[arg(long)]
        clear: bool,
    },
    /// Submit a sketch and print the ranked matches
    Query {
        /// JSON file: an array of numbers or of {"x", "y"} points
        #[arg(long, conflicts_with = "path")]
        points: Option<PathBuf>,
        /// SVG-style path such as "M0,0L10,5L20,2"
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        k: Option<usize>,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Comma-separated series names to restrict to
        #[arg(long, value_delimiter = ',')]
        names: Option<Vec<String>>,
        #[arg(long)]
        min_window: Option<usize>,
        #[arg(long)]
        max_window: Option<usize>,
    },
    /// Print collection statistics
    Stats,
    /// Remove every indexed window
    Clear,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    PerName,
    Global,
}

impl From<ModeArg> for QueryMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::PerName => QueryMode::PerName,
            ModeArg::Global => QueryMode::Global,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load().context("failed to load configuration")?;

    init_tracing(&config)?;

    match cli.command {
        Commands::Build {
            csv,
            random_walk,
            length,
            seed,
            window_sizes,
            drop_incomplete,
            clear,
        } => {
            if let Some(sizes) = window_sizes {
                config.index.window_sizes = sizes;
                config.validate().context("invalid --window-sizes")?;
            }

            let corpus = match (csv, random_walk) {
                (Some(path), _) => {
                    let options = CsvOptions {
                        date_column: None,
                        drop_incomplete,
                        max_series: config.index.max_series,
                    };
                    Corpus::from_csv_path(&path, &options)
                        .with_context(|| format!("failed to load {}", path.display()))?
                }
                (None, Some(n)) => Corpus::random_walk(n, length, seed)
                    .context("failed to generate random-walk corpus")?,
                (None, None) => bail!("build needs --csv <file> or --random-walk <N>"),
            };
            tracing::info!(
                series = corpus.len(),
                length = corpus.series_length(),
                "Loaded corpus"
            );

            let collection = Collection::open_or_create(
                config.storage.collection.clone(),
                config.index.target_size,
                config.index.metric,
                open_storage(&config)?,
                config.collection_options(),
            )
            .await
            .with_context(|| format!("failed to open collection {}", config.storage.collection))?;
            if clear {
                collection.clear().await.context("failed to clear collection")?;
            }

            let builder = IndexBuilder::new(config.build_config())?;
            let report = builder
                .build(&corpus, &collection)
                .await
                .context("index build failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Query {
            points,
            path,
            k,
            mode,
            names,
            min_window,
            max_window,
        } => {
            let sketch = match (points, path) {
                (Some(file), _) => read_points(&file)?,
                (None, Some(path)) => SketchInput::Path(path),
                (None, None) => bail!("query needs --points <file> or --path <svg path>"),
            };
            if let Some(mode) = mode {
                config.query.mode = mode.into();
            }

            let (default_min, default_max) = config.session.default_window_range;
            let window_range = WindowRange::new(
                min_window.unwrap_or(default_min),
                max_window.unwrap_or(default_max),
            )?;

            let collection = Collection::open_populated(
                config.storage.collection.clone(),
                open_storage(&config)?,
                config.collection_options(),
            )
            .await
            .context("nothing to query, run `seqindex build` first")?;
            let collection = Arc::new(collection);
            let engine = QueryEngine::new(collection, config.query_config())?;
            let session = Session::new(engine, config.session_config());

            let submitted = session
                .submit(
                    session.initial_state(),
                    SubmitRequest {
                        sketch,
                        window_range,
                        names,
                        k,
                    },
                )
                .await?;
            if let Some(error) = &submitted.error {
                tracing::warn!(%error, "Index failed for this sketch");
            }

            let view = session.view(&submitted.state)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Stats => {
            let collection = open_collection(&config).await?;
            println!("{}", serde_json::to_string_pretty(&collection.stats().await)?);
        }
        Commands::Clear => {
            let collection = open_collection(&config).await?;
            collection.clear().await.context("failed to clear collection")?;
            println!("Cleared collection {}", collection.name());
        }
    }

    Ok(())
}

fn open_storage(config: &AppConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let storage = create_storage(config.storage_config()).context("failed to open storage")?;
    Ok(Arc::from(storage))
}

/// Open an existing collection without creating one as a side effect
async fn open_collection(config: &AppConfig) -> anyhow::Result<Collection> {
    Collection::open(
        config.storage.collection.clone(),
        open_storage(config)?,
        config.collection_options(),
    )
    .await
    .with_context(|| format!("failed to open collection {}", config.storage.collection))
}

fn read_points(file: &PathBuf) -> anyhow::Result<SketchInput> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    if let Ok(samples) = serde_json::from_str::<Vec<f64>>(&raw) {
        return Ok(SketchInput::Samples(samples));
    }
    let points: Vec<Point> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is neither a number array nor a point array", file.display()))?;
    Ok(SketchInput::Points(points))
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.logging.level.clone()))
        .unwrap_or_else(|_| EnvFilter::new("seqindex=info"));

    // Logs go to stderr so command output stays machine readable
    let registry = tracing_subscriber::registry().with(env_filter);

    match config.logging.format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
