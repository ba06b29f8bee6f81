use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use osgrep::config::Config;
use osgrep::embed::pool::{WorkerCommand, WorkerPool};
use osgrep::project::ProjectPaths;
use osgrep::search::{Retriever, SearchOptions};
use osgrep::store::Storage;
use osgrep::sync::Syncer;

#[derive(Parser)]
#[command(name = "osgrep", about = "Local-first semantic code search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index (or re-index) the current project.
    Index {
        /// Project directory (defaults to the working directory).
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Search the index.
    Search {
        query: String,
        /// Number of results.
        #[arg(short, default_value_t = 10)]
        k: usize,
        /// Restrict results to paths under this prefix.
        #[arg(long)]
        path_prefix: Option<String>,
        /// Emit JSON instead of the compact TSV.
        #[arg(long)]
        json: bool,
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Internal: run an embedding worker on stdio (spawned by the pool).
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The worker speaks JSON on stdout; its logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Worker => {
            osgrep::embed::worker::run()?;
            Ok(())
        }
        Commands::Index { path } => {
            let (paths, config, storage) = open_project(path)?;
            let pool = Arc::new(WorkerPool::start(config.clone(), WorkerCommand::current_exe()?).await?);

            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Cancellation requested, finishing in-flight work");
                    ctrl_c_cancel.cancel();
                }
            });

            let syncer = Syncer::new(paths, config, storage, pool.clone());
            let report = syncer.sync(&cancel, &mut ()).await;
            pool.shutdown().await;
            let report = report?;

            println!(
                "processed {} indexed {} total {}{}",
                report.processed,
                report.indexed,
                report.total,
                if report.complete { "" } else { " (incomplete)" }
            );
            Ok(())
        }
        Commands::Search {
            query,
            k,
            path_prefix,
            json,
            path,
        } => {
            let (_paths, config, storage) = open_project(path)?;
            let pool = Arc::new(WorkerPool::start(config, WorkerCommand::current_exe()?).await?);

            let retriever = Retriever::new(storage, pool.clone());
            let options = SearchOptions {
                path_prefix,
                filter: None,
            };
            let results = retriever.search(&query, k, &options).await;
            pool.shutdown().await;
            let results = results?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print!("{}", osgrep::models::results_to_tsv(&results));
            }
            Ok(())
        }
    }
}

fn open_project(
    path: Option<PathBuf>,
) -> anyhow::Result<(ProjectPaths, Config, Arc<Storage>)> {
    let start = match path {
        Some(p) => p,
        None => std::env::current_dir()?,
    };
    let paths = ProjectPaths::discover(&start)?;
    let config = Config::from_env();
    let storage = Arc::new(Storage::open(
        &paths.store_dir(),
        &config.store_name,
        config.vector_cache_max,
    )?);
    Ok((paths, config, storage))
}
