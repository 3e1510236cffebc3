use std::process;

use clap::{Parser, Subcommand};

use wdf_indexer::config::Config;
use wdf_indexer::error::PipelineError;
use wdf_indexer::item_source::HttpItemSource;
use wdf_indexer::metrics::PipelineMetrics;
use wdf_indexer::pipeline::{self, CancellationToken};
use wdf_indexer::store::duckdb_store::DuckDbStore;
use wdf_indexer::store::Store;

#[derive(Parser)]
#[command(name = "wdf-indexer")]
#[command(about = "Chunked indexing pipeline for marketplace crawler dumps")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Materialize dictionaries and SKUs for a job without writing versions.
    PrepareDump {
        job: String,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long, value_parser = ["yes", "no"], default_value = "no")]
        background: String,
    },
    /// Run the full prepare -> import -> wrap chain for one job, in-process.
    ImportDump {
        job: String,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        group_size: Option<usize>,
        #[arg(long, value_parser = ["yes", "no"], default_value = "no")]
        background: String,
    },
    /// Run the full chain for every dump matching the given crawler tags
    /// and/or internal state, resuming partially-imported ones.
    ImportAll {
        #[arg(long)]
        tags: Option<String>,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        group_size: Option<usize>,
    },
    /// Prune a single stuck dump, or every dump older than `--older-than`
    /// minutes that has not reached PROCESSED or ERROR.
    ClearUnfinished {
        #[arg(long)]
        job_id: Option<String>,
        #[arg(long)]
        older_than: Option<i64>,
    },
    /// Report dumps that look stuck (older than `--older-than` minutes,
    /// not PROCESSED/ERROR) without touching them.
    CheckUnfinished {
        #[arg(long)]
        older_than: Option<i64>,
    },
    /// Consolidate SKUs that duplicate an article.
    MergeDuplicates {
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long, value_parser = ["yes", "no"], default_value = "yes")]
        process_all: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            process::exit(2);
        }
    };

    let cli = Cli::parse();
    let exit_code = run(cli, config).await;
    process::exit(exit_code);
}

async fn run(cli: Cli, mut config: Config) -> i32 {
    let store = match DuckDbStore::open(&config.store_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to open store: {e}");
            return e.exit_code();
        }
    };
    let source = HttpItemSource::new(
        config.item_source_base_url.clone(),
        config.item_source_api_key.clone(),
    );
    let metrics = PipelineMetrics::new();
    let cancel = install_cancellation_handler();

    let result = match cli.command {
        Command::PrepareDump { job, chunk_size, background } => {
            apply_chunk_size(&mut config, chunk_size);
            log_background_note(&background);
            pipeline::prepare_dump(&store, &source, &metrics, &config, &job, &cancel)
                .await
                .map(|d| println!("{job}: {} (state_code={})", d.state.as_str(), d.state.code()))
        }
        Command::ImportDump {
            job,
            chunk_size,
            group_size,
            background,
        } => {
            apply_chunk_size(&mut config, chunk_size);
            if let Some(g) = group_size {
                config.group_size = g;
            }
            log_background_note(&background);
            pipeline::run_full_dump(&store, &source, &metrics, &config, &job, config.group_size, &cancel)
                .await
                .map(|d| println!("{job}: {} (state_code={})", d.state.as_str(), d.state.code()))
        }
        Command::ImportAll {
            tags,
            state,
            chunk_size,
            group_size,
        } => {
            apply_chunk_size(&mut config, chunk_size);
            if let Some(g) = group_size {
                config.group_size = g;
            }
            import_all(&store, &source, &metrics, &config, tags, state, &cancel).await
        }
        Command::ClearUnfinished { job_id, older_than } => {
            let threshold = older_than.unwrap_or(config.stale_dump_minutes);
            clear_unfinished(&store, &metrics, &config, job_id, threshold)
        }
        Command::CheckUnfinished { older_than } => {
            let threshold = older_than.unwrap_or(config.stale_dump_minutes);
            check_unfinished(&store, threshold)
        }
        Command::MergeDuplicates { chunk_size, process_all } => {
            let chunk_size = chunk_size.unwrap_or(config.save_chunk_size);
            let process_all = process_all == "yes";
            pipeline::run_merge_duplicates(&store, chunk_size, process_all)
                .map(|n| println!("merged {n} duplicate article group(s)"))
        }
    };

    match result {
        Ok(()) => {
            log::info!("{}", metrics.summary());
            0
        }
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}

fn apply_chunk_size(config: &mut Config, chunk_size: Option<usize>) {
    if let Some(n) = chunk_size {
        config.get_chunk_size = n;
        config.save_chunk_size = n;
    }
}

fn log_background_note(background: &str) {
    if background == "yes" {
        log::warn!("--background yes requested, but this binary has no task broker to hand off to; running synchronously");
    }
}

async fn import_all(
    store: &DuckDbStore,
    source: &HttpItemSource,
    metrics: &PipelineMetrics,
    config: &Config,
    tags: Option<String>,
    state: Option<String>,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let tags: Vec<String> = tags
        .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let dumps = store.dumps_by_tags(&tags, state.as_deref())?;
    if dumps.is_empty() {
        println!("no dumps matched tags={tags:?} state={state:?}");
        return Ok(());
    }

    for summary in dumps {
        if cancel.is_cancelled() {
            log::warn!("import_all cancelled");
            break;
        }
        log::info!("importing {} ({})", summary.job, summary.crawler);
        match pipeline::run_full_dump(store, source, metrics, config, &summary.job, config.group_size, cancel).await {
            Ok(d) => println!("{}: {} (state_code={})", summary.job, d.state.as_str(), d.state.code()),
            Err(e) => eprintln!("{}: {e}", summary.job),
        }
    }
    Ok(())
}

fn clear_unfinished(
    store: &DuckDbStore,
    metrics: &PipelineMetrics,
    config: &Config,
    job_id: Option<String>,
    older_than_minutes: i64,
) -> Result<(), PipelineError> {
    if let Some(job) = job_id {
        pipeline::prune_dump(store, metrics, config, &job)?;
        println!("pruned {job}");
        return Ok(());
    }

    let stale = store.stale_dumps(older_than_minutes)?;
    if stale.is_empty() {
        println!("no dumps older than {older_than_minutes} minutes found");
    }
    for summary in &stale {
        pipeline::prune_dump(store, metrics, config, &summary.job)?;
        println!("pruned {} ({}, {})", summary.job, summary.crawler, summary.state);
    }
    Ok(())
}

fn check_unfinished(store: &DuckDbStore, older_than_minutes: i64) -> Result<(), PipelineError> {
    let stale = store.stale_dumps(older_than_minutes)?;
    if stale.is_empty() {
        println!("no dumps older than {older_than_minutes} minutes found");
        return Ok(());
    }
    for summary in &stale {
        println!(
            "{} crawler={} state={} state_code={}",
            summary.job, summary.crawler, summary.state, summary.state_code
        );
    }
    Ok(())
}

fn install_cancellation_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let flag = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("received interrupt, cancelling at next chunk boundary");
            flag.cancel();
        }
    });
    token
}
