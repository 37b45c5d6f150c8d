//! VEP Ingest - vendor file loader

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vep_common::logging::{init_logging, LogConfig, LogLevel};
use vep_common::CanonicalSchema;
use vep_ingest::db::{create_pool, health_check, DbConfig};
use vep_ingest::{
    FileOutcome, IngestConfig, IngestionPipeline, IngestionRunCoordinator, MappingTable,
    MemoryStore, PgRelationStore, PipelineState, ProgressEvent, RelationStore, SourceFile,
    TableProvisioner, UnmappedColumnPolicy, VendorFieldMapper,
};

#[derive(Parser, Debug)]
#[command(name = "vep-ingest")]
#[command(author, version, about = "Load vendor voter and target files into PostgreSQL")]
struct Cli {
    /// Mapping table (CSV or JSON)
    #[arg(short, long, env = "VEP_MAPPING_FILE")]
    mapping: PathBuf,

    /// Canonical schema definition (JSON); defaults to the built-in voter-file schema
    #[arg(long, env = "VEP_SCHEMA_FILE")]
    schema: Option<PathBuf>,

    /// JSON array of {path, vendor, jurisdiction, namespace} entries
    #[arg(long, conflicts_with_all = ["vendor", "jurisdiction", "paths"])]
    manifest: Option<PathBuf>,

    /// Vendor that produced the files
    #[arg(long, requires = "jurisdiction")]
    vendor: Option<String>,

    /// Jurisdiction (state) the files cover
    #[arg(long, requires = "vendor")]
    jurisdiction: Option<String>,

    /// Target schema namespace
    #[arg(short, long, default_value = "voterfile")]
    namespace: String,

    /// Unmapped column policy; overrides VEP_UNMAPPED_COLUMNS
    #[arg(long)]
    unmapped_columns: Option<UnmappedColumnPolicy>,

    /// Load into an in-memory store instead of PostgreSQL
    #[arg(long)]
    dry_run: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// CSV files, or directories whose *.csv files are loaded
    paths: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("vep-ingest")
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env()?;
    if let Some(policy) = cli.unmapped_columns {
        config.unmapped_columns = policy;
    }
    info!(
        unmapped_columns = %config.unmapped_columns,
        batch_size = config.batch_size,
        max_concurrent_files = config.max_concurrent_files,
        "Loaded ingest configuration"
    );

    let schema = match &cli.schema {
        Some(path) => CanonicalSchema::from_json_file(path)
            .with_context(|| format!("Failed to load schema from {}", path.display()))?,
        None => CanonicalSchema::voter_file(),
    };
    let schema = Arc::new(schema);

    let table = MappingTable::load(Arc::clone(&schema), &cli.mapping)
        .with_context(|| format!("Failed to load mapping table {}", cli.mapping.display()))?;
    info!(entries = table.len(), fields = schema.len(), "Loaded mapping table");

    let files = collect_files(&cli)?;
    if files.is_empty() {
        bail!("No CSV files to load");
    }

    let store: Arc<dyn RelationStore> = if cli.dry_run {
        warn!("Dry run: rows are kept in memory and discarded");
        Arc::new(MemoryStore::new())
    } else {
        let db_config = DbConfig::from_env()?;
        let pool = create_pool(&db_config).await?;
        health_check(&pool).await.context("Database health check failed")?;
        Arc::new(PgRelationStore::new(pool))
    };

    let mapper = Arc::new(VendorFieldMapper::new(Arc::new(table), config.unmapped_columns));
    let provisioner = Arc::new(TableProvisioner::new(store));
    let pipeline = Arc::new(IngestionPipeline::new(mapper, provisioner, config));
    let progress = tokio::spawn(render_progress(pipeline.subscribe()));

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            ctrl_c_token.cancel();
        }
    });

    let coordinator = IngestionRunCoordinator::new(pipeline);
    let summary = coordinator.run(files, &cancel).await;

    // Dropping the last pipeline handle closes the progress channel
    drop(coordinator);
    progress.await.ok();

    for outcome in &summary.outcomes {
        match outcome {
            FileOutcome::Completed(file) => println!(
                "✓ {} → {}: {} written, {} rejected",
                file.file.display(),
                file.relation.as_deref().unwrap_or("-"),
                file.rows_written,
                file.rows_rejected
            ),
            FileOutcome::Failed(failure) => {
                println!("✗ {}: {}", failure.summary.file.display(), failure.error);
                for rejection in &failure.summary.rejections {
                    println!("    {rejection}");
                }
            }
            FileOutcome::Skipped(source) => println!("- {}: skipped", source.path.display()),
        }
        if let Some(file) = outcome.summary() {
            for warning in &file.warnings {
                println!("    warning: {warning}");
            }
        }
    }

    let totals = summary.totals();
    println!(
        "{} completed, {} failed, {} skipped; {} rows written in {:.1}s",
        totals.files_completed,
        totals.files_failed,
        totals.files_skipped,
        totals.rows_written,
        summary.duration.as_secs_f64()
    );

    if !summary.is_success() {
        bail!("{} file(s) did not load", totals.files_failed + totals.files_skipped);
    }
    Ok(())
}

fn collect_files(cli: &Cli) -> Result<Vec<SourceFile>> {
    if let Some(manifest) = &cli.manifest {
        let contents = std::fs::read_to_string(manifest)
            .with_context(|| format!("Failed to read manifest {}", manifest.display()))?;
        let files: Vec<SourceFile> =
            serde_json::from_str(&contents).context("Manifest is not a valid file list")?;
        return Ok(files);
    }

    let (Some(vendor), Some(jurisdiction)) = (&cli.vendor, &cli.jurisdiction) else {
        bail!("Either --manifest or both --vendor and --jurisdiction are required");
    };

    let mut files = Vec::new();
    for path in &cli.paths {
        for csv in expand_path(path)? {
            files.push(SourceFile::new(csv, vendor, jurisdiction, &cli.namespace));
        }
    }
    Ok(files)
}

/// A file is taken as-is; a directory yields its `*.csv` files in name order
fn expand_path(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
    {
        let candidate = entry?.path();
        let is_csv = candidate
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if candidate.is_file() && is_csv {
            files.push(candidate);
        }
    }
    files.sort();
    Ok(files)
}

async fn render_progress(mut events: broadcast::Receiver<ProgressEvent>) {
    let bars = MultiProgress::new();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    let mut by_file: HashMap<PathBuf, ProgressBar> = HashMap::new();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };

        let bar = by_file.entry(event.file.clone()).or_insert_with(|| {
            let bar = bars.add(ProgressBar::new_spinner());
            bar.set_style(style.clone());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });

        let name = event
            .file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        bar.set_message(format!(
            "{name}: {} read, {} written, {} rejected",
            event.rows_read, event.rows_written, event.errors_count
        ));

        if event.state.is_terminal() {
            let message = format!("{name}: {} ({} rows written)", event.state, event.rows_written);
            if event.state == PipelineState::Completed {
                bar.finish_with_message(message);
            } else {
                bar.abandon_with_message(message);
            }
        }
    }
}
