//! Ingestion run coordinator
//!
//! Runs one pipeline per file over a bounded pool. A failed file does not
//! stop the others unless `continue_on_error` is off; schema drift always
//! cancels the rest of the run, since every later file for that relation
//! would fail the same way.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pipeline::{FileSummary, IngestionPipeline, PipelineFailure, SourceFile};

/// What happened to one file of a run
#[derive(Debug)]
pub enum FileOutcome {
    Completed(FileSummary),
    Failed(PipelineFailure),
    /// Never started because the run was cancelled first
    Skipped(SourceFile),
}

impl FileOutcome {
    pub fn path(&self) -> &PathBuf {
        match self {
            FileOutcome::Completed(summary) => &summary.file,
            FileOutcome::Failed(failure) => &failure.summary.file,
            FileOutcome::Skipped(source) => &source.path,
        }
    }

    pub fn summary(&self) -> Option<&FileSummary> {
        match self {
            FileOutcome::Completed(summary) => Some(summary),
            FileOutcome::Failed(failure) => Some(&failure.summary),
            FileOutcome::Skipped(_) => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, FileOutcome::Completed(_))
    }
}

/// Per-file outcomes of a run, in input order
#[derive(Debug)]
pub struct RunSummary {
    pub outcomes: Vec<FileOutcome>,
    pub duration: Duration,
}

/// Aggregate counts of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub files_completed: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_rejected: u64,
}

impl RunSummary {
    pub fn totals(&self) -> RunTotals {
        self.outcomes
            .iter()
            .fold(RunTotals::default(), |mut totals, outcome| {
                match outcome {
                    FileOutcome::Completed(_) => totals.files_completed += 1,
                    FileOutcome::Failed(_) => totals.files_failed += 1,
                    FileOutcome::Skipped(_) => totals.files_skipped += 1,
                }
                if let Some(summary) = outcome.summary() {
                    totals.rows_read += summary.rows_read;
                    totals.rows_written += summary.rows_written;
                    totals.rows_rejected += summary.rows_rejected;
                }
                totals
            })
    }

    pub fn failures(&self) -> impl Iterator<Item = &PipelineFailure> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            FileOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(FileOutcome::is_completed)
    }
}

pub struct IngestionRunCoordinator {
    pipeline: Arc<IngestionPipeline>,
}

impl IngestionRunCoordinator {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }

    /// Load `files` with up to `max_concurrent_files` pipelines at a time
    pub async fn run(&self, files: Vec<SourceFile>, cancel: &CancellationToken) -> RunSummary {
        let started = Instant::now();
        let config = self.pipeline.config();
        let concurrency = config.max_concurrent_files.max(1);
        let continue_on_error = config.continue_on_error;
        let run_token = cancel.child_token();

        info!(files = files.len(), concurrency, "Starting ingestion run");

        let mut outcomes: Vec<(usize, FileOutcome)> = stream::iter(files.into_iter().enumerate())
            .map(|(index, source)| {
                let pipeline = Arc::clone(&self.pipeline);
                let run_token = run_token.clone();
                async move {
                    if run_token.is_cancelled() {
                        return (index, FileOutcome::Skipped(source));
                    }

                    match pipeline.ingest_file(&source, &run_token).await {
                        Ok(summary) => (index, FileOutcome::Completed(summary)),
                        Err(failure) => {
                            if failure.error.aborts_run() && !run_token.is_cancelled() {
                                error!(
                                    file = %source.path.display(),
                                    error = %failure.error,
                                    "Cancelling remaining files"
                                );
                                run_token.cancel();
                            } else if !continue_on_error && !run_token.is_cancelled() {
                                warn!(file = %source.path.display(), "Stopping run after failure");
                                run_token.cancel();
                            }
                            (index, FileOutcome::Failed(failure))
                        }
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        outcomes.sort_by_key(|(index, _)| *index);
        let summary = RunSummary {
            outcomes: outcomes.into_iter().map(|(_, outcome)| outcome).collect(),
            duration: started.elapsed(),
        };

        let totals = summary.totals();
        info!(
            completed = totals.files_completed,
            failed = totals.files_failed,
            skipped = totals.files_skipped,
            rows_written = totals.rows_written,
            rows_rejected = totals.rows_rejected,
            duration_ms = summary.duration.as_millis() as u64,
            "Ingestion run finished"
        );
        summary
    }
}
