//! Per-file ingestion pipeline
//!
//! A file moves through `Opened → HeaderParsed → Streaming ⇄ Flushing →
//! Completed`, or ends in `Failed`/`Cancelled` from any earlier state.
//!
//! The CSV file is read and mapped on a blocking task that feeds a bounded
//! channel, so reading runs ahead of the writer by up to `read_ahead_rows`
//! while batches are flushed strictly in file order. Each flush is one
//! store transaction, retried with exponential backoff on transient errors
//! and timeouts.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::error::{IngestError, Result, RowError};
use crate::mapping::VendorFieldMapper;
use crate::provision::TableProvisioner;
use crate::record::{IngestionBatch, Provenance};
use crate::relation::RelationHandle;
use crate::source::{ReaderReport, RowOutcome, SourceReader};
use crate::store::RelationStore;

/// Progress events buffered per subscriber before the oldest are dropped
const PROGRESS_CHANNEL_CAPACITY: usize = 1024;

/// A file to load together with its identity metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub vendor: String,
    pub jurisdiction: String,
    pub namespace: String,
}

impl SourceFile {
    pub fn new(
        path: impl Into<PathBuf>,
        vendor: impl Into<String>,
        jurisdiction: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            vendor: vendor.into(),
            jurisdiction: jurisdiction.into(),
            namespace: namespace.into(),
        }
    }
}

/// Lifecycle state of one file load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Opened,
    HeaderParsed,
    Streaming,
    Flushing,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Opened => "opened",
            PipelineState::HeaderParsed => "header_parsed",
            PipelineState::Streaming => "streaming",
            PipelineState::Flushing => "flushing",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
            PipelineState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Failed | PipelineState::Cancelled
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot broadcast after every flush and at terminal states
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub file: PathBuf,
    pub state: PipelineState,
    pub rows_read: u64,
    pub rows_written: u64,
    pub errors_count: u64,
}

/// Outcome of one file load, produced on success and on failure
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub file: PathBuf,
    pub vendor: String,
    pub jurisdiction: String,
    pub relation: Option<String>,
    pub state: PipelineState,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_rejected: u64,
    /// First rejected rows, up to `max_reported_rejections`
    pub rejections: Vec<RowError>,
    pub warnings: Vec<String>,
    pub duration: Duration,
}

/// A failed file load; the summary reflects everything done before failing
#[derive(Debug, Error)]
#[error("Failed to ingest {}: {error}", summary.file.display())]
pub struct PipelineFailure {
    pub summary: FileSummary,
    #[source]
    pub error: IngestError,
}

/// Mutable bookkeeping for one file load
struct FileRun {
    summary: FileSummary,
    started: Instant,
}

impl FileRun {
    fn new(source: &SourceFile) -> Self {
        Self {
            summary: FileSummary {
                file: source.path.clone(),
                vendor: source.vendor.clone(),
                jurisdiction: source.jurisdiction.clone(),
                relation: None,
                state: PipelineState::Opened,
                rows_read: 0,
                rows_written: 0,
                rows_rejected: 0,
                rejections: Vec::new(),
                warnings: Vec::new(),
                duration: Duration::ZERO,
            },
            started: Instant::now(),
        }
    }

    fn reject(&mut self, err: RowError, keep: usize) {
        debug!(file = %self.summary.file.display(), line = err.line, error = %err, "Rejected row");
        self.summary.rows_rejected += 1;
        if self.summary.rejections.len() < keep {
            self.summary.rejections.push(err);
        }
    }

    fn progress(&self) -> ProgressEvent {
        ProgressEvent {
            file: self.summary.file.clone(),
            state: self.summary.state,
            rows_read: self.summary.rows_read,
            rows_written: self.summary.rows_written,
            errors_count: self.summary.rows_rejected,
        }
    }

    fn finish(mut self, state: PipelineState) -> FileSummary {
        self.summary.state = state;
        self.summary.duration = self.started.elapsed();
        self.summary
    }
}

/// Loads single files into their relations
pub struct IngestionPipeline {
    mapper: Arc<VendorFieldMapper>,
    provisioner: Arc<TableProvisioner>,
    store: Arc<dyn RelationStore>,
    config: IngestConfig,
    progress: broadcast::Sender<ProgressEvent>,
}

impl IngestionPipeline {
    pub fn new(
        mapper: Arc<VendorFieldMapper>,
        provisioner: Arc<TableProvisioner>,
        config: IngestConfig,
    ) -> Self {
        let store = Arc::clone(provisioner.store());
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            mapper,
            provisioner,
            store,
            config,
            progress,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Receive progress events for every file this pipeline loads
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    fn emit(&self, run: &FileRun) {
        // No subscribers is fine
        let _ = self.progress.send(run.progress());
    }

    /// Load one file; on failure the summary is carried in the error
    pub async fn ingest_file(
        &self,
        source: &SourceFile,
        cancel: &CancellationToken,
    ) -> std::result::Result<FileSummary, PipelineFailure> {
        let mut run = FileRun::new(source);
        info!(
            file = %source.path.display(),
            vendor = %source.vendor,
            jurisdiction = %source.jurisdiction,
            namespace = %source.namespace,
            "Starting file"
        );

        match self.load(source, &mut run, cancel).await {
            Ok(()) => {
                run.summary.state = PipelineState::Completed;
                self.emit(&run);

                let summary = run.finish(PipelineState::Completed);
                info!(
                    file = %summary.file.display(),
                    rows_read = summary.rows_read,
                    rows_written = summary.rows_written,
                    rows_rejected = summary.rows_rejected,
                    duration_ms = summary.duration.as_millis() as u64,
                    "File completed"
                );
                Ok(summary)
            }
            Err(err) => {
                let state = if matches!(err, IngestError::Cancelled) {
                    PipelineState::Cancelled
                } else {
                    PipelineState::Failed
                };
                run.summary.state = state;
                self.emit(&run);

                let summary = run.finish(state);
                if state == PipelineState::Cancelled {
                    warn!(
                        file = %summary.file.display(),
                        rows_written = summary.rows_written,
                        "File cancelled"
                    );
                } else {
                    error!(
                        file = %summary.file.display(),
                        rows_read = summary.rows_read,
                        rows_written = summary.rows_written,
                        error = %err,
                        "File failed"
                    );
                }
                Err(PipelineFailure {
                    summary,
                    error: err,
                })
            }
        }
    }

    async fn load(
        &self,
        source: &SourceFile,
        run: &mut FileRun,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let (reader, header) = open_source(&source.path).await?;

        let plan = self
            .mapper
            .plan_header(&source.vendor, &source.jurisdiction, &header)?;
        run.summary.state = PipelineState::HeaderParsed;
        run.summary.warnings.extend(plan.warnings().iter().cloned());
        debug!(
            file = %source.path.display(),
            columns = plan.width(),
            mapped = plan.mapped_columns(),
            "Header parsed"
        );

        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            handle = self.provisioner.ensure_relation(
                &source.namespace,
                &source.vendor,
                &source.jurisdiction,
                self.mapper.schema(),
            ) => handle?,
        };
        run.summary.relation = Some(handle.name().qualified());

        let provenance = Arc::new(Provenance::new(
            &source.vendor,
            &source.jurisdiction,
            source.path.display().to_string(),
            Utc::now(),
        ));

        // Channel capacity must be non-zero
        let (tx, mut rx) = mpsc::channel(self.config.read_ahead_rows.max(1));
        let reader_task: JoinHandle<Result<ReaderReport>> =
            tokio::task::spawn_blocking(move || {
                let mut records = reader.into_records(Arc::new(plan), provenance);
                for outcome in records.by_ref() {
                    if tx.blocking_send(outcome?).is_err() {
                        // Receiver gone: the load was cancelled or failed
                        break;
                    }
                }
                Ok(records.report())
            });

        run.summary.state = PipelineState::Streaming;
        let streamed = self.stream(&handle, &mut rx, run, cancel).await;

        // Close the channel so a blocked reader unblocks, then wait for it
        // to release the file before reporting anything.
        drop(rx);
        let report = reader_task
            .await
            .map_err(|err| IngestError::ReaderTask(err.to_string()));

        let mut batch = streamed?;
        let report = report??;
        if let Some(line) = report.encoding_fallback_line {
            run.summary
                .warnings
                .push(format!("non-UTF-8 data from line {line} decoded as Windows-1252"));
        }

        self.check_error_rate(run, true)?;
        if !batch.is_empty() {
            self.flush(&handle, &mut batch, run, cancel).await?;
        }
        Ok(())
    }

    /// Pull mapped rows until the reader finishes, flushing full batches.
    /// Returns the final, possibly partial, batch.
    async fn stream(
        &self,
        handle: &RelationHandle,
        rx: &mut mpsc::Receiver<RowOutcome>,
        run: &mut FileRun,
        cancel: &CancellationToken,
    ) -> Result<IngestionBatch> {
        let batch_size = self.config.batch_size.max(1);
        let mut batch = IngestionBatch::with_capacity(batch_size);

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                outcome = rx.recv() => outcome,
            };

            match outcome {
                Some(RowOutcome::Record(record)) => {
                    run.summary.rows_read += 1;
                    batch.push(record);
                }
                Some(RowOutcome::Rejected(err)) => {
                    run.summary.rows_read += 1;
                    run.reject(err, self.config.max_reported_rejections);
                    self.check_error_rate(run, false)?;
                }
                None => return Ok(batch),
            }

            if batch.len() >= batch_size {
                self.flush(handle, &mut batch, run, cancel).await?;
            }
        }
    }

    /// Fail once the rejection rate exceeds the limit; mid-file only after
    /// `error_rate_min_rows` rows, at end of file always
    fn check_error_rate(&self, run: &FileRun, at_eof: bool) -> Result<()> {
        let read = run.summary.rows_read;
        let rejected = run.summary.rows_rejected;
        if read == 0 || rejected == 0 || (!at_eof && read < self.config.error_rate_min_rows) {
            return Ok(());
        }

        let rate = rejected as f64 / read as f64;
        if rate > self.config.max_error_rate {
            return Err(IngestError::ErrorThresholdExceeded {
                rejected,
                read,
                max_rate: self.config.max_error_rate,
            });
        }
        Ok(())
    }

    /// Write `batch` in one transaction, retrying transient failures
    async fn flush(
        &self,
        handle: &RelationHandle,
        batch: &mut IngestionBatch,
        run: &mut FileRun,
        cancel: &CancellationToken,
    ) -> Result<()> {
        run.summary.state = PipelineState::Flushing;
        let timeout = self.config.flush_timeout();
        let mut attempt = 0u32;

        let written = loop {
            // Dropping the write future on cancel rolls its transaction back
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                result = tokio::time::timeout(timeout, self.store.write_batch(handle, batch)) => {
                    result.unwrap_or(Err(IngestError::FlushTimeout(timeout)))
                }
            };

            match result {
                Ok(written) => break written,
                Err(err) if err.is_transient() && attempt < self.config.max_flush_retries => {
                    let delay = self.config.retry_delay(attempt);
                    attempt += 1;
                    warn!(
                        relation = %handle.name(),
                        rows = batch.len(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient flush failure, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) if err.is_transient() => {
                    return Err(IngestError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        };

        run.summary.rows_written += written;
        run.summary.state = PipelineState::Streaming;
        debug!(
            relation = %handle.name(),
            rows = written,
            total = run.summary.rows_written,
            "Flushed batch"
        );
        batch.clear();
        self.emit(run);
        Ok(())
    }
}

/// Open the file and read its header on a blocking task
async fn open_source(path: &Path) -> Result<(SourceReader, Vec<String>)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut reader = SourceReader::open(&path)?;
        let header = reader.read_header()?;
        Ok((reader, header))
    })
    .await
    .map_err(|err| IngestError::ReaderTask(err.to_string()))?
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_terminality() {
        assert!(PipelineState::Completed.is_terminal());
        assert!(PipelineState::Cancelled.is_terminal());
        assert!(!PipelineState::Flushing.is_terminal());
        assert_eq!(PipelineState::HeaderParsed.to_string(), "header_parsed");
    }

    #[test]
    fn test_reject_keeps_first_rejections() {
        let source = SourceFile::new("a.csv", "Acme", "TX", "voterfile");
        let mut run = FileRun::new(&source);
        for line in 2..20 {
            run.reject(RowError::new(line, crate::error::RowErrorKind::Coercion, "bad"), 3);
        }
        assert_eq!(run.summary.rows_rejected, 18);
        assert_eq!(run.summary.rejections.len(), 3);
        assert_eq!(run.summary.rejections[0].line, 2);
    }
}
