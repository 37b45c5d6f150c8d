//! Blocking CSV source reader
//!
//! Runs inside `spawn_blocking`. The file handle lives exactly as long as
//! the [`SourceReader`] (and the [`RecordStream`] it turns into), so every
//! exit path of the reader task closes it.

use encoding_rs::WINDOWS_1252;
use std::borrow::Cow;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::error::{IngestError, Result, RowError, RowErrorKind};
use crate::mapping::ColumnPlan;
use crate::record::{IngestionRecord, Provenance};

/// Decode a field as UTF-8, falling back to Windows-1252
///
/// Windows-1252 is a superset of printable Latin-1 that also covers the
/// smart quotes and dashes vendor exports carry in 0x80..=0x9F. Returns the
/// text and whether the fallback was needed.
pub fn decode_field(bytes: &[u8]) -> (Cow<'_, str>, bool) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (Cow::Borrowed(text), false),
        Err(_) => {
            let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
            (text, true)
        }
    }
}

pub struct SourceReader {
    path: PathBuf,
    reader: csv::Reader<File>,
    record: csv::ByteRecord,
    fallback_line: Option<u64>,
}

impl SourceReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        Ok(Self {
            path,
            reader,
            record: csv::ByteRecord::new(),
            fallback_line: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the mandatory header row
    pub fn read_header(&mut self) -> Result<Vec<String>> {
        if !self.reader.read_byte_record(&mut self.record)? {
            return Err(IngestError::EmptyFile(self.path.clone()));
        }

        let mut header = Vec::with_capacity(self.record.len());
        let mut fell_back = false;
        for bytes in self.record.iter() {
            let (text, fallback) = decode_field(bytes);
            fell_back |= fallback;
            header.push(text.into_owned());
        }
        if fell_back {
            self.note_fallback(1);
        }

        if let Some(first) = header.first_mut() {
            if let Some(stripped) = first.strip_prefix('\u{feff}') {
                *first = stripped.to_string();
            }
        }

        Ok(header)
    }

    /// Turn the reader into a lazy stream of mapped rows
    pub fn into_records(self, plan: Arc<ColumnPlan>, provenance: Arc<Provenance>) -> RecordStream {
        RecordStream {
            source: self,
            plan,
            provenance,
            finished: false,
        }
    }

    fn note_fallback(&mut self, line: u64) {
        if self.fallback_line.is_none() {
            warn!(
                file = %self.path.display(),
                line,
                "File is not valid UTF-8; decoding as Windows-1252"
            );
            self.fallback_line = Some(line);
        }
    }
}

/// One data row after mapping
#[derive(Debug)]
pub enum RowOutcome {
    Record(IngestionRecord),
    Rejected(RowError),
}

/// What the reader observed besides rows
#[derive(Debug, Clone, Default)]
pub struct ReaderReport {
    /// First line that needed Windows-1252 decoding
    pub encoding_fallback_line: Option<u64>,
}

/// Iterator over the data rows of a source file
///
/// Yields `Err` only for unrecoverable read failures, after which it ends.
pub struct RecordStream {
    source: SourceReader,
    plan: Arc<ColumnPlan>,
    provenance: Arc<Provenance>,
    finished: bool,
}

impl RecordStream {
    pub fn report(&self) -> ReaderReport {
        ReaderReport {
            encoding_fallback_line: self.source.fallback_line,
        }
    }

    fn map_current(&mut self) -> RowOutcome {
        let line = self
            .source
            .record
            .position()
            .map(|position| position.line())
            .unwrap_or_default();

        let mut fell_back = false;
        let fields: Vec<Cow<'_, str>> = self
            .source
            .record
            .iter()
            .map(|bytes| {
                let (text, fallback) = decode_field(bytes);
                fell_back |= fallback;
                text
            })
            .collect();

        let outcome = match self.plan.map_row(&fields, line) {
            Ok(values) => {
                RowOutcome::Record(IngestionRecord::new(values, Arc::clone(&self.provenance)))
            }
            Err(err) => RowOutcome::Rejected(err),
        };

        drop(fields);
        if fell_back {
            self.source.note_fallback(line);
        }
        outcome
    }
}

impl Iterator for RecordStream {
    type Item = Result<RowOutcome>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.source.reader.read_byte_record(&mut self.source.record) {
            Ok(true) => Some(Ok(self.map_current())),
            Ok(false) => {
                self.finished = true;
                None
            }
            Err(err) if matches!(err.kind(), csv::ErrorKind::Io(_)) => {
                self.finished = true;
                Some(Err(err.into()))
            }
            Err(err) => {
                let line = err
                    .position()
                    .map(|position| position.line())
                    .unwrap_or_default();
                Some(Ok(RowOutcome::Rejected(RowError::new(
                    line,
                    RowErrorKind::Malformed,
                    err.to_string(),
                ))))
            }
        }
    }
}
