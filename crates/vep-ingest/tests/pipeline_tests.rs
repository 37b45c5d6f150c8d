//! End-to-end pipeline tests against the in-memory store

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use chrono::NaiveDate;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vep_common::{CanonicalSchema, FieldValue};
use vep_ingest::{
    IngestConfig, IngestError, IngestionRecord, MappingTable, PipelineState, ProvenanceFilter, RelationHandle,
    RelationStore, RowErrorKind, SourceFile, UnmappedColumnPolicy, WriteFault,
};

fn date(y: i32, m: u32, d: u32) -> FieldValue {
    FieldValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

fn text(value: &str) -> FieldValue {
    FieldValue::Text(value.to_string())
}

async fn relation(harness: &TestHarness, vendor: &str, jurisdiction: &str) -> RelationHandle {
    harness
        .provisioner
        .ensure_relation(NAMESPACE, vendor, jurisdiction, &voter_schema())
        .await
        .unwrap()
}

async fn read_all(harness: &TestHarness, handle: &RelationHandle) -> Vec<IngestionRecord> {
    harness
        .store
        .read_rows(handle, &ProvenanceFilter::all())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_ryan_data_texas_scenario() {
    let schema = voter_schema();
    let harness = TestHarness::new(ryan_data_mappings(schema.clone()), test_config());
    let path = harness.write_csv(
        "texas.csv",
        "Voter ID,Last Name,DOB\nTX1,Smith,1980-01-05\nTX2,Jones,1975-12-31\n",
    );
    let source = SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE);

    let summary = harness
        .pipeline
        .ingest_file(&source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.state, PipelineState::Completed);
    assert_eq!(summary.rows_read, 2);
    assert_eq!(summary.rows_written, 2);
    assert_eq!(summary.relation.as_deref(), Some("\"voterfile\".\"ryan_data__tx\""));

    let handle = relation(&harness, "Ryan Data", "TX").await;
    let rows = harness
        .store
        .read_rows(
            &handle,
            &ProvenanceFilter::all()
                .vendor("Ryan Data")
                .jurisdiction("TX")
                .source_file(path.display().to_string()),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].get(&schema, "voter_id"), Some(&text("TX1")));
    assert_eq!(rows[0].get(&schema, "last_name"), Some(&text("Smith")));
    assert_eq!(rows[0].get(&schema, "date_of_birth"), Some(&date(1980, 1, 5)));
    assert_eq!(rows[1].get(&schema, "voter_id"), Some(&text("TX2")));
    assert_eq!(rows[1].get(&schema, "date_of_birth"), Some(&date(1975, 12, 31)));
    assert_eq!(rows[1].get(&schema, "party"), Some(&FieldValue::Null));

    let provenance = rows[0].provenance();
    assert_eq!(provenance.vendor, "Ryan Data");
    assert_eq!(provenance.jurisdiction, "TX");
    assert_eq!(provenance.source_file, path.display().to_string());
    assert_eq!(provenance.loaded_at, rows[1].provenance().loaded_at);
}

#[tokio::test]
async fn test_fixture_round_trip_coerces_values() {
    let schema = voter_schema();
    let harness = TestHarness::new(fixture_mappings(schema.clone()), test_config());
    let source = SourceFile::new(
        fixtures_dir().join("ryan_data_tx.csv"),
        "Ryan Data",
        "TX",
        NAMESPACE,
    );

    let summary = harness
        .pipeline
        .ingest_file(&source, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.rows_written, 3);
    assert_eq!(summary.rows_rejected, 0);

    let handle = relation(&harness, "Ryan Data", "TX").await;
    let mut rows = read_all(&harness, &handle).await;
    rows.sort_by_key(|row| row.values()[0].to_string());

    assert_eq!(rows[0].get(&schema, "date_of_birth"), Some(&date(1980, 1, 5)));
    assert_eq!(rows[0].get(&schema, "registration_date"), Some(&date(2004, 10, 2)));
    assert_eq!(rows[1].get(&schema, "last_name"), Some(&text("O'Brien, Jr")));
    assert_eq!(rows[1].get(&schema, "registration_date"), Some(&date(2010, 1, 15)));
    assert_eq!(rows[2].get(&schema, "date_of_birth"), Some(&date(1992, 3, 9)));
    assert_eq!(rows[2].get(&schema, "party"), Some(&FieldValue::Null));
    assert_eq!(rows[2].get(&schema, "county"), Some(&text("Dallas")));
}

#[tokio::test]
async fn test_header_only_file_completes_empty() {
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), test_config());
    let path = harness.write_csv("header_only.csv", "Voter ID,Last Name,DOB\n");

    let summary = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.state, PipelineState::Completed);
    assert_eq!(summary.rows_read, 0);
    assert_eq!(summary.rows_written, 0);
    assert_eq!(harness.store.create_calls(), 1);
    assert_eq!(harness.store.write_calls(), 0);
}

#[tokio::test]
async fn test_zero_byte_file_fails_without_provisioning() {
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), test_config());
    let path = harness.write_csv("empty.csv", "");

    let failure = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(failure.error, IngestError::EmptyFile(_)));
    assert_eq!(failure.summary.state, PipelineState::Failed);
    assert_eq!(harness.store.create_calls(), 0);
}

#[tokio::test]
async fn test_strict_unmapped_column_fails_before_provisioning() {
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), test_config());
    let path = harness.write_csv("extra.csv", "Voter ID,Shoe Size,Last Name,DOB\nTX1,10,Smith,\n");

    let failure = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        &failure.error,
        IngestError::UnmappedColumn { raw_header, .. } if raw_header == "Shoe Size"
    ));
    assert_eq!(failure.summary.state, PipelineState::Failed);
    assert!(failure.summary.relation.is_none());
    assert_eq!(harness.store.create_calls(), 0);
    assert!(harness.store.relation_names().is_empty());
}

#[tokio::test]
async fn test_lenient_unmapped_column_is_dropped_with_one_warning() {
    let schema = voter_schema();
    let config = vep_ingest::IngestConfig {
        unmapped_columns: UnmappedColumnPolicy::Lenient,
        ..test_config()
    };
    let harness = TestHarness::new(ryan_data_mappings(schema.clone()), config);
    let path = harness.write_csv(
        "extra.csv",
        "Voter ID,Shoe Size,Last Name,DOB\nTX1,10,Smith,\nTX2,11,Jones,1/2/1990\nTX3,9,Lee,\n",
    );

    let summary = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.state, PipelineState::Completed);
    assert_eq!(summary.rows_written, 3);
    assert_eq!(summary.warnings.len(), 1);
    assert!(summary.warnings[0].contains("Shoe Size"));

    let handle = relation(&harness, "Ryan Data", "TX").await;
    let rows = read_all(&harness, &handle).await;
    assert_eq!(rows.len(), 3);
    assert!(rows
        .iter()
        .all(|row| !row.values().contains(&text("10")) && !row.values().contains(&text("11"))));
    assert_eq!(rows[1].get(&schema, "date_of_birth"), Some(&date(1990, 1, 2)));
}

#[tokio::test]
async fn test_batches_flush_in_order_and_report_progress() {
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), test_config());
    let path = harness.write_csv("five.csv", &ryan_data_csv(5));
    let mut progress = harness.pipeline.subscribe();

    let summary = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.rows_written, 5);
    assert_eq!(harness.store.write_calls(), 3);

    let handle = relation(&harness, "Ryan Data", "TX").await;
    let ids: Vec<String> = read_all(&harness, &handle)
        .await
        .iter()
        .map(|row| row.values()[0].to_string())
        .collect();
    assert_eq!(ids, vec!["TX00000", "TX00001", "TX00002", "TX00003", "TX00004"]);

    let mut events = Vec::new();
    while let Ok(event) = progress.try_recv() {
        events.push(event);
    }
    let written: Vec<u64> = events.iter().map(|event| event.rows_written).collect();
    assert_eq!(written, vec![2, 4, 5, 5]);
    assert_eq!(events.last().unwrap().state, PipelineState::Completed);
    assert!(events.iter().all(|event| event.file == path));
}

#[tokio::test]
async fn test_zero_read_ahead_and_batch_size_still_load() {
    let config = IngestConfig {
        read_ahead_rows: 0,
        batch_size: 0,
        ..test_config()
    };
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), config);
    let path = harness.write_csv("three.csv", &ryan_data_csv(3));

    let summary = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.rows_written, 3);
    assert_eq!(harness.store.write_calls(), 3);
}

#[tokio::test]
async fn test_rejected_rows_are_counted_and_reported() {
    let config = vep_ingest::IngestConfig {
        max_error_rate: 0.5,
        ..test_config()
    };
    let harness = TestHarness::new(fixture_mappings(voter_schema()), config);
    let source = SourceFile::new(
        fixtures_dir().join("bridge_tree_tx.csv"),
        "Bridge Tree",
        "TX",
        "targetfile",
    );

    let summary = harness
        .pipeline
        .ingest_file(&source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.rows_read, 3);
    assert_eq!(summary.rows_written, 2);
    assert_eq!(summary.rows_rejected, 1);
    assert_eq!(summary.rejections.len(), 1);
    assert_eq!(summary.rejections[0].kind, RowErrorKind::Coercion);
    assert_eq!(summary.rejections[0].line, 3);
}

#[tokio::test]
async fn test_error_rate_at_end_of_file_fails_file() {
    let harness = TestHarness::new(fixture_mappings(voter_schema()), test_config());
    let source = SourceFile::new(
        fixtures_dir().join("bridge_tree_tx.csv"),
        "Bridge Tree",
        "TX",
        "targetfile",
    );

    let failure = harness
        .pipeline
        .ingest_file(&source, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        IngestError::ErrorThresholdExceeded { rejected: 1, read: 3, .. }
    ));
    assert_eq!(failure.summary.state, PipelineState::Failed);
    assert_eq!(failure.summary.rows_rejected, 1);
}

#[tokio::test]
async fn test_error_rate_escalates_mid_file() {
    let config = vep_ingest::IngestConfig {
        error_rate_min_rows: 10,
        max_reported_rejections: 4,
        ..test_config()
    };
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), config);
    let mut csv = String::from("Voter ID,Last Name,DOB\n");
    for row in 0..50 {
        csv.push_str(&format!("TX{row},Name,not-a-date\n"));
    }
    let path = harness.write_csv("bad.csv", &csv);

    let failure = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(failure.error, IngestError::ErrorThresholdExceeded { .. }));
    assert_eq!(failure.summary.rows_read, 10);
    assert_eq!(failure.summary.rejections.len(), 4);
    assert_eq!(harness.store.write_calls(), 0);
}

#[tokio::test]
async fn test_transient_flush_failures_are_retried() {
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), test_config());
    harness.store.fail_next_writes(WriteFault::Transient, 2);
    let path = harness.write_csv("retry.csv", &ryan_data_csv(3));

    let summary = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.rows_written, 3);
    assert_eq!(harness.store.write_calls(), 4);

    let handle = relation(&harness, "Ryan Data", "TX").await;
    assert_eq!(harness.store.row_count(handle.name()), 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_file() {
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), test_config());
    harness.store.fail_next_writes(WriteFault::Transient, 10);
    let path = harness.write_csv("retry.csv", &ryan_data_csv(2));

    let failure = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        IngestError::RetriesExhausted { attempts: 4, .. }
    ));
    assert_eq!(harness.store.write_calls(), 4);
    assert_eq!(failure.summary.rows_written, 0);
}

#[tokio::test]
async fn test_fatal_write_error_is_not_retried() {
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), test_config());
    harness.store.fail_next_writes(WriteFault::Fatal, 1);
    let path = harness.write_csv("fatal.csv", &ryan_data_csv(2));

    let failure = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(failure.error, IngestError::Storage(_)));
    assert_eq!(harness.store.write_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_flush_timeout_follows_retry_path() {
    let config = vep_ingest::IngestConfig {
        flush_timeout_secs: 1,
        max_flush_retries: 1,
        ..test_config()
    };
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), config);
    harness.store.set_write_delay(Duration::from_secs(30));
    let path = harness.write_csv("slow.csv", &ryan_data_csv(2));

    let failure = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match failure.error {
        IngestError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last, IngestError::FlushTimeout(_)));
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }

    let handle = relation(&harness, "Ryan Data", "TX").await;
    assert_eq!(harness.store.row_count(handle.name()), 0);
}

#[tokio::test]
async fn test_cancellation_abandons_in_flight_batch() {
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), test_config());
    harness.store.set_write_delay(Duration::from_secs(60));
    let path = harness.write_csv("cancel.csv", &ryan_data_csv(6));

    let cancel = CancellationToken::new();
    let task = {
        let pipeline = Arc::clone(&harness.pipeline);
        let cancel = cancel.clone();
        let source = SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE);
        tokio::spawn(async move { pipeline.ingest_file(&source, &cancel).await })
    };

    while harness.store.write_calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let failure = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("pipeline did not stop after cancellation")
        .unwrap()
        .unwrap_err();

    assert!(matches!(failure.error, IngestError::Cancelled));
    assert_eq!(failure.summary.state, PipelineState::Cancelled);
    assert_eq!(failure.summary.rows_written, 0);

    let handle = relation(&harness, "Ryan Data", "TX").await;
    assert_eq!(harness.store.row_count(handle.name()), 0);
}

#[tokio::test]
async fn test_cancelled_before_start_touches_nothing() {
    let harness = TestHarness::new(ryan_data_mappings(voter_schema()), test_config());
    let path = harness.write_csv("early.csv", &ryan_data_csv(2));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let failure = harness
        .pipeline
        .ingest_file(&SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE), &cancel)
        .await
        .unwrap_err();

    assert_eq!(failure.summary.state, PipelineState::Cancelled);
    assert_eq!(harness.store.create_calls(), 0);
}

#[tokio::test]
async fn test_windows_1252_file_loads_with_warning() {
    let schema = voter_schema();
    let harness = TestHarness::new(ryan_data_mappings(schema.clone()), test_config());
    let path = harness.write_csv_bytes(
        "cp1252.csv",
        b"Voter ID,Last Name,DOB\nTX1,Pe\xf1a,\nTX2,O\x92Brien \x96 Jr,\n",
    );

    let summary = harness
        .pipeline
        .ingest_file(
            &SourceFile::new(&path, "Ryan Data", "TX", NAMESPACE),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.rows_written, 2);
    assert_eq!(summary.warnings.len(), 1);
    assert!(summary.warnings[0].contains("line 2"));
    assert!(summary.warnings[0].contains("Windows-1252"));

    let handle = relation(&harness, "Ryan Data", "TX").await;
    let mut rows = read_all(&harness, &handle).await;
    rows.sort_by_key(|row| row.values()[0].to_string());
    assert_eq!(rows[0].get(&schema, "last_name"), Some(&text("Peña")));
    assert_eq!(
        rows[1].get(&schema, "last_name"),
        Some(&text("O\u{2019}Brien \u{2013} Jr"))
    );
}

#[tokio::test]
async fn test_fixture_mappings_require_matching_schema() {
    let narrow = Arc::new(
        CanonicalSchema::from_json_file(fixtures_dir().join("schema.json")).unwrap(),
    );
    let result = MappingTable::load(narrow, fixtures_dir().join("mappings.csv"));
    assert!(matches!(result, Err(IngestError::UnknownField(_))));
}
