//! Integration tests for the streaming export engine

use chrono::NaiveDate;
use sheetstream::datasource::RowStream;
use sheetstream::{
    CancellationSource, CellValue, ExportConfig, ExportEngine, ExportError, ExportOptions,
    ExportPhase, ExportProgress, Filter, InMemoryMetrics, IteratorSource, Predicate, Scalar,
    SchemaBuilder, SheetSchema, StreamingDataSource,
};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::NamedTempFile;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn read_part(bytes: &[u8], name: &str) -> String {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    let mut xml = String::new();
    archive
        .by_name(name)
        .unwrap()
        .read_to_string(&mut xml)
        .unwrap();
    xml
}

fn sheet_xml(bytes: &[u8]) -> String {
    read_part(bytes, "xl/worksheets/sheet1.xml")
}

#[derive(Clone)]
struct User {
    name: String,
    age: u32,
}

fn user_schema() -> impl SheetSchema<User> {
    SchemaBuilder::<User>::new("Users")
        .column("Name", 20, |u| u.name.as_str().into())
        .column("Age", 10, |u| u.age.into())
        .build()
}

fn number_schema() -> impl SheetSchema<u64> {
    SchemaBuilder::<u64>::new("Numbers")
        .column("N", 10, |n| (*n).into())
        .build()
}

/// Endless source counting the entities pulled from it and the calls to `close`
struct CountingSource {
    pulled: Arc<AtomicU64>,
    closes: usize,
    fail_open: bool,
}

impl CountingSource {
    fn new() -> Self {
        CountingSource {
            pulled: Arc::new(AtomicU64::new(0)),
            closes: 0,
            fail_open: false,
        }
    }

    fn pulled(&self) -> u64 {
        self.pulled.load(Ordering::SeqCst)
    }
}

impl StreamingDataSource<u64> for CountingSource {
    fn source_name(&self) -> &str {
        "counting"
    }

    fn stream(&mut self) -> sheetstream::Result<RowStream<'_, u64>> {
        if self.fail_open {
            return Err(ExportError::data_source("counting", "connection refused"));
        }
        let pulled = Arc::clone(&self.pulled);
        Ok(Box::new((0u64..).map(move |i| {
            pulled.fetch_add(1, Ordering::SeqCst);
            Ok(i)
        })))
    }

    fn close(&mut self) {
        self.closes += 1;
    }
}

fn export_to_vec<T, S, D>(
    schema: &S,
    source: &mut D,
    config: &ExportConfig,
    options: &ExportOptions,
) -> sheetstream::Result<Vec<u8>>
where
    S: SheetSchema<T>,
    D: StreamingDataSource<T>,
{
    let out = ExportEngine::new().export(schema, source, Cursor::new(Vec::new()), config, options)?;
    Ok(out.into_inner())
}

#[test]
fn test_export_users() {
    init_logging();
    let users = vec![
        User {
            name: "Alice".to_string(),
            age: 30,
        },
        User {
            name: "Bob".to_string(),
            age: 25,
        },
    ];
    let mut source = IteratorSource::new("users", move || users.clone());

    let bytes = export_to_vec(
        &user_schema(),
        &mut source,
        &ExportConfig::default(),
        &ExportOptions::default(),
    )
    .unwrap();

    let xml = sheet_xml(&bytes);
    assert_eq!(xml.matches("<row ").count(), 3);
    assert!(xml.contains("<t>Name</t>"));
    assert!(xml.contains("<t>Age</t>"));
    assert!(xml.contains("<t>Alice</t>"));
    assert!(xml.contains("<v>30</v>"));
    assert!(xml.contains("<t>Bob</t>"));
    assert!(xml.contains("<v>25</v>"));
    assert!(xml.find("Alice").unwrap() < xml.find("Bob").unwrap());
    assert!(xml.contains("<col min=\"1\" max=\"1\" width=\"20\" customWidth=\"1\"/>"));
    assert!(xml.contains("<col min=\"2\" max=\"2\" width=\"10\" customWidth=\"1\"/>"));

    let workbook = read_part(&bytes, "xl/workbook.xml");
    assert!(workbook.contains("name=\"Users\""));
    assert_eq!(source.open_streams(), 0);
}

#[test]
fn test_export_to_file() {
    let temp = NamedTempFile::new().unwrap();
    let mut source = IteratorSource::new("numbers", || 0..50u64);

    ExportEngine::new()
        .export(
            &number_schema(),
            &mut source,
            temp.reopen().unwrap(),
            &ExportConfig::default(),
            &ExportOptions::default(),
        )
        .unwrap();

    let bytes = std::fs::read(temp.path()).unwrap();
    assert_eq!(sheet_xml(&bytes).matches("<row ").count(), 51);
}

#[test]
fn test_empty_source_writes_header_only() {
    let mut source = IteratorSource::new("empty", Vec::<u64>::new);
    let bytes = export_to_vec(
        &number_schema(),
        &mut source,
        &ExportConfig::default(),
        &ExportOptions::default(),
    )
    .unwrap();

    let xml = sheet_xml(&bytes);
    assert_eq!(xml.matches("<row ").count(), 1);
    assert!(xml.contains("<t>N</t>"));
}

#[test]
fn test_max_rows_stops_pulling() {
    let config = ExportConfig::builder().max_rows(Some(10)).build().unwrap();
    let mut source = CountingSource::new();

    let bytes = export_to_vec(&number_schema(), &mut source, &config, &ExportOptions::default())
        .unwrap();

    assert_eq!(sheet_xml(&bytes).matches("<row ").count(), 11);
    assert_eq!(source.pulled(), 10);
    assert_eq!(source.closes, 1);
}

#[test]
fn test_paged_rows_keep_source_order() {
    let config = ExportConfig::builder()
        .row_window_size(7)
        .flush_batch_size(40)
        .build()
        .unwrap();
    let mut source = IteratorSource::new("numbers", || 0..250u64);

    let bytes = export_to_vec(&number_schema(), &mut source, &config, &ExportOptions::default())
        .unwrap();

    let xml = sheet_xml(&bytes);
    let mut last = 0;
    for r in 1..=251 {
        let at = xml.find(&format!("<row r=\"{r}\">")).unwrap();
        assert!(at > last || r == 1);
        last = at;
    }
    assert!(xml.contains("<c r=\"A251\" s=\""));
    assert!(xml.contains("<v>249</v>"));
}

#[test]
fn test_formula_injection_escaped() {
    let schema = SchemaBuilder::<&'static str>::new("Notes")
        .column("Note", 30, |s| (*s).into())
        .build();

    let mut source = IteratorSource::new("notes", || vec!["  =cmd|calc", "@SUM(A1)", "safe"]);
    let bytes = export_to_vec(
        &schema,
        &mut source,
        &ExportConfig::default(),
        &ExportOptions::default(),
    )
    .unwrap();
    let xml = sheet_xml(&bytes);
    assert!(xml.contains("<t>'  =cmd|calc</t>"));
    assert!(xml.contains("<t>'@SUM(A1)</t>"));
    assert!(xml.contains("<t>safe</t>"));

    let config = ExportConfig::builder()
        .prevent_formula_injection(false)
        .build()
        .unwrap();
    let mut source = IteratorSource::new("notes", || vec!["  =cmd|calc"]);
    let bytes = export_to_vec(&schema, &mut source, &config, &ExportOptions::default()).unwrap();
    assert!(sheet_xml(&bytes).contains("<t xml:space=\"preserve\">  =cmd|calc</t>"));
}

#[test]
fn test_formula_headers_escaped() {
    let schema = SchemaBuilder::<u64>::new("Totals")
        .column("=Total", 12, |n| (*n).into())
        .column("+Delta", 12, |n| (*n).into())
        .column("Plain", 12, |n| (*n).into())
        .build();

    let mut source = IteratorSource::new("totals", || vec![1u64]);
    let bytes = export_to_vec(
        &schema,
        &mut source,
        &ExportConfig::default(),
        &ExportOptions::default(),
    )
    .unwrap();
    let xml = sheet_xml(&bytes);
    assert!(xml.contains("<t>'=Total</t>"));
    assert!(xml.contains("<t>'+Delta</t>"));
    assert!(xml.contains("<t>Plain</t>"));

    let config = ExportConfig::builder()
        .prevent_formula_injection(false)
        .build()
        .unwrap();
    let mut source = IteratorSource::new("totals", || vec![1u64]);
    let bytes = export_to_vec(&schema, &mut source, &config, &ExportOptions::default()).unwrap();
    assert!(sheet_xml(&bytes).contains("<t>=Total</t>"));
}

#[test]
fn test_literal_escape_sequences_survive() {
    let schema = SchemaBuilder::<&'static str>::new("Codes")
        .column("Code", 20, |s| (*s).into())
        .build();

    let mut source = IteratorSource::new("codes", || vec!["_x0041_", "bell\u{7}"]);
    let bytes = export_to_vec(
        &schema,
        &mut source,
        &ExportConfig::default(),
        &ExportOptions::default(),
    )
    .unwrap();
    let xml = sheet_xml(&bytes);
    assert!(xml.contains("<t>_x005F_x0041_</t>"));
    assert!(xml.contains("<t>bell_x0007_</t>"));
}

#[test]
fn test_hard_row_limit_stops_pulling() {
    let mut source = CountingSource::new();
    let config = ExportConfig::high_performance();

    let bytes = export_to_vec(
        &number_schema(),
        &mut source,
        &config,
        &ExportOptions::default(),
    )
    .unwrap();

    // header plus data rows 1..=1_048_574; row index 1_048_575 is never written
    assert_eq!(source.pulled(), 1_048_574);
    assert_eq!(source.closes, 1);

    let xml = sheet_xml(&bytes);
    assert!(xml.contains("<row r=\"1048575\""));
    assert!(!xml.contains("<row r=\"1048576\""));
    assert_eq!(xml.matches("<row ").count(), 1_048_575);
}

#[test]
fn test_open_failure_closes_source_once() {
    let mut source = CountingSource::new();
    source.fail_open = true;

    let err = export_to_vec(
        &number_schema(),
        &mut source,
        &ExportConfig::default(),
        &ExportOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(err, ExportError::DataSource { .. }));
    assert!(err.is_retryable());
    assert_eq!(source.closes, 1);
}

#[test]
fn test_mid_stream_failure_surfaces() {
    let mut source = IteratorSource::from_fallible("flaky", || {
        Ok((0..10u64).map(|i| {
            if i == 6 {
                Err(ExportError::StreamProcessing {
                    processed: i,
                    message: "cursor lost".to_string(),
                })
            } else {
                Ok(i)
            }
        }))
    });

    let err = export_to_vec(
        &number_schema(),
        &mut source,
        &ExportConfig::default(),
        &ExportOptions::default(),
    )
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Stream processing failed after 6 items: cursor lost"
    );
    assert_eq!(source.open_streams(), 0);
}

struct MisalignedSchema {
    headers: Vec<String>,
}

impl SheetSchema<u64> for MisalignedSchema {
    fn sheet_name(&self) -> &str {
        "Broken"
    }

    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn column_widths(&self) -> Vec<u32> {
        Vec::new()
    }

    fn to_row(&self, n: &u64) -> Vec<CellValue> {
        vec![(*n).into()]
    }
}

#[test]
fn test_row_width_mismatch_is_schema_error() {
    let schema = MisalignedSchema {
        headers: vec!["A".to_string(), "B".to_string()],
    };
    let mut source = CountingSource::new();

    let err = export_to_vec(
        &schema,
        &mut source,
        &ExportConfig::default(),
        &ExportOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(err, ExportError::Schema { .. }));
    assert!(!err.is_retryable());
    assert_eq!(source.pulled(), 1);
    assert_eq!(source.closes, 1);
}

#[test]
fn test_progress_events_are_ordered() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let options = ExportOptions::default()
        .with_progress_listener(move |p: &ExportProgress| sink.lock().unwrap().push(*p));
    let config = ExportConfig::builder().flush_batch_size(100).build().unwrap();
    let mut source = IteratorSource::new("numbers", || 0..350u64);

    export_to_vec(&number_schema(), &mut source, &config, &options).unwrap();

    let events = events.lock().unwrap();
    let phases: Vec<ExportPhase> = events.iter().map(|p| p.phase).collect();
    assert_eq!(
        phases,
        vec![
            ExportPhase::Starting,
            ExportPhase::FlushedBatch,
            ExportPhase::FlushedBatch,
            ExportPhase::FlushedBatch,
            ExportPhase::WritingWorkbook,
            ExportPhase::Completed,
        ]
    );
    assert_eq!(events[0], ExportProgress::new(ExportPhase::Starting, 0, 0));
    assert_eq!(events[3], ExportProgress::new(ExportPhase::FlushedBatch, 300, 3));
    assert_eq!(events[5], ExportProgress::new(ExportPhase::Completed, 350, 3));
}

#[test]
fn test_cancel_observed_at_flush_boundary() {
    let cancellation = Arc::new(CancellationSource::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let trigger = Arc::clone(&cancellation);
    let options = ExportOptions::default()
        .with_cancellation(cancellation.token())
        .with_progress_listener(move |p: &ExportProgress| {
            sink.lock().unwrap().push(*p);
            if p.phase == ExportPhase::FlushedBatch && p.batches_flushed == 2 {
                trigger.cancel();
            }
        });
    let config = ExportConfig::builder().flush_batch_size(100).build().unwrap();
    let mut source = CountingSource::new();

    let err = export_to_vec(&number_schema(), &mut source, &config, &options).unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(source.pulled(), 200);
    assert_eq!(source.closes, 1);
    let events = events.lock().unwrap();
    assert_eq!(
        events.last(),
        Some(&ExportProgress::new(ExportPhase::Cancelled, 200, 2))
    );
}

#[test]
fn test_filter_validated_before_stream() {
    let mut source = CountingSource::new();
    let filter = Filter::new().with("name; DROP", "x");

    let err = ExportEngine::new()
        .export_filtered(
            &number_schema(),
            &mut source,
            &filter,
            Cursor::new(Vec::new()),
            &ExportConfig::default(),
            &ExportOptions::default(),
        )
        .unwrap_err();

    assert!(matches!(err, ExportError::Validation { .. }));
    assert_eq!(source.pulled(), 0);
    assert_eq!(source.closes, 1);
}

#[test]
fn test_filtered_export() {
    let mut source = IteratorSource::new("numbers", || 0..100u64)
        .with_field_accessor(|n: &u64, key| (key == "n").then(|| Scalar::Int(*n as i64)));
    let filter = Filter::new().with(
        "n",
        Predicate::Range {
            gt: None,
            gte: Some(Scalar::Int(10)),
            lt: Some(Scalar::Int(15)),
            lte: None,
        },
    );

    let out = ExportEngine::new()
        .export_filtered(
            &number_schema(),
            &mut source,
            &filter,
            Cursor::new(Vec::new()),
            &ExportConfig::default(),
            &ExportOptions::default(),
        )
        .unwrap();

    let xml = sheet_xml(out.get_ref());
    assert_eq!(xml.matches("<row ").count(), 6);
    assert!(xml.contains("<v>10</v>"));
    assert!(xml.contains("<v>14</v>"));
    assert!(!xml.contains("<v>15</v>"));
}

#[test]
fn test_date_columns_get_formats() {
    struct Order {
        placed: NaiveDate,
        amount: f64,
    }

    let schema = SchemaBuilder::<Order>::new("Orders")
        .column("Placed", 12, |o| o.placed.into())
        .column_with_pattern("Amount", 12, "#,##0.00", |o| o.amount.into())
        .build();
    let mut source = IteratorSource::new("orders", || {
        vec![Order {
            placed: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            amount: 1234.5,
        }]
    });

    let bytes = export_to_vec(
        &schema,
        &mut source,
        &ExportConfig::default(),
        &ExportOptions::default(),
    )
    .unwrap();

    let styles = read_part(&bytes, "xl/styles.xml");
    assert!(styles.contains("formatCode=\"yyyy-mm-dd\""));
    assert!(styles.contains("numFmtId=\"4\""));
    let xml = sheet_xml(&bytes);
    assert!(xml.contains("<v>45306</v>"));
    assert!(xml.contains("<v>1234.5</v>"));
}

#[test]
fn test_sheet_name_sanitized() {
    let schema = SchemaBuilder::<u64>::new("Q1/Q2 [draft]: sales*?")
        .column("N", 10, |n| (*n).into())
        .build();
    let mut source = IteratorSource::new("numbers", || 0..1u64);

    let bytes = export_to_vec(
        &schema,
        &mut source,
        &ExportConfig::default(),
        &ExportOptions::default(),
    )
    .unwrap();

    let workbook = read_part(&bytes, "xl/workbook.xml");
    assert!(workbook.contains("name=\"Q1 Q2  draft   sales  \""));
}

#[test]
fn test_metrics_recorded_when_enabled() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = ExportEngine::with_metrics(metrics.clone());
    let config = ExportConfig::builder().enable_metrics(true).build().unwrap();

    let mut source = IteratorSource::new("numbers", || 0..42u64);
    engine
        .export(
            &number_schema(),
            &mut source,
            Cursor::new(Vec::new()),
            &config,
            &ExportOptions::default(),
        )
        .unwrap();

    let mut broken = CountingSource::new();
    broken.fail_open = true;
    assert!(engine
        .export(
            &number_schema(),
            &mut broken,
            Cursor::new(Vec::new()),
            &config,
            &ExportOptions::default(),
        )
        .is_err());

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.exports_succeeded, 1);
    assert_eq!(snapshot.exports_failed, 1);
    assert_eq!(snapshot.exported_rows, 42);
}

#[test]
fn test_concurrent_exports_are_independent() {
    let engine = ExportEngine::new();
    let config = ExportConfig::builder()
        .row_window_size(10)
        .flush_batch_size(50)
        .build()
        .unwrap();

    let handles: Vec<_> = (1..=4u64)
        .map(|worker| {
            let engine = engine.clone();
            let config = config.clone();
            thread::spawn(move || {
                let rows = worker * 300;
                let mut source = IteratorSource::new("numbers", move || 0..rows);
                let out = engine
                    .export(
                        &number_schema(),
                        &mut source,
                        Cursor::new(Vec::new()),
                        &config,
                        &ExportOptions::default(),
                    )
                    .unwrap();
                (rows, out.into_inner())
            })
        })
        .collect();

    for handle in handles {
        let (rows, bytes) = handle.join().unwrap();
        let xml = sheet_xml(&bytes);
        assert_eq!(xml.matches("<row ").count() as u64, rows + 1);
        assert!(xml.contains(&format!("<v>{}</v>", rows - 1)));
    }
}
