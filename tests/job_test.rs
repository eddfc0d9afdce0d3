//! Integration tests for export jobs: worker, stores and the tokio service

use sheetstream::datasource::RowStream;
use sheetstream::jobs::MemoryHashStore;
use sheetstream::storage::MemoryFileStorage;
use sheetstream::{
    ExportConfig, ExportError, ExportJob, ExportService, ExportWorker, Filter, InMemoryJobStore,
    IteratorSource, JobEvent, JobStatus, JobStore, KeyValueJobStore, LocalFileStorage,
    SchemaBuilder, SheetSchema, StreamingDataSource,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn number_schema() -> Arc<impl SheetSchema<u64>> {
    Arc::new(
        SchemaBuilder::<u64>::new("Numbers")
            .column("N", 10, |n| (*n).into())
            .build(),
    )
}

/// Endless source producing entities at a bounded rate
struct SlowSource;

impl StreamingDataSource<u64> for SlowSource {
    fn source_name(&self) -> &str {
        "slow"
    }

    fn stream(&mut self) -> sheetstream::Result<RowStream<'_, u64>> {
        Ok(Box::new((0u64..).map(|i| {
            thread::sleep(Duration::from_micros(200));
            Ok(i)
        })))
    }

    fn close(&mut self) {}
}

async fn wait_until<F>(service: &ExportService, job_id: &str, done: F) -> ExportJob
where
    F: Fn(&ExportJob) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(job) = service.job(job_id).unwrap() {
            if done(&job) {
                return job;
            }
        }
        assert!(Instant::now() < deadline, "job {job_id} did not finish");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_terminal(service: &ExportService, job_id: &str) -> ExportJob {
    wait_until(service, job_id, |job| job.status.is_terminal()).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_service_completes_job() {
    let storage = Arc::new(MemoryFileStorage::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let worker = ExportWorker::new(Arc::new(InMemoryJobStore::new()), storage.clone())
        .with_listener(move |e: &JobEvent| sink.lock().unwrap().push(e.clone()));
    let service = ExportService::with_current_runtime(worker).unwrap();

    let job_id = service
        .start_export(number_schema(), IteratorSource::new("numbers", || 0..2_500u64))
        .unwrap();
    let job = wait_for_terminal(&service, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.rows_written, 2_500);
    assert_eq!(job.batches_flushed, 2);
    assert!(job.completed_at.is_some());
    assert!(job.error_message.is_none());

    let locator = job.result_locator.unwrap();
    assert!(storage.get(&locator).unwrap().bytes.starts_with(b"PK"));

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].job_id, job_id);
    assert_eq!(events[0].result_locator.as_deref(), Some(locator.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_job() {
    let store = Arc::new(KeyValueJobStore::new(MemoryHashStore::new()));
    let storage = Arc::new(MemoryFileStorage::new());
    let config = ExportConfig::builder().flush_batch_size(10).build().unwrap();
    let worker = ExportWorker::new(store, storage.clone()).with_config(config);
    let service = ExportService::with_current_runtime(worker).unwrap();

    let job_id = service.start_export(number_schema(), SlowSource).unwrap();
    wait_until(&service, &job_id, |job| job.rows_written >= 20).await;
    service.request_cancel(&job_id).unwrap();

    let job = wait_for_terminal(&service, &job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.cancel_requested);
    assert_eq!(job.rows_written % 10, 0);
    assert_eq!(job.batches_flushed, job.rows_written / 10);
    assert!(job.result_locator.is_none());
    assert!(storage.is_empty());

    // a late status write must not resurrect the job
    service.request_cancel(&job_id).unwrap();
    assert_eq!(
        service.job(&job_id).unwrap().unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_job_keeps_message() {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = Arc::new(LocalFileStorage::new(dir.path()).unwrap());
    let worker = ExportWorker::new(Arc::new(InMemoryJobStore::new()), storage);
    let service = ExportService::with_current_runtime(worker).unwrap();

    let source = IteratorSource::from_fallible("orders-db", || {
        Err::<std::iter::Empty<sheetstream::Result<u64>>, _>(ExportError::data_source(
            "orders-db",
            "authentication failed",
        ))
    });
    let job_id = service.start_export(number_schema(), source).unwrap();
    let job = wait_for_terminal(&service, &job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("DataSource [orders-db] error: authentication failed")
    );
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_storage_result() {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = Arc::new(LocalFileStorage::new(dir.path()).unwrap());
    let worker = ExportWorker::new(Arc::new(InMemoryJobStore::new()), storage);
    let service = ExportService::with_current_runtime(worker).unwrap();

    let job_id = service
        .start_export(number_schema(), IteratorSource::new("numbers", || 0..10u64))
        .unwrap();
    let job = wait_for_terminal(&service, &job_id).await;

    let locator = job.result_locator.unwrap();
    assert!(locator.ends_with(&format!("Numbers-{job_id}.xlsx")));
    let bytes = std::fs::read(&locator).unwrap();
    assert!(zip::ZipArchive::new(std::io::Cursor::new(bytes)).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_filter_creates_no_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let worker = ExportWorker::new(store.clone(), Arc::new(MemoryFileStorage::new()));
    let service = ExportService::with_current_runtime(worker).unwrap();

    let err = service
        .start_export_filtered(
            number_schema(),
            IteratorSource::new("numbers", || 0..10u64),
            Filter::new().with("$where", "1 == 1"),
        )
        .unwrap_err();

    assert!(matches!(err, ExportError::Validation { .. }));
    assert!(store.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_jobs_run_concurrently() {
    let storage = Arc::new(MemoryFileStorage::new());
    let worker = ExportWorker::new(Arc::new(InMemoryJobStore::new()), storage.clone())
        .with_config(ExportConfig::high_performance());
    let service = ExportService::with_current_runtime(worker).unwrap();

    let mut ids = Vec::new();
    for n in 1..=8u64 {
        let rows = n * 200;
        ids.push((
            rows,
            service
                .start_export(number_schema(), IteratorSource::new("numbers", move || 0..rows))
                .unwrap(),
        ));
    }

    for (rows, id) in &ids {
        let job = wait_for_terminal(&service, id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_written, *rows);
    }
    assert_eq!(storage.len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_mapper_fails_job() {
    let worker = ExportWorker::new(
        Arc::new(InMemoryJobStore::new()),
        Arc::new(MemoryFileStorage::new()),
    );
    let service = ExportService::with_current_runtime(worker).unwrap();

    let schema = Arc::new(
        SchemaBuilder::<u64>::new("Numbers")
            .column("N", 10, |n| {
                if *n == 42 {
                    panic!("bad row {n}");
                }
                (*n).into()
            })
            .build(),
    );
    let job_id = service
        .start_export(schema, IteratorSource::new("numbers", || 0..100u64))
        .unwrap();
    let job = wait_for_terminal(&service, &job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Export task panicked: bad row 42")
    );
}

#[test]
fn test_service_requires_runtime() {
    let worker = ExportWorker::new(
        Arc::new(InMemoryJobStore::new()),
        Arc::new(MemoryFileStorage::new()),
    );
    let err = ExportService::with_current_runtime(worker).err().unwrap();
    assert!(matches!(err, ExportError::Configuration { .. }));
}

#[test]
fn test_worker_drives_kv_store() {
    let store = Arc::new(KeyValueJobStore::new(MemoryHashStore::new()));
    let worker = ExportWorker::new(store.clone(), Arc::new(MemoryFileStorage::new()));

    let job_id = store.create_job().unwrap();
    let mut source = IteratorSource::new("numbers", || 0..1_234u64);
    let status = worker
        .process(&job_id, &*number_schema(), &mut source, None)
        .unwrap();

    assert_eq!(status, JobStatus::Completed);
    let job = store.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.rows_written, 1_234);
    assert_eq!(job.batches_flushed, 1);
    assert_eq!(
        job.result_locator,
        Some(format!("memory://Numbers-{job_id}.xlsx"))
    );
}
