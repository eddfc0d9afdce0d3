//! # sheetstream
//!
//! Bounded-memory streaming XLSX export with cancellable background export jobs.
//!
//! ## Features
//!
//! - **Streaming Export**: Pull entities from a data source and write millions of rows while
//!   only a fixed window of rows stays in memory; older rows are paged to a (optionally
//!   gzip-compressed) temp file
//! - **Typed Schemas**: Headers, column widths, number/date formats and row mapping per type
//! - **Safe Output**: Formula-injection escaping, sheet-name sanitizing, hard row limit
//! - **Validated Filters**: Untrusted filter maps are checked before they reach a backend
//! - **Cancellation & Progress**: Cooperative cancellation at flush boundaries, ordered
//!   progress events
//! - **Export Jobs**: Job records with a forward-only lifecycle, in-memory and key-value
//!   stores, file storage with retries and a tokio-driven service
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sheetstream::{ExportConfig, ExportEngine, ExportOptions, IteratorSource, SchemaBuilder};
//! use std::fs::File;
//!
//! # fn main() -> sheetstream::Result<()> {
//! let schema = SchemaBuilder::<(String, u32)>::new("Users")
//!     .column("Name", 20, |u| u.0.as_str().into())
//!     .column("Age", 10, |u| u.1.into())
//!     .build();
//! let mut source = IteratorSource::new("users", || {
//!     vec![("Alice".to_string(), 30), ("Bob".to_string(), 25)]
//! });
//!
//! let config = ExportConfig::builder().flush_batch_size(500).build()?;
//! ExportEngine::new().export(
//!     &schema,
//!     &mut source,
//!     File::create("users.xlsx")?,
//!     &config,
//!     &ExportOptions::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod datasource;
pub mod error;
pub mod exporter;
pub mod fast_writer;
pub mod jobs;
pub mod metrics;
pub mod progress;
pub mod schema;
pub mod service;
pub mod storage;
pub mod types;
pub mod worker;

pub use cancel::{CancellationRegistration, CancellationSource, CancellationToken};
pub use config::{ExportConfig, ExportConfigBuilder, MemoryProfile};
pub use datasource::{Filter, FilterValue, IteratorSource, Predicate, Scalar, StreamingDataSource};
pub use error::{ExportError, Result};
pub use exporter::{escape_formula, safe_sheet_name, ExportEngine, ExportOptions};
pub use jobs::{ExportJob, InMemoryJobStore, JobStatus, JobStore, KeyValueJobStore};
pub use metrics::{InMemoryMetrics, MetricsRecorder};
pub use progress::{ExportPhase, ExportProgress, ProgressListener};
pub use schema::{ColumnSchema, SchemaBuilder, SheetSchema};
pub use service::ExportService;
pub use storage::{FileStorage, LocalFileStorage, RetryingFileStorage, XLSX_CONTENT_TYPE};
pub use types::CellValue;
pub use worker::{ExportWorker, JobEvent, JobListener};
