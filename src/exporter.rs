//! Streaming export engine
//!
//! [`ExportEngine`] pulls entities from a [`StreamingDataSource`], maps them through a
//! [`SheetSchema`] and writes them into a [`StreamingWorkbook`], keeping only a bounded
//! window of rows in memory.
//!
//! # Examples
//!
//! ```no_run
//! use sheetstream::{ExportConfig, ExportEngine, ExportOptions, IteratorSource, SchemaBuilder};
//! use std::fs::File;
//!
//! struct User {
//!     name: String,
//!     age: u32,
//! }
//!
//! let schema = SchemaBuilder::<User>::new("Users")
//!     .column("Name", 20, |u| u.name.as_str().into())
//!     .column("Age", 10, |u| u.age.into())
//!     .build();
//! let mut source = IteratorSource::new("users", || {
//!     (0..100_000).map(|i| User { name: format!("User{i}"), age: 20 + i % 50 })
//! });
//!
//! let output = File::create("users.xlsx")?;
//! ExportEngine::new().export(
//!     &schema,
//!     &mut source,
//!     output,
//!     &ExportConfig::default(),
//!     &ExportOptions::default(),
//! )?;
//! # Ok::<(), sheetstream::ExportError>(())
//! ```

use crate::cancel::CancellationToken;
use crate::config::ExportConfig;
use crate::datasource::{Filter, StreamingDataSource};
use crate::error::{ExportError, Result};
use crate::fast_writer::{Cell, CellStyle, StreamingWorkbook, StyleSheet, EXCEL_MAX_ROWS};
use crate::metrics::{MetricsRecorder, NoopMetrics};
use crate::progress::{ExportPhase, ExportProgress, NoopProgressListener, ProgressListener};
use crate::schema::{resolved_column_widths, SheetSchema};
use crate::types::CellValue;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Seek, Write};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// Data rows stop before this index so the sheet never reaches the format's row cap
const HARD_LIMIT_ROW_INDEX: u32 = EXCEL_MAX_ROWS - 1;

/// Maximum sheet name length accepted by spreadsheet applications
pub const MAX_SHEET_NAME_LENGTH: usize = 31;

/// Per-call options
#[derive(Clone)]
pub struct ExportOptions {
    pub cancellation_token: CancellationToken,
    pub progress_listener: Arc<dyn ProgressListener>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            cancellation_token: CancellationToken::none(),
            progress_listener: Arc::new(NoopProgressListener),
        }
    }
}

impl ExportOptions {
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn with_progress_listener<L>(mut self, listener: L) -> Self
    where
        L: ProgressListener + 'static,
    {
        self.progress_listener = Arc::new(listener);
        self
    }

    fn emit(&self, phase: ExportPhase, rows_written: u64, batches_flushed: u64) {
        self.progress_listener
            .on_progress(&ExportProgress::new(phase, rows_written, batches_flushed));
    }
}

impl std::fmt::Debug for ExportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportOptions")
            .field("cancellation_token", &self.cancellation_token)
            .finish_non_exhaustive()
    }
}

/// Streaming spreadsheet exporter
///
/// Holds no per-export state, so one engine can serve concurrent exports.
#[derive(Clone)]
pub struct ExportEngine {
    metrics: Arc<dyn MetricsRecorder>,
}

impl Default for ExportEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportEngine {
    pub fn new() -> Self {
        ExportEngine {
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Engine feeding `metrics` when `enable_metrics` is set
    pub fn with_metrics(metrics: Arc<dyn MetricsRecorder>) -> Self {
        ExportEngine { metrics }
    }

    /// Export every entity of `source` into `output`
    ///
    /// The source is closed on every exit path. Returns the output once the workbook has
    /// been written and flushed.
    pub fn export<T, S, D, W>(
        &self,
        schema: &S,
        source: &mut D,
        output: W,
        config: &ExportConfig,
        options: &ExportOptions,
    ) -> Result<W>
    where
        S: SheetSchema<T> + ?Sized,
        D: StreamingDataSource<T> + ?Sized,
        W: Write + Seek,
    {
        self.run(schema, source, None, output, config, options)
    }

    /// Export the entities of `source` matching `filter`
    ///
    /// The filter is validated before the source is queried.
    pub fn export_filtered<T, S, D, W>(
        &self,
        schema: &S,
        source: &mut D,
        filter: &Filter,
        output: W,
        config: &ExportConfig,
        options: &ExportOptions,
    ) -> Result<W>
    where
        S: SheetSchema<T> + ?Sized,
        D: StreamingDataSource<T> + ?Sized,
        W: Write + Seek,
    {
        self.run(schema, source, Some(filter), output, config, options)
    }

    fn run<T, S, D, W>(
        &self,
        schema: &S,
        source: &mut D,
        filter: Option<&Filter>,
        output: W,
        config: &ExportConfig,
        options: &ExportOptions,
    ) -> Result<W>
    where
        S: SheetSchema<T> + ?Sized,
        D: StreamingDataSource<T> + ?Sized,
        W: Write + Seek,
    {
        let started = Instant::now();
        let mut guard = SourceGuard::new(source);
        let mut workbook =
            StreamingWorkbook::new(config.row_window_size(), config.compress_temp_files());

        let mut run = ExportRun {
            config,
            options,
            rows_written: 0,
            batches_flushed: 0,
        };
        let result = run.write(schema, &mut guard, filter, &mut workbook, output);

        if let Err(e) = workbook.dispose() {
            log::warn!("{}", e);
        }
        drop(guard);

        if config.enable_metrics() {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            self.metrics
                .record_export_duration_ms(elapsed_ms, result.is_ok());
            if result.is_ok() {
                log::info!(
                    "Excel export completed: {} rows, {} ms",
                    run.rows_written,
                    elapsed_ms
                );
                self.metrics.increment_exported_rows(run.rows_written);
            }
        }
        result
    }
}

/// Closes the wrapped source when dropped
struct SourceGuard<'a, T, D: StreamingDataSource<T> + ?Sized> {
    source: &'a mut D,
    _entity: PhantomData<fn() -> T>,
}

impl<'a, T, D: StreamingDataSource<T> + ?Sized> SourceGuard<'a, T, D> {
    fn new(source: &'a mut D) -> Self {
        SourceGuard {
            source,
            _entity: PhantomData,
        }
    }
}

impl<T, D: StreamingDataSource<T> + ?Sized> Drop for SourceGuard<'_, T, D> {
    fn drop(&mut self) {
        log::debug!("Closing data source {}", self.source.source_name());
        self.source.close();
    }
}

/// Counters and settings of one export call
struct ExportRun<'a> {
    config: &'a ExportConfig,
    options: &'a ExportOptions,
    rows_written: u64,
    batches_flushed: u64,
}

impl ExportRun<'_> {
    fn write<T, S, D, W>(
        &mut self,
        schema: &S,
        guard: &mut SourceGuard<'_, T, D>,
        filter: Option<&Filter>,
        workbook: &mut StreamingWorkbook,
        output: W,
    ) -> Result<W>
    where
        S: SheetSchema<T> + ?Sized,
        D: StreamingDataSource<T> + ?Sized,
        W: Write + Seek,
    {
        let config = self.config;
        self.options.emit(ExportPhase::Starting, 0, 0);

        let sheet_name = safe_sheet_name(schema.sheet_name());
        let headers = schema.headers();
        let patterns = schema.column_patterns();
        let mut styles = StyleManager::new(config);

        let header_style = styles.header_style(workbook.styles_mut());
        let header_cells: Vec<Cell> = headers
            .iter()
            .map(|h| {
                let text = if config.prevent_formula_injection() {
                    escape_formula(h)
                } else {
                    Cow::Borrowed(h.as_str())
                };
                Cell::new(CellValue::String(text.into_owned()), header_style)
            })
            .collect();

        {
            let sheet = workbook.create_sheet(&sheet_name)?;
            sheet.set_column_widths(resolved_column_widths::<T, S>(schema));
            sheet.append_row(0, header_cells)?;
        }

        let source_name = guard.source.source_name().to_string();
        let mut rows = match filter {
            Some(filter) => guard.source.stream_filtered(filter)?,
            None => guard.source.stream()?,
        };
        log::debug!("Streaming {} into sheet '{}'", source_name, sheet_name);

        let max_rows = config.max_rows();
        let flush_batch = config.flush_batch_size() as u64;
        let mut row_index: u32 = 1;

        loop {
            if row_index >= HARD_LIMIT_ROW_INDEX {
                log::error!(
                    "Excel hard limit reached ({} rows). Halting export.",
                    EXCEL_MAX_ROWS
                );
                break;
            }
            if let Some(max) = max_rows {
                if self.rows_written >= max {
                    log::warn!("Maximum row limit reached: {}. Halting export.", max);
                    break;
                }
            }

            let entity = match rows.next() {
                Some(Ok(entity)) => entity,
                Some(Err(e)) => return Err(self.stream_error(e)),
                None => break,
            };

            let values = schema.to_row(&entity);
            if values.len() != headers.len() {
                return Err(ExportError::Schema {
                    entity_type: Some(std::any::type_name::<T>().to_string()),
                    message: format!(
                        "to_row returned {} values for {} headers at row {}",
                        values.len(),
                        headers.len(),
                        row_index
                    ),
                });
            }

            let cells = values
                .into_iter()
                .enumerate()
                .map(|(column, value)| {
                    let pattern = patterns
                        .get(column)
                        .and_then(|p| p.as_deref())
                        .or_else(|| value.default_pattern());
                    let style = styles.data_style(workbook.styles_mut(), pattern);
                    let value = match value {
                        CellValue::String(s) if config.prevent_formula_injection() => {
                            CellValue::String(escape_formula(&s).into_owned())
                        }
                        other => other,
                    };
                    Cell::new(value, style)
                })
                .collect();

            let sheet = workbook.sheet_mut()?;
            sheet.append_row(row_index, cells)?;
            self.rows_written += 1;
            row_index += 1;

            if self.rows_written % flush_batch == 0 {
                sheet.flush_rows(0)?;
                self.batches_flushed += 1;
                log::debug!(
                    "Flushed batch {} ({} rows written)",
                    self.batches_flushed,
                    self.rows_written
                );
                self.options.emit(
                    ExportPhase::FlushedBatch,
                    self.rows_written,
                    self.batches_flushed,
                );
                if self.options.cancellation_token.is_requested() {
                    log::info!(
                        "Export of '{}' cancelled after {} rows",
                        sheet_name,
                        self.rows_written
                    );
                    self.options.emit(
                        ExportPhase::Cancelled,
                        self.rows_written,
                        self.batches_flushed,
                    );
                    return Err(ExportError::Cancelled);
                }
            }
        }
        drop(rows);

        self.options.emit(
            ExportPhase::WritingWorkbook,
            self.rows_written,
            self.batches_flushed,
        );
        let output = workbook.write_to(output)?;
        self.options.emit(
            ExportPhase::Completed,
            self.rows_written,
            self.batches_flushed,
        );
        Ok(output)
    }

    fn stream_error(&self, err: ExportError) -> ExportError {
        match err {
            ExportError::DataSource { .. }
            | ExportError::StreamProcessing { .. }
            | ExportError::Validation { .. }
            | ExportError::Cancelled => err,
            other => ExportError::StreamProcessing {
                processed: self.rows_written,
                message: other.to_string(),
            },
        }
    }
}

/// Cell formats of one export call, memoized by number format pattern
struct StyleManager {
    apply_header_style: bool,
    apply_data_borders: bool,
    base: Option<u32>,
    by_pattern: HashMap<String, u32>,
}

impl StyleManager {
    fn new(config: &ExportConfig) -> Self {
        StyleManager {
            apply_header_style: config.apply_header_style(),
            apply_data_borders: config.apply_data_borders(),
            base: None,
            by_pattern: HashMap::new(),
        }
    }

    fn header_style(&self, styles: &mut StyleSheet) -> u32 {
        if !self.apply_header_style {
            return 0;
        }
        styles.register(&CellStyle {
            number_format: None,
            header: true,
            border: true,
        })
    }

    fn data_style(&mut self, styles: &mut StyleSheet, pattern: Option<&str>) -> u32 {
        let Some(pattern) = pattern else {
            let border = self.apply_data_borders;
            return *self.base.get_or_insert_with(|| {
                styles.register(&CellStyle {
                    number_format: None,
                    header: false,
                    border,
                })
            });
        };
        if let Some(&id) = self.by_pattern.get(pattern) {
            return id;
        }
        let id = styles.register(&CellStyle {
            number_format: Some(pattern.to_string()),
            header: false,
            border: self.apply_data_borders,
        });
        self.by_pattern.insert(pattern.to_string(), id);
        id
    }
}

/// Prefix `'` to strings that a spreadsheet would evaluate as a formula
///
/// Leading whitespace of every kind is skipped before looking at the first character,
/// so `"\t=cmd"` is escaped as well.
pub fn escape_formula(value: &str) -> Cow<'_, str> {
    let trimmed = value.trim_start_matches(char::is_whitespace);
    match trimmed.chars().next() {
        Some('=' | '+' | '-' | '@') => Cow::Owned(format!("'{value}")),
        _ => Cow::Borrowed(value),
    }
}

/// Sheet name accepted by spreadsheet applications
///
/// Forbidden characters (`[]:*?/\` and control characters) become spaces, a leading or
/// trailing `'` becomes a space, the result is cut to 31 characters and an empty name
/// becomes `"empty"`.
pub fn safe_sheet_name(name: &str) -> String {
    if name.is_empty() {
        return "empty".to_string();
    }
    let truncated: Vec<char> = name.chars().take(MAX_SHEET_NAME_LENGTH).collect();
    let last = truncated.len() - 1;
    truncated
        .iter()
        .enumerate()
        .map(|(i, &c)| match c {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => ' ',
            '\'' if i == 0 || i == last => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect()
}
