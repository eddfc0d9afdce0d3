//! Export configuration
//!
//! [`ExportConfig`] is immutable and validated when built. Sizes can be picked by hand,
//! from a [`MemoryProfile`], or from `SHEETSTREAM_*` environment variables.

use crate::error::{ExportError, Result};

/// Rows kept resident before older rows are paged to the spill file
pub const DEFAULT_ROW_WINDOW_SIZE: usize = 100;

/// Rows between durability flushes
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 1000;

/// Memory profile for different pod sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryProfile {
    /// Small pods (< 512MB): window 50 rows, flush every 100 rows
    Low,
    /// Medium pods (512MB-1GB): window 100 rows, flush every 500 rows
    Medium,
    /// Large pods (> 1GB): window 200 rows, flush every 1000 rows (default)
    High,
    /// Custom profile
    Custom {
        row_window_size: usize,
        flush_batch_size: usize,
    },
}

impl MemoryProfile {
    /// Pick a profile from a memory limit in MB
    pub fn from_memory_mb(memory_mb: usize) -> Self {
        if memory_mb < 512 {
            MemoryProfile::Low
        } else if memory_mb < 1024 {
            MemoryProfile::Medium
        } else {
            MemoryProfile::High
        }
    }

    /// Detect from the MEMORY_LIMIT_MB environment variable
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `High` when the limit is unset or not a number
    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup("MEMORY_LIMIT_MB")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .map(Self::from_memory_mb)
            .unwrap_or(MemoryProfile::High)
    }

    /// (row window, flush batch) for this profile
    pub fn sizes(&self) -> (usize, usize) {
        match *self {
            MemoryProfile::Low => (50, 100),
            MemoryProfile::Medium => (100, 500),
            MemoryProfile::High => (200, 1000),
            MemoryProfile::Custom {
                row_window_size,
                flush_batch_size,
            } => (row_window_size, flush_batch_size),
        }
    }
}

/// Validated export configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExportConfig {
    row_window_size: usize,
    flush_batch_size: usize,
    compress_temp_files: bool,
    apply_header_style: bool,
    apply_data_borders: bool,
    prevent_formula_injection: bool,
    enable_metrics: bool,
    max_rows: Option<u64>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            row_window_size: DEFAULT_ROW_WINDOW_SIZE,
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            compress_temp_files: true,
            apply_header_style: true,
            apply_data_borders: true,
            prevent_formula_injection: true,
            enable_metrics: false,
            max_rows: None,
        }
    }
}

impl ExportConfig {
    /// Start from the defaults
    pub fn builder() -> ExportConfigBuilder {
        ExportConfigBuilder {
            config: ExportConfig::default(),
        }
    }

    /// Small window, frequent flushes, no styling
    pub fn high_performance() -> Self {
        ExportConfig {
            row_window_size: 50,
            flush_batch_size: 500,
            compress_temp_files: true,
            apply_header_style: false,
            apply_data_borders: false,
            prevent_formula_injection: true,
            ..ExportConfig::default()
        }
    }

    /// Injection escaping and compressed spill files always on
    pub fn security_hardened() -> Self {
        ExportConfig {
            prevent_formula_injection: true,
            compress_temp_files: true,
            ..ExportConfig::default()
        }
    }

    /// Larger window with header and border styling
    pub fn high_quality() -> Self {
        ExportConfig {
            row_window_size: 200,
            flush_batch_size: 2000,
            compress_temp_files: true,
            apply_header_style: true,
            apply_data_borders: true,
            ..ExportConfig::default()
        }
    }

    /// Build from `SHEETSTREAM_*` variables on top of the detected [`MemoryProfile`]
    ///
    /// Recognised variables: `SHEETSTREAM_ROW_WINDOW_SIZE`, `SHEETSTREAM_FLUSH_BATCH_SIZE`,
    /// `SHEETSTREAM_COMPRESS_TEMP_FILES`, `SHEETSTREAM_APPLY_HEADER_STYLE`,
    /// `SHEETSTREAM_APPLY_DATA_BORDERS`, `SHEETSTREAM_PREVENT_FORMULA_INJECTION`,
    /// `SHEETSTREAM_ENABLE_METRICS` and `SHEETSTREAM_MAX_ROWS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder =
            ExportConfig::builder().memory_profile(MemoryProfile::from_lookup(&lookup));

        if let Some(v) = lookup("SHEETSTREAM_ROW_WINDOW_SIZE") {
            builder = builder.row_window_size(parse_env("SHEETSTREAM_ROW_WINDOW_SIZE", &v)?);
        }
        if let Some(v) = lookup("SHEETSTREAM_FLUSH_BATCH_SIZE") {
            builder = builder.flush_batch_size(parse_env("SHEETSTREAM_FLUSH_BATCH_SIZE", &v)?);
        }
        if let Some(v) = lookup("SHEETSTREAM_COMPRESS_TEMP_FILES") {
            builder = builder.compress_temp_files(parse_flag("SHEETSTREAM_COMPRESS_TEMP_FILES", &v)?);
        }
        if let Some(v) = lookup("SHEETSTREAM_APPLY_HEADER_STYLE") {
            builder = builder.apply_header_style(parse_flag("SHEETSTREAM_APPLY_HEADER_STYLE", &v)?);
        }
        if let Some(v) = lookup("SHEETSTREAM_APPLY_DATA_BORDERS") {
            builder = builder.apply_data_borders(parse_flag("SHEETSTREAM_APPLY_DATA_BORDERS", &v)?);
        }
        if let Some(v) = lookup("SHEETSTREAM_PREVENT_FORMULA_INJECTION") {
            builder = builder.prevent_formula_injection(parse_flag(
                "SHEETSTREAM_PREVENT_FORMULA_INJECTION",
                &v,
            )?);
        }
        if let Some(v) = lookup("SHEETSTREAM_ENABLE_METRICS") {
            builder = builder.enable_metrics(parse_flag("SHEETSTREAM_ENABLE_METRICS", &v)?);
        }
        if let Some(v) = lookup("SHEETSTREAM_MAX_ROWS") {
            builder = builder.max_rows(Some(parse_env("SHEETSTREAM_MAX_ROWS", &v)?));
        }

        builder.build()
    }

    pub fn row_window_size(&self) -> usize {
        self.row_window_size
    }

    pub fn flush_batch_size(&self) -> usize {
        self.flush_batch_size
    }

    pub fn compress_temp_files(&self) -> bool {
        self.compress_temp_files
    }

    pub fn apply_header_style(&self) -> bool {
        self.apply_header_style
    }

    pub fn apply_data_borders(&self) -> bool {
        self.apply_data_borders
    }

    pub fn prevent_formula_injection(&self) -> bool {
        self.prevent_formula_injection
    }

    pub fn enable_metrics(&self) -> bool {
        self.enable_metrics
    }

    pub fn max_rows(&self) -> Option<u64> {
        self.max_rows
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ExportError::configuration(key, format!("cannot parse '{value}'")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(ExportError::configuration(
            key,
            format!("expected a boolean, got '{value}'"),
        )),
    }
}

/// Builder for [`ExportConfig`]
#[derive(Debug, Clone)]
pub struct ExportConfigBuilder {
    config: ExportConfig,
}

impl ExportConfigBuilder {
    /// Rows kept in memory before paging to disk
    pub fn row_window_size(mut self, rows: usize) -> Self {
        self.config.row_window_size = rows;
        self
    }

    /// Rows between durability flushes (also the cancellation check interval)
    pub fn flush_batch_size(mut self, rows: usize) -> Self {
        self.config.flush_batch_size = rows;
        self
    }

    /// Apply window and flush sizes from a memory profile
    pub fn memory_profile(mut self, profile: MemoryProfile) -> Self {
        let (window, flush) = profile.sizes();
        self.config.row_window_size = window;
        self.config.flush_batch_size = flush;
        self
    }

    pub fn compress_temp_files(mut self, enabled: bool) -> Self {
        self.config.compress_temp_files = enabled;
        self
    }

    pub fn apply_header_style(mut self, enabled: bool) -> Self {
        self.config.apply_header_style = enabled;
        self
    }

    pub fn apply_data_borders(mut self, enabled: bool) -> Self {
        self.config.apply_data_borders = enabled;
        self
    }

    pub fn prevent_formula_injection(mut self, enabled: bool) -> Self {
        self.config.prevent_formula_injection = enabled;
        self
    }

    pub fn enable_metrics(mut self, enabled: bool) -> Self {
        self.config.enable_metrics = enabled;
        self
    }

    /// Cap on data rows; `None` means unlimited
    pub fn max_rows(mut self, max_rows: Option<u64>) -> Self {
        self.config.max_rows = max_rows;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<ExportConfig> {
        let config = self.config;
        if config.row_window_size == 0 {
            return Err(ExportError::configuration(
                "row_window_size",
                "row_window_size must be positive",
            ));
        }
        if config.flush_batch_size == 0 {
            return Err(ExportError::configuration(
                "flush_batch_size",
                "flush_batch_size must be positive",
            ));
        }
        if config.max_rows == Some(0) {
            return Err(ExportError::configuration(
                "max_rows",
                "max_rows must be positive",
            ));
        }
        Ok(config)
    }
}
