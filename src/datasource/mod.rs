//! Streaming data source contract
//!
//! A source hands out lazily evaluated entity sequences. Each call to
//! [`StreamingDataSource::stream`] may open a backend resource (cursor, result set, file
//! handle); sources track those in an [`OpenResources`] set so that a sequence read to the
//! end releases its resource on its own and [`StreamingDataSource::close`] releases whatever
//! is left.

mod filter;
mod iter_source;
mod resources;

pub use filter::{CompiledFilter, Filter, FilterValue, Predicate, Scalar, MAX_IN_VALUES, MAX_PATTERN_LENGTH};
pub use iter_source::IteratorSource;
pub use resources::{OpenResources, ResourceHandle};

use crate::error::Result;

/// Lazy sequence of entities; backend failures surface as `Err` items
pub type RowStream<'a, T> = Box<dyn Iterator<Item = Result<T>> + 'a>;

/// Source of entities for an export
pub trait StreamingDataSource<T>: Send {
    /// Name used in logs and error messages
    fn source_name(&self) -> &str;

    /// Open a new sequence over all entities
    fn stream(&mut self) -> Result<RowStream<'_, T>>;

    /// Open a sequence restricted by `filter`
    ///
    /// The filter is validated before any backend call. Sources without native filtering
    /// fall back to [`stream`](Self::stream).
    fn stream_filtered(&mut self, filter: &Filter) -> Result<RowStream<'_, T>> {
        filter.validate()?;
        log::debug!(
            "Filtering not supported by {}, streaming all entities (filter: {})",
            self.source_name(),
            filter.describe()
        );
        self.stream()
    }

    /// Release every resource still open. Idempotent, never fails.
    fn close(&mut self);
}
