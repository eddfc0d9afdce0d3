//! In-process data source over iterators

use super::{Filter, OpenResources, ResourceHandle, RowStream, Scalar, StreamingDataSource};
use crate::error::Result;
use std::sync::Arc;

type BoxedIter<T> = Box<dyn Iterator<Item = Result<T>> + Send + 'static>;
type Factory<T> = Box<dyn FnMut() -> Result<BoxedIter<T>> + Send + 'static>;
type FieldAccessor<T> = Arc<dyn Fn(&T, &str) -> Option<Scalar> + Send + Sync + 'static>;

/// Data source that builds a fresh iterator for every `stream()` call
///
/// # Examples
///
/// ```
/// use sheetstream::datasource::{Filter, IteratorSource, Scalar, StreamingDataSource};
///
/// let mut source = IteratorSource::new("numbers", || 1..=5i64)
///     .with_field_accessor(|n: &i64, field| (field == "value").then(|| Scalar::Int(*n)));
///
/// let filter = Filter::new().with("value", 3i64);
/// let matched: Vec<i64> = source
///     .stream_filtered(&filter)?
///     .collect::<Result<_, _>>()?;
/// assert_eq!(matched, vec![3]);
/// source.close();
/// # Ok::<(), sheetstream::ExportError>(())
/// ```
pub struct IteratorSource<T> {
    name: String,
    factory: Factory<T>,
    accessor: Option<FieldAccessor<T>>,
    resources: OpenResources,
    opened: u64,
}

impl<T: Send + 'static> IteratorSource<T> {
    /// Source over infallible iterators
    pub fn new<F, I>(name: impl Into<String>, mut factory: F) -> Self
    where
        F: FnMut() -> I + Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_fallible(name, move || Ok(factory().into_iter().map(Ok)))
    }

    /// Source whose factory and items may fail
    pub fn from_fallible<F, I>(name: impl Into<String>, mut factory: F) -> Self
    where
        F: FnMut() -> Result<I> + Send + 'static,
        I: IntoIterator<Item = Result<T>>,
        I::IntoIter: Send + 'static,
    {
        IteratorSource {
            name: name.into(),
            factory: Box::new(move || {
                let iter = factory()?.into_iter();
                Ok(Box::new(iter) as BoxedIter<T>)
            }),
            accessor: None,
            resources: OpenResources::new(),
            opened: 0,
        }
    }

    /// Enable in-memory filtering by resolving entity fields by name
    pub fn with_field_accessor<A>(mut self, accessor: A) -> Self
    where
        A: Fn(&T, &str) -> Option<Scalar> + Send + Sync + 'static,
    {
        self.accessor = Some(Arc::new(accessor));
        self
    }

    /// Sequences opened and not yet released
    pub fn open_streams(&self) -> usize {
        self.resources.open_count()
    }

    fn open(&mut self) -> Result<TrackedStream<T>> {
        let inner = (self.factory)()?;
        self.opened += 1;
        let handle = self
            .resources
            .track(format!("{}#stream-{}", self.name, self.opened));
        log::debug!("Opened {}", handle.name());
        Ok(TrackedStream {
            inner: Some(inner),
            handle,
        })
    }
}

impl<T: Send + 'static> StreamingDataSource<T> for IteratorSource<T> {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn stream(&mut self) -> Result<RowStream<'_, T>> {
        Ok(Box::new(self.open()?))
    }

    fn stream_filtered(&mut self, filter: &Filter) -> Result<RowStream<'_, T>> {
        let compiled = filter.compile()?;
        let Some(accessor) = self.accessor.clone() else {
            log::debug!(
                "No field accessor on {}, streaming all entities (filter: {})",
                self.name,
                filter.describe()
            );
            return self.stream();
        };

        let stream = self.open()?;
        Ok(Box::new(stream.filter(move |item| match item {
            Ok(entity) => compiled.matches(|key| accessor(entity, key)),
            Err(_) => true,
        })))
    }

    fn close(&mut self) {
        let released = self.resources.release_all();
        if released > 0 {
            log::debug!("Closed {} open stream(s) on {}", released, self.name);
        }
    }
}

struct TrackedStream<T> {
    inner: Option<BoxedIter<T>>,
    handle: ResourceHandle,
}

impl<T> Iterator for TrackedStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.handle.is_released() {
            self.inner = None;
        }
        let item = self.inner.as_mut()?.next();
        if item.is_none() {
            self.inner = None;
            if let Err(e) = self.handle.release() {
                log::warn!("Failed to release {}: {}", self.handle.name(), e);
            }
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::Predicate;
    use crate::error::ExportError;

    #[test]
    fn test_exhausted_stream_releases_itself() {
        let mut source = IteratorSource::new("letters", || vec!["a", "b"]);

        let items: Vec<&str> = source.stream().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(items, vec!["a", "b"]);
        assert_eq!(source.open_streams(), 0);
    }

    #[test]
    fn test_close_releases_partial_streams() {
        let mut source = IteratorSource::new("counter", || 0..);

        {
            let mut stream = source.stream().unwrap();
            assert_eq!(stream.next().unwrap().unwrap(), 0);
        }
        {
            let _unused = source.stream().unwrap();
        }
        assert_eq!(source.open_streams(), 2);

        source.close();
        assert_eq!(source.open_streams(), 0);
        source.close();
    }

    #[test]
    fn test_filter_without_accessor_falls_back() {
        let mut source = IteratorSource::new("numbers", || 1..=3i64);
        let filter = Filter::new().with("value", 2i64);

        let all: Vec<i64> = source
            .stream_filtered(&filter)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[test]
    fn test_invalid_filter_rejected_before_open() {
        let mut source = IteratorSource::new("numbers", || 1..=3i64)
            .with_field_accessor(|n: &i64, _| Some(Scalar::Int(*n)));
        let filter = Filter::new().with("value; drop", 2i64);

        let err = source.stream_filtered(&filter).err().unwrap();
        assert!(matches!(err, ExportError::Validation { .. }));
        assert_eq!(source.open_streams(), 0);
    }

    #[test]
    fn test_pattern_filter() {
        let names = ["alice", "Bob", "ALINA", "carol"];
        let mut source = IteratorSource::new("names", move || names.map(String::from))
            .with_field_accessor(|s: &String, field| {
                (field == "name").then(|| Scalar::Text(s.clone()))
            });
        let filter = Filter::new().with(
            "name",
            Predicate::Pattern {
                pattern: "^al".to_string(),
                options: Some("i".to_string()),
            },
        );

        let matched: Vec<String> = source
            .stream_filtered(&filter)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(matched, vec!["alice", "ALINA"]);
    }

    #[test]
    fn test_unbalanced_pattern_is_validation_error() {
        let mut source = IteratorSource::new("names", || vec!["a".to_string()])
            .with_field_accessor(|s: &String, _| Some(Scalar::Text(s.clone())));
        let filter = Filter::new().with(
            "name",
            Predicate::Pattern {
                pattern: "(unclosed".to_string(),
                options: None,
            },
        );

        let err = source.stream_filtered(&filter).err().unwrap();
        assert!(matches!(err, ExportError::Validation { .. }));
    }
}
