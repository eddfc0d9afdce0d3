//! Filters passed to data sources
//!
//! Keys and values frequently come from untrusted request parameters, so every filter is
//! validated before a backend sees it: keys must match `^[a-zA-Z0-9._]+$`, values must be
//! scalars or typed predicates, never generic maps.

use crate::error::{ExportError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;

/// Maximum number of values in an `In` predicate
pub const MAX_IN_VALUES: usize = 1000;

/// Maximum length of a `Pattern` predicate
pub const MAX_PATTERN_LENGTH: usize = 256;

fn key_regex() -> &'static Regex {
    static KEY_REGEX: OnceLock<Regex> = OnceLock::new();
    KEY_REGEX.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._]+$").expect("static filter key regex"))
}

/// Scalar filter operand
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Scalar {
    /// Ordering between comparable scalars; ints and floats compare numerically
    pub fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
            (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
            (Scalar::Float(a), Scalar::Float(b)) => a.partial_cmp(b),
            (Scalar::Int(a), Scalar::Float(b)) => (*a as f64).partial_cmp(b),
            (Scalar::Float(a), Scalar::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Scalar::Text(a), Scalar::Text(b)) => Some(a.cmp(b)),
            (Scalar::Date(a), Scalar::Date(b)) => Some(a.cmp(b)),
            (Scalar::DateTime(a), Scalar::DateTime(b)) => Some(a.cmp(b)),
            (Scalar::Null, Scalar::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Scalar::Null => "null".to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Text(s) => s.clone(),
            Scalar::Date(d) => d.to_string(),
            Scalar::DateTime(d) => d.to_string(),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<i32> for Scalar {
    fn from(i: i32) -> Self {
        Scalar::Int(i64::from(i))
    }
}

impl From<f64> for Scalar {
    fn from(f: f64) -> Self {
        Scalar::Float(f)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl From<NaiveDate> for Scalar {
    fn from(d: NaiveDate) -> Self {
        Scalar::Date(d)
    }
}

impl From<NaiveDateTime> for Scalar {
    fn from(d: NaiveDateTime) -> Self {
        Scalar::DateTime(d)
    }
}

/// Explicit typed predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Scalar),
    In(Vec<Scalar>),
    Range {
        gt: Option<Scalar>,
        gte: Option<Scalar>,
        lt: Option<Scalar>,
        lte: Option<Scalar>,
    },
    /// Regular expression; `options` accepts the inline flags `i`, `m`, `s`, `x`
    Pattern {
        pattern: String,
        options: Option<String>,
    },
}

impl Predicate {
    fn validate(&self) -> Result<()> {
        match self {
            Predicate::Eq(_) => Ok(()),
            Predicate::In(values) => {
                if values.is_empty() {
                    return Err(ExportError::validation(
                        "filter.value",
                        "IN filter values must not be empty",
                    ));
                }
                if values.len() > MAX_IN_VALUES {
                    return Err(ExportError::validation(
                        "filter.value",
                        format!("IN filter values size must be <= {MAX_IN_VALUES}"),
                    ));
                }
                Ok(())
            }
            Predicate::Range { gt, gte, lt, lte } => {
                if gt.is_none() && gte.is_none() && lt.is_none() && lte.is_none() {
                    return Err(ExportError::validation(
                        "filter.value",
                        "Range filter must have at least one bound",
                    ));
                }
                Ok(())
            }
            Predicate::Pattern { pattern, options } => {
                if pattern.trim().is_empty() {
                    return Err(ExportError::validation(
                        "filter.value",
                        "Regex pattern must not be blank",
                    ));
                }
                if pattern.chars().count() > MAX_PATTERN_LENGTH {
                    return Err(ExportError::validation(
                        "filter.value",
                        format!("Regex pattern length must be <= {MAX_PATTERN_LENGTH}"),
                    ));
                }
                if let Some(opts) = options {
                    if let Some(bad) = opts.chars().find(|c| !"imsx".contains(*c)) {
                        return Err(ExportError::invalid_value(
                            "filter.value",
                            "Unsupported regex option",
                            bad.to_string(),
                        ));
                    }
                }
                self.compile_pattern()?;
                Ok(())
            }
        }
    }

    /// Compile a `Pattern` predicate
    pub fn compile_pattern(&self) -> Result<Option<Regex>> {
        match self {
            Predicate::Pattern { pattern, options } => {
                let source = match options.as_deref().filter(|o| !o.is_empty()) {
                    Some(opts) => format!("(?{opts}){pattern}"),
                    None => pattern.clone(),
                };
                Ok(Some(Regex::new(&source)?))
            }
            _ => Ok(None),
        }
    }

    /// Evaluate a non-pattern predicate against a field value
    ///
    /// `Pattern` predicates need a compiled regex; see [`Filter::compile`].
    fn matches(&self, value: &Scalar) -> bool {
        match self {
            Predicate::Eq(expected) => value.compare(expected) == Some(Ordering::Equal),
            Predicate::In(values) => values
                .iter()
                .any(|v| value.compare(v) == Some(Ordering::Equal)),
            Predicate::Range { gt, gte, lt, lte } => {
                let check = |bound: &Option<Scalar>, ok: &dyn Fn(Ordering) -> bool| {
                    bound
                        .as_ref()
                        .map_or(true, |b| value.compare(b).is_some_and(ok))
                };
                check(gt, &|o| o == Ordering::Greater)
                    && check(gte, &|o| o != Ordering::Less)
                    && check(lt, &|o| o == Ordering::Less)
                    && check(lte, &|o| o != Ordering::Greater)
            }
            Predicate::Pattern { .. } => false,
        }
    }
}

/// Value attached to a filter key
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(Scalar),
    Predicate(Predicate),
    /// Generic nested map as received from untrusted input; always rejected
    Nested(IndexMap<String, FilterValue>),
}

impl From<Scalar> for FilterValue {
    fn from(value: Scalar) -> Self {
        FilterValue::Scalar(value)
    }
}

macro_rules! impl_scalar_filter_value {
    ($($t:ty),*) => {
        $(
            impl From<$t> for FilterValue {
                fn from(value: $t) -> Self {
                    FilterValue::Scalar(Scalar::from(value))
                }
            }
        )*
    };
}

impl_scalar_filter_value!(&str, String, i64, i32, f64, bool, NaiveDate, NaiveDateTime);

impl From<Predicate> for FilterValue {
    fn from(p: Predicate) -> Self {
        FilterValue::Predicate(p)
    }
}

/// Insertion-ordered filter conditions, combined with AND
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: IndexMap<String, FilterValue>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition (builder style)
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FilterValue>) {
        self.conditions.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.conditions.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.conditions.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Reject unsafe keys and values before any backend call
    pub fn validate(&self) -> Result<()> {
        for (key, value) in &self.conditions {
            if !key_regex().is_match(key) {
                log::warn!("Invalid filter key rejected: {}", key);
                return Err(ExportError::invalid_value(
                    "filter.key",
                    "Filter key must contain only alphanumeric characters, dots, and underscores. Pattern: ^[a-zA-Z0-9._]+$",
                    key.as_str(),
                ));
            }
            match value {
                FilterValue::Scalar(_) => {}
                FilterValue::Predicate(p) => p.validate()?,
                FilterValue::Nested(_) => {
                    log::warn!("Nested filter value rejected for key: {}", key);
                    return Err(ExportError::invalid_value(
                        "filter.value",
                        "Filter values must be scalars or typed predicates, not maps",
                        key.as_str(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validate and compile into a matcher; regex patterns are built once here
    pub fn compile(&self) -> Result<CompiledFilter> {
        self.validate()?;
        let mut conditions = Vec::with_capacity(self.conditions.len());
        for (key, value) in &self.conditions {
            let condition = match value {
                FilterValue::Scalar(expected) => Condition::Equals(expected.clone()),
                FilterValue::Predicate(p) => match p.compile_pattern()? {
                    Some(re) => Condition::Pattern(re),
                    None => Condition::Predicate(p.clone()),
                },
                FilterValue::Nested(_) => {
                    return Err(ExportError::invalid_value(
                        "filter.value",
                        "Filter values must be scalars or typed predicates, not maps",
                        key.as_str(),
                    ))
                }
            };
            conditions.push((key.clone(), condition));
        }
        Ok(CompiledFilter { conditions })
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        self.conditions
            .iter()
            .map(|(k, v)| match v {
                FilterValue::Scalar(s) => format!("{k}={}", s.describe()),
                FilterValue::Predicate(_) => format!("{k}=<predicate>"),
                FilterValue::Nested(_) => format!("{k}=<map>"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone)]
enum Condition {
    Equals(Scalar),
    Predicate(Predicate),
    Pattern(Regex),
}

/// Validated filter with its patterns compiled, ready to test entities
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    conditions: Vec<(String, Condition)>,
}

impl CompiledFilter {
    /// Evaluate every condition with `field` resolving entity fields by key
    ///
    /// Missing fields never match.
    pub fn matches<F>(&self, field: F) -> bool
    where
        F: Fn(&str) -> Option<Scalar>,
    {
        self.conditions.iter().all(|(key, condition)| {
            let Some(actual) = field(key) else {
                return false;
            };
            match condition {
                Condition::Equals(expected) => actual.compare(expected) == Some(Ordering::Equal),
                Condition::Predicate(p) => p.matches(&actual),
                Condition::Pattern(re) => match &actual {
                    Scalar::Text(text) => re.is_match(text),
                    _ => false,
                },
            }
        })
    }
}
