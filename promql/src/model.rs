//! Core data types shared by storage, operators and query results.
//!
//! Labels identify a series, points carry either a float or a native
//! histogram, and [`QueryValue`] is what a finished query hands back.

use std::fmt;

use promql_parser::label::METRIC_NAME;

use crate::histogram::FloatHistogram;

/// A label is a key-value pair that identifies a time series.
///
/// The metric name is stored with key `__name__`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    /// The label name (key).
    pub name: String,
    /// The label value.
    pub value: String,
}

impl Label {
    /// Creates a new label with the given name and value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Creates a metric name label (`__name__`).
    pub fn metric_name(name: impl Into<String>) -> Self {
        Self::new(METRIC_NAME, name)
    }
}

/// A sorted, duplicate-free set of labels.
///
/// Labels are kept ordered by name so that equality, hashing and ordering
/// all agree with the Prometheus notion of series identity. Labels with an
/// empty value are dropped on construction: PromQL treats an empty value the
/// same as an absent label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Builds a label set, sorting by name. When a name repeats the last
    /// occurrence wins.
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.retain(|l| !l.value.is_empty());
        // stable sort keeps insertion order among equal names
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        let mut deduped: Vec<Label> = Vec::with_capacity(labels.len());
        for label in labels {
            match deduped.last_mut() {
                Some(last) if last.name == label.name => *last = label,
                _ => deduped.push(label),
            }
        }
        Self(deduped)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Convenience constructor from `(name, value)` pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::new(pairs.iter().map(|(k, v)| Label::new(*k, *v)).collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Label> {
        self.0
    }

    /// Returns a copy with `name` set to `value`. An empty value removes the label.
    pub fn with(&self, name: &str, value: &str) -> Labels {
        let mut labels: Vec<Label> = self.0.iter().filter(|l| l.name != name).cloned().collect();
        if !value.is_empty() {
            labels.push(Label::new(name, value));
        }
        Labels::new(labels)
    }

    pub fn without_metric_name(&self) -> Labels {
        if !self.has(METRIC_NAME) {
            return self.clone();
        }
        Labels(
            self.0
                .iter()
                .filter(|l| l.name != METRIC_NAME)
                .cloned()
                .collect(),
        )
    }

    /// Drops the named labels.
    pub fn without<S: AsRef<str>>(&self, names: &[S]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| !names.iter().any(|n| n.as_ref() == l.name))
                .cloned()
                .collect(),
        )
    }

    /// Keeps only the named labels.
    pub fn keep_only<S: AsRef<str>>(&self, names: &[S]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| names.iter().any(|n| n.as_ref() == l.name))
                .cloned()
                .collect(),
        )
    }

    /// Stable 64-bit hash of the label set, independent of process or run.
    pub fn stable_hash(&self) -> u64 {
        let mut buf = Vec::with_capacity(self.0.iter().map(|l| l.name.len() + l.value.len() + 2).sum());
        for label in &self.0 {
            buf.extend_from_slice(label.name.as_bytes());
            buf.push(0xff);
            buf.extend_from_slice(label.value.as_bytes());
            buf.push(0xff);
        }
        xxhash_rust::xxh3::xxh3_64(&buf)
    }
}

impl fmt::Display for Labels {
    /// Renders in exposition form: `name{a="b", c="d"}`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.metric_name() {
            write!(f, "{}", name)?;
        }
        let rest: Vec<&Label> = self.0.iter().filter(|l| l.name != METRIC_NAME).collect();
        if rest.is_empty() && self.metric_name().is_some() {
            return Ok(());
        }
        write!(f, "{{")?;
        for (i, label) in rest.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl From<Vec<Label>> for Labels {
    fn from(labels: Vec<Label>) -> Self {
        Labels::new(labels)
    }
}

/// A float point at a timestamp (milliseconds since the Unix epoch).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FPoint {
    pub t: i64,
    pub f: f64,
}

impl FPoint {
    pub fn new(t: i64, f: f64) -> Self {
        Self { t, f }
    }
}

/// A native histogram point at a timestamp (milliseconds since the Unix epoch).
#[derive(Debug, Clone, PartialEq)]
pub struct HPoint {
    pub t: i64,
    pub h: Box<FloatHistogram>,
}

impl HPoint {
    pub fn new(t: i64, h: FloatHistogram) -> Self {
        Self { t, h: Box::new(h) }
    }
}

/// The value of a stored or computed sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Float(f64),
    Histogram(FloatHistogram),
}

/// Bit pattern Prometheus uses to mark a series as stale.
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// Returns true if `f` is the staleness marker rather than an ordinary NaN.
pub fn is_stale_marker(f: f64) -> bool {
    f.to_bits() == STALE_NAN_BITS
}

/// A single data point as returned by storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Timestamp in milliseconds since Unix epoch.
    pub timestamp_ms: i64,
    pub value: SampleValue,
}

impl Sample {
    pub fn float(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value: SampleValue::Float(value),
        }
    }

    pub fn histogram(timestamp_ms: i64, h: FloatHistogram) -> Self {
        Self {
            timestamp_ms,
            value: SampleValue::Histogram(h),
        }
    }

    /// A staleness marker ending the series at `timestamp_ms`.
    pub fn stale(timestamp_ms: i64) -> Self {
        Self::float(timestamp_ms, f64::from_bits(STALE_NAN_BITS))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.value, SampleValue::Float(f) if is_stale_marker(f))
    }
}

/// One element of an instant vector result.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantSample {
    pub labels: Labels,
    pub timestamp_ms: i64,
    pub value: SampleValue,
}

/// One series of a range (matrix) result.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSeries {
    pub labels: Labels,
    pub floats: Vec<FPoint>,
    pub histograms: Vec<HPoint>,
}

/// The value produced by a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Scalar { timestamp_ms: i64, value: f64 },
    String { timestamp_ms: i64, value: String },
    Vector(Vec<InstantSample>),
    Matrix(Vec<RangeSeries>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_sort_labels_and_keep_last_duplicate() {
        // given
        let labels = Labels::new(vec![
            Label::new("job", "a"),
            Label::metric_name("up"),
            Label::new("job", "b"),
        ]);

        // then
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("job"), Some("b"));
        assert_eq!(labels.iter().next().unwrap().name, METRIC_NAME);
    }

    #[test]
    fn should_drop_empty_label_values() {
        let labels = Labels::from_pairs(&[("a", ""), ("b", "1")]);

        assert_eq!(labels, Labels::from_pairs(&[("b", "1")]));
        assert_eq!(labels.with("b", ""), Labels::empty());
    }

    #[test]
    fn should_render_labels_in_exposition_form() {
        let labels = Labels::from_pairs(&[("__name__", "up"), ("job", "api"), ("env", "prod")]);

        assert_eq!(labels.to_string(), r#"up{env="prod", job="api"}"#);
        assert_eq!(labels.without_metric_name().to_string(), r#"{env="prod", job="api"}"#);
        assert_eq!(Labels::from_pairs(&[("__name__", "up")]).to_string(), "up");
    }

    #[test]
    fn should_filter_labels_by_name() {
        let labels = Labels::from_pairs(&[("__name__", "up"), ("job", "api"), ("env", "prod")]);

        assert_eq!(labels.keep_only(&["job"]), Labels::from_pairs(&[("job", "api")]));
        assert_eq!(
            labels.without(&["job", METRIC_NAME]),
            Labels::from_pairs(&[("env", "prod")])
        );
    }

    #[test]
    fn should_hash_labels_stably() {
        let a = Labels::from_pairs(&[("a", "1"), ("b", "2")]);
        let b = Labels::from_pairs(&[("b", "2"), ("a", "1")]);
        let c = Labels::from_pairs(&[("a", "12")]);

        assert_eq!(a.stable_hash(), b.stable_hash());
        assert_ne!(a.stable_hash(), c.stable_hash());
    }

    #[test]
    fn should_distinguish_stale_marker_from_nan() {
        assert!(Sample::stale(10).is_stale());
        assert!(!Sample::float(10, f64::NAN).is_stale());
    }
}
