//! The boundary between the engine and the series store.
//!
//! Selectors call [`Queryable::select`] once, receive every matching series
//! (labels first, samples lazily), and stream samples out of each series in
//! timestamp order.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use promql_parser::label::{Matcher, Matchers};

use crate::error::StorageResult;
use crate::model::{Label, Labels, Sample};

/// Hints describing the time span and shape of a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectHints {
    /// Earliest timestamp any step could need, inclusive.
    pub start_ms: i64,
    /// Latest timestamp any step could need, inclusive.
    pub end_ms: i64,
    pub step_ms: i64,
    /// Range of the selector for range vectors, zero for instant vectors.
    pub range_ms: i64,
    /// Name of the enclosing function, if any.
    pub function: Option<String>,
}

/// A series store the engine can query.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Returns every series matching `matchers` that may hold samples within
    /// the hinted time span, ordered by labels.
    async fn select(&self, hints: &SelectHints, matchers: &Matchers) -> StorageResult<Box<dyn SeriesSet>>;
}

#[async_trait]
pub trait SeriesSet: Send {
    async fn next_series(&mut self) -> StorageResult<Option<StorageSeries>>;
}

/// Samples of one series, in ascending timestamp order.
pub trait SampleIterator: Send {
    fn next_sample(&mut self) -> StorageResult<Option<Sample>>;
}

pub struct StorageSeries {
    pub labels: Labels,
    pub samples: Box<dyn SampleIterator>,
}

/// Whether `labels` satisfy `matchers`, treating a missing label as empty.
///
/// With alternative (`or`) groups, the series must satisfy every plain
/// matcher or every matcher of at least one group.
pub fn matches_labels(matchers: &Matchers, labels: &Labels) -> bool {
    let all = |group: &[Matcher]| {
        group
            .iter()
            .all(|m| m.is_match(labels.get(&m.name).unwrap_or("")))
    };
    if matchers.or_matchers.is_empty() {
        return all(&matchers.matchers);
    }
    (!matchers.matchers.is_empty() && all(&matchers.matchers))
        || matchers.or_matchers.iter().any(|group| all(group))
}

struct VecSampleIterator {
    samples: std::vec::IntoIter<Sample>,
}

impl SampleIterator for VecSampleIterator {
    fn next_sample(&mut self) -> StorageResult<Option<Sample>> {
        Ok(self.samples.next())
    }
}

struct VecSeriesSet {
    series: std::vec::IntoIter<(Labels, Vec<Sample>)>,
}

#[async_trait]
impl SeriesSet for VecSeriesSet {
    async fn next_series(&mut self) -> StorageResult<Option<StorageSeries>> {
        Ok(self.series.next().map(|(labels, samples)| StorageSeries {
            labels,
            samples: Box::new(VecSampleIterator {
                samples: samples.into_iter(),
            }),
        }))
    }
}

/// A [`Queryable`] over series held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueryable {
    series: Arc<BTreeMap<Labels, Vec<Sample>>>,
}

impl InMemoryQueryable {
    pub fn builder() -> InMemoryQueryableBuilder {
        InMemoryQueryableBuilder::default()
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

#[async_trait]
impl Queryable for InMemoryQueryable {
    #[tracing::instrument(level = "trace", skip_all, fields(start = hints.start_ms, end = hints.end_ms))]
    async fn select(&self, hints: &SelectHints, matchers: &Matchers) -> StorageResult<Box<dyn SeriesSet>> {
        let selected: Vec<(Labels, Vec<Sample>)> = self
            .series
            .iter()
            .filter(|(labels, _)| matches_labels(matchers, labels))
            .filter_map(|(labels, samples)| {
                let window: Vec<Sample> = samples
                    .iter()
                    .filter(|s| s.timestamp_ms >= hints.start_ms && s.timestamp_ms <= hints.end_ms)
                    .cloned()
                    .collect();
                (!window.is_empty()).then(|| (labels.clone(), window))
            })
            .collect();
        tracing::trace!(series = selected.len(), "selected series");
        Ok(Box::new(VecSeriesSet {
            series: selected.into_iter(),
        }))
    }
}

/// Builder for [`InMemoryQueryable`].
#[derive(Debug, Default)]
pub struct InMemoryQueryableBuilder {
    series: BTreeMap<Labels, Vec<Sample>>,
}

impl InMemoryQueryableBuilder {
    /// Adds a sample. Samples of one series may be added in any order; a
    /// later sample with the same timestamp replaces the earlier one.
    pub fn add_sample(&mut self, labels: Vec<Label>, sample: Sample) -> &mut Self {
        self.series.entry(Labels::new(labels)).or_default().push(sample);
        self
    }

    pub fn add_series(&mut self, labels: Labels, samples: impl IntoIterator<Item = Sample>) -> &mut Self {
        self.series.entry(labels).or_default().extend(samples);
        self
    }

    pub fn build(&mut self) -> InMemoryQueryable {
        let mut series = std::mem::take(&mut self.series);
        for samples in series.values_mut() {
            samples.reverse();
            // stable sort of the reversed input keeps the last write first
            samples.sort_by_key(|s| s.timestamp_ms);
            samples.dedup_by_key(|s| s.timestamp_ms);
        }
        InMemoryQueryable {
            series: Arc::new(series),
        }
    }
}
