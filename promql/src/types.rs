//! Data exchanged between operators, and the tracked buffers that hold it.
//!
//! Buffers are obtained with [`get_vec`], grown only through [`push_tracked`]
//! and handed back with [`put_vec`], so that the query's
//! [`MemoryConsumptionTracker`] always reflects their capacity.

use std::mem::size_of;

use crate::error::EvalResult;
use crate::functions::math::{KahanMean, Welford};
use crate::histogram::FloatHistogram;
use crate::memory::{MemoryConsumptionTracker, MemorySource, labels_size};
use crate::model::{FPoint, HPoint, Labels};
use crate::ring_buffer::RingBufferView;

/// Identity of one series flowing through the operator tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesMetadata {
    pub labels: Labels,
}

impl SeriesMetadata {
    pub fn new(labels: Labels) -> Self {
        Self { labels }
    }
}

/// The points of one series of an instant vector, one per step at most.
#[derive(Debug, Default, PartialEq)]
pub struct InstantVectorSeriesData {
    pub floats: Vec<FPoint>,
    pub histograms: Vec<HPoint>,
}

impl InstantVectorSeriesData {
    pub(crate) fn release(self, tracker: &mut MemoryConsumptionTracker) {
        put_vec(self.floats, tracker);
        put_vec(self.histograms, tracker);
    }

    pub fn is_empty(&self) -> bool {
        self.floats.is_empty() && self.histograms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.floats.len() + self.histograms.len()
    }
}

/// One value per step of the enclosing time range.
#[derive(Debug, Default, PartialEq)]
pub struct ScalarData {
    pub samples: Vec<FPoint>,
}

impl ScalarData {
    pub(crate) fn release(self, tracker: &mut MemoryConsumptionTracker) {
        put_vec(self.samples, tracker);
    }

    pub(crate) fn value_at(&self, step: usize) -> f64 {
        self.samples.get(step).map(|p| p.f).unwrap_or(f64::NAN)
    }
}

/// The window of samples visible to a range function for one output step.
///
/// Samples satisfy `range_start < t <= range_end`.
pub struct RangeVectorStepData<'a> {
    pub step_t: i64,
    pub range_start: i64,
    pub range_end: i64,
    pub floats: RingBufferView<'a, FPoint>,
    pub histograms: RingBufferView<'a, HPoint>,
}

/// An element type whose buffers are charged to the memory tracker.
pub(crate) trait TrackedElement: Sized {
    const SOURCE: MemorySource;

    fn element_size() -> u64 {
        size_of::<Self>() as u64
    }
}

impl TrackedElement for FPoint {
    const SOURCE: MemorySource = MemorySource::FPointSlice;
}

impl TrackedElement for HPoint {
    const SOURCE: MemorySource = MemorySource::HPointSlice;

    // the boxed histogram is counted with the slot that owns it
    fn element_size() -> u64 {
        (size_of::<HPoint>() + size_of::<FloatHistogram>()) as u64
    }
}

impl TrackedElement for f64 {
    const SOURCE: MemorySource = MemorySource::FloatSlice;
}

impl TrackedElement for bool {
    const SOURCE: MemorySource = MemorySource::BoolSlice;
}

impl TrackedElement for usize {
    const SOURCE: MemorySource = MemorySource::IndexSlice;
}

impl TrackedElement for Option<FloatHistogram> {
    const SOURCE: MemorySource = MemorySource::HistogramSlice;
}

impl TrackedElement for Vec<f64> {
    const SOURCE: MemorySource = MemorySource::FloatSlice;
}

impl TrackedElement for KahanMean {
    const SOURCE: MemorySource = MemorySource::FloatSlice;
}

impl TrackedElement for Welford {
    const SOURCE: MemorySource = MemorySource::FloatSlice;
}

impl TrackedElement for SeriesMetadata {
    const SOURCE: MemorySource = MemorySource::SeriesMetadataSlice;
}

/// Allocates an empty buffer with room for at least `capacity` elements.
pub(crate) fn get_vec<T: TrackedElement>(
    capacity: usize,
    tracker: &mut MemoryConsumptionTracker,
) -> EvalResult<Vec<T>> {
    let v: Vec<T> = Vec::with_capacity(capacity);
    tracker.reserve(v.capacity() as u64 * T::element_size(), T::SOURCE)?;
    Ok(v)
}

/// Allocates a buffer of `len` copies of `value`.
pub(crate) fn get_filled_vec<T: TrackedElement + Clone>(
    len: usize,
    value: T,
    tracker: &mut MemoryConsumptionTracker,
) -> EvalResult<Vec<T>> {
    let mut v = get_vec(len, tracker)?;
    v.resize(len, value);
    Ok(v)
}

/// Returns a buffer, releasing its capacity.
pub(crate) fn put_vec<T: TrackedElement>(v: Vec<T>, tracker: &mut MemoryConsumptionTracker) {
    release_vec(&v, tracker);
}

/// Releases the capacity of a buffer that is about to leave the query
/// (moved into a result).
pub(crate) fn release_vec<T: TrackedElement>(v: &Vec<T>, tracker: &mut MemoryConsumptionTracker) {
    tracker.release(v.capacity() as u64 * T::element_size(), T::SOURCE);
}

/// Appends `item`, doubling the buffer through the tracker when full.
pub(crate) fn push_tracked<T: TrackedElement>(
    v: &mut Vec<T>,
    item: T,
    tracker: &mut MemoryConsumptionTracker,
) -> EvalResult<()> {
    if v.len() == v.capacity() {
        let mut grown = get_vec((v.capacity() * 2).max(4), tracker)?;
        grown.append(v);
        let old = std::mem::replace(v, grown);
        put_vec(old, tracker);
    }
    v.push(item);
    Ok(())
}

/// Appends a series, charging its labels as well as the slot.
pub(crate) fn append_series_metadata(
    v: &mut Vec<SeriesMetadata>,
    metadata: SeriesMetadata,
    tracker: &mut MemoryConsumptionTracker,
) -> EvalResult<()> {
    let size = labels_size(&metadata.labels);
    tracker.reserve(size, MemorySource::Labels)?;
    if let Err(e) = push_tracked(v, metadata, tracker) {
        tracker.release(size, MemorySource::Labels);
        return Err(e);
    }
    Ok(())
}

/// Returns a series metadata buffer, releasing both its slots and labels.
pub(crate) fn put_series_metadata_vec(v: Vec<SeriesMetadata>, tracker: &mut MemoryConsumptionTracker) {
    for m in &v {
        tracker.release_labels(&m.labels);
    }
    put_vec(v, tracker);
}

/// Replaces the labels of `metadata`, charging the size difference.
pub(crate) fn replace_labels(
    metadata: &mut SeriesMetadata,
    labels: Labels,
    tracker: &mut MemoryConsumptionTracker,
) -> EvalResult<()> {
    tracker.replace_labels(&metadata.labels, &labels)?;
    metadata.labels = labels;
    Ok(())
}
