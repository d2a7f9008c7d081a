//! Per-query memory accounting.
//!
//! Every buffer an operator allocates is reserved here before use and
//! released when it is returned. A reservation that would push the running
//! total past the limit fails with a resource-exhausted error and leaves the
//! tracker unchanged.

use crate::error::{EvalResult, EvaluationError};
use crate::model::Labels;

/// Fixed per-label overhead added to the string lengths when estimating the
/// size of a label set.
pub const LABEL_OVERHEAD_BYTES: u64 = 16;

/// What a reservation was made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySource {
    Labels,
    SeriesMetadataSlice,
    FPointSlice,
    HPointSlice,
    FloatSlice,
    BoolSlice,
    HistogramSlice,
    IndexSlice,
}

impl MemorySource {
    pub const ALL: [MemorySource; 8] = [
        MemorySource::Labels,
        MemorySource::SeriesMetadataSlice,
        MemorySource::FPointSlice,
        MemorySource::HPointSlice,
        MemorySource::FloatSlice,
        MemorySource::BoolSlice,
        MemorySource::HistogramSlice,
        MemorySource::IndexSlice,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Estimated size of a label set.
pub fn labels_size(labels: &Labels) -> u64 {
    labels
        .iter()
        .map(|l| (l.name.len() + l.value.len()) as u64 + LABEL_OVERHEAD_BYTES)
        .sum()
}

#[derive(Debug, Clone)]
pub struct MemoryConsumptionTracker {
    /// Zero means unlimited.
    limit: u64,
    current: u64,
    peak: u64,
    by_source: [u64; MemorySource::ALL.len()],
}

impl MemoryConsumptionTracker {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            current: 0,
            peak: 0,
            by_source: [0; MemorySource::ALL.len()],
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn reserve(&mut self, bytes: u64, source: MemorySource) -> EvalResult<()> {
        let next = self.current.saturating_add(bytes);
        if self.limit > 0 && next > self.limit {
            tracing::debug!(
                requested = bytes,
                current = self.current,
                limit = self.limit,
                ?source,
                "memory reservation rejected"
            );
            return Err(EvaluationError::memory_exhausted(self.limit));
        }
        self.current = next;
        self.by_source[source.index()] += bytes;
        self.peak = self.peak.max(self.current);
        Ok(())
    }

    /// Releases a previous reservation. Releasing more than is outstanding for
    /// `source` is a bookkeeping bug.
    pub fn release(&mut self, bytes: u64, source: MemorySource) {
        let held = &mut self.by_source[source.index()];
        debug_assert!(
            *held >= bytes,
            "released {} bytes of {:?} but only {} are held",
            bytes,
            source,
            held
        );
        if *held < bytes {
            tracing::error!(bytes, held = *held, ?source, "memory release exceeds reservation");
        }
        let released = bytes.min(*held);
        *held -= released;
        self.current -= released;
    }

    pub fn reserve_labels(&mut self, labels: &Labels) -> EvalResult<()> {
        self.reserve(labels_size(labels), MemorySource::Labels)
    }

    pub fn release_labels(&mut self, labels: &Labels) {
        self.release(labels_size(labels), MemorySource::Labels)
    }

    /// Swaps the reservation for `old` for one covering `new`, charging only
    /// the difference. On failure the reservation for `old` is kept.
    pub fn replace_labels(&mut self, old: &Labels, new: &Labels) -> EvalResult<()> {
        let (old_size, new_size) = (labels_size(old), labels_size(new));
        if new_size > old_size {
            self.reserve(new_size - old_size, MemorySource::Labels)
        } else {
            self.release(old_size - new_size, MemorySource::Labels);
            Ok(())
        }
    }

    pub fn current_bytes(&self) -> u64 {
        self.current
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn current_bytes_by_source(&self, source: MemorySource) -> u64 {
        self.by_source[source.index()]
    }
}
