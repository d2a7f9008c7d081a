//! State shared by every operator of one executing query.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::annotations::Annotations;
use crate::config::QueryLimits;
use crate::error::{EvalResult, EvaluationError, LimitedResource};
use crate::memory::MemoryConsumptionTracker;

/// Counters reported with a query result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Samples read by selectors (one per output point for instant selectors).
    pub total_samples: u64,
    /// Series returned by storage across all selectors.
    pub series_fetched: u64,
    /// High-water mark of the memory tracker.
    pub peak_memory_bytes: u64,
}

/// Memory tracker, annotation collector, statistics and cancellation state
/// of a query. Passed explicitly as `&mut` to every operator call.
pub struct QueryContext {
    pub(crate) memory: MemoryConsumptionTracker,
    pub(crate) annotations: Annotations,
    pub(crate) stats: QueryStats,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    max_samples: u64,
    check_interval: u64,
    samples_since_check: u64,
}

impl QueryContext {
    pub fn new(limits: &QueryLimits, cancellation: CancellationToken, check_interval: u64) -> Self {
        let deadline = (!limits.timeout.is_zero())
            .then(|| Instant::now().checked_add(limits.timeout))
            .flatten();
        Self {
            memory: MemoryConsumptionTracker::new(limits.max_estimated_memory_bytes),
            annotations: Annotations::new(),
            stats: QueryStats::default(),
            cancellation,
            deadline,
            max_samples: limits.max_samples,
            check_interval: check_interval.max(1),
            samples_since_check: 0,
        }
    }

    /// Fails if the query was cancelled or ran past its deadline.
    pub(crate) fn check_cancelled(&self) -> EvalResult<()> {
        if self.cancellation.is_cancelled() {
            return Err(EvaluationError::Canceled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(EvaluationError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Counts processed samples, enforcing the sample limit and checking for
    /// cancellation every `check_interval` samples.
    pub(crate) fn record_samples(&mut self, n: u64) -> EvalResult<()> {
        self.stats.total_samples += n;
        if self.max_samples > 0 && self.stats.total_samples > self.max_samples {
            return Err(EvaluationError::ResourceExhausted {
                resource: LimitedResource::Samples,
                limit: self.max_samples,
            });
        }
        self.samples_since_check += n;
        if self.samples_since_check >= self.check_interval {
            self.samples_since_check = 0;
            self.check_cancelled()?;
        }
        Ok(())
    }

    pub fn memory(&self) -> &MemoryConsumptionTracker {
        &self.memory
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub(crate) fn finish(self) -> (Annotations, QueryStats, MemoryConsumptionTracker) {
        let mut stats = self.stats;
        stats.peak_memory_bytes = self.memory.peak_bytes();
        (self.annotations, stats, self.memory)
    }
}

#[cfg(test)]
impl QueryContext {
    /// Context with no limits, for operator tests.
    pub(crate) fn for_tests() -> Self {
        let limits = QueryLimits {
            max_estimated_memory_bytes: 0,
            max_samples: 0,
            timeout: std::time::Duration::ZERO,
        };
        Self::new(&limits, CancellationToken::new(), 1024)
    }

    pub(crate) fn with_memory_limit(bytes: u64) -> Self {
        let mut ctx = Self::for_tests();
        ctx.memory = MemoryConsumptionTracker::new(bytes);
        ctx
    }
}
