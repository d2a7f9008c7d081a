//! `expr[range:step]`: evaluates an instant vector expression on its own,
//! step-aligned time range and exposes the results as a range vector.

use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::model::{FPoint, HPoint};
use crate::operators::{InstantVectorOperator, RangeVectorOperator};
use crate::ring_buffer::RingBuffer;
use crate::time_range::QueryTimeRange;
use crate::types::{InstantVectorSeriesData, RangeVectorStepData, SeriesMetadata};

/// Time range the inner expression of a subquery is evaluated over.
///
/// Steps are multiples of `step_ms` (relative to the epoch), starting with the
/// first one inside the window of the outer query's first step.
pub(crate) fn subquery_time_range(
    outer: &QueryTimeRange,
    timestamp_ms: Option<i64>,
    offset_ms: i64,
    range_ms: i64,
    step_ms: i64,
) -> EvalResult<QueryTimeRange> {
    let (outer_start, outer_end) = match timestamp_ms {
        Some(t) => (t, t),
        None => (outer.start_t, outer.end_t),
    };
    let earliest = outer_start - offset_ms - range_ms;
    let mut start = earliest.div_euclid(step_ms) * step_ms;
    if start < earliest {
        start += step_ms;
    }
    let end = outer_end - offset_ms;
    if end < start {
        // no inner step falls in any window: evaluate a single step that
        // every window excludes
        return QueryTimeRange::new_range(start, start, step_ms);
    }
    QueryTimeRange::new_range(start, end, step_ms)
}

pub(crate) struct Subquery {
    inner: Box<dyn InstantVectorOperator>,
    time_range: QueryTimeRange,
    timestamp_ms: Option<i64>,
    offset_ms: i64,
    range_ms: i64,
    /// Output of the inner expression for the current series.
    current: Option<InstantVectorSeriesData>,
    next_float: usize,
    next_histogram: usize,
    floats: RingBuffer<FPoint>,
    histograms: RingBuffer<HPoint>,
    next_step: usize,
}

impl Subquery {
    pub(crate) fn new(
        inner: Box<dyn InstantVectorOperator>,
        time_range: QueryTimeRange,
        timestamp_ms: Option<i64>,
        offset_ms: i64,
        range_ms: i64,
    ) -> Self {
        Self {
            inner,
            time_range,
            timestamp_ms,
            offset_ms,
            range_ms,
            current: None,
            next_float: 0,
            next_histogram: 0,
            floats: RingBuffer::new(),
            histograms: RingBuffer::new(),
            next_step: 0,
        }
    }

    fn release_current(&mut self, ctx: &mut QueryContext) {
        if let Some(data) = self.current.take() {
            data.release(&mut ctx.memory);
        }
    }

    fn fill_window(&mut self, range_start: i64, range_end: i64, ctx: &mut QueryContext) -> EvalResult<()> {
        let Some(data) = &self.current else {
            return Ok(());
        };
        while let Some(p) = data.floats.get(self.next_float) {
            if p.t > range_end {
                break;
            }
            self.next_float += 1;
            if p.t > range_start {
                self.floats.append(*p, &mut ctx.memory)?;
            }
        }
        while let Some(p) = data.histograms.get(self.next_histogram) {
            if p.t > range_end {
                break;
            }
            self.next_histogram += 1;
            if p.t > range_start {
                self.histograms.append(p.clone(), &mut ctx.memory)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RangeVectorOperator for Subquery {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        self.inner.series_metadata(ctx).await
    }

    fn range_ms(&self) -> i64 {
        self.range_ms
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<bool> {
        ctx.check_cancelled()?;
        self.release_current(ctx);
        self.floats.reset();
        self.histograms.reset();
        self.next_float = 0;
        self.next_histogram = 0;
        self.next_step = 0;
        self.current = self.inner.next_series(ctx).await?;
        Ok(self.current.is_some())
    }

    fn next_step_samples<'a>(
        &'a mut self,
        ctx: &mut QueryContext,
    ) -> EvalResult<Option<RangeVectorStepData<'a>>> {
        if self.current.is_none() || self.next_step >= self.time_range.step_count {
            return Ok(None);
        }
        let step_t = self.time_range.step_time(self.next_step);
        let range_end = self.timestamp_ms.unwrap_or(step_t) - self.offset_ms;
        let range_start = range_end - self.range_ms - 1;
        self.floats.discard_points_at_or_before(range_start);
        self.histograms.discard_points_at_or_before(range_start);
        self.fill_window(range_start, range_end, ctx)?;
        self.next_step += 1;
        Ok(Some(RangeVectorStepData {
            step_t,
            range_start,
            range_end,
            floats: self.floats.view_until(range_end),
            histograms: self.histograms.view_until(range_end),
        }))
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        self.release_current(ctx);
        self.floats.close(&mut ctx.memory);
        self.histograms.close(&mut ctx.memory);
        self.inner.close(ctx);
    }
}
