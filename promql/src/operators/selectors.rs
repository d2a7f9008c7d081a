//! Leaf operators reading series from storage.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use promql_parser::label::Matchers;

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::model::{FPoint, HPoint, Sample, SampleValue};
use crate::operators::{InstantVectorOperator, RangeVectorOperator};
use crate::ring_buffer::RingBuffer;
use crate::storage::{Queryable, SampleIterator, SelectHints, StorageSeries};
use crate::time_range::QueryTimeRange;
use crate::types::{
    InstantVectorSeriesData, RangeVectorStepData, SeriesMetadata, append_series_metadata, get_vec,
    push_tracked, put_series_metadata_vec,
};

/// Selection shared by instant and range vector selectors.
pub(crate) struct Selector {
    pub(crate) queryable: Arc<dyn Queryable>,
    pub(crate) matchers: Matchers,
    pub(crate) time_range: QueryTimeRange,
    /// Fixed evaluation time from an `@` modifier.
    pub(crate) timestamp_ms: Option<i64>,
    pub(crate) offset_ms: i64,
    pub(crate) lookback_delta_ms: i64,
    /// Zero for instant vector selectors.
    pub(crate) range_ms: i64,
    pub(crate) function: Option<String>,
    series: VecDeque<StorageSeries>,
}

impl Selector {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queryable: Arc<dyn Queryable>,
        matchers: Matchers,
        time_range: QueryTimeRange,
        timestamp_ms: Option<i64>,
        offset_ms: i64,
        lookback_delta_ms: i64,
        range_ms: i64,
        function: Option<String>,
    ) -> Self {
        Self {
            queryable,
            matchers,
            time_range,
            timestamp_ms,
            offset_ms,
            lookback_delta_ms,
            range_ms,
            function,
            series: VecDeque::new(),
        }
    }

    fn hints(&self) -> SelectHints {
        let (start, end) = match self.timestamp_ms {
            Some(ts) => (ts, ts),
            None => (self.time_range.start_t, self.time_range.end_t),
        };
        let lookback = if self.range_ms > 0 {
            self.range_ms
        } else {
            self.lookback_delta_ms
        };
        SelectHints {
            start_ms: start - self.offset_ms - lookback,
            end_ms: end - self.offset_ms,
            step_ms: self.time_range.interval_ms,
            range_ms: self.range_ms,
            function: self.function.clone(),
        }
    }

    /// Time at which step `step` reads storage.
    pub(crate) fn eval_time(&self, step: usize) -> i64 {
        self.timestamp_ms
            .unwrap_or_else(|| self.time_range.step_time(step))
            - self.offset_ms
    }

    #[tracing::instrument(level = "debug", skip_all, fields(series = tracing::field::Empty))]
    pub(crate) async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        ctx.check_cancelled()?;
        let hints = self.hints();
        let mut set = self.queryable.select(&hints, &self.matchers).await?;
        let mut out = get_vec(0, &mut ctx.memory)?;
        loop {
            let series = match set.next_series().await {
                Ok(Some(series)) => series,
                Ok(None) => break,
                Err(e) => {
                    put_series_metadata_vec(out, &mut ctx.memory);
                    return Err(e.into());
                }
            };
            if let Err(e) = append_series_metadata(&mut out, SeriesMetadata::new(series.labels.clone()), &mut ctx.memory) {
                put_series_metadata_vec(out, &mut ctx.memory);
                return Err(e);
            }
            self.series.push_back(series);
        }
        ctx.stats.series_fetched += out.len() as u64;
        tracing::Span::current().record("series", out.len());
        Ok(out)
    }

    pub(crate) fn next_series(&mut self) -> Option<StorageSeries> {
        self.series.pop_front()
    }

    pub(crate) fn close(&mut self) {
        self.series.clear();
    }
}

/// Reads the next sample, preferring one set aside by a previous step.
fn next_sample(pending: &mut Option<Sample>, samples: &mut dyn SampleIterator) -> EvalResult<Option<Sample>> {
    match pending.take() {
        Some(sample) => Ok(Some(sample)),
        None => Ok(samples.next_sample()?),
    }
}

/// `metric{...}`: the latest sample within the lookback window at each step.
pub(crate) struct InstantVectorSelector {
    selector: Selector,
    /// Output the sample's timestamp in seconds instead of its value.
    return_sample_timestamps: bool,
}

impl InstantVectorSelector {
    pub(crate) fn new(selector: Selector, return_sample_timestamps: bool) -> Self {
        Self {
            selector,
            return_sample_timestamps,
        }
    }

    fn fill(
        &self,
        series: &mut StorageSeries,
        data: &mut InstantVectorSeriesData,
        ctx: &mut QueryContext,
    ) -> EvalResult<()> {
        let time_range = self.selector.time_range;
        let mut last: Option<Sample> = None;
        let mut pending: Option<Sample> = None;
        for step in 0..time_range.step_count {
            let ts = self.selector.eval_time(step);
            while let Some(sample) = next_sample(&mut pending, series.samples.as_mut())? {
                if sample.timestamp_ms > ts {
                    pending = Some(sample);
                    break;
                }
                last = Some(sample);
            }
            let Some(sample) = &last else { continue };
            if sample.timestamp_ms <= ts - self.selector.lookback_delta_ms || sample.is_stale() {
                continue;
            }
            let t = time_range.step_time(step);
            match &sample.value {
                _ if self.return_sample_timestamps => {
                    push_tracked(&mut data.floats, FPoint::new(t, sample.timestamp_ms as f64 / 1000.0), &mut ctx.memory)?
                }
                SampleValue::Float(f) => push_tracked(&mut data.floats, FPoint::new(t, *f), &mut ctx.memory)?,
                SampleValue::Histogram(h) => {
                    push_tracked(&mut data.histograms, HPoint::new(t, h.clone()), &mut ctx.memory)?
                }
            }
            ctx.record_samples(1)?;
        }
        Ok(())
    }
}

#[async_trait]
impl InstantVectorOperator for InstantVectorSelector {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        self.selector.series_metadata(ctx).await
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        ctx.check_cancelled()?;
        let Some(mut series) = self.selector.next_series() else {
            return Ok(None);
        };
        let mut data = InstantVectorSeriesData::default();
        match self.fill(&mut series, &mut data, ctx) {
            Ok(()) => Ok(Some(data)),
            Err(e) => {
                data.release(&mut ctx.memory);
                Err(e)
            }
        }
    }

    fn close(&mut self, _ctx: &mut QueryContext) {
        self.selector.close();
    }
}

/// `metric{...}[range]`: a sliding window of raw samples per step.
///
/// The window for a step evaluated at `t` holds samples with
/// `t - range <= ts <= t`.
pub(crate) struct RangeVectorSelector {
    selector: Selector,
    samples: Option<Box<dyn SampleIterator>>,
    pending: Option<Sample>,
    floats: RingBuffer<FPoint>,
    histograms: RingBuffer<HPoint>,
    next_step: usize,
}

impl RangeVectorSelector {
    pub(crate) fn new(selector: Selector) -> Self {
        Self {
            selector,
            samples: None,
            pending: None,
            floats: RingBuffer::new(),
            histograms: RingBuffer::new(),
            next_step: 0,
        }
    }

    fn fill_window(&mut self, range_start: i64, range_end: i64, ctx: &mut QueryContext) -> EvalResult<()> {
        let Some(samples) = self.samples.as_mut() else {
            return Ok(());
        };
        while let Some(sample) = next_sample(&mut self.pending, samples.as_mut())? {
            if sample.timestamp_ms > range_end {
                self.pending = Some(sample);
                break;
            }
            if sample.timestamp_ms <= range_start || sample.is_stale() {
                continue;
            }
            match sample.value {
                SampleValue::Float(f) => self
                    .floats
                    .append(FPoint::new(sample.timestamp_ms, f), &mut ctx.memory)?,
                SampleValue::Histogram(h) => self
                    .histograms
                    .append(HPoint::new(sample.timestamp_ms, h), &mut ctx.memory)?,
            }
            ctx.record_samples(1)?;
        }
        Ok(())
    }
}

#[async_trait]
impl RangeVectorOperator for RangeVectorSelector {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        self.selector.series_metadata(ctx).await
    }

    fn range_ms(&self) -> i64 {
        self.selector.range_ms
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<bool> {
        ctx.check_cancelled()?;
        self.floats.reset();
        self.histograms.reset();
        self.pending = None;
        self.next_step = 0;
        match self.selector.next_series() {
            Some(series) => {
                self.samples = Some(series.samples);
                Ok(true)
            }
            None => {
                self.samples = None;
                Ok(false)
            }
        }
    }

    fn next_step_samples<'a>(
        &'a mut self,
        ctx: &mut QueryContext,
    ) -> EvalResult<Option<RangeVectorStepData<'a>>> {
        if self.samples.is_none() || self.next_step >= self.selector.time_range.step_count {
            return Ok(None);
        }
        let range_end = self.selector.eval_time(self.next_step);
        // the window includes its lower edge, t - range
        let range_start = range_end - self.selector.range_ms - 1;
        self.floats.discard_points_at_or_before(range_start);
        self.histograms.discard_points_at_or_before(range_start);
        self.fill_window(range_start, range_end, ctx)?;

        let step_t = self.selector.time_range.step_time(self.next_step);
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
        self.selector.close();
        self.samples = None;
        self.pending = None;
        self.floats.close(&mut ctx.memory);
        self.histograms.close(&mut ctx.memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::FloatHistogram;
    use crate::model::{Label, Labels};
    use crate::operators::testing::collect_floats;
    use crate::storage::InMemoryQueryable;
    use promql_parser::label::{MatchOp, Matcher};

    fn name_matcher(name: &str) -> Matchers {
        Matchers::new(vec![Matcher {
            op: MatchOp::Equal,
            name: "__name__".to_string(),
            value: name.to_string(),
        }])
    }

    fn queryable(samples: &[(&str, i64, f64)]) -> Arc<dyn Queryable> {
        let mut builder = InMemoryQueryable::builder();
        for &(job, t, v) in samples {
            let sample = if v.is_nan() { Sample::stale(t) } else { Sample::float(t, v) };
            builder.add_sample(vec![Label::metric_name("m"), Label::new("job", job)], sample);
        }
        Arc::new(builder.build())
    }

    fn selector(queryable: Arc<dyn Queryable>, time_range: QueryTimeRange, range_ms: i64) -> Selector {
        Selector::new(queryable, name_matcher("m"), time_range, None, 0, 300_000, range_ms, None)
    }

    #[tokio::test]
    async fn should_select_latest_sample_within_lookback() {
        // given: samples at 0 and 60s, queried every 2 minutes up to 8 minutes
        let queryable = queryable(&[("a", 0, 1.0), ("a", 60_000, 2.0)]);
        let range = QueryTimeRange::new_range(0, 480_000, 120_000).unwrap();
        let mut op = InstantVectorSelector::new(selector(queryable, range, 0), false);
        let mut ctx = QueryContext::for_tests();

        // when
        let result = collect_floats(&mut op, &mut ctx).await;

        // then: the 60s sample is visible until it falls out of the 5m lookback
        assert_eq!(
            result[0].1,
            vec![(0, 1.0), (120_000, 2.0), (240_000, 2.0)]
        );
        assert_eq!(ctx.memory.current_bytes(), 0);
        assert_eq!(ctx.stats.total_samples, 3);
    }

    #[tokio::test]
    async fn should_stop_at_stale_marker() {
        let queryable = queryable(&[("a", 0, 1.0), ("a", 60_000, f64::NAN)]);
        let range = QueryTimeRange::new_range(0, 120_000, 60_000).unwrap();
        let mut op = InstantVectorSelector::new(selector(queryable, range, 0), false);
        let mut ctx = QueryContext::for_tests();

        let result = collect_floats(&mut op, &mut ctx).await;

        assert_eq!(result[0].1, vec![(0, 1.0)]);
    }

    #[tokio::test]
    async fn should_apply_offset() {
        let queryable = queryable(&[("a", 0, 1.0), ("a", 60_000, 2.0)]);
        let mut sel = selector(queryable, QueryTimeRange::new_instant(60_000), 0);
        sel.offset_ms = 60_000;
        let mut op = InstantVectorSelector::new(sel, false);
        let mut ctx = QueryContext::for_tests();

        let result = collect_floats(&mut op, &mut ctx).await;

        assert_eq!(result[0].1, vec![(60_000, 1.0)]);
    }

    #[tokio::test]
    async fn should_return_sample_timestamps() {
        let queryable = queryable(&[("a", 10_000, 7.0)]);
        let mut op = InstantVectorSelector::new(selector(queryable, QueryTimeRange::new_instant(30_000), 0), true);
        let mut ctx = QueryContext::for_tests();

        let result = collect_floats(&mut op, &mut ctx).await;

        assert_eq!(result[0].1, vec![(30_000, 10.0)]);
    }

    #[tokio::test]
    async fn should_slide_range_window_including_lower_edge() {
        // given: samples every minute, 2m windows evaluated every minute
        let queryable = queryable(&[("a", 0, 0.0), ("a", 60_000, 1.0), ("a", 120_000, 2.0), ("a", 180_000, 3.0)]);
        let range = QueryTimeRange::new_range(60_000, 180_000, 60_000).unwrap();
        let mut op = RangeVectorSelector::new(selector(queryable, range, 120_000));
        let mut ctx = QueryContext::for_tests();

        // when
        let metadata = op.series_metadata(&mut ctx).await.unwrap();
        assert!(op.next_series(&mut ctx).await.unwrap());
        let mut windows = Vec::new();
        while let Some(step) = op.next_step_samples(&mut ctx).unwrap() {
            windows.push((step.step_t, step.floats.iter().map(|p| p.t).collect::<Vec<_>>()));
        }

        // then
        assert_eq!(
            windows,
            vec![
                (60_000, vec![0, 60_000]),
                (120_000, vec![0, 60_000, 120_000]),
                (180_000, vec![60_000, 120_000, 180_000]),
            ]
        );
        assert!(!op.next_series(&mut ctx).await.unwrap());
        put_series_metadata_vec(metadata, &mut ctx.memory);
        op.close(&mut ctx);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[tokio::test]
    async fn should_exclude_sample_one_millisecond_below_window() {
        // given: a 2m window ending at 5m, samples just below, on, and at its end
        let queryable = queryable(&[("a", 179_999, 1.0), ("a", 180_000, 2.0), ("a", 300_000, 3.0)]);
        let mut op = RangeVectorSelector::new(selector(queryable, QueryTimeRange::new_instant(300_000), 120_000));
        let mut ctx = QueryContext::for_tests();

        // when
        let metadata = op.series_metadata(&mut ctx).await.unwrap();
        assert!(op.next_series(&mut ctx).await.unwrap());
        let step = op.next_step_samples(&mut ctx).unwrap().unwrap();

        // then
        assert_eq!(step.range_start, 179_999);
        assert_eq!(step.range_end, 300_000);
        assert_eq!(step.floats.iter().map(|p| (p.t, p.f)).collect::<Vec<_>>(), vec![(180_000, 2.0), (300_000, 3.0)]);
        put_series_metadata_vec(metadata, &mut ctx.memory);
        op.close(&mut ctx);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[tokio::test]
    async fn should_separate_histograms_from_floats_in_window() {
        let mut builder = InMemoryQueryable::builder();
        let labels = vec![Label::metric_name("m")];
        builder
            .add_sample(labels.clone(), Sample::float(0, 1.0))
            .add_sample(labels, Sample::histogram(10_000, FloatHistogram::new_exponential(0)));
        let queryable: Arc<dyn Queryable> = Arc::new(builder.build());
        let mut op = RangeVectorSelector::new(selector(queryable, QueryTimeRange::new_instant(20_000), 60_000));
        let mut ctx = QueryContext::for_tests();

        let metadata = op.series_metadata(&mut ctx).await.unwrap();
        assert_eq!(metadata[0].labels, Labels::from_pairs(&[("__name__", "m")]));
        assert!(op.next_series(&mut ctx).await.unwrap());
        let step = op.next_step_samples(&mut ctx).unwrap().unwrap();

        assert_eq!(step.floats.len(), 1);
        assert_eq!(step.histograms.len(), 1);
        put_series_metadata_vec(metadata, &mut ctx.memory);
        op.close(&mut ctx);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }
}
