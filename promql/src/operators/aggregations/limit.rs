//! `limitk` and `limit_ratio`: pass through a subset of each group's series
//! unchanged, floats and histograms alike.

use async_trait::async_trait;

use crate::annotations::invalid_ratio_warning;
use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::model::Labels;
use crate::operators::aggregations::Grouping;
use crate::operators::aggregations::topk_bottomk::k_from_param;
use crate::operators::{InstantVectorOperator, ScalarOperator, materialize};
use crate::time_range::QueryTimeRange;
use crate::types::{
    InstantVectorSeriesData, ScalarData, SeriesMetadata, append_series_metadata, get_filled_vec, get_vec, push_tracked,
    put_series_metadata_vec, put_vec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LimitKind {
    /// At most `k` series per group and step, in input order.
    Count,
    /// A deterministic, label-hash based share of the series.
    Ratio,
}

/// Position of a series in `[0, 1]` used by `limit_ratio`.
pub(crate) fn sample_offset(labels: &Labels) -> f64 {
    labels.stable_hash() as f64 / u64::MAX as f64
}

/// Whether a series at `offset` is part of the `ratio` sample. A positive
/// ratio takes from the bottom of `[0, 1]`, a negative one from the top, so
/// `r` and `r - 1` select complementary sets.
pub(crate) fn in_ratio(ratio: f64, offset: f64) -> bool {
    if ratio.abs() >= 1.0 {
        return true;
    }
    (ratio >= 0.0 && offset < ratio) || (ratio < 0.0 && offset >= 1.0 + ratio)
}

pub(crate) struct Limit {
    inner: Box<dyn InstantVectorOperator>,
    param: Box<dyn ScalarOperator>,
    grouping: Grouping,
    kind: LimitKind,
    time_range: QueryTimeRange,
    position: String,
    output: Vec<InstantVectorSeriesData>,
    next: usize,
}

impl Limit {
    pub(crate) fn new(
        inner: Box<dyn InstantVectorOperator>,
        param: Box<dyn ScalarOperator>,
        grouping: Grouping,
        kind: LimitKind,
        time_range: QueryTimeRange,
        position: String,
    ) -> Self {
        Self {
            inner,
            param,
            grouping,
            kind,
            time_range,
            position,
            output: Vec::new(),
            next: 0,
        }
    }

    /// Per-step parameter after validation: the count for `limitk`, the
    /// clamped ratio for `limit_ratio`.
    fn step_params(&self, param: &ScalarData, ctx: &mut QueryContext) -> EvalResult<Vec<f64>> {
        let mut params = get_vec(self.time_range.step_count, &mut ctx.memory)?;
        for step in 0..self.time_range.step_count {
            let value = param.value_at(step);
            let value = match self.kind {
                LimitKind::Count => match k_from_param(value) {
                    Ok(k) => k as f64,
                    Err(e) => {
                        put_vec(params, &mut ctx.memory);
                        return Err(e);
                    }
                },
                LimitKind::Ratio => {
                    let capped = value.clamp(-1.0, 1.0);
                    if capped != value {
                        ctx.annotations
                            .add_if_absent(invalid_ratio_warning(value, capped, &self.position));
                    }
                    capped
                }
            };
            params.push(value);
        }
        Ok(params)
    }

    /// Keeps the selected points of `data`, consuming it.
    fn filter(
        &self,
        data: InstantVectorSeriesData,
        keep: impl Fn(i64) -> bool,
        ctx: &mut QueryContext,
    ) -> EvalResult<InstantVectorSeriesData> {
        let mut kept = InstantVectorSeriesData::default();
        let mut result = Ok(());
        for p in &data.floats {
            if result.is_ok() && keep(p.t) {
                result = push_tracked(&mut kept.floats, *p, &mut ctx.memory);
            }
        }
        for p in &data.histograms {
            if result.is_ok() && keep(p.t) {
                result = push_tracked(&mut kept.histograms, p.clone(), &mut ctx.memory);
            }
        }
        data.release(&mut ctx.memory);
        match result {
            Ok(()) => Ok(kept),
            Err(e) => {
                kept.release(&mut ctx.memory);
                Err(e)
            }
        }
    }

    /// Keeps the steps at which the series' group still has room. `counts`
    /// holds the number of series already taken per step for this group.
    fn keep_first_k(
        &self,
        data: InstantVectorSeriesData,
        counts: &mut [f64],
        params: &[f64],
        ctx: &mut QueryContext,
    ) -> EvalResult<InstantVectorSeriesData> {
        let time_range = self.time_range;
        let mut keep_steps = match get_filled_vec(time_range.step_count, false, &mut ctx.memory) {
            Ok(v) => v,
            Err(e) => {
                data.release(&mut ctx.memory);
                return Err(e);
            }
        };
        let steps = data
            .floats
            .iter()
            .map(|p| p.t)
            .chain(data.histograms.iter().map(|p| p.t));
        for t in steps {
            let step = time_range.point_index(t);
            if counts[step] < params[step] {
                counts[step] += 1.0;
                keep_steps[step] = true;
            }
        }
        let kept = self.filter(data, |t| keep_steps[time_range.point_index(t)], ctx);
        put_vec(keep_steps, &mut ctx.memory);
        kept
    }

    fn select(
        &mut self,
        metadata: &[SeriesMetadata],
        data: Vec<InstantVectorSeriesData>,
        params: &[f64],
        ctx: &mut QueryContext,
    ) -> EvalResult<Vec<SeriesMetadata>> {
        let (groups, group_labels) = self.grouping.assign(metadata);
        let steps = self.time_range.step_count;
        let counters = match self.kind {
            LimitKind::Count => group_labels.len() * steps,
            LimitKind::Ratio => 0,
        };
        let mut taken: Vec<f64> = match get_filled_vec(counters, 0.0, &mut ctx.memory) {
            Ok(v) => v,
            Err(e) => {
                data.into_iter().for_each(|d| d.release(&mut ctx.memory));
                return Err(e);
            }
        };
        let result = self.select_series(metadata, data, &groups, &mut taken, params, ctx);
        put_vec(taken, &mut ctx.memory);
        result
    }

    fn select_series(
        &mut self,
        metadata: &[SeriesMetadata],
        data: Vec<InstantVectorSeriesData>,
        groups: &[usize],
        taken: &mut [f64],
        params: &[f64],
        ctx: &mut QueryContext,
    ) -> EvalResult<Vec<SeriesMetadata>> {
        let steps = self.time_range.step_count;
        let mut data = data.into_iter();
        let mut out_metadata = match get_vec(0, &mut ctx.memory) {
            Ok(v) => v,
            Err(e) => {
                data.for_each(|d| d.release(&mut ctx.memory));
                return Err(e);
            }
        };
        for (series, m) in metadata.iter().enumerate() {
            let Some(series_data) = data.next() else {
                break;
            };
            let kept = match self.kind {
                LimitKind::Count => {
                    let group = groups[series];
                    let counts = &mut taken[group * steps..(group + 1) * steps];
                    self.keep_first_k(series_data, counts, params, ctx)
                }
                LimitKind::Ratio => {
                    let offset = sample_offset(&m.labels);
                    let time_range = self.time_range;
                    self.filter(series_data, |t| in_ratio(params[time_range.point_index(t)], offset), ctx)
                }
            };
            let kept = match kept {
                Ok(k) => k,
                Err(e) => {
                    data.for_each(|d| d.release(&mut ctx.memory));
                    put_series_metadata_vec(out_metadata, &mut ctx.memory);
                    return Err(e);
                }
            };
            if kept.is_empty() {
                continue;
            }
            self.output.push(kept);
            if let Err(e) = append_series_metadata(&mut out_metadata, m.clone(), &mut ctx.memory) {
                data.for_each(|d| d.release(&mut ctx.memory));
                put_series_metadata_vec(out_metadata, &mut ctx.memory);
                return Err(e);
            }
        }
        Ok(out_metadata)
    }
}

#[async_trait]
impl InstantVectorOperator for Limit {
    #[tracing::instrument(level = "trace", skip_all, fields(kind = ?self.kind))]
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        let param = self.param.values(ctx).await?;
        let params = self.step_params(&param, ctx);
        param.release(&mut ctx.memory);
        let params = params?;
        let (metadata, data) = match materialize(self.inner.as_mut(), ctx).await {
            Ok(materialized) => materialized,
            Err(e) => {
                put_vec(params, &mut ctx.memory);
                return Err(e);
            }
        };
        let result = self.select(&metadata, data, &params, ctx);
        put_vec(params, &mut ctx.memory);
        put_series_metadata_vec(metadata, &mut ctx.memory);
        result
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        ctx.check_cancelled()?;
        let Some(slot) = self.output.get_mut(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        Ok(Some(std::mem::take(slot)))
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        for data in self.output.drain(..) {
            data.release(&mut ctx.memory);
        }
        self.param.close(ctx);
        self.inner.close(ctx);
    }
}
