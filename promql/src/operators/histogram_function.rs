//! `histogram_quantile(φ, v)` over native histograms and classic `le`
//! bucket series.
//!
//! Classic buckets of one histogram arrive as separate series, so series are
//! grouped by their labels without `le` and `__name__`. As for aggregations,
//! a group is emitted once its last input series has been read.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::annotations::{
    bad_bucket_label_warning, forced_monotonicity_info, invalid_quantile_warning,
    mixed_classic_native_histograms_warning,
};
use crate::context::QueryContext;
use crate::error::{EvalResult, EvaluationError};
use crate::functions::histograms::{ClassicBucket, bucket_quantile};
use crate::histogram::FloatHistogram;
use crate::model::{FPoint, Labels};
use crate::operators::deduplicate_and_merge::DUPLICATE_LABELSET_MESSAGE;
use crate::operators::{InstantVectorOperator, ScalarOperator};
use crate::time_range::QueryTimeRange;
use crate::types::{
    InstantVectorSeriesData, ScalarData, SeriesMetadata, append_series_metadata, get_filled_vec, get_vec,
    push_tracked, put_series_metadata_vec, put_vec,
};

const BUCKET_LABEL: &str = "le";

/// Per-series facts needed once its data arrives.
struct InputSeries {
    group: usize,
    /// Parsed `le`, or the raw value when it is missing or malformed.
    upper_bound: Result<f64, String>,
    metric_name: Option<String>,
}

#[derive(Default)]
struct GroupState {
    /// Per step, the classic buckets seen so far.
    uppers: Vec<Vec<f64>>,
    counts: Vec<Vec<f64>>,
    natives: Vec<Option<FloatHistogram>>,
    metric_name: Option<String>,
}

impl GroupState {
    fn release(&mut self, ctx: &mut QueryContext) {
        for mut outer in [std::mem::take(&mut self.uppers), std::mem::take(&mut self.counts)] {
            for inner in outer.drain(..) {
                put_vec(inner, &mut ctx.memory);
            }
            put_vec(outer, &mut ctx.memory);
        }
        put_vec(std::mem::take(&mut self.natives), &mut ctx.memory);
    }
}

pub(crate) struct HistogramQuantile {
    inner: Box<dyn InstantVectorOperator>,
    param: Box<dyn ScalarOperator>,
    param_values: Option<ScalarData>,
    time_range: QueryTimeRange,
    position: String,
    series: Vec<InputSeries>,
    group_last_series: Vec<usize>,
    output_order: Vec<usize>,
    states: Vec<Option<GroupState>>,
    next_input: usize,
    next_output: usize,
}

impl HistogramQuantile {
    pub(crate) fn new(
        inner: Box<dyn InstantVectorOperator>,
        param: Box<dyn ScalarOperator>,
        time_range: QueryTimeRange,
        position: String,
    ) -> Self {
        Self {
            inner,
            param,
            param_values: None,
            time_range,
            position,
            series: Vec::new(),
            group_last_series: Vec::new(),
            output_order: Vec::new(),
            states: Vec::new(),
            next_input: 0,
            next_output: 0,
        }
    }

    fn group_labels(labels: &Labels) -> Labels {
        if labels.has(BUCKET_LABEL) {
            labels.without(&[BUCKET_LABEL]).without_metric_name()
        } else {
            labels.without_metric_name()
        }
    }

    fn accumulate(
        state: &mut GroupState,
        series: &InputSeries,
        data: &InstantVectorSeriesData,
        time_range: &QueryTimeRange,
        position: &str,
        ctx: &mut QueryContext,
    ) -> EvalResult<()> {
        let steps = time_range.step_count;
        if state.metric_name.is_none() {
            state.metric_name.clone_from(&series.metric_name);
        }
        if !data.floats.is_empty() {
            match &series.upper_bound {
                Err(raw) => {
                    ctx.annotations.add_if_absent(bad_bucket_label_warning(
                        series.metric_name.as_deref(),
                        raw,
                        position,
                    ));
                }
                Ok(upper) => {
                    if state.uppers.is_empty() {
                        state.uppers = get_filled_vec(steps, Vec::new(), &mut ctx.memory)?;
                        state.counts = get_filled_vec(steps, Vec::new(), &mut ctx.memory)?;
                    }
                    for p in &data.floats {
                        let i = time_range.point_index(p.t);
                        push_tracked(&mut state.uppers[i], *upper, &mut ctx.memory)?;
                        push_tracked(&mut state.counts[i], p.f, &mut ctx.memory)?;
                    }
                }
            }
        }
        if !data.histograms.is_empty() {
            if state.natives.is_empty() {
                state.natives = get_filled_vec(steps, None, &mut ctx.memory)?;
            }
            for p in &data.histograms {
                let slot = &mut state.natives[time_range.point_index(p.t)];
                if slot.is_some() {
                    return Err(EvaluationError::FunctionEvaluation(DUPLICATE_LABELSET_MESSAGE.to_string()));
                }
                *slot = Some((*p.h).clone());
            }
        }
        Ok(())
    }

    fn finish(&self, state: &GroupState, ctx: &mut QueryContext) -> EvalResult<InstantVectorSeriesData> {
        let mut out = InstantVectorSeriesData::default();
        let mut buckets = Vec::new();
        for (i, t) in self.time_range.step_times().enumerate() {
            let q = self.param_values.as_ref().map(|p| p.value_at(i)).unwrap_or(f64::NAN);
            let classic = state.uppers.get(i).filter(|u| !u.is_empty());
            let native = state.natives.get(i).and_then(Option::as_ref);
            let value = match (classic, native) {
                (Some(_), Some(_)) => {
                    ctx.annotations.add_if_absent(mixed_classic_native_histograms_warning(
                        state.metric_name.as_deref(),
                        &self.position,
                    ));
                    None
                }
                (Some(uppers), None) => {
                    buckets.clear();
                    buckets.extend(
                        uppers
                            .iter()
                            .zip(&state.counts[i])
                            .map(|(&upper, &count)| ClassicBucket { upper, count }),
                    );
                    let result = bucket_quantile(q, &mut buckets);
                    if result.forced_monotonic {
                        ctx.annotations.add_if_absent(forced_monotonicity_info(
                            state.metric_name.as_deref(),
                            &self.position,
                        ));
                    }
                    Some(result.value)
                }
                (None, Some(h)) => Some(h.quantile(q)),
                (None, None) => None,
            };
            let Some(value) = value else { continue };
            if !(0.0..=1.0).contains(&q) {
                ctx.annotations.add_if_absent(invalid_quantile_warning(q, &self.position));
            }
            if let Err(e) = push_tracked(&mut out.floats, FPoint::new(t, value), &mut ctx.memory) {
                out.release(&mut ctx.memory);
                return Err(e);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl InstantVectorOperator for HistogramQuantile {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        self.param_values = Some(self.param.values(ctx).await?);
        let input = self.inner.series_metadata(ctx).await?;
        let mut by_labels: HashMap<Labels, usize> = HashMap::new();
        let mut group_labels = Vec::new();
        for m in &input {
            let key = Self::group_labels(&m.labels);
            let group = *by_labels.entry(key).or_insert_with_key(|key| {
                group_labels.push(key.clone());
                group_labels.len() - 1
            });
            let raw = m.labels.get(BUCKET_LABEL).unwrap_or_default();
            self.series.push(InputSeries {
                group,
                upper_bound: raw.parse::<f64>().map_err(|_| raw.to_string()),
                metric_name: m.labels.metric_name().map(str::to_string),
            });
        }
        put_series_metadata_vec(input, &mut ctx.memory);

        let mut last = vec![0; group_labels.len()];
        for (i, s) in self.series.iter().enumerate() {
            last[s.group] = i;
        }
        let mut order: Vec<usize> = (0..group_labels.len()).collect();
        order.sort_by_key(|&g| last[g]);
        let mut output = get_vec(order.len(), &mut ctx.memory)?;
        for &g in &order {
            if let Err(e) = append_series_metadata(
                &mut output,
                SeriesMetadata::new(group_labels[g].clone()),
                &mut ctx.memory,
            ) {
                put_series_metadata_vec(output, &mut ctx.memory);
                return Err(e);
            }
        }
        self.states = (0..order.len()).map(|_| None).collect();
        self.group_last_series = last;
        self.output_order = order;
        Ok(output)
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        ctx.check_cancelled()?;
        let Some(&g) = self.output_order.get(self.next_output) else {
            return Ok(None);
        };
        self.next_output += 1;
        while self.next_input <= self.group_last_series[g] {
            let Some(data) = self.inner.next_series(ctx).await? else {
                return Err(EvaluationError::Internal(format!(
                    "histogram_quantile input ended after {} series",
                    self.next_input
                )));
            };
            let series = &self.series[self.next_input];
            self.next_input += 1;
            let state = self.states[series.group].get_or_insert_with(GroupState::default);
            let accumulated = Self::accumulate(state, series, &data, &self.time_range, &self.position, ctx);
            data.release(&mut ctx.memory);
            accumulated?;
        }
        let Some(mut state) = self.states[g].take() else {
            return Err(EvaluationError::Internal("histogram_quantile group has no series".to_string()));
        };
        let result = self.finish(&state, ctx);
        state.release(ctx);
        result.map(Some)
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        for mut state in self.states.iter_mut().filter_map(Option::take) {
            state.release(ctx);
        }
        if let Some(values) = self.param_values.take() {
            values.release(&mut ctx.memory);
        }
        self.param.close(ctx);
        self.inner.close(ctx);
    }
}
