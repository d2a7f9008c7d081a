use crate::annotations::{
    incompatible_custom_buckets_warning, mixed_exponential_custom_histograms_warning,
    mixed_floats_histograms_aggregation_warning,
};
use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::functions::math::kahan_inc;
use crate::histogram::{FloatHistogram, HistogramError};
use crate::model::{FPoint, HPoint};
use crate::operators::aggregations::{AggregationGroup, GroupEnv};
use crate::types::{InstantVectorSeriesData, get_filled_vec, push_tracked, put_vec};

/// Per-step histogram sums, shared by `sum` and `avg`.
#[derive(Default)]
pub(crate) struct HistogramSums {
    sums: Vec<Option<FloatHistogram>>,
    counts: Vec<f64>,
    /// Steps at which two histograms could not be combined.
    invalid: Vec<bool>,
}

impl HistogramSums {
    pub(crate) fn add(&mut self, data: &InstantVectorSeriesData, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<()> {
        if data.histograms.is_empty() {
            return Ok(());
        }
        if self.sums.is_empty() {
            let steps = env.time_range.step_count;
            self.sums = get_filled_vec(steps, None, &mut ctx.memory)?;
            self.counts = get_filled_vec(steps, 0.0, &mut ctx.memory)?;
            self.invalid = get_filled_vec(steps, false, &mut ctx.memory)?;
        }
        for p in &data.histograms {
            let i = env.time_range.point_index(p.t);
            self.counts[i] += 1.0;
            if self.invalid[i] {
                continue;
            }
            match &mut self.sums[i] {
                None => self.sums[i] = Some((*p.h).clone()),
                Some(sum) => {
                    if let Err(e) = sum.add(&p.h) {
                        self.invalid[i] = true;
                        ctx.annotations.add_if_absent(match e {
                            HistogramError::MixedExponentialAndCustom => {
                                mixed_exponential_custom_histograms_warning(None, env.position)
                            }
                            HistogramError::IncompatibleCustomBounds => {
                                incompatible_custom_buckets_warning(None, env.position)
                            }
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn present(&self, i: usize) -> bool {
        self.counts.get(i).is_some_and(|&c| c > 0.0)
    }

    /// The sum at step `i`, divided by the number of histograms when
    /// `average` is set.
    pub(crate) fn take(&mut self, i: usize, average: bool) -> Option<FloatHistogram> {
        if self.invalid.get(i).copied().unwrap_or(true) {
            return None;
        }
        let mut sum = self.sums[i].take()?;
        if average {
            sum.div(self.counts[i]);
        }
        sum.compact();
        Some(sum)
    }

    pub(crate) fn release(&mut self, ctx: &mut QueryContext) {
        put_vec(std::mem::take(&mut self.sums), &mut ctx.memory);
        put_vec(std::mem::take(&mut self.counts), &mut ctx.memory);
        put_vec(std::mem::take(&mut self.invalid), &mut ctx.memory);
    }
}

/// Emits the warning for a step that saw both floats and histograms.
pub(crate) fn mixed_step(env: &GroupEnv<'_>, ctx: &mut QueryContext) {
    ctx.annotations
        .add_if_absent(mixed_floats_histograms_aggregation_warning(env.position));
}

#[derive(Default)]
pub(crate) struct SumGroup {
    sums: Vec<f64>,
    compensations: Vec<f64>,
    present: Vec<bool>,
    histograms: HistogramSums,
}

impl AggregationGroup for SumGroup {
    fn accumulate(&mut self, data: &InstantVectorSeriesData, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<()> {
        if !data.floats.is_empty() && self.sums.is_empty() {
            let steps = env.time_range.step_count;
            self.sums = get_filled_vec(steps, 0.0, &mut ctx.memory)?;
            self.compensations = get_filled_vec(steps, 0.0, &mut ctx.memory)?;
            self.present = get_filled_vec(steps, false, &mut ctx.memory)?;
        }
        for p in &data.floats {
            let i = env.time_range.point_index(p.t);
            (self.sums[i], self.compensations[i]) = kahan_inc(p.f, self.sums[i], self.compensations[i]);
            self.present[i] = true;
        }
        self.histograms.add(data, env, ctx)
    }

    fn finish(&mut self, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<InstantVectorSeriesData> {
        let mut out = InstantVectorSeriesData::default();
        for (i, t) in env.time_range.step_times().enumerate() {
            let has_float = self.present.get(i).copied().unwrap_or(false);
            let has_histogram = self.histograms.present(i);
            let pushed = match (has_float, has_histogram) {
                (true, true) => {
                    mixed_step(env, ctx);
                    Ok(())
                }
                (true, false) => {
                    let sum = self.sums[i];
                    let value = if sum.is_infinite() { sum } else { sum + self.compensations[i] };
                    push_tracked(&mut out.floats, FPoint::new(t, value), &mut ctx.memory)
                }
                (false, true) => match self.histograms.take(i, false) {
                    Some(h) => push_tracked(&mut out.histograms, HPoint::new(t, h), &mut ctx.memory),
                    None => Ok(()),
                },
                (false, false) => Ok(()),
            };
            if let Err(e) = pushed {
                out.release(&mut ctx.memory);
                return Err(e);
            }
        }
        Ok(out)
    }

    fn release(&mut self, ctx: &mut QueryContext) {
        put_vec(std::mem::take(&mut self.sums), &mut ctx.memory);
        put_vec(std::mem::take(&mut self.compensations), &mut ctx.memory);
        put_vec(std::mem::take(&mut self.present), &mut ctx.memory);
        self.histograms.release(ctx);
    }
}
