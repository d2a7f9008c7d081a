use crate::annotations::histogram_ignored_in_aggregation_info;
use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::model::FPoint;
use crate::operators::aggregations::{AggregationGroup, GroupEnv};
use crate::types::{InstantVectorSeriesData, get_filled_vec, push_tracked, put_vec};

/// `min` and `max`. A NaN is only kept when nothing else was seen.
pub(crate) struct MinMaxGroup {
    values: Vec<f64>,
    present: Vec<bool>,
    is_max: bool,
}

impl MinMaxGroup {
    pub(crate) fn new(is_max: bool) -> Self {
        Self {
            values: Vec::new(),
            present: Vec::new(),
            is_max,
        }
    }

    fn better(&self, candidate: f64, current: f64) -> bool {
        if current.is_nan() {
            return true;
        }
        if self.is_max { candidate > current } else { candidate < current }
    }
}

impl AggregationGroup for MinMaxGroup {
    fn accumulate(&mut self, data: &InstantVectorSeriesData, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<()> {
        if !data.histograms.is_empty() {
            let name = if self.is_max { "max" } else { "min" };
            ctx.annotations
                .add_if_absent(histogram_ignored_in_aggregation_info(name, env.position));
        }
        if data.floats.is_empty() {
            return Ok(());
        }
        if self.values.is_empty() {
            let steps = env.time_range.step_count;
            self.values = get_filled_vec(steps, f64::NAN, &mut ctx.memory)?;
            self.present = get_filled_vec(steps, false, &mut ctx.memory)?;
        }
        for p in &data.floats {
            let i = env.time_range.point_index(p.t);
            if !self.present[i] || self.better(p.f, self.values[i]) {
                self.values[i] = p.f;
            }
            self.present[i] = true;
        }
        Ok(())
    }

    fn finish(&mut self, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<InstantVectorSeriesData> {
        let mut out = InstantVectorSeriesData::default();
        for (i, (&value, &present)) in self.values.iter().zip(&self.present).enumerate() {
            if !present {
                continue;
            }
            if let Err(e) = push_tracked(
                &mut out.floats,
                FPoint::new(env.time_range.step_time(i), value),
                &mut ctx.memory,
            ) {
                out.release(&mut ctx.memory);
                return Err(e);
            }
        }
        Ok(out)
    }

    fn release(&mut self, ctx: &mut QueryContext) {
        put_vec(std::mem::take(&mut self.values), &mut ctx.memory);
        put_vec(std::mem::take(&mut self.present), &mut ctx.memory);
    }
}
