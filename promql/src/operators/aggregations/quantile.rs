use crate::annotations::{histogram_ignored_in_aggregation_info, invalid_quantile_warning};
use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::functions::math::quantile;
use crate::model::FPoint;
use crate::operators::aggregations::{AggregationGroup, GroupEnv};
use crate::types::{InstantVectorSeriesData, get_filled_vec, push_tracked, put_vec};

/// `quantile(q, ...)`: keeps every float of the group until the group is
/// complete, one buffer per step.
#[derive(Default)]
pub(crate) struct QuantileGroup {
    values: Vec<Vec<f64>>,
}

impl AggregationGroup for QuantileGroup {
    fn accumulate(&mut self, data: &InstantVectorSeriesData, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<()> {
        if !data.histograms.is_empty() {
            ctx.annotations
                .add_if_absent(histogram_ignored_in_aggregation_info("quantile", env.position));
        }
        if data.floats.is_empty() {
            return Ok(());
        }
        if self.values.is_empty() {
            self.values = get_filled_vec(env.time_range.step_count, Vec::new(), &mut ctx.memory)?;
        }
        for p in &data.floats {
            push_tracked(&mut self.values[env.time_range.point_index(p.t)], p.f, &mut ctx.memory)?;
        }
        Ok(())
    }

    fn finish(&mut self, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<InstantVectorSeriesData> {
        let mut out = InstantVectorSeriesData::default();
        for (i, values) in self.values.iter_mut().enumerate() {
            if values.is_empty() {
                continue;
            }
            let q = env.param.map(|p| p.value_at(i)).unwrap_or(f64::NAN);
            if !(0.0..=1.0).contains(&q) {
                ctx.annotations.add_if_absent(invalid_quantile_warning(q, env.position));
            }
            if let Err(e) = push_tracked(
                &mut out.floats,
                FPoint::new(env.time_range.step_time(i), quantile(q, values)),
                &mut ctx.memory,
            ) {
                out.release(&mut ctx.memory);
                return Err(e);
            }
        }
        Ok(out)
    }

    fn release(&mut self, ctx: &mut QueryContext) {
        let mut outer = std::mem::take(&mut self.values);
        for values in outer.drain(..) {
            put_vec(values, &mut ctx.memory);
        }
        put_vec(outer, &mut ctx.memory);
    }
}
