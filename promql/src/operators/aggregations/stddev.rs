use crate::annotations::histogram_ignored_in_aggregation_info;
use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::functions::math::Welford;
use crate::model::FPoint;
use crate::operators::aggregations::{AggregationGroup, GroupEnv};
use crate::types::{InstantVectorSeriesData, get_filled_vec, push_tracked, put_vec};

/// `stddev` and `stdvar`, population statistics over floats only.
pub(crate) struct StddevGroup {
    accumulators: Vec<Welford>,
    present: Vec<bool>,
    is_stddev: bool,
}

impl StddevGroup {
    pub(crate) fn new(is_stddev: bool) -> Self {
        Self {
            accumulators: Vec::new(),
            present: Vec::new(),
            is_stddev,
        }
    }
}

impl AggregationGroup for StddevGroup {
    fn accumulate(&mut self, data: &InstantVectorSeriesData, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<()> {
        if !data.histograms.is_empty() {
            let name = if self.is_stddev { "stddev" } else { "stdvar" };
            ctx.annotations
                .add_if_absent(histogram_ignored_in_aggregation_info(name, env.position));
        }
        if data.floats.is_empty() {
            return Ok(());
        }
        if self.accumulators.is_empty() {
            let steps = env.time_range.step_count;
            self.accumulators = get_filled_vec(steps, Welford::default(), &mut ctx.memory)?;
            self.present = get_filled_vec(steps, false, &mut ctx.memory)?;
        }
        for p in &data.floats {
            let i = env.time_range.point_index(p.t);
            self.accumulators[i].push(p.f);
            self.present[i] = true;
        }
        Ok(())
    }

    fn finish(&mut self, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<InstantVectorSeriesData> {
        let mut out = InstantVectorSeriesData::default();
        for (i, (acc, &present)) in self.accumulators.iter().zip(&self.present).enumerate() {
            if !present {
                continue;
            }
            let variance = acc.variance();
            let value = if self.is_stddev { variance.sqrt() } else { variance };
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
        put_vec(std::mem::take(&mut self.accumulators), &mut ctx.memory);
        put_vec(std::mem::take(&mut self.present), &mut ctx.memory);
    }
}
