use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::model::FPoint;
use crate::operators::aggregations::{AggregationGroup, GroupEnv};
use crate::types::{InstantVectorSeriesData, get_filled_vec, push_tracked, put_vec};

/// `count`, and `group` when every present step reports 1.
pub(crate) struct CountGroup {
    counts: Vec<f64>,
    is_group: bool,
}

impl CountGroup {
    pub(crate) fn new(is_group: bool) -> Self {
        Self {
            counts: Vec::new(),
            is_group,
        }
    }
}

impl AggregationGroup for CountGroup {
    fn accumulate(&mut self, data: &InstantVectorSeriesData, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<()> {
        if self.counts.is_empty() {
            self.counts = get_filled_vec(env.time_range.step_count, 0.0, &mut ctx.memory)?;
        }
        let steps = data.floats.iter().map(|p| p.t).chain(data.histograms.iter().map(|p| p.t));
        for t in steps {
            self.counts[env.time_range.point_index(t)] += 1.0;
        }
        Ok(())
    }

    fn finish(&mut self, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<InstantVectorSeriesData> {
        let mut out = InstantVectorSeriesData::default();
        for (i, &count) in self.counts.iter().enumerate() {
            if count == 0.0 {
                continue;
            }
            let value = if self.is_group { 1.0 } else { count };
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
        put_vec(std::mem::take(&mut self.counts), &mut ctx.memory);
    }
}
