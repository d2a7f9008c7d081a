use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::functions::math::KahanMean;
use crate::model::{FPoint, HPoint};
use crate::operators::aggregations::sum::{HistogramSums, mixed_step};
use crate::operators::aggregations::{AggregationGroup, GroupEnv};
use crate::types::{InstantVectorSeriesData, get_filled_vec, push_tracked, put_vec};

/// `avg`. Histograms are averaged as their sum divided by their count.
#[derive(Default)]
pub(crate) struct AvgGroup {
    means: Vec<KahanMean>,
    histograms: HistogramSums,
}

impl AggregationGroup for AvgGroup {
    fn accumulate(&mut self, data: &InstantVectorSeriesData, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<()> {
        if !data.floats.is_empty() && self.means.is_empty() {
            self.means = get_filled_vec(env.time_range.step_count, KahanMean::default(), &mut ctx.memory)?;
        }
        for p in &data.floats {
            self.means[env.time_range.point_index(p.t)].push(p.f);
        }
        self.histograms.add(data, env, ctx)
    }

    fn finish(&mut self, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<InstantVectorSeriesData> {
        let mut out = InstantVectorSeriesData::default();
        for (i, t) in env.time_range.step_times().enumerate() {
            let has_float = self.means.get(i).is_some_and(|m| m.count() > 0.0);
            let pushed = match (has_float, self.histograms.present(i)) {
                (true, true) => {
                    mixed_step(env, ctx);
                    Ok(())
                }
                (true, false) => push_tracked(&mut out.floats, FPoint::new(t, self.means[i].value()), &mut ctx.memory),
                (false, true) => match self.histograms.take(i, true) {
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
        put_vec(std::mem::take(&mut self.means), &mut ctx.memory);
        self.histograms.release(ctx);
    }
}
