//! `topk` and `bottomk`.
//!
//! Selection happens per step and per group, so every input series must be
//! read before the first output series is known. Selected series keep their
//! labels; steps where a series was not selected are dropped.

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::annotations::histogram_ignored_in_aggregation_info;
use crate::context::QueryContext;
use crate::error::{EvalResult, EvaluationError};
use crate::model::FPoint;
use crate::operators::aggregations::Grouping;
use crate::operators::{InstantVectorOperator, ScalarOperator, materialize};
use crate::time_range::QueryTimeRange;
use crate::types::{
    InstantVectorSeriesData, ScalarData, SeriesMetadata, append_series_metadata, get_filled_vec, get_vec,
    push_tracked, put_series_metadata_vec, put_vec,
};

/// Converts a `k` parameter to a count the way integer conversion of a
/// scalar argument does, rejecting values that do not fit.
pub(crate) fn k_from_param(k: f64) -> EvalResult<i64> {
    if k.is_nan() || k >= i64::MAX as f64 || k <= i64::MIN as f64 {
        return Err(EvaluationError::FunctionEvaluation(format!(
            "scalar value {} overflows int64",
            k
        )));
    }
    Ok(k as i64)
}

pub(crate) struct TopKBottomK {
    inner: Box<dyn InstantVectorOperator>,
    param: Box<dyn ScalarOperator>,
    grouping: Grouping,
    is_top: bool,
    time_range: QueryTimeRange,
    position: String,
    /// Selected output, in input order.
    output: Vec<InstantVectorSeriesData>,
    next: usize,
}

impl TopKBottomK {
    pub(crate) fn new(
        inner: Box<dyn InstantVectorOperator>,
        param: Box<dyn ScalarOperator>,
        grouping: Grouping,
        is_top: bool,
        time_range: QueryTimeRange,
        position: String,
    ) -> Self {
        Self {
            inner,
            param,
            grouping,
            is_top,
            time_range,
            position,
            output: Vec::new(),
            next: 0,
        }
    }

    /// Orders candidates so that the wanted ones come first. NaN is always
    /// the least wanted.
    fn rank(&self, a: f64, b: f64) -> Ordering {
        match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if self.is_top => b.total_cmp(&a),
            (false, false) => a.total_cmp(&b),
        }
    }

    /// For every step, marks which series are selected.
    fn select(
        &self,
        metadata: &[SeriesMetadata],
        data: &[InstantVectorSeriesData],
        k: &ScalarData,
        ctx: &mut QueryContext,
    ) -> EvalResult<Vec<bool>> {
        let steps = self.time_range.step_count;
        let mut selected: Vec<bool> = get_filled_vec(steps * data.len(), false, &mut ctx.memory)?;
        let (groups, group_labels) = self.grouping.assign(metadata);
        let mut candidates: Vec<Vec<(f64, usize)>> = vec![Vec::new(); group_labels.len()];
        for step in 0..steps {
            let limit = match k_from_param(k.value_at(step)) {
                Ok(limit) => limit,
                Err(e) => {
                    put_vec(selected, &mut ctx.memory);
                    return Err(e);
                }
            };
            if limit < 1 {
                continue;
            }
            let t = self.time_range.step_time(step);
            for c in candidates.iter_mut() {
                c.clear();
            }
            for (series, points) in data.iter().enumerate() {
                if let Ok(i) = points.floats.binary_search_by_key(&t, |p| p.t) {
                    candidates[groups[series]].push((points.floats[i].f, series));
                }
            }
            for group in candidates.iter_mut() {
                group.sort_by(|a, b| self.rank(a.0, b.0).then(a.1.cmp(&b.1)));
                for &(_, series) in group.iter().take(limit as usize) {
                    selected[series * steps + step] = true;
                }
            }
        }
        Ok(selected)
    }
}

#[async_trait]
impl InstantVectorOperator for TopKBottomK {
    #[tracing::instrument(level = "trace", skip_all, fields(top = self.is_top))]
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        let k = self.param.values(ctx).await?;
        let (metadata, data) = match materialize(self.inner.as_mut(), ctx).await {
            Ok(input) => input,
            Err(e) => {
                k.release(&mut ctx.memory);
                return Err(e);
            }
        };
        if data.iter().any(|d| !d.histograms.is_empty()) {
            let name = if self.is_top { "topk" } else { "bottomk" };
            ctx.annotations
                .add_if_absent(histogram_ignored_in_aggregation_info(name, &self.position));
        }
        let selected = self.select(&metadata, &data, &k, ctx);
        k.release(&mut ctx.memory);
        let selected = match selected {
            Ok(s) => s,
            Err(e) => {
                data.into_iter().for_each(|d| d.release(&mut ctx.memory));
                put_series_metadata_vec(metadata, &mut ctx.memory);
                return Err(e);
            }
        };

        let steps = self.time_range.step_count;
        let result = (|| -> EvalResult<Vec<SeriesMetadata>> {
            let mut out_metadata = get_vec(0, &mut ctx.memory)?;
            for (series, (m, d)) in metadata.iter().zip(&data).enumerate() {
                let mut kept = InstantVectorSeriesData::default();
                for p in &d.floats {
                    if selected[series * steps + self.time_range.point_index(p.t)]
                        && let Err(e) = push_tracked(&mut kept.floats, FPoint::new(p.t, p.f), &mut ctx.memory)
                    {
                        kept.release(&mut ctx.memory);
                        put_series_metadata_vec(out_metadata, &mut ctx.memory);
                        return Err(e);
                    }
                }
                if kept.is_empty() {
                    continue;
                }
                self.output.push(kept);
                if let Err(e) = append_series_metadata(&mut out_metadata, m.clone(), &mut ctx.memory) {
                    put_series_metadata_vec(out_metadata, &mut ctx.memory);
                    return Err(e);
                }
            }
            Ok(out_metadata)
        })();
        put_vec(selected, &mut ctx.memory);
        data.into_iter().for_each(|d| d.release(&mut ctx.memory));
        put_series_metadata_vec(metadata, &mut ctx.memory);
        if self.time_range.is_instant {
            return result.map(|m| self.order_instant_output(m));
        }
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

impl TopKBottomK {
    /// For an instant query the selected series are reported best first.
    fn order_instant_output(&mut self, mut metadata: Vec<SeriesMetadata>) -> Vec<SeriesMetadata> {
        let mut paired: Vec<(SeriesMetadata, InstantVectorSeriesData)> =
            metadata.drain(..).zip(self.output.drain(..)).collect();
        let value = |d: &InstantVectorSeriesData| d.floats.first().map(|p| p.f).unwrap_or(f64::NAN);
        paired.sort_by(|a, b| self.rank(value(&a.1), value(&b.1)));
        // refilled in place so the tracked capacity does not change
        for (m, d) in paired {
            metadata.push(m);
            self.output.push(d);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Labels;
    use crate::operators::aggregations::tests::{input, range};
    use crate::operators::scalars::ConstantScalar;
    use crate::operators::testing::{FixedSeries, collect_floats, points};
    use rstest::rstest;

    fn labels(job: &str, code: &str) -> Labels {
        Labels::from_pairs(&[("__name__", "http"), ("job", job), ("code", code)])
    }

    #[rstest]
    #[case::top_one_overall(
        true,
        Grouping::All,
        1.0,
        vec![(labels("db", "200"), vec![(0, 10.0)]), (labels("api", "500"), vec![(1000, 4.0)])]
    )]
    #[case::bottom_one_by_job(
        false,
        Grouping::By(vec!["job".to_string()]),
        1.0,
        vec![
            (labels("api", "200"), vec![(0, 1.0), (1000, 2.0)]),
            (labels("db", "200"), vec![(0, 10.0)]),
        ]
    )]
    #[case::zero_selects_nothing(true, Grouping::All, 0.0, vec![])]
    #[tokio::test]
    async fn should_select_per_step_and_group(
        #[case] is_top: bool,
        #[case] grouping: Grouping,
        #[case] k: f64,
        #[case] expected: Vec<(Labels, Vec<(i64, f64)>)>,
    ) {
        // given
        let mut ctx = QueryContext::for_tests();
        let mut op = TopKBottomK::new(
            input(),
            Box::new(ConstantScalar::new(k, range())),
            grouping,
            is_top,
            range(),
            String::new(),
        );

        // when
        let result = collect_floats(&mut op, &mut ctx).await;

        // then
        assert_eq!(result, expected);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[tokio::test]
    async fn should_fail_on_nan_k() {
        // given
        let mut ctx = QueryContext::for_tests();
        let mut op = TopKBottomK::new(
            input(),
            Box::new(ConstantScalar::new(f64::NAN, range())),
            Grouping::All,
            true,
            range(),
            String::new(),
        );

        // when
        let result = op.series_metadata(&mut ctx).await;

        // then
        assert!(matches!(result, Err(EvaluationError::FunctionEvaluation(_))));
        op.close(&mut ctx);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[tokio::test]
    async fn should_order_instant_results_best_first() {
        // given
        let mut ctx = QueryContext::for_tests();
        let time_range = QueryTimeRange::new_instant(0);
        let input = FixedSeries::boxed(vec![
            (labels("api", "200"), points(&[(0, 1.0)])),
            (labels("db", "200"), points(&[(0, 10.0)])),
            (labels("api", "500"), points(&[(0, 3.0)])),
        ]);
        let mut op = TopKBottomK::new(
            input,
            Box::new(ConstantScalar::new(2.0, time_range)),
            Grouping::All,
            true,
            time_range,
            String::new(),
        );

        // when
        let result = collect_floats(&mut op, &mut ctx).await;

        // then
        assert_eq!(
            result,
            vec![
                (labels("db", "200"), vec![(0, 10.0)]),
                (labels("api", "500"), vec![(0, 3.0)]),
            ]
        );
    }
}
