//! Aggregations over the series of an instant vector.
//!
//! Input series are grouped by `by`/`without` labels. A group is emitted as
//! soon as its last input series has been accumulated, so output groups are
//! ordered by the position of their last member.

use std::collections::HashMap;

use async_trait::async_trait;
use promql_parser::parser::LabelModifier;

use crate::context::QueryContext;
use crate::error::{EvalResult, EvaluationError};
use crate::model::Labels;
use crate::operators::{InstantVectorOperator, ScalarOperator};
use crate::time_range::QueryTimeRange;
use crate::types::{
    InstantVectorSeriesData, ScalarData, SeriesMetadata, append_series_metadata, get_vec, put_series_metadata_vec,
};

pub(crate) mod avg;
pub(crate) mod count;
pub(crate) mod limit;
pub(crate) mod min_max;
pub(crate) mod quantile;
pub(crate) mod stddev;
pub(crate) mod sum;
pub(crate) mod topk_bottomk;

/// How input series are assigned to output groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Grouping {
    By(Vec<String>),
    Without(Vec<String>),
    All,
}

impl Grouping {
    pub(crate) fn from_modifier(modifier: Option<&LabelModifier>) -> Self {
        match modifier {
            Some(LabelModifier::Include(list)) => Grouping::By(list.labels.clone()),
            Some(LabelModifier::Exclude(list)) => Grouping::Without(list.labels.clone()),
            None => Grouping::All,
        }
    }

    pub(crate) fn group_labels(&self, labels: &Labels) -> Labels {
        match self {
            Grouping::By(names) => labels.keep_only(names),
            Grouping::Without(names) => labels.without(names).without_metric_name(),
            Grouping::All => Labels::empty(),
        }
    }

    /// Group index of every series, numbering groups by first occurrence.
    pub(crate) fn assign(&self, metadata: &[SeriesMetadata]) -> (Vec<usize>, Vec<Labels>) {
        let mut by_labels: HashMap<Labels, usize> = HashMap::new();
        let mut labels = Vec::new();
        let groups = metadata
            .iter()
            .map(|m| {
                let key = self.group_labels(&m.labels);
                *by_labels.entry(key).or_insert_with_key(|key| {
                    labels.push(key.clone());
                    labels.len() - 1
                })
            })
            .collect();
        (groups, labels)
    }
}

/// What a group accumulator can see besides the series it is given.
pub(crate) struct GroupEnv<'a> {
    pub(crate) time_range: &'a QueryTimeRange,
    /// Per-step parameter, for `quantile`.
    pub(crate) param: Option<&'a ScalarData>,
    pub(crate) position: &'a str,
}

/// Accumulates the series of one output group, step by step.
pub(crate) trait AggregationGroup: Send {
    fn accumulate(
        &mut self,
        data: &InstantVectorSeriesData,
        env: &GroupEnv<'_>,
        ctx: &mut QueryContext,
    ) -> EvalResult<()>;

    /// Produces the output series and releases the accumulator's buffers.
    fn finish(&mut self, env: &GroupEnv<'_>, ctx: &mut QueryContext) -> EvalResult<InstantVectorSeriesData>;

    /// Returns every buffer still held. Safe to call more than once.
    fn release(&mut self, ctx: &mut QueryContext);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AggregationOp {
    Sum,
    Avg,
    Count,
    Group,
    Min,
    Max,
    Stddev,
    Stdvar,
    Quantile,
}

impl AggregationOp {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        let op = match name {
            "sum" => AggregationOp::Sum,
            "avg" => AggregationOp::Avg,
            "count" => AggregationOp::Count,
            "group" => AggregationOp::Group,
            "min" => AggregationOp::Min,
            "max" => AggregationOp::Max,
            "stddev" => AggregationOp::Stddev,
            "stdvar" => AggregationOp::Stdvar,
            "quantile" => AggregationOp::Quantile,
            _ => return None,
        };
        Some(op)
    }

    fn new_group(self) -> Box<dyn AggregationGroup> {
        match self {
            AggregationOp::Sum => Box::new(sum::SumGroup::default()),
            AggregationOp::Avg => Box::new(avg::AvgGroup::default()),
            AggregationOp::Count => Box::new(count::CountGroup::new(false)),
            AggregationOp::Group => Box::new(count::CountGroup::new(true)),
            AggregationOp::Min => Box::new(min_max::MinMaxGroup::new(false)),
            AggregationOp::Max => Box::new(min_max::MinMaxGroup::new(true)),
            AggregationOp::Stddev => Box::new(stddev::StddevGroup::new(true)),
            AggregationOp::Stdvar => Box::new(stddev::StddevGroup::new(false)),
            AggregationOp::Quantile => Box::new(quantile::QuantileGroup::default()),
        }
    }
}

pub(crate) struct Aggregation {
    inner: Box<dyn InstantVectorOperator>,
    op: AggregationOp,
    grouping: Grouping,
    param: Option<Box<dyn ScalarOperator>>,
    param_values: Option<ScalarData>,
    time_range: QueryTimeRange,
    position: String,
    series_groups: Vec<usize>,
    group_last_series: Vec<usize>,
    output_order: Vec<usize>,
    states: Vec<Option<Box<dyn AggregationGroup>>>,
    next_input: usize,
    next_output: usize,
}

impl Aggregation {
    pub(crate) fn new(
        inner: Box<dyn InstantVectorOperator>,
        op: AggregationOp,
        grouping: Grouping,
        param: Option<Box<dyn ScalarOperator>>,
        time_range: QueryTimeRange,
        position: String,
    ) -> Self {
        Self {
            inner,
            op,
            grouping,
            param,
            param_values: None,
            time_range,
            position,
            series_groups: Vec::new(),
            group_last_series: Vec::new(),
            output_order: Vec::new(),
            states: Vec::new(),
            next_input: 0,
            next_output: 0,
        }
    }
}

#[async_trait]
impl InstantVectorOperator for Aggregation {
    #[tracing::instrument(level = "trace", skip_all, fields(op = ?self.op))]
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        if let Some(param) = &mut self.param {
            self.param_values = Some(param.values(ctx).await?);
        }
        let input = self.inner.series_metadata(ctx).await?;
        let (series_groups, group_labels) = self.grouping.assign(&input);
        let mut last = vec![0; group_labels.len()];
        for (i, &g) in series_groups.iter().enumerate() {
            last[g] = i;
        }
        let mut order: Vec<usize> = (0..group_labels.len()).collect();
        order.sort_by_key(|&g| last[g]);
        put_series_metadata_vec(input, &mut ctx.memory);

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
        tracing::trace!(series = series_groups.len(), groups = order.len(), "grouped series");
        self.states = (0..order.len()).map(|_| None).collect();
        self.series_groups = series_groups;
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
        let env = GroupEnv {
            time_range: &self.time_range,
            param: self.param_values.as_ref(),
            position: &self.position,
        };
        while self.next_input <= self.group_last_series[g] {
            let Some(data) = self.inner.next_series(ctx).await? else {
                return Err(EvaluationError::Internal(format!(
                    "aggregation input ended after {} series",
                    self.next_input
                )));
            };
            let op = self.op;
            let state = self.states[self.series_groups[self.next_input]].get_or_insert_with(|| op.new_group());
            self.next_input += 1;
            let accumulated = state.accumulate(&data, &env, ctx);
            data.release(&mut ctx.memory);
            accumulated?;
        }
        let Some(mut state) = self.states[g].take() else {
            return Err(EvaluationError::Internal("aggregation group has no series".to_string()));
        };
        let result = state.finish(&env, ctx);
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
        if let Some(param) = &mut self.param {
            param.close(ctx);
        }
        self.inner.close(ctx);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::operators::testing::{FixedSeries, collect_floats, points};
    use rstest::rstest;

    pub(crate) fn input() -> Box<dyn InstantVectorOperator> {
        FixedSeries::boxed(vec![
            (
                Labels::from_pairs(&[("__name__", "http"), ("job", "api"), ("code", "200")]),
                points(&[(0, 1.0), (1000, 2.0)]),
            ),
            (
                Labels::from_pairs(&[("__name__", "http"), ("job", "db"), ("code", "200")]),
                points(&[(0, 10.0)]),
            ),
            (
                Labels::from_pairs(&[("__name__", "http"), ("job", "api"), ("code", "500")]),
                points(&[(0, 3.0), (1000, 4.0)]),
            ),
        ])
    }

    pub(crate) fn range() -> QueryTimeRange {
        QueryTimeRange::new_range(0, 1000, 1000).unwrap()
    }

    #[rstest]
    #[case::sum_by_job(
        AggregationOp::Sum,
        Grouping::By(vec!["job".to_string()]),
        vec![
            (vec![("job", "db")], vec![(0, 10.0)]),
            (vec![("job", "api")], vec![(0, 4.0), (1000, 6.0)]),
        ]
    )]
    #[case::max_without_code(
        AggregationOp::Max,
        Grouping::Without(vec!["code".to_string()]),
        vec![
            (vec![("job", "db")], vec![(0, 10.0)]),
            (vec![("job", "api")], vec![(0, 3.0), (1000, 4.0)]),
        ]
    )]
    #[case::count_all(AggregationOp::Count, Grouping::All, vec![(vec![], vec![(0, 3.0), (1000, 2.0)])])]
    #[case::avg_all(AggregationOp::Avg, Grouping::All, vec![(vec![], vec![(0, 14.0 / 3.0), (1000, 3.0)])])]
    #[case::group_by_code(
        AggregationOp::Group,
        Grouping::By(vec!["code".to_string()]),
        vec![
            (vec![("code", "200")], vec![(0, 1.0), (1000, 1.0)]),
            (vec![("code", "500")], vec![(0, 1.0), (1000, 1.0)]),
        ]
    )]
    #[case::stdvar_all(AggregationOp::Stdvar, Grouping::All, vec![(vec![], vec![(0, 134.0 / 9.0), (1000, 1.0)])])]
    #[tokio::test]
    async fn should_aggregate_groups(
        #[case] op: AggregationOp,
        #[case] grouping: Grouping,
        #[case] expected: Vec<(Vec<(&str, &str)>, Vec<(i64, f64)>)>,
    ) {
        // given
        let mut ctx = QueryContext::for_tests();
        let mut aggregation = Aggregation::new(input(), op, grouping, None, range(), String::new());

        // when
        let result = collect_floats(&mut aggregation, &mut ctx).await;

        // then
        let expected: Vec<(Labels, Vec<(i64, f64)>)> = expected
            .into_iter()
            .map(|(l, p)| (Labels::from_pairs(&l), p))
            .collect();
        assert_eq!(result.len(), expected.len());
        for ((labels, points), (expected_labels, expected_points)) in result.iter().zip(&expected) {
            assert_eq!(labels, expected_labels);
            assert_eq!(points.len(), expected_points.len());
            for ((t, v), (et, ev)) in points.iter().zip(expected_points) {
                assert_eq!(t, et);
                assert!((v - ev).abs() < 1e-9, "{} != {}", v, ev);
            }
        }
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[tokio::test]
    async fn should_emit_group_once_its_last_series_is_read() {
        // given: api's last series is the third input, db's the second
        let mut ctx = QueryContext::for_tests();
        let mut aggregation = Aggregation::new(
            input(),
            AggregationOp::Sum,
            Grouping::By(vec!["job".to_string()]),
            None,
            range(),
            String::new(),
        );
        let metadata = aggregation.series_metadata(&mut ctx).await.unwrap();

        // when
        let first = aggregation.next_series(&mut ctx).await.unwrap().unwrap();

        // then: db was emitted after reading two input series only
        assert_eq!(metadata[0].labels, Labels::from_pairs(&[("job", "db")]));
        assert_eq!(aggregation.next_input, 2);
        first.release(&mut ctx.memory);
        put_series_metadata_vec(metadata, &mut ctx.memory);
        aggregation.close(&mut ctx);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }
}
