//! `and`, `or` and `unless`.
//!
//! Set operations never combine values: they decide, per step, which points
//! of which side survive. Presence of the deciding side is recorded per match
//! key as one flag per step.

use std::collections::HashMap;

use async_trait::async_trait;
use promql_parser::parser::LabelModifier;

use crate::context::QueryContext;
use crate::error::{EvalResult, EvaluationError};
use crate::model::Labels;
use crate::operators::InstantVectorOperator;
use crate::operators::binary::{BinaryOp, match_key};
use crate::time_range::QueryTimeRange;
use crate::types::{
    InstantVectorSeriesData, SeriesMetadata, append_series_metadata, get_filled_vec, get_vec,
    put_series_metadata_vec, put_vec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Left,
    Right,
    Done,
}

pub(crate) struct SetOperation {
    left: Box<dyn InstantVectorOperator>,
    right: Box<dyn InstantVectorOperator>,
    op: BinaryOp,
    matching: Option<LabelModifier>,
    time_range: QueryTimeRange,
    left_groups: Vec<Option<usize>>,
    right_groups: Vec<Option<usize>>,
    /// Steps at which the deciding side of each group has a point.
    presence: Vec<Option<Vec<bool>>>,
    /// Groups whose presence must be recorded.
    tracked_groups: Vec<bool>,
    next_left: usize,
    next_right: usize,
    phase: Phase,
    presence_loaded: bool,
}

impl SetOperation {
    pub(crate) fn new(
        left: Box<dyn InstantVectorOperator>,
        right: Box<dyn InstantVectorOperator>,
        op: BinaryOp,
        matching: Option<LabelModifier>,
        time_range: QueryTimeRange,
    ) -> EvalResult<Self> {
        if !op.is_set_operator() {
            return Err(EvaluationError::Internal(format!(
                "{} is not a set operator",
                op.symbol()
            )));
        }
        Ok(Self {
            left,
            right,
            op,
            matching,
            time_range,
            left_groups: Vec::new(),
            right_groups: Vec::new(),
            presence: Vec::new(),
            tracked_groups: Vec::new(),
            next_left: 0,
            next_right: 0,
            phase: Phase::Left,
            presence_loaded: false,
        })
    }

    /// Assigns a group to every series of `deciding` by key, then looks up
    /// the group of every series of `other`.
    fn group(
        &self,
        deciding: &[SeriesMetadata],
        other: &[SeriesMetadata],
    ) -> (Vec<Option<usize>>, Vec<Option<usize>>, usize) {
        let mut by_key: HashMap<Labels, usize> = HashMap::new();
        let deciding_groups = deciding
            .iter()
            .map(|m| {
                let next = by_key.len();
                Some(*by_key.entry(match_key(&m.labels, self.matching.as_ref())).or_insert(next))
            })
            .collect();
        let other_groups = other
            .iter()
            .map(|m| by_key.get(&match_key(&m.labels, self.matching.as_ref())).copied())
            .collect();
        (deciding_groups, other_groups, by_key.len())
    }

    fn mark_present(&mut self, group: usize, data: &InstantVectorSeriesData, ctx: &mut QueryContext) -> EvalResult<()> {
        if !self.tracked_groups[group] {
            return Ok(());
        }
        if self.presence[group].is_none() {
            self.presence[group] = Some(get_filled_vec(self.time_range.step_count, false, &mut ctx.memory)?);
        }
        if let Some(present) = &mut self.presence[group] {
            for t in data.floats.iter().map(|p| p.t).chain(data.histograms.iter().map(|p| p.t)) {
                present[self.time_range.point_index(t)] = true;
            }
        }
        Ok(())
    }

    /// Keeps the points of `data` whose step presence equals `keep_if_present`.
    fn filter(&self, group: Option<usize>, keep_if_present: bool, data: &mut InstantVectorSeriesData) {
        let present = group.and_then(|g| self.presence[g].as_deref());
        let keep = |t: i64| {
            let is_present = present.is_some_and(|p| p[self.time_range.point_index(t)]);
            is_present == keep_if_present
        };
        data.floats.retain(|p| keep(p.t));
        data.histograms.retain(|p| keep(p.t));
    }

    /// Reads the whole right side for `and` and `unless`.
    async fn load_right_presence(&mut self, ctx: &mut QueryContext) -> EvalResult<()> {
        self.presence_loaded = true;
        for i in 0..self.right_groups.len() {
            let Some(data) = self.right.next_series(ctx).await? else {
                break;
            };
            let marked = match self.right_groups[i] {
                Some(g) => self.mark_present(g, &data, ctx),
                None => Ok(()),
            };
            data.release(&mut ctx.memory);
            marked?;
        }
        Ok(())
    }

    async fn next_filtered_left(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        if !self.presence_loaded {
            self.load_right_presence(ctx).await?;
        }
        while self.next_left < self.left_groups.len() {
            let group = self.left_groups[self.next_left];
            self.next_left += 1;
            let Some(mut data) = self.left.next_series(ctx).await? else {
                break;
            };
            match (self.op, group) {
                (BinaryOp::And, None) => data.release(&mut ctx.memory),
                (BinaryOp::And, Some(_)) => {
                    self.filter(group, true, &mut data);
                    return Ok(Some(data));
                }
                _ => {
                    self.filter(group, false, &mut data);
                    return Ok(Some(data));
                }
            }
        }
        Ok(None)
    }

    async fn next_or(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        if self.phase == Phase::Left {
            if self.next_left < self.left_groups.len()
                && let Some(data) = self.left.next_series(ctx).await?
            {
                let group = self.left_groups[self.next_left];
                self.next_left += 1;
                if let Some(g) = group
                    && let Err(e) = self.mark_present(g, &data, ctx)
                {
                    data.release(&mut ctx.memory);
                    return Err(e);
                }
                return Ok(Some(data));
            }
            self.phase = Phase::Right;
        }
        if self.phase == Phase::Right {
            if self.next_right < self.right_groups.len()
                && let Some(mut data) = self.right.next_series(ctx).await?
            {
                let group = self.right_groups[self.next_right];
                self.next_right += 1;
                self.filter(group, false, &mut data);
                return Ok(Some(data));
            }
            self.phase = Phase::Done;
        }
        Ok(None)
    }
}

#[async_trait]
impl InstantVectorOperator for SetOperation {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        let left = self.left.series_metadata(ctx).await?;
        let right = match self.right.series_metadata(ctx).await {
            Ok(m) => m,
            Err(e) => {
                put_series_metadata_vec(left, &mut ctx.memory);
                return Err(e);
            }
        };
        let group_count = if self.op == BinaryOp::Or {
            let (left_groups, right_groups, count) = self.group(&left, &right);
            self.left_groups = left_groups;
            self.right_groups = right_groups;
            count
        } else {
            let (right_groups, left_groups, count) = self.group(&right, &left);
            self.left_groups = left_groups;
            self.right_groups = right_groups;
            count
        };
        self.presence = (0..group_count).map(|_| None).collect();
        self.tracked_groups = vec![false; group_count];
        let deciding = if self.op == BinaryOp::Or {
            &self.right_groups
        } else {
            &self.left_groups
        };
        for g in deciding.iter().flatten() {
            self.tracked_groups[*g] = true;
        }

        let output_len = match self.op {
            BinaryOp::Or => left.len() + right.len(),
            _ => left.len(),
        };
        let mut output = match get_vec(output_len, &mut ctx.memory) {
            Ok(v) => v,
            Err(e) => {
                put_series_metadata_vec(left, &mut ctx.memory);
                put_series_metadata_vec(right, &mut ctx.memory);
                return Err(e);
            }
        };
        let kept_right: &[SeriesMetadata] = if self.op == BinaryOp::Or { &right } else { &[] };
        let kept = left
            .iter()
            .zip(&self.left_groups)
            .filter(|(_, g)| self.op != BinaryOp::And || g.is_some())
            .map(|(m, _)| m)
            .chain(kept_right.iter());
        let mut appended = Ok(());
        for m in kept {
            appended = append_series_metadata(&mut output, m.clone(), &mut ctx.memory);
            if appended.is_err() {
                break;
            }
        }
        put_series_metadata_vec(left, &mut ctx.memory);
        put_series_metadata_vec(right, &mut ctx.memory);
        if let Err(e) = appended {
            put_series_metadata_vec(output, &mut ctx.memory);
            return Err(e);
        }
        Ok(output)
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        ctx.check_cancelled()?;
        match self.op {
            BinaryOp::Or => self.next_or(ctx).await,
            _ => self.next_filtered_left(ctx).await,
        }
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        for present in self.presence.iter_mut().filter_map(Option::take) {
            put_vec(present, &mut ctx.memory);
        }
        self.left.close(ctx);
        self.right.close(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::testing::{FixedSeries, collect_floats, points};
    use rstest::rstest;

    fn operands() -> (Box<dyn InstantVectorOperator>, Box<dyn InstantVectorOperator>) {
        let left = FixedSeries::boxed(vec![
            (Labels::from_pairs(&[("__name__", "a"), ("job", "x")]), points(&[(0, 1.0), (1000, 2.0)])),
            (Labels::from_pairs(&[("__name__", "a"), ("job", "y")]), points(&[(0, 3.0)])),
        ]);
        let right = FixedSeries::boxed(vec![
            (Labels::from_pairs(&[("__name__", "b"), ("job", "x")]), points(&[(1000, 9.0)])),
            (Labels::from_pairs(&[("__name__", "b"), ("job", "z")]), points(&[(0, 7.0), (1000, 8.0)])),
        ]);
        (left, right)
    }

    #[rstest]
    #[case::and(BinaryOp::And, vec![(("a", "x"), vec![(1000, 2.0)])])]
    #[case::unless(BinaryOp::Unless, vec![(("a", "x"), vec![(0, 1.0)]), (("a", "y"), vec![(0, 3.0)])])]
    #[case::or(
        BinaryOp::Or,
        vec![
            (("a", "x"), vec![(0, 1.0), (1000, 2.0)]),
            (("a", "y"), vec![(0, 3.0)]),
            (("b", "x"), vec![]),
            (("b", "z"), vec![(0, 7.0), (1000, 8.0)]),
        ]
    )]
    #[tokio::test]
    async fn should_select_points_by_presence(
        #[case] op: BinaryOp,
        #[case] expected: Vec<((&str, &str), Vec<(i64, f64)>)>,
    ) {
        // given
        let mut ctx = QueryContext::for_tests();
        let (left, right) = operands();
        let time_range = QueryTimeRange::new_range(0, 1000, 1000).unwrap();
        let mut set = SetOperation::new(left, right, op, None, time_range).unwrap();

        // when
        let result = collect_floats(&mut set, &mut ctx).await;

        // then
        let expected: Vec<(Labels, Vec<(i64, f64)>)> = expected
            .into_iter()
            .map(|((name, job), p)| (Labels::from_pairs(&[("__name__", name), ("job", job)]), p))
            .collect();
        assert_eq!(result, expected);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }
}
