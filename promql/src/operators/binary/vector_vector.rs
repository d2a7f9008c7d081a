//! Arithmetic and comparison between two instant vectors.
//!
//! Series are paired by their match key. The "one" side (the right operand,
//! or the left one for `group_right`) may pair with several series of the
//! "many" side; its series sharing a key are merged into one, failing the
//! query if two of them have a point at the same step.

use std::collections::HashMap;

use async_trait::async_trait;
use promql_parser::parser::LabelModifier;

use crate::context::QueryContext;
use crate::error::{EvalResult, EvaluationError};
use crate::model::Labels;
use crate::operators::InstantVectorOperator;
use crate::operators::binary::{BinaryOp, StepPoints, evaluate_pair, match_key, push_step_value};
use crate::operators::deduplicate_and_merge::merge_series;
use crate::operators::series_buffer::SeriesBuffer;
use crate::types::{
    InstantVectorSeriesData, SeriesMetadata, append_series_metadata, get_vec, put_series_metadata_vec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cardinality {
    OneToOne,
    ManyToOne,
    OneToMany,
}

/// How series of the two operands are paired up.
#[derive(Debug, Clone)]
pub(crate) struct VectorMatching {
    pub(crate) card: Cardinality,
    pub(crate) matching: Option<LabelModifier>,
    /// Labels copied from the "one" side by `group_left`/`group_right`.
    pub(crate) include: Vec<String>,
}

impl VectorMatching {
    pub(crate) fn one_to_one(matching: Option<LabelModifier>) -> Self {
        Self {
            card: Cardinality::OneToOne,
            matching,
            include: Vec::new(),
        }
    }

    /// Error raised when two output series end up with the same labels and
    /// a point at the same step.
    pub(crate) fn conflict_message(&self) -> &'static str {
        match self.card {
            Cardinality::OneToOne => {
                "multiple matches for labels: many-to-one matching must be explicit (group_left/group_right)"
            }
            Cardinality::ManyToOne | Cardinality::OneToMany => {
                "multiple matches for labels: grouping labels must ensure unique matches"
            }
        }
    }

    fn one_side(&self) -> &'static str {
        match self.card {
            Cardinality::OneToMany => "left",
            _ => "right",
        }
    }

    /// Labels of an output series, derived from the "many" side.
    fn result_labels(&self, op: BinaryOp, return_bool: bool, many: &Labels, one: &Labels) -> Labels {
        let mut labels = if op.drops_metric_name() || return_bool {
            many.without_metric_name()
        } else {
            many.clone()
        };
        if self.card == Cardinality::OneToOne {
            labels = match &self.matching {
                Some(LabelModifier::Include(list)) => labels.keep_only(&list.labels),
                Some(LabelModifier::Exclude(list)) => labels.without(&list.labels),
                None => labels,
            };
        }
        for name in &self.include {
            labels = match one.get(name) {
                Some(value) => labels.with(name, value),
                None => labels.without(&[name]),
            };
        }
        labels
    }
}

/// Series of the "one" side sharing a match key.
struct MatchGroup {
    key: Labels,
    members: Vec<usize>,
    member_labels: Vec<Labels>,
    remaining_uses: usize,
    data: Option<InstantVectorSeriesData>,
}

struct OutputSeries {
    many_index: usize,
    group: usize,
}

enum State {
    Pending {
        left: Box<dyn InstantVectorOperator>,
        right: Box<dyn InstantVectorOperator>,
    },
    Running {
        many: SeriesBuffer,
        one: SeriesBuffer,
    },
    Closed,
}

pub(crate) struct VectorVectorBinary {
    state: State,
    op: BinaryOp,
    return_bool: bool,
    matching: VectorMatching,
    groups: Vec<MatchGroup>,
    outputs: Vec<OutputSeries>,
    next_output: usize,
    position: String,
}

impl VectorVectorBinary {
    pub(crate) fn new(
        left: Box<dyn InstantVectorOperator>,
        right: Box<dyn InstantVectorOperator>,
        op: BinaryOp,
        return_bool: bool,
        matching: VectorMatching,
        position: String,
    ) -> Self {
        Self {
            state: State::Pending { left, right },
            op,
            return_bool,
            matching,
            groups: Vec::new(),
            outputs: Vec::new(),
            next_output: 0,
            position,
        }
    }

    fn plan(
        &mut self,
        many: &[SeriesMetadata],
        one: &[SeriesMetadata],
        ctx: &mut QueryContext,
    ) -> EvalResult<Vec<SeriesMetadata>> {
        let matching = self.matching.matching.as_ref();
        let mut by_key: HashMap<Labels, usize> = HashMap::with_capacity(one.len());
        for (i, m) in one.iter().enumerate() {
            let key = match_key(&m.labels, matching);
            match by_key.get(&key) {
                Some(&g) => {
                    self.groups[g].members.push(i);
                    self.groups[g].member_labels.push(m.labels.clone());
                }
                None => {
                    by_key.insert(key.clone(), self.groups.len());
                    self.groups.push(MatchGroup {
                        key,
                        members: vec![i],
                        member_labels: vec![m.labels.clone()],
                        remaining_uses: 0,
                        data: None,
                    });
                }
            }
        }

        let mut output = get_vec(many.len(), &mut ctx.memory)?;
        for (i, m) in many.iter().enumerate() {
            let Some(&g) = by_key.get(&match_key(&m.labels, matching)) else {
                continue;
            };
            let labels =
                self.matching
                    .result_labels(self.op, self.return_bool, &m.labels, &self.groups[g].member_labels[0]);
            if let Err(e) = append_series_metadata(&mut output, SeriesMetadata::new(labels), &mut ctx.memory) {
                put_series_metadata_vec(output, &mut ctx.memory);
                return Err(e);
            }
            self.groups[g].remaining_uses += 1;
            self.outputs.push(OutputSeries { many_index: i, group: g });
        }
        tracing::trace!(
            many = many.len(),
            one = one.len(),
            groups = self.groups.len(),
            output = output.len(),
            "planned vector matching"
        );
        Ok(output)
    }
}

async fn load_group(
    group: &MatchGroup,
    buffer: &mut SeriesBuffer,
    side: &str,
    ctx: &mut QueryContext,
) -> EvalResult<InstantVectorSeriesData> {
    if let [only] = group.members.as_slice() {
        return buffer.get(*only, false, ctx).await;
    }
    let mut members = Vec::with_capacity(group.members.len());
    for &i in &group.members {
        match buffer.get(i, false, ctx).await {
            Ok(data) => members.push(data),
            Err(e) => {
                members
                    .into_iter()
                    .for_each(|m: InstantVectorSeriesData| m.release(&mut ctx.memory));
                return Err(e);
            }
        }
    }
    match merge_series(members, ctx)? {
        Some(data) => Ok(data),
        None => {
            let duplicates: Vec<String> = group.member_labels.iter().map(ToString::to_string).collect();
            Err(EvaluationError::FunctionEvaluation(format!(
                "found duplicate series for the match group {} on the {} hand-side of the operation: [{}];many-to-many matching not allowed: matching labels must be unique on one side",
                group.key,
                side,
                duplicates.join(", ")
            )))
        }
    }
}

/// Pairs the points of `many` and `one` at equal timestamps.
fn combine(
    op: BinaryOp,
    return_bool: bool,
    one_is_left: bool,
    many: &InstantVectorSeriesData,
    one: &InstantVectorSeriesData,
    position: &str,
    ctx: &mut QueryContext,
) -> EvalResult<InstantVectorSeriesData> {
    let mut out = InstantVectorSeriesData::default();
    let mut one_points = StepPoints::new(one).peekable();
    for (t, many_value) in StepPoints::new(many) {
        while one_points.next_if(|(ot, _)| *ot < t).is_some() {}
        let Some(&(ot, one_value)) = one_points.peek() else {
            break;
        };
        if ot != t {
            continue;
        }
        let (l, r) = if one_is_left {
            (one_value, many_value)
        } else {
            (many_value, one_value)
        };
        let value = evaluate_pair(op, l, r, return_bool, position, &mut ctx.annotations);
        if let Err(e) = push_step_value(&mut out, t, value, &mut ctx.memory) {
            out.release(&mut ctx.memory);
            return Err(e);
        }
    }
    Ok(out)
}

#[async_trait]
impl InstantVectorOperator for VectorVectorBinary {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        let State::Pending { left, right } = &mut self.state else {
            return Err(EvaluationError::Internal("series metadata requested twice".to_string()));
        };
        let left_metadata = left.series_metadata(ctx).await?;
        let right_metadata = match right.series_metadata(ctx).await {
            Ok(m) => m,
            Err(e) => {
                put_series_metadata_vec(left_metadata, &mut ctx.memory);
                return Err(e);
            }
        };
        let one_is_left = self.matching.card == Cardinality::OneToMany;
        let (many_metadata, one_metadata) = if one_is_left {
            (right_metadata, left_metadata)
        } else {
            (left_metadata, right_metadata)
        };
        let planned = self.plan(&many_metadata, &one_metadata, ctx);

        let mut many_needed = vec![false; many_metadata.len()];
        for output in &self.outputs {
            many_needed[output.many_index] = true;
        }
        let mut one_needed = vec![false; one_metadata.len()];
        for group in self.groups.iter().filter(|g| g.remaining_uses > 0) {
            for &i in &group.members {
                one_needed[i] = true;
            }
        }
        put_series_metadata_vec(many_metadata, &mut ctx.memory);
        put_series_metadata_vec(one_metadata, &mut ctx.memory);
        let output = planned?;

        let State::Pending { left, right } = std::mem::replace(&mut self.state, State::Closed) else {
            return Err(EvaluationError::Internal("operands already taken".to_string()));
        };
        let (many, one) = if one_is_left { (right, left) } else { (left, right) };
        self.state = State::Running {
            many: SeriesBuffer::new(many, many_needed),
            one: SeriesBuffer::new(one, one_needed),
        };
        Ok(output)
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        ctx.check_cancelled()?;
        let State::Running { many, one } = &mut self.state else {
            return Ok(None);
        };
        let Some(output) = self.outputs.get(self.next_output) else {
            return Ok(None);
        };
        let (many_index, g) = (output.many_index, output.group);
        self.next_output += 1;

        let many_data = many.get(many_index, false, ctx).await?;
        if self.groups[g].data.is_none() {
            match load_group(&self.groups[g], one, self.matching.one_side(), ctx).await {
                Ok(data) => self.groups[g].data = Some(data),
                Err(e) => {
                    many_data.release(&mut ctx.memory);
                    return Err(e);
                }
            }
        }
        let one_is_left = self.matching.card == Cardinality::OneToMany;
        let group = &mut self.groups[g];
        let result = match &group.data {
            Some(one_data) => combine(
                self.op,
                self.return_bool,
                one_is_left,
                &many_data,
                one_data,
                &self.position,
                ctx,
            ),
            None => Err(EvaluationError::Internal("match group was not loaded".to_string())),
        };
        many_data.release(&mut ctx.memory);
        group.remaining_uses = group.remaining_uses.saturating_sub(1);
        if group.remaining_uses == 0
            && let Some(data) = group.data.take()
        {
            data.release(&mut ctx.memory);
        }
        result.map(Some)
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        for group in &mut self.groups {
            if let Some(data) = group.data.take() {
                data.release(&mut ctx.memory);
            }
        }
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Pending { mut left, mut right } => {
                left.close(ctx);
                right.close(ctx);
            }
            State::Running { mut many, mut one } => {
                many.close(ctx);
                one.close(ctx);
            }
            State::Closed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::testing::{FixedSeries, collect, collect_floats, points};
    use promql_parser::label::Labels as LabelList;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::from_pairs(pairs)
    }

    #[tokio::test]
    async fn should_match_one_to_one_and_drop_unmatched() {
        // given
        let mut ctx = QueryContext::for_tests();
        let left = FixedSeries::boxed(vec![
            (labels(&[("__name__", "a"), ("job", "x")]), points(&[(0, 10.0), (1000, 20.0)])),
            (labels(&[("__name__", "a"), ("job", "y")]), points(&[(0, 1.0)])),
        ]);
        let right = FixedSeries::boxed(vec![(
            labels(&[("__name__", "b"), ("job", "x")]),
            points(&[(1000, 5.0)]),
        )]);
        let mut op = VectorVectorBinary::new(
            left,
            right,
            BinaryOp::Sub,
            false,
            VectorMatching::one_to_one(None),
            "a - b".to_string(),
        );

        // when
        let result = collect_floats(&mut op, &mut ctx).await;

        // then
        assert_eq!(result, vec![(labels(&[("job", "x")]), vec![(1000, 15.0)])]);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[tokio::test]
    async fn should_copy_included_labels_with_group_left() {
        // given: two request series per instance, one info series
        let mut ctx = QueryContext::for_tests();
        let left = FixedSeries::boxed(vec![
            (labels(&[("__name__", "req"), ("instance", "1"), ("path", "/a")]), points(&[(0, 2.0)])),
            (labels(&[("__name__", "req"), ("instance", "1"), ("path", "/b")]), points(&[(0, 3.0)])),
        ]);
        let right = FixedSeries::boxed(vec![(
            labels(&[("__name__", "info"), ("instance", "1"), ("version", "v2")]),
            points(&[(0, 1.0)]),
        )]);
        let matching = VectorMatching {
            card: Cardinality::ManyToOne,
            matching: Some(LabelModifier::Include(LabelList::new(vec!["instance"]))),
            include: vec!["version".to_string()],
        };
        let mut op = VectorVectorBinary::new(
            left,
            right,
            BinaryOp::Mul,
            false,
            matching,
            "req * on(instance) group_left(version) info".to_string(),
        );

        // when
        let result = collect_floats(&mut op, &mut ctx).await;

        // then
        assert_eq!(
            result,
            vec![
                (labels(&[("instance", "1"), ("path", "/a"), ("version", "v2")]), vec![(0, 2.0)]),
                (labels(&[("instance", "1"), ("path", "/b"), ("version", "v2")]), vec![(0, 3.0)]),
            ]
        );
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[tokio::test]
    async fn should_keep_left_value_and_name_for_comparison() {
        let mut ctx = QueryContext::for_tests();
        let left = FixedSeries::boxed(vec![(
            labels(&[("__name__", "a"), ("job", "x")]),
            points(&[(0, 1.0), (1000, 9.0)]),
        )]);
        let right = FixedSeries::boxed(vec![(
            labels(&[("__name__", "b"), ("job", "x")]),
            points(&[(0, 5.0), (1000, 5.0)]),
        )]);
        let mut op = VectorVectorBinary::new(
            left,
            right,
            BinaryOp::Gt,
            false,
            VectorMatching::one_to_one(None),
            "a > b".to_string(),
        );

        let result = collect_floats(&mut op, &mut ctx).await;

        assert_eq!(
            result,
            vec![(labels(&[("__name__", "a"), ("job", "x")]), vec![(1000, 9.0)])]
        );
    }

    #[tokio::test]
    async fn should_fail_on_duplicate_series_on_one_side() {
        // given: two right-hand series with the same key and the same step
        let mut ctx = QueryContext::for_tests();
        let left = FixedSeries::boxed(vec![(labels(&[("job", "x")]), points(&[(0, 1.0)]))]);
        let right = FixedSeries::boxed(vec![
            (labels(&[("__name__", "b1"), ("job", "x")]), points(&[(0, 1.0)])),
            (labels(&[("__name__", "b2"), ("job", "x")]), points(&[(0, 2.0)])),
        ]);
        let mut op = VectorVectorBinary::new(
            left,
            right,
            BinaryOp::Add,
            false,
            VectorMatching::one_to_one(None),
            "a + b".to_string(),
        );

        // when
        let result = collect(&mut op, &mut ctx).await;

        // then
        let Err(EvaluationError::FunctionEvaluation(message)) = result else {
            panic!("expected a matching error");
        };
        assert!(message.starts_with("found duplicate series for the match group {job=\"x\"} on the right hand-side"));
        assert!(message.ends_with("many-to-many matching not allowed: matching labels must be unique on one side"));
        op.close(&mut ctx);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[tokio::test]
    async fn should_accept_one_side_duplicates_at_disjoint_steps() {
        let mut ctx = QueryContext::for_tests();
        let left = FixedSeries::boxed(vec![(labels(&[("job", "x")]), points(&[(0, 1.0), (1000, 1.0)]))]);
        let right = FixedSeries::boxed(vec![
            (labels(&[("__name__", "b1"), ("job", "x")]), points(&[(0, 10.0)])),
            (labels(&[("__name__", "b2"), ("job", "x")]), points(&[(1000, 20.0)])),
        ]);
        let mut op = VectorVectorBinary::new(
            left,
            right,
            BinaryOp::Add,
            false,
            VectorMatching::one_to_one(None),
            "a + b".to_string(),
        );

        let result = collect_floats(&mut op, &mut ctx).await;

        assert_eq!(result, vec![(labels(&[("job", "x")]), vec![(0, 11.0), (1000, 21.0)])]);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }
}
