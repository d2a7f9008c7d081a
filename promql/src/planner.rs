//! Turns a parsed expression into a tree of streaming operators.
//!
//! Planning is purely structural: no storage is touched and no memory is
//! reserved until the engine starts pulling from the root.

use std::sync::Arc;

use promql_parser::label::{METRIC_NAME, MatchOp, Matcher, Matchers};
use promql_parser::parser::{
    AggregateExpr, AtModifier, BinaryExpr, Call, Expr, MatrixSelector, Offset, SubqueryExpr,
    VectorMatchCardinality, VectorSelector,
};

use crate::config::EngineConfig;
use crate::error::{EvalResult, EvaluationError};
use crate::functions::labels::{DropMetricName, LabelJoin, LabelReplace, SeriesMetadataFunction};
use crate::functions::{
    FunctionDefinition, InstantVectorFunction, RangeVectorFunction, Signature, SpecialFunction, instant, lookup,
};
use crate::model::Labels;
use crate::operators::absent::{Absent, AbsentInput, absent_labels};
use crate::operators::aggregations::limit::{Limit, LimitKind};
use crate::operators::aggregations::topk_bottomk::TopKBottomK;
use crate::operators::aggregations::{Aggregation, AggregationOp, Grouping};
use crate::operators::binary::BinaryOp;
use crate::operators::binary::scalar_scalar::ScalarScalarBinary;
use crate::operators::binary::set_operation::SetOperation;
use crate::operators::binary::vector_scalar::VectorScalarBinary;
use crate::operators::binary::vector_vector::{Cardinality, VectorMatching, VectorVectorBinary};
use crate::operators::deduplicate_and_merge::DeduplicateAndMerge;
use crate::operators::function_over_instant_vector::FunctionOverInstantVector;
use crate::operators::function_over_range_vector::FunctionOverRangeVector;
use crate::operators::histogram_function::HistogramQuantile;
use crate::operators::scalars::{ConstantScalar, ScalarFunction, TimeScalar, UnaryNegationScalar, VectorFunction};
use crate::operators::selectors::{InstantVectorSelector, RangeVectorSelector, Selector};
use crate::operators::sort::Sort;
use crate::operators::subquery::{Subquery, subquery_time_range};
use crate::operators::{InstantVectorOperator, OperatorNode, RangeVectorOperator, ScalarOperator};
use crate::storage::Queryable;
use crate::time_range::{QueryTimeRange, duration_millis, millis_from_system_time};

/// A planned query.
pub(crate) struct Plan {
    pub(crate) root: OperatorNode,
    /// The root emits series in a meaningful order (`sort`, `topk` on an
    /// instant query) that the result must keep.
    pub(crate) preserves_order: bool,
}

pub(crate) struct Planner {
    queryable: Arc<dyn Queryable>,
    lookback_delta_ms: i64,
    default_subquery_step_ms: i64,
    /// What `@ start()` and `@ end()` resolve to, at any nesting depth.
    query_start: i64,
    query_end: i64,
}

fn unwrap_parens(mut expr: &Expr) -> &Expr {
    while let Expr::Paren(p) = expr {
        expr = &p.expr;
    }
    expr
}

fn offset_millis(offset: Option<&Offset>) -> i64 {
    match offset {
        Some(Offset::Pos(d)) => duration_millis(*d),
        Some(Offset::Neg(d)) => -duration_millis(*d),
        None => 0,
    }
}

/// The selector's matchers with its metric name added as a `__name__`
/// matcher, in every alternative when there are several.
fn selector_matchers(vs: &VectorSelector) -> Matchers {
    let mut matchers = vs.matchers.clone();
    if let Some(name) = &vs.name {
        let name_matcher = Matcher::new(MatchOp::Equal, METRIC_NAME, name.as_str());
        if matchers.or_matchers.is_empty() {
            matchers.matchers.push(name_matcher);
        } else {
            for group in &mut matchers.or_matchers {
                group.push(name_matcher.clone());
            }
        }
    }
    matchers
}

fn type_error(expected: &str, context: &str, node: &OperatorNode) -> EvaluationError {
    EvaluationError::InvalidQuery(format!(
        "expected type {} in {}, got {}",
        expected,
        context,
        node.type_name()
    ))
}

fn expect_instant(node: OperatorNode, context: &str) -> EvalResult<Box<dyn InstantVectorOperator>> {
    match node {
        OperatorNode::InstantVector(op) => Ok(op),
        other => Err(type_error("instant vector", context, &other)),
    }
}

fn expect_range(node: OperatorNode, context: &str) -> EvalResult<Box<dyn RangeVectorOperator>> {
    match node {
        OperatorNode::RangeVector(op) => Ok(op),
        other => Err(type_error("range vector", context, &other)),
    }
}

fn expect_scalar(node: OperatorNode, context: &str) -> EvalResult<Box<dyn ScalarOperator>> {
    match node {
        OperatorNode::Scalar(op) => Ok(op),
        other => Err(type_error("scalar", context, &other)),
    }
}

fn expect_string(node: OperatorNode, context: &str) -> EvalResult<String> {
    match node {
        OperatorNode::String(s) => Ok(s),
        other => Err(type_error("string", context, &other)),
    }
}

fn dedup(op: impl InstantVectorOperator + 'static) -> Box<dyn InstantVectorOperator> {
    Box::new(DeduplicateAndMerge::new(Box::new(op)))
}

/// Whether the root of `expr` orders its output itself.
fn preserves_order(expr: &Expr, time_range: &QueryTimeRange) -> bool {
    if !time_range.is_instant {
        return false;
    }
    match unwrap_parens(expr) {
        Expr::Call(call) => matches!(call.func.name, "sort" | "sort_desc"),
        Expr::Aggregate(agg) => matches!(agg.op.to_string().as_str(), "topk" | "bottomk"),
        _ => false,
    }
}

impl Planner {
    pub(crate) fn new(queryable: Arc<dyn Queryable>, config: &EngineConfig, time_range: &QueryTimeRange) -> Self {
        Self {
            queryable,
            lookback_delta_ms: duration_millis(config.lookback_delta),
            default_subquery_step_ms: duration_millis(config.default_subquery_step),
            query_start: time_range.start_t,
            query_end: time_range.end_t,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(expr = %expr))]
    pub(crate) fn plan(&self, expr: &Expr, time_range: QueryTimeRange) -> EvalResult<Plan> {
        let root = self.plan_expr(expr, time_range)?;
        let preserves_order = preserves_order(expr, &time_range);
        tracing::debug!(root = root.type_name(), preserves_order, "planned query");
        Ok(Plan { root, preserves_order })
    }

    fn plan_expr(&self, expr: &Expr, time_range: QueryTimeRange) -> EvalResult<OperatorNode> {
        let node = match expr {
            Expr::NumberLiteral(n) => OperatorNode::Scalar(Box::new(ConstantScalar::new(n.val, time_range))),
            Expr::StringLiteral(s) => OperatorNode::String(s.val.clone()),
            Expr::Paren(p) => self.plan_expr(&p.expr, time_range)?,
            Expr::VectorSelector(vs) => OperatorNode::InstantVector(self.instant_selector(vs, time_range, None, false)),
            Expr::MatrixSelector(ms) => OperatorNode::RangeVector(self.range_selector(ms, time_range, None)),
            Expr::Subquery(sq) => OperatorNode::RangeVector(self.subquery(sq, time_range)?),
            Expr::Unary(u) => match self.plan_expr(&u.expr, time_range)? {
                OperatorNode::Scalar(s) => OperatorNode::Scalar(Box::new(UnaryNegationScalar::new(s))),
                OperatorNode::InstantVector(v) => OperatorNode::InstantVector(dedup(FunctionOverInstantVector::new(
                    v,
                    Vec::new(),
                    Some(Box::new(DropMetricName)),
                    instant::negate,
                    time_range,
                ))),
                other => return Err(type_error("scalar or instant vector", "unary expression", &other)),
            },
            Expr::Binary(b) => self.binary(b, time_range, expr.to_string())?,
            Expr::Aggregate(agg) => self.aggregate(agg, time_range, expr.to_string())?,
            Expr::Call(call) => self.call(call, time_range, expr.to_string())?,
            Expr::Extension(_) => {
                return Err(EvaluationError::Unsupported("extension expressions".to_string()));
            }
        };
        Ok(node)
    }

    fn at_millis(&self, at: Option<&AtModifier>) -> Option<i64> {
        at.map(|at| match at {
            AtModifier::At(t) => millis_from_system_time(*t),
            AtModifier::Start => self.query_start,
            AtModifier::End => self.query_end,
        })
    }

    fn selector(
        &self,
        vs: &VectorSelector,
        time_range: QueryTimeRange,
        range_ms: i64,
        function: Option<&str>,
    ) -> Selector {
        Selector::new(
            self.queryable.clone(),
            selector_matchers(vs),
            time_range,
            self.at_millis(vs.at.as_ref()),
            offset_millis(vs.offset.as_ref()),
            self.lookback_delta_ms,
            range_ms,
            function.map(str::to_string),
        )
    }

    fn instant_selector(
        &self,
        vs: &VectorSelector,
        time_range: QueryTimeRange,
        function: Option<&str>,
        return_sample_timestamps: bool,
    ) -> Box<dyn InstantVectorOperator> {
        let selector = self.selector(vs, time_range, 0, function);
        Box::new(InstantVectorSelector::new(selector, return_sample_timestamps))
    }

    fn range_selector(
        &self,
        ms: &MatrixSelector,
        time_range: QueryTimeRange,
        function: Option<&str>,
    ) -> Box<dyn RangeVectorOperator> {
        let selector = self.selector(&ms.vs, time_range, duration_millis(ms.range), function);
        Box::new(RangeVectorSelector::new(selector))
    }

    fn subquery(&self, sq: &SubqueryExpr, time_range: QueryTimeRange) -> EvalResult<Box<dyn RangeVectorOperator>> {
        let step_ms = sq.step.map(duration_millis).unwrap_or(self.default_subquery_step_ms);
        if step_ms <= 0 {
            return Err(EvaluationError::InvalidQuery(format!(
                "subquery step must be positive, got {}ms",
                step_ms
            )));
        }
        let range_ms = duration_millis(sq.range);
        let offset_ms = offset_millis(sq.offset.as_ref());
        let timestamp_ms = self.at_millis(sq.at.as_ref());
        let inner_range = subquery_time_range(&time_range, timestamp_ms, offset_ms, range_ms, step_ms)?;
        tracing::trace!(
            start = inner_range.start_t,
            end = inner_range.end_t,
            step = step_ms,
            "planned subquery range"
        );
        let inner = expect_instant(self.plan_expr(&sq.expr, inner_range)?, "subquery")?;
        Ok(Box::new(Subquery::new(inner, time_range, timestamp_ms, offset_ms, range_ms)))
    }

    fn binary(&self, b: &BinaryExpr, time_range: QueryTimeRange, position: String) -> EvalResult<OperatorNode> {
        let op = BinaryOp::from_token(b.op)?;
        if let Some(modifier) = &b.modifier {
            let fill = &modifier.fill_values;
            if fill.lhs.is_some() || fill.rhs.is_some() {
                return Err(EvaluationError::Unsupported(
                    "fill modifiers in binary expressions".to_string(),
                ));
            }
        }
        let return_bool = b.return_bool();
        let left = self.plan_expr(&b.lhs, time_range)?;
        let right = self.plan_expr(&b.rhs, time_range)?;
        let node = match (left, right) {
            (OperatorNode::Scalar(l), OperatorNode::Scalar(r)) => {
                OperatorNode::Scalar(Box::new(ScalarScalarBinary::new(l, r, op)))
            }
            (OperatorNode::InstantVector(v), OperatorNode::Scalar(s)) => {
                OperatorNode::InstantVector(self.vector_scalar(v, s, op, return_bool, false, time_range, position)?)
            }
            (OperatorNode::Scalar(s), OperatorNode::InstantVector(v)) => {
                OperatorNode::InstantVector(self.vector_scalar(v, s, op, return_bool, true, time_range, position)?)
            }
            (OperatorNode::InstantVector(l), OperatorNode::InstantVector(r)) => {
                OperatorNode::InstantVector(self.vector_vector(b, l, r, op, return_bool, time_range, position)?)
            }
            (l, r) => {
                return Err(EvaluationError::InvalidQuery(format!(
                    "binary expression must contain only scalar and instant vector types, got {} and {}",
                    l.type_name(),
                    r.type_name()
                )));
            }
        };
        Ok(node)
    }

    #[allow(clippy::too_many_arguments)]
    fn vector_scalar(
        &self,
        vector: Box<dyn InstantVectorOperator>,
        scalar: Box<dyn ScalarOperator>,
        op: BinaryOp,
        return_bool: bool,
        scalar_is_left: bool,
        time_range: QueryTimeRange,
        position: String,
    ) -> EvalResult<Box<dyn InstantVectorOperator>> {
        if op.is_set_operator() {
            return Err(EvaluationError::InvalidQuery(format!(
                "set operator {} not allowed in binary scalar expression",
                op.symbol()
            )));
        }
        let binary = VectorScalarBinary::new(vector, scalar, op, return_bool, scalar_is_left, time_range, position);
        if VectorScalarBinary::drops_metric_name(op, return_bool) {
            Ok(dedup(binary))
        } else {
            Ok(Box::new(binary))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn vector_vector(
        &self,
        b: &BinaryExpr,
        left: Box<dyn InstantVectorOperator>,
        right: Box<dyn InstantVectorOperator>,
        op: BinaryOp,
        return_bool: bool,
        time_range: QueryTimeRange,
        position: String,
    ) -> EvalResult<Box<dyn InstantVectorOperator>> {
        let modifier = b.modifier.as_ref();
        let matching_labels = modifier.and_then(|m| m.matching.clone());
        if op.is_set_operator() {
            let set = SetOperation::new(left, right, op, matching_labels, time_range)?;
            return Ok(if op == BinaryOp::Or {
                dedup(set)
            } else {
                Box::new(set)
            });
        }
        let matching = match modifier.map(|m| &m.card) {
            None | Some(VectorMatchCardinality::OneToOne) => VectorMatching::one_to_one(matching_labels),
            Some(VectorMatchCardinality::ManyToOne(include)) => VectorMatching {
                card: Cardinality::ManyToOne,
                matching: matching_labels,
                include: include.labels.clone(),
            },
            Some(VectorMatchCardinality::OneToMany(include)) => VectorMatching {
                card: Cardinality::OneToMany,
                matching: matching_labels,
                include: include.labels.clone(),
            },
            Some(VectorMatchCardinality::ManyToMany) => {
                return Err(EvaluationError::InvalidQuery(format!(
                    "many-to-many matching is only allowed for set operators, got {}",
                    op.symbol()
                )));
            }
        };
        let message = matching.conflict_message();
        let binary = VectorVectorBinary::new(left, right, op, return_bool, matching, position);
        Ok(Box::new(DeduplicateAndMerge::with_conflict_message(Box::new(binary), message)))
    }

    fn scalar_param(
        &self,
        agg: &AggregateExpr,
        name: &str,
        time_range: QueryTimeRange,
    ) -> EvalResult<Box<dyn ScalarOperator>> {
        let Some(param) = &agg.param else {
            return Err(EvaluationError::InvalidQuery(format!("{} requires a parameter", name)));
        };
        expect_scalar(self.plan_expr(param, time_range)?, name)
    }

    fn aggregate(&self, agg: &AggregateExpr, time_range: QueryTimeRange, position: String) -> EvalResult<OperatorNode> {
        let name = agg.op.to_string();
        if name == "count_values" {
            return Err(EvaluationError::Unsupported("count_values aggregation".to_string()));
        }
        let input = expect_instant(self.plan_expr(&agg.expr, time_range)?, &name)?;
        let grouping = Grouping::from_modifier(agg.modifier.as_ref());
        let op: Box<dyn InstantVectorOperator> = match name.as_str() {
            "topk" | "bottomk" => Box::new(TopKBottomK::new(
                input,
                self.scalar_param(agg, &name, time_range)?,
                grouping,
                name == "topk",
                time_range,
                position,
            )),
            "limitk" | "limit_ratio" => {
                let kind = if name == "limitk" {
                    LimitKind::Count
                } else {
                    LimitKind::Ratio
                };
                Box::new(Limit::new(
                    input,
                    self.scalar_param(agg, &name, time_range)?,
                    grouping,
                    kind,
                    time_range,
                    position,
                ))
            }
            _ => {
                let Some(op) = AggregationOp::from_name(&name) else {
                    return Err(EvaluationError::Unsupported(format!("aggregation {}", name)));
                };
                let param = match op {
                    AggregationOp::Quantile => Some(self.scalar_param(agg, &name, time_range)?),
                    _ => None,
                };
                Box::new(Aggregation::new(input, op, grouping, param, time_range, position))
            }
        };
        Ok(OperatorNode::InstantVector(op))
    }

    fn call(&self, call: &Call, time_range: QueryTimeRange, position: String) -> EvalResult<OperatorNode> {
        let name = call.func.name;
        let Some(definition) = lookup(name) else {
            return Err(EvaluationError::Unsupported(format!("function {}", name)));
        };
        match definition {
            FunctionDefinition::InstantVector(f) => self.instant_function(call, f, time_range),
            FunctionDefinition::RangeVector(f) => self.range_function(call, f, time_range, position),
            FunctionDefinition::Special(special) => self.special_function(call, *special, time_range, position),
        }
    }

    fn arg<'a>(&self, call: &'a Call, index: usize) -> EvalResult<&'a Expr> {
        call.args.args.get(index).map(|a| a.as_ref()).ok_or_else(|| {
            EvaluationError::InvalidQuery(format!(
                "missing argument {} of function {}",
                index + 1,
                call.func.name
            ))
        })
    }

    /// Splits the arguments of a registry function into its vector argument
    /// (if given) and its planned scalar arguments, filling in a defaulted
    /// last scalar.
    fn signature_args<'a>(
        &self,
        call: &'a Call,
        signature: &Signature,
        time_range: QueryTimeRange,
    ) -> EvalResult<(Option<&'a Expr>, Vec<Box<dyn ScalarOperator>>)> {
        let name = call.func.name;
        let mut vector = None;
        let mut scalars = Vec::with_capacity(signature.scalars);
        for (i, arg) in call.args.args.iter().enumerate() {
            if i == signature.vector_index {
                vector = Some(arg.as_ref());
            } else {
                scalars.push(expect_scalar(self.plan_expr(arg, time_range)?, name)?);
            }
        }
        if scalars.len() < signature.scalars
            && let Some(default) = signature.default_last_scalar
        {
            scalars.push(Box::new(ConstantScalar::new(default, time_range)));
        }
        if scalars.len() != signature.scalars {
            return Err(EvaluationError::InvalidQuery(format!(
                "function {} expects {} scalar arguments, got {}",
                name,
                signature.scalars,
                scalars.len()
            )));
        }
        Ok((vector, scalars))
    }

    fn instant_function(
        &self,
        call: &Call,
        f: &InstantVectorFunction,
        time_range: QueryTimeRange,
    ) -> EvalResult<OperatorNode> {
        let name = call.func.name;
        let (vector, scalars) = self.signature_args(call, &f.signature, time_range)?;
        let inner = match vector {
            Some(expr) => expect_instant(self.plan_expr(expr, time_range)?, name)?,
            None if f.signature.vector_optional => {
                Box::new(VectorFunction::new(Box::new(TimeScalar::new(time_range))))
            }
            None => {
                return Err(EvaluationError::InvalidQuery(format!(
                    "function {} requires a vector argument",
                    name
                )));
            }
        };
        let metadata_function = f
            .drops_metric_name
            .then(|| Box::new(DropMetricName) as Box<dyn SeriesMetadataFunction>);
        let op = FunctionOverInstantVector::new(inner, scalars, metadata_function, f.series_data, time_range);
        Ok(OperatorNode::InstantVector(if f.needs_series_deduplication() {
            dedup(op)
        } else {
            Box::new(op)
        }))
    }

    /// Plans the range vector argument of `function`, passing the function
    /// name on to storage as a hint when it reads a selector directly.
    fn range_arg(
        &self,
        expr: &Expr,
        function: &str,
        time_range: QueryTimeRange,
    ) -> EvalResult<Box<dyn RangeVectorOperator>> {
        match unwrap_parens(expr) {
            Expr::MatrixSelector(ms) => Ok(self.range_selector(ms, time_range, Some(function))),
            other => expect_range(self.plan_expr(other, time_range)?, function),
        }
    }

    fn range_function(
        &self,
        call: &Call,
        f: &RangeVectorFunction,
        time_range: QueryTimeRange,
        position: String,
    ) -> EvalResult<OperatorNode> {
        let name = call.func.name;
        let (vector, scalars) = self.signature_args(call, &f.signature, time_range)?;
        let Some(vector) = vector else {
            return Err(EvaluationError::InvalidQuery(format!(
                "function {} requires a range vector argument",
                name
            )));
        };
        let inner = self.range_arg(vector, name, time_range)?;
        let validator = f.validator_factory.map(|make| make());
        let op = FunctionOverRangeVector::new(
            inner,
            scalars,
            f.step,
            f.drops_metric_name,
            validator,
            time_range,
            position,
        );
        Ok(OperatorNode::InstantVector(if f.needs_series_deduplication() {
            dedup(op)
        } else {
            Box::new(op)
        }))
    }

    fn instant_arg(&self, call: &Call, index: usize, time_range: QueryTimeRange) -> EvalResult<Box<dyn InstantVectorOperator>> {
        expect_instant(self.plan_expr(self.arg(call, index)?, time_range)?, call.func.name)
    }

    fn string_arg(&self, call: &Call, index: usize, time_range: QueryTimeRange) -> EvalResult<String> {
        expect_string(self.plan_expr(self.arg(call, index)?, time_range)?, call.func.name)
    }

    fn special_function(
        &self,
        call: &Call,
        special: SpecialFunction,
        time_range: QueryTimeRange,
        position: String,
    ) -> EvalResult<OperatorNode> {
        let name = call.func.name;
        let node = match special {
            SpecialFunction::Absent => {
                let labels = match unwrap_parens(self.arg(call, 0)?) {
                    Expr::VectorSelector(vs) => absent_labels(&vs.matchers),
                    _ => Labels::empty(),
                };
                let input = self.instant_arg(call, 0, time_range)?;
                OperatorNode::InstantVector(Box::new(Absent::new(AbsentInput::Instant(input), labels, time_range)))
            }
            SpecialFunction::AbsentOverTime => {
                let arg = self.arg(call, 0)?;
                let labels = match unwrap_parens(arg) {
                    Expr::MatrixSelector(ms) => absent_labels(&ms.vs.matchers),
                    _ => Labels::empty(),
                };
                let input = self.range_arg(arg, name, time_range)?;
                OperatorNode::InstantVector(Box::new(Absent::new(AbsentInput::Range(input), labels, time_range)))
            }
            SpecialFunction::Scalar => {
                let input = self.instant_arg(call, 0, time_range)?;
                OperatorNode::Scalar(Box::new(ScalarFunction::new(input, time_range)))
            }
            SpecialFunction::Vector => {
                let input = expect_scalar(self.plan_expr(self.arg(call, 0)?, time_range)?, name)?;
                OperatorNode::InstantVector(Box::new(VectorFunction::new(input)))
            }
            SpecialFunction::Time => OperatorNode::Scalar(Box::new(TimeScalar::new(time_range))),
            SpecialFunction::Timestamp => {
                let op = match unwrap_parens(self.arg(call, 0)?) {
                    Expr::VectorSelector(vs) => FunctionOverInstantVector::new(
                        self.instant_selector(vs, time_range, Some(name), true),
                        Vec::new(),
                        Some(Box::new(DropMetricName)),
                        instant::unchanged,
                        time_range,
                    ),
                    _ => FunctionOverInstantVector::new(
                        self.instant_arg(call, 0, time_range)?,
                        Vec::new(),
                        Some(Box::new(DropMetricName)),
                        instant::step_timestamps,
                        time_range,
                    ),
                };
                OperatorNode::InstantVector(dedup(op))
            }
            SpecialFunction::HistogramQuantile => {
                let param = expect_scalar(self.plan_expr(self.arg(call, 0)?, time_range)?, name)?;
                let input = self.instant_arg(call, 1, time_range)?;
                OperatorNode::InstantVector(Box::new(HistogramQuantile::new(input, param, time_range, position)))
            }
            SpecialFunction::Sort | SpecialFunction::SortDesc => {
                let input = self.instant_arg(call, 0, time_range)?;
                let descending = special == SpecialFunction::SortDesc;
                OperatorNode::InstantVector(Box::new(Sort::new(input, descending, time_range.is_instant)))
            }
            SpecialFunction::LabelReplace => {
                let input = self.instant_arg(call, 0, time_range)?;
                let function = LabelReplace::new(
                    &self.string_arg(call, 1, time_range)?,
                    &self.string_arg(call, 2, time_range)?,
                    &self.string_arg(call, 3, time_range)?,
                    &self.string_arg(call, 4, time_range)?,
                )?;
                OperatorNode::InstantVector(dedup(FunctionOverInstantVector::new(
                    input,
                    Vec::new(),
                    Some(Box::new(function)),
                    instant::unchanged,
                    time_range,
                )))
            }
            SpecialFunction::LabelJoin => {
                let input = self.instant_arg(call, 0, time_range)?;
                let dst = self.string_arg(call, 1, time_range)?;
                let separator = self.string_arg(call, 2, time_range)?;
                let src = (3..call.args.args.len())
                    .map(|i| self.string_arg(call, i, time_range))
                    .collect::<EvalResult<Vec<_>>>()?;
                let function = LabelJoin::new(&dst, &separator, src)?;
                OperatorNode::InstantVector(dedup(FunctionOverInstantVector::new(
                    input,
                    Vec::new(),
                    Some(Box::new(function)),
                    instant::unchanged,
                    time_range,
                )))
            }
        };
        Ok(node)
    }
}
