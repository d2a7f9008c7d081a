//! Query lifecycle: parse, plan, pull the operator tree, materialize.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use promql_parser::parser::{Expr, parse};
use tokio_util::sync::CancellationToken;

use crate::annotations::Annotations;
use crate::config::{EngineConfig, QueryLimits};
use crate::context::{QueryContext, QueryStats};
use crate::error::{EvalResult, EvaluationError};
use crate::model::{InstantSample, QueryValue, RangeSeries, SampleValue};
use crate::operators::{InstantVectorOperator, OperatorNode, RangeVectorOperator, ScalarOperator};
use crate::planner::{Plan, Planner};
use crate::storage::Queryable;
use crate::time_range::{QueryTimeRange, duration_millis, millis_from_system_time};
use crate::types::{put_series_metadata_vec, release_vec};

/// Most steps a top-level range query may ask for. Subqueries are bounded by
/// the memory and sample limits instead.
pub const MAX_POINTS_PER_SERIES: usize = 11_000;

/// Outcome of a successful query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub value: QueryValue,
    pub annotations: Annotations,
    pub stats: QueryStats,
}

/// Creates queries against a [`Queryable`]. Cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Prepares `query` for evaluation at a single point in time.
    pub fn instant_query(&self, queryable: Arc<dyn Queryable>, query: &str, time: SystemTime) -> EvalResult<Query> {
        let time_range = QueryTimeRange::new_instant(millis_from_system_time(time));
        self.prepare(queryable, query, time_range)
    }

    /// Prepares `query` for evaluation at every `step` from `start` to `end`.
    pub fn range_query(
        &self,
        queryable: Arc<dyn Queryable>,
        query: &str,
        start: SystemTime,
        end: SystemTime,
        step: Duration,
    ) -> EvalResult<Query> {
        let time_range = QueryTimeRange::new_range(
            millis_from_system_time(start),
            millis_from_system_time(end),
            duration_millis(step),
        )?;
        if time_range.step_count > MAX_POINTS_PER_SERIES {
            return Err(EvaluationError::InvalidRange(format!(
                "exceeded maximum resolution of {} points per timeseries, try decreasing the query resolution",
                MAX_POINTS_PER_SERIES
            )));
        }
        self.prepare(queryable, query, time_range)
    }

    fn prepare(&self, queryable: Arc<dyn Queryable>, query: &str, time_range: QueryTimeRange) -> EvalResult<Query> {
        let expr = parse(query).map_err(EvaluationError::InvalidQuery)?;
        Ok(Query {
            queryable,
            expr,
            time_range,
            config: self.config.clone(),
            limits: self.config.default_limits.clone(),
        })
    }
}

/// A parsed query bound to a time range, ready to execute once.
pub struct Query {
    queryable: Arc<dyn Queryable>,
    expr: Expr,
    time_range: QueryTimeRange,
    config: EngineConfig,
    limits: QueryLimits,
}

impl Query {
    /// Overrides the engine's default limits, e.g. with a tenant's own.
    pub fn with_limits(mut self, limits: QueryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn time_range(&self) -> &QueryTimeRange {
        &self.time_range
    }

    pub async fn exec(self) -> EvalResult<QueryResult> {
        self.exec_with_cancellation(CancellationToken::new()).await
    }

    /// Runs the query to completion, or until `cancellation` fires or the
    /// timeout elapses. Every buffer is released whatever the outcome.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(
            query = %self.expr,
            start = self.time_range.start_t,
            end = self.time_range.end_t,
            step = self.time_range.interval_ms,
        )
    )]
    pub async fn exec_with_cancellation(self, cancellation: CancellationToken) -> EvalResult<QueryResult> {
        let mut ctx = QueryContext::new(&self.limits, cancellation, self.config.cancellation_check_interval);
        ctx.check_cancelled()?;
        let planner = Planner::new(self.queryable.clone(), &self.config, &self.time_range);
        let Plan {
            mut root,
            preserves_order,
        } = planner.plan(&self.expr, self.time_range)?;

        let value = evaluate(&mut root, preserves_order, &self.time_range, &mut ctx).await;
        root.close(&mut ctx);
        let (annotations, stats, memory) = ctx.finish();

        let leaked = memory.current_bytes();
        if leaked != 0 {
            tracing::error!(
                leaked_bytes = leaked,
                failed = value.is_err(),
                "query did not release all tracked memory"
            );
            if cfg!(debug_assertions) {
                let outcome = match &value {
                    Ok(_) => "succeeded".to_string(),
                    Err(e) => format!("failed with: {e}"),
                };
                return Err(EvaluationError::Internal(format!(
                    "{leaked} bytes still tracked after the query finished (query {outcome})"
                )));
            }
        }

        let value = match value {
            Ok(value) => value,
            Err(e) => {
                if matches!(e, EvaluationError::ResourceExhausted { .. }) {
                    tracing::warn!(error = %e, peak_memory_bytes = stats.peak_memory_bytes, "query exceeded a limit");
                } else {
                    tracing::debug!(error = %e, "query failed");
                }
                return Err(e);
            }
        };
        tracing::debug!(
            samples = stats.total_samples,
            series = stats.series_fetched,
            peak_memory_bytes = stats.peak_memory_bytes,
            annotations = annotations.len(),
            "query finished"
        );
        Ok(QueryResult {
            value,
            annotations,
            stats,
        })
    }
}

async fn evaluate(
    root: &mut OperatorNode,
    preserves_order: bool,
    time_range: &QueryTimeRange,
    ctx: &mut QueryContext,
) -> EvalResult<QueryValue> {
    match root {
        OperatorNode::InstantVector(op) if time_range.is_instant => {
            let mut samples = instant_vector(op.as_mut(), ctx).await?;
            if !preserves_order {
                samples.sort_by(|a, b| a.labels.cmp(&b.labels));
            }
            Ok(QueryValue::Vector(samples))
        }
        OperatorNode::InstantVector(op) => {
            let mut series = instant_vector_matrix(op.as_mut(), ctx).await?;
            series.sort_by(|a, b| a.labels.cmp(&b.labels));
            Ok(QueryValue::Matrix(series))
        }
        OperatorNode::RangeVector(op) if time_range.is_instant => {
            let mut series = range_vector_matrix(op.as_mut(), ctx).await?;
            series.sort_by(|a, b| a.labels.cmp(&b.labels));
            Ok(QueryValue::Matrix(series))
        }
        OperatorNode::Scalar(op) => scalar(op.as_mut(), time_range, ctx).await,
        OperatorNode::String(s) if time_range.is_instant => Ok(QueryValue::String {
            timestamp_ms: time_range.start_t,
            value: s.clone(),
        }),
        other => Err(EvaluationError::InvalidQuery(format!(
            "invalid expression type \"{}\" for range query, must be scalar or instant vector",
            other.type_name()
        ))),
    }
}

async fn instant_vector(op: &mut dyn InstantVectorOperator, ctx: &mut QueryContext) -> EvalResult<Vec<InstantSample>> {
    let metadata = op.series_metadata(ctx).await?;
    let mut samples = Vec::with_capacity(metadata.len());
    let mut result = Ok(());
    for m in &metadata {
        let data = match op.next_series(ctx).await {
            Ok(Some(data)) => data,
            Ok(None) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        if let Some(p) = data.floats.first() {
            samples.push(InstantSample {
                labels: m.labels.clone(),
                timestamp_ms: p.t,
                value: SampleValue::Float(p.f),
            });
        } else if let Some(p) = data.histograms.first() {
            samples.push(InstantSample {
                labels: m.labels.clone(),
                timestamp_ms: p.t,
                value: SampleValue::Histogram((*p.h).clone()),
            });
        }
        data.release(&mut ctx.memory);
    }
    put_series_metadata_vec(metadata, &mut ctx.memory);
    result.map(|()| samples)
}

async fn instant_vector_matrix(
    op: &mut dyn InstantVectorOperator,
    ctx: &mut QueryContext,
) -> EvalResult<Vec<RangeSeries>> {
    let metadata = op.series_metadata(ctx).await?;
    let mut series = Vec::with_capacity(metadata.len());
    let mut result = Ok(());
    for m in &metadata {
        let data = match op.next_series(ctx).await {
            Ok(Some(data)) => data,
            Ok(None) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        if data.is_empty() {
            data.release(&mut ctx.memory);
            continue;
        }
        // the buffers leave the query with the result
        release_vec(&data.floats, &mut ctx.memory);
        release_vec(&data.histograms, &mut ctx.memory);
        series.push(RangeSeries {
            labels: m.labels.clone(),
            floats: data.floats,
            histograms: data.histograms,
        });
    }
    put_series_metadata_vec(metadata, &mut ctx.memory);
    result.map(|()| series)
}

async fn range_vector_matrix(op: &mut dyn RangeVectorOperator, ctx: &mut QueryContext) -> EvalResult<Vec<RangeSeries>> {
    let metadata = op.series_metadata(ctx).await?;
    let mut series = Vec::with_capacity(metadata.len());
    let mut result = Ok(());
    for m in &metadata {
        match op.next_series(ctx).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
        let step = match op.next_step_samples(ctx) {
            Ok(Some(step)) => step,
            Ok(None) => continue,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        let floats: Vec<_> = step.floats.iter().copied().collect();
        let histograms: Vec<_> = step.histograms.iter().cloned().collect();
        if floats.is_empty() && histograms.is_empty() {
            continue;
        }
        series.push(RangeSeries {
            labels: m.labels.clone(),
            floats,
            histograms,
        });
    }
    put_series_metadata_vec(metadata, &mut ctx.memory);
    result.map(|()| series)
}

async fn scalar(
    op: &mut dyn ScalarOperator,
    time_range: &QueryTimeRange,
    ctx: &mut QueryContext,
) -> EvalResult<QueryValue> {
    let data = op.values(ctx).await?;
    release_vec(&data.samples, &mut ctx.memory);
    if time_range.is_instant {
        return Ok(QueryValue::Scalar {
            timestamp_ms: time_range.start_t,
            value: data.value_at(0),
        });
    }
    Ok(QueryValue::Matrix(vec![RangeSeries {
        labels: Default::default(),
        floats: data.samples,
        histograms: Vec::new(),
    }]))
}
