//! The streaming operator tree.
//!
//! Every node reports the identity of all its output series up front
//! ([`InstantVectorOperator::series_metadata`]) and then yields their data one
//! series at a time, in the same order. A node never holds more than it needs
//! to produce the next series, and all of its buffers are charged to the
//! query's memory tracker.

use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::types::{InstantVectorSeriesData, RangeVectorStepData, ScalarData, SeriesMetadata};

pub(crate) mod absent;
pub(crate) mod aggregations;
pub(crate) mod binary;
pub(crate) mod deduplicate_and_merge;
pub(crate) mod function_over_instant_vector;
pub(crate) mod function_over_range_vector;
pub(crate) mod histogram_function;
pub(crate) mod scalars;
pub(crate) mod selectors;
pub(crate) mod series_buffer;
pub(crate) mod sort;
pub(crate) mod subquery;

/// Produces an instant vector: per series, at most one point per step.
#[async_trait]
pub(crate) trait InstantVectorOperator: Send {
    /// Identities of all output series. Called once, before any data.
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>>;

    /// Data for the next series, or `None` after the last one.
    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>>;

    /// Returns every buffer still held. Safe to call more than once.
    fn close(&mut self, ctx: &mut QueryContext);
}

/// Produces a range vector: per series, a window of samples per step.
#[async_trait]
pub(crate) trait RangeVectorOperator: Send {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>>;

    /// Length of the window in milliseconds.
    fn range_ms(&self) -> i64;

    /// Advances to the next series. Returns false after the last one.
    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<bool>;

    /// Window for the next step of the current series, or `None` once every
    /// step has been visited. The returned view is valid until the next call.
    fn next_step_samples<'a>(
        &'a mut self,
        ctx: &mut QueryContext,
    ) -> EvalResult<Option<RangeVectorStepData<'a>>>;

    fn close(&mut self, ctx: &mut QueryContext);
}

/// Produces one value per step.
#[async_trait]
pub(crate) trait ScalarOperator: Send {
    async fn values(&mut self, ctx: &mut QueryContext) -> EvalResult<ScalarData>;

    fn close(&mut self, ctx: &mut QueryContext);
}

/// A planned sub-expression, by the type of value it produces.
pub(crate) enum OperatorNode {
    InstantVector(Box<dyn InstantVectorOperator>),
    RangeVector(Box<dyn RangeVectorOperator>),
    Scalar(Box<dyn ScalarOperator>),
    String(String),
}

impl OperatorNode {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            OperatorNode::InstantVector(_) => "instant vector",
            OperatorNode::RangeVector(_) => "range vector",
            OperatorNode::Scalar(_) => "scalar",
            OperatorNode::String(_) => "string",
        }
    }

    pub(crate) fn close(&mut self, ctx: &mut QueryContext) {
        match self {
            OperatorNode::InstantVector(op) => op.close(ctx),
            OperatorNode::RangeVector(op) => op.close(ctx),
            OperatorNode::Scalar(op) => op.close(ctx),
            OperatorNode::String(_) => {}
        }
    }
}

/// Drains an instant vector operator into `(metadata, data)` pairs, releasing
/// nothing: the caller owns the returned buffers. Used by operators that must
/// see every input series before producing output.
pub(crate) async fn materialize(
    op: &mut dyn InstantVectorOperator,
    ctx: &mut QueryContext,
) -> EvalResult<(Vec<SeriesMetadata>, Vec<InstantVectorSeriesData>)> {
    let metadata = op.series_metadata(ctx).await?;
    let mut data = Vec::with_capacity(metadata.len());
    for _ in 0..metadata.len() {
        match op.next_series(ctx).await {
            Ok(Some(series)) => data.push(series),
            Ok(None) => break,
            Err(e) => {
                for series in data {
                    series.release(&mut ctx.memory);
                }
                crate::types::put_series_metadata_vec(metadata, &mut ctx.memory);
                return Err(e);
            }
        }
    }
    Ok((metadata, data))
}
