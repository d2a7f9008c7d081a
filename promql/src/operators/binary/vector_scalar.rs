use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::functions::StepValue;
use crate::functions::labels::{DropMetricName, SeriesMetadataFunction};
use crate::operators::binary::{BinaryOp, Operand, StepPoints, evaluate_pair, push_step_value};
use crate::operators::{InstantVectorOperator, ScalarOperator};
use crate::time_range::QueryTimeRange;
use crate::types::{InstantVectorSeriesData, ScalarData, SeriesMetadata, put_series_metadata_vec};

/// A binary operation between every series of a vector and a scalar.
///
/// Comparisons filter the vector; the surviving value is always the
/// vector's own, whichever side the scalar is on.
pub(crate) struct VectorScalarBinary {
    vector: Box<dyn InstantVectorOperator>,
    scalar: Box<dyn ScalarOperator>,
    scalar_values: Option<ScalarData>,
    op: BinaryOp,
    return_bool: bool,
    scalar_is_left: bool,
    time_range: QueryTimeRange,
    position: String,
}

impl VectorScalarBinary {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        vector: Box<dyn InstantVectorOperator>,
        scalar: Box<dyn ScalarOperator>,
        op: BinaryOp,
        return_bool: bool,
        scalar_is_left: bool,
        time_range: QueryTimeRange,
        position: String,
    ) -> Self {
        Self {
            vector,
            scalar,
            scalar_values: None,
            op,
            return_bool,
            scalar_is_left,
            time_range,
            position,
        }
    }

    pub(crate) fn drops_metric_name(op: BinaryOp, return_bool: bool) -> bool {
        op.drops_metric_name() || return_bool
    }

    fn apply(&self, data: &InstantVectorSeriesData, ctx: &mut QueryContext) -> EvalResult<InstantVectorSeriesData> {
        let mut out = InstantVectorSeriesData::default();
        let Some(scalar) = &self.scalar_values else {
            return Ok(out);
        };
        for (t, vector_value) in StepPoints::new(data) {
            let scalar_value = Operand::Float(scalar.value_at(self.time_range.point_index(t)));
            let (l, r) = if self.scalar_is_left {
                (scalar_value, vector_value)
            } else {
                (vector_value, scalar_value)
            };
            let mut value = evaluate_pair(self.op, l, r, self.return_bool, &self.position, &mut ctx.annotations);
            if self.op.is_comparison() && !self.return_bool && !matches!(value, StepValue::None) {
                value = match vector_value {
                    Operand::Float(f) => StepValue::Float(f),
                    Operand::Histogram(h) => StepValue::Histogram(h.clone()),
                };
            }
            if let Err(e) = push_step_value(&mut out, t, value, &mut ctx.memory) {
                out.release(&mut ctx.memory);
                return Err(e);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl InstantVectorOperator for VectorScalarBinary {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        self.scalar_values = Some(self.scalar.values(ctx).await?);
        let mut metadata = self.vector.series_metadata(ctx).await?;
        if Self::drops_metric_name(self.op, self.return_bool)
            && let Err(e) = DropMetricName.apply(&mut metadata, ctx)
        {
            put_series_metadata_vec(metadata, &mut ctx.memory);
            return Err(e);
        }
        Ok(metadata)
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        ctx.check_cancelled()?;
        let Some(data) = self.vector.next_series(ctx).await? else {
            return Ok(None);
        };
        let result = self.apply(&data, ctx);
        data.release(&mut ctx.memory);
        result.map(Some)
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        if let Some(values) = self.scalar_values.take() {
            values.release(&mut ctx.memory);
        }
        self.scalar.close(ctx);
        self.vector.close(ctx);
    }
}
