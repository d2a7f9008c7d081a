use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::functions::SeriesDataFn;
use crate::functions::labels::SeriesMetadataFunction;
use crate::operators::{InstantVectorOperator, ScalarOperator};
use crate::time_range::QueryTimeRange;
use crate::types::{InstantVectorSeriesData, ScalarData, SeriesMetadata, put_series_metadata_vec};

/// Applies a per-series kernel, and optionally a label rewrite, to every
/// series of its input. Scalar arguments are evaluated once, up front.
pub(crate) struct FunctionOverInstantVector {
    inner: Box<dyn InstantVectorOperator>,
    scalar_args: Vec<Box<dyn ScalarOperator>>,
    scalar_values: Vec<ScalarData>,
    metadata_function: Option<Box<dyn SeriesMetadataFunction>>,
    series_data: SeriesDataFn,
    time_range: QueryTimeRange,
}

impl FunctionOverInstantVector {
    pub(crate) fn new(
        inner: Box<dyn InstantVectorOperator>,
        scalar_args: Vec<Box<dyn ScalarOperator>>,
        metadata_function: Option<Box<dyn SeriesMetadataFunction>>,
        series_data: SeriesDataFn,
        time_range: QueryTimeRange,
    ) -> Self {
        Self {
            inner,
            scalar_args,
            scalar_values: Vec::new(),
            metadata_function,
            series_data,
            time_range,
        }
    }
}

/// Evaluates every scalar argument, releasing those already evaluated if one
/// fails.
pub(crate) async fn evaluate_scalar_args(
    args: &mut [Box<dyn ScalarOperator>],
    ctx: &mut QueryContext,
) -> EvalResult<Vec<ScalarData>> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args.iter_mut() {
        match arg.values(ctx).await {
            Ok(v) => values.push(v),
            Err(e) => {
                values.into_iter().for_each(|v: ScalarData| v.release(&mut ctx.memory));
                return Err(e);
            }
        }
    }
    Ok(values)
}

#[async_trait]
impl InstantVectorOperator for FunctionOverInstantVector {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        self.scalar_values = evaluate_scalar_args(&mut self.scalar_args, ctx).await?;
        let mut metadata = self.inner.series_metadata(ctx).await?;
        if let Some(function) = &self.metadata_function
            && let Err(e) = function.apply(&mut metadata, ctx)
        {
            put_series_metadata_vec(metadata, &mut ctx.memory);
            return Err(e);
        }
        Ok(metadata)
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        ctx.check_cancelled()?;
        let Some(data) = self.inner.next_series(ctx).await? else {
            return Ok(None);
        };
        (self.series_data)(data, &self.scalar_values, &self.time_range, ctx).map(Some)
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        for values in self.scalar_values.drain(..) {
            values.release(&mut ctx.memory);
        }
        for arg in &mut self.scalar_args {
            arg.close(ctx);
        }
        self.inner.close(ctx);
    }
}
