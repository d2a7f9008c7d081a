use std::collections::VecDeque;

use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::functions::labels::{DropMetricName, SeriesMetadataFunction};
use crate::functions::{RangeStepFn, SeriesValidator, StepEnv, StepValue};
use crate::model::{FPoint, HPoint};
use crate::operators::function_over_instant_vector::evaluate_scalar_args;
use crate::operators::{InstantVectorOperator, RangeVectorOperator, ScalarOperator};
use crate::time_range::QueryTimeRange;
use crate::types::{InstantVectorSeriesData, ScalarData, SeriesMetadata, push_tracked, put_series_metadata_vec};

/// Evaluates a range function over every step of every input series,
/// turning a range vector into an instant vector.
pub(crate) struct FunctionOverRangeVector {
    inner: Box<dyn RangeVectorOperator>,
    scalar_args: Vec<Box<dyn ScalarOperator>>,
    scalar_values: Vec<ScalarData>,
    step: RangeStepFn,
    drops_metric_name: bool,
    validator: Option<Box<dyn SeriesValidator>>,
    /// Metric names of the input series not yet evaluated.
    metric_names: VecDeque<Option<String>>,
    time_range: QueryTimeRange,
    position: String,
}

impl FunctionOverRangeVector {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        inner: Box<dyn RangeVectorOperator>,
        scalar_args: Vec<Box<dyn ScalarOperator>>,
        step: RangeStepFn,
        drops_metric_name: bool,
        validator: Option<Box<dyn SeriesValidator>>,
        time_range: QueryTimeRange,
        position: String,
    ) -> Self {
        Self {
            inner,
            scalar_args,
            scalar_values: Vec::new(),
            step,
            drops_metric_name,
            validator,
            metric_names: VecDeque::new(),
            time_range,
            position,
        }
    }

    fn evaluate_series(
        &mut self,
        metric_name: Option<&str>,
        data: &mut InstantVectorSeriesData,
        ctx: &mut QueryContext,
    ) -> EvalResult<()> {
        let range_ms = self.inner.range_ms();
        let mut args = Vec::with_capacity(self.scalar_values.len());
        let mut saw_floats = false;
        while let Some(step) = self.inner.next_step_samples(ctx)? {
            saw_floats |= !step.floats.is_empty();
            let index = self.time_range.point_index(step.step_t);
            args.clear();
            args.extend(self.scalar_values.iter().map(|s| s.value_at(index)));
            let step_t = step.step_t;
            let mut env = StepEnv {
                scalar_args: &args,
                range_ms,
                metric_name,
                position: &self.position,
                annotations: &mut ctx.annotations,
            };
            match (self.step)(&step, &mut env)? {
                StepValue::None => {}
                StepValue::Float(f) => push_tracked(&mut data.floats, FPoint::new(step_t, f), &mut ctx.memory)?,
                StepValue::Histogram(h) => {
                    push_tracked(&mut data.histograms, HPoint::new(step_t, h), &mut ctx.memory)?
                }
            }
        }
        if let Some(validator) = &mut self.validator {
            validator.validate(metric_name, saw_floats, &self.position, &mut ctx.annotations);
        }
        Ok(())
    }
}

#[async_trait]
impl InstantVectorOperator for FunctionOverRangeVector {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        self.scalar_values = evaluate_scalar_args(&mut self.scalar_args, ctx).await?;
        let mut metadata = self.inner.series_metadata(ctx).await?;
        self.metric_names = metadata
            .iter()
            .map(|m| m.labels.metric_name().map(str::to_string))
            .collect();
        if self.drops_metric_name
            && let Err(e) = DropMetricName.apply(&mut metadata, ctx)
        {
            put_series_metadata_vec(metadata, &mut ctx.memory);
            return Err(e);
        }
        Ok(metadata)
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        if !self.inner.next_series(ctx).await? {
            return Ok(None);
        }
        let metric_name = self.metric_names.pop_front().flatten();
        let mut data = InstantVectorSeriesData::default();
        match self.evaluate_series(metric_name.as_deref(), &mut data, ctx) {
            Ok(()) => Ok(Some(data)),
            Err(e) => {
                data.release(&mut ctx.memory);
                Err(e)
            }
        }
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
