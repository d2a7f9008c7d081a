//! Operators producing one value per step: literals, `time()`, `scalar()`,
//! and the `vector()` conversion back to an instant vector.

use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::model::{FPoint, Labels};
use crate::operators::{InstantVectorOperator, ScalarOperator};
use crate::time_range::QueryTimeRange;
use crate::types::{
    InstantVectorSeriesData, ScalarData, SeriesMetadata, append_series_metadata, get_filled_vec, get_vec,
    put_vec,
};

fn fill(time_range: &QueryTimeRange, ctx: &mut QueryContext, f: impl Fn(i64) -> f64) -> EvalResult<ScalarData> {
    let mut samples = get_vec(time_range.step_count, &mut ctx.memory)?;
    samples.extend(time_range.step_times().map(|t| FPoint::new(t, f(t))));
    Ok(ScalarData { samples })
}

/// A number literal.
pub(crate) struct ConstantScalar {
    value: f64,
    time_range: QueryTimeRange,
}

impl ConstantScalar {
    pub(crate) fn new(value: f64, time_range: QueryTimeRange) -> Self {
        Self { value, time_range }
    }
}

#[async_trait]
impl ScalarOperator for ConstantScalar {
    async fn values(&mut self, ctx: &mut QueryContext) -> EvalResult<ScalarData> {
        let value = self.value;
        fill(&self.time_range, ctx, |_| value)
    }

    fn close(&mut self, _ctx: &mut QueryContext) {}
}

/// `time()`: the evaluation timestamp of each step, in seconds.
pub(crate) struct TimeScalar {
    time_range: QueryTimeRange,
}

impl TimeScalar {
    pub(crate) fn new(time_range: QueryTimeRange) -> Self {
        Self { time_range }
    }
}

#[async_trait]
impl ScalarOperator for TimeScalar {
    async fn values(&mut self, ctx: &mut QueryContext) -> EvalResult<ScalarData> {
        fill(&self.time_range, ctx, |t| t as f64 / 1000.0)
    }

    fn close(&mut self, _ctx: &mut QueryContext) {}
}

/// `scalar(v)`: the value of the only float sample at each step, or NaN when
/// the step has zero or several.
pub(crate) struct ScalarFunction {
    inner: Box<dyn InstantVectorOperator>,
    time_range: QueryTimeRange,
}

impl ScalarFunction {
    pub(crate) fn new(inner: Box<dyn InstantVectorOperator>, time_range: QueryTimeRange) -> Self {
        Self { inner, time_range }
    }

    async fn accumulate(
        &mut self,
        series_count: usize,
        values: &mut [f64],
        seen: &mut [usize],
        ctx: &mut QueryContext,
    ) -> EvalResult<()> {
        for _ in 0..series_count {
            let Some(data) = self.inner.next_series(ctx).await? else {
                break;
            };
            for p in &data.floats {
                let i = self.time_range.point_index(p.t);
                values[i] = p.f;
                seen[i] += 1;
            }
            data.release(&mut ctx.memory);
        }
        Ok(())
    }
}

#[async_trait]
impl ScalarOperator for ScalarFunction {
    async fn values(&mut self, ctx: &mut QueryContext) -> EvalResult<ScalarData> {
        let metadata = self.inner.series_metadata(ctx).await?;
        let series_count = metadata.len();
        crate::types::put_series_metadata_vec(metadata, &mut ctx.memory);

        let steps = self.time_range.step_count;
        let mut values = get_filled_vec(steps, f64::NAN, &mut ctx.memory)?;
        let mut seen = match get_filled_vec(steps, 0usize, &mut ctx.memory) {
            Ok(v) => v,
            Err(e) => {
                put_vec(values, &mut ctx.memory);
                return Err(e);
            }
        };
        let accumulated = self.accumulate(series_count, &mut values, &mut seen, ctx).await;
        let result = accumulated.and_then(|()| {
            fill(&self.time_range, ctx, |t| {
                let i = self.time_range.point_index(t);
                if seen[i] == 1 { values[i] } else { f64::NAN }
            })
        });
        put_vec(values, &mut ctx.memory);
        put_vec(seen, &mut ctx.memory);
        result
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        self.inner.close(ctx);
    }
}

/// `-s` for a scalar `s`.
pub(crate) struct UnaryNegationScalar {
    inner: Box<dyn ScalarOperator>,
}

impl UnaryNegationScalar {
    pub(crate) fn new(inner: Box<dyn ScalarOperator>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ScalarOperator for UnaryNegationScalar {
    async fn values(&mut self, ctx: &mut QueryContext) -> EvalResult<ScalarData> {
        let mut data = self.inner.values(ctx).await?;
        for p in &mut data.samples {
            p.f = -p.f;
        }
        Ok(data)
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        self.inner.close(ctx);
    }
}

/// `vector(s)`: a single series without labels.
pub(crate) struct VectorFunction {
    inner: Box<dyn ScalarOperator>,
    done: bool,
}

impl VectorFunction {
    pub(crate) fn new(inner: Box<dyn ScalarOperator>) -> Self {
        Self { inner, done: false }
    }
}

#[async_trait]
impl InstantVectorOperator for VectorFunction {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        let mut out = get_vec(1, &mut ctx.memory)?;
        append_series_metadata(&mut out, SeriesMetadata::new(Labels::empty()), &mut ctx.memory)?;
        Ok(out)
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let values = self.inner.values(ctx).await?;
        Ok(Some(InstantVectorSeriesData {
            floats: values.samples,
            histograms: Vec::new(),
        }))
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        self.inner.close(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::testing::{FixedSeries, collect_floats, points};
    use rstest::rstest;

    fn range() -> QueryTimeRange {
        QueryTimeRange::new_range(0, 2000, 1000).unwrap()
    }

    async fn scalar_values(op: &mut dyn ScalarOperator, ctx: &mut QueryContext) -> Vec<f64> {
        let data = op.values(ctx).await.unwrap();
        let values = data.samples.iter().map(|p| p.f).collect();
        data.release(&mut ctx.memory);
        op.close(ctx);
        values
    }

    #[tokio::test]
    async fn should_report_step_time_in_seconds() {
        let mut ctx = QueryContext::for_tests();
        let mut op = TimeScalar::new(range());

        let values = scalar_values(&mut op, &mut ctx).await;

        assert_eq!(values, vec![0.0, 1.0, 2.0]);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[tokio::test]
    async fn should_negate_scalar() {
        let mut ctx = QueryContext::for_tests();
        let mut op = UnaryNegationScalar::new(Box::new(ConstantScalar::new(3.0, range())));

        let values = scalar_values(&mut op, &mut ctx).await;

        assert_eq!(values, vec![-3.0, -3.0, -3.0]);
    }

    #[rstest]
    #[case::single_series(vec![points(&[(0, 1.0), (1000, 2.0)])], vec![Some(1.0), Some(2.0), None])]
    #[case::two_series(
        vec![points(&[(0, 1.0)]), points(&[(0, 5.0), (2000, 7.0)])],
        vec![None, None, Some(7.0)]
    )]
    #[case::no_series(vec![], vec![None, None, None])]
    #[tokio::test]
    async fn should_convert_vector_to_scalar(#[case] series: Vec<Vec<FPoint>>, #[case] expected: Vec<Option<f64>>) {
        // given
        let mut ctx = QueryContext::for_tests();
        let input = FixedSeries::boxed(
            series
                .into_iter()
                .enumerate()
                .map(|(i, p)| (Labels::from_pairs(&[("i", i.to_string().as_str())]), p))
                .collect(),
        );
        let mut op = ScalarFunction::new(input, range());

        // when
        let values = scalar_values(&mut op, &mut ctx).await;

        // then
        let values: Vec<Option<f64>> = values.into_iter().map(|v| (!v.is_nan()).then_some(v)).collect();
        assert_eq!(values, expected);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[tokio::test]
    async fn should_wrap_scalar_as_unlabelled_series() {
        let mut ctx = QueryContext::for_tests();
        let mut op = VectorFunction::new(Box::new(ConstantScalar::new(4.0, range())));

        let result = collect_floats(&mut op, &mut ctx).await;

        assert_eq!(result, vec![(Labels::empty(), vec![(0, 4.0), (1000, 4.0), (2000, 4.0)])]);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }
}
