use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::operators::ScalarOperator;
use crate::operators::binary::BinaryOp;
use crate::types::ScalarData;

/// A binary operation between two scalars. Comparisons always yield 0 or 1;
/// the parser only accepts them with `bool`.
pub(crate) struct ScalarScalarBinary {
    left: Box<dyn ScalarOperator>,
    right: Box<dyn ScalarOperator>,
    op: BinaryOp,
}

impl ScalarScalarBinary {
    pub(crate) fn new(left: Box<dyn ScalarOperator>, right: Box<dyn ScalarOperator>, op: BinaryOp) -> Self {
        Self { left, right, op }
    }
}

#[async_trait]
impl ScalarOperator for ScalarScalarBinary {
    async fn values(&mut self, ctx: &mut QueryContext) -> EvalResult<ScalarData> {
        let mut left = self.left.values(ctx).await?;
        let right = match self.right.values(ctx).await {
            Ok(r) => r,
            Err(e) => {
                left.release(&mut ctx.memory);
                return Err(e);
            }
        };
        for (l, r) in left.samples.iter_mut().zip(&right.samples) {
            l.f = if self.op.is_comparison() {
                if self.op.compare(l.f, r.f) { 1.0 } else { 0.0 }
            } else {
                self.op.arithmetic(l.f, r.f)
            };
        }
        right.release(&mut ctx.memory);
        Ok(left)
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        self.left.close(ctx);
        self.right.close(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::scalars::{ConstantScalar, TimeScalar};
    use crate::time_range::QueryTimeRange;

    #[tokio::test]
    async fn should_combine_step_by_step() {
        // given: time() ^ 2 over three steps
        let mut ctx = QueryContext::for_tests();
        let range = QueryTimeRange::new_range(1000, 3000, 1000).unwrap();
        let mut op = ScalarScalarBinary::new(
            Box::new(TimeScalar::new(range)),
            Box::new(ConstantScalar::new(2.0, range)),
            BinaryOp::Pow,
        );

        // when
        let data = op.values(&mut ctx).await.unwrap();

        // then
        let values: Vec<f64> = data.samples.iter().map(|p| p.f).collect();
        assert_eq!(values, vec![1.0, 4.0, 9.0]);
        data.release(&mut ctx.memory);
        op.close(&mut ctx);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[tokio::test]
    async fn should_yield_zero_or_one_for_comparisons() {
        let mut ctx = QueryContext::for_tests();
        let range = QueryTimeRange::new_instant(0);
        let mut op = ScalarScalarBinary::new(
            Box::new(ConstantScalar::new(1.0, range)),
            Box::new(ConstantScalar::new(2.0, range)),
            BinaryOp::Lt,
        );

        let data = op.values(&mut ctx).await.unwrap();

        assert_eq!(data.samples[0].f, 1.0);
        data.release(&mut ctx.memory);
    }
}
