use std::cmp::Ordering;

use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::operators::{InstantVectorOperator, materialize};
use crate::types::{InstantVectorSeriesData, SeriesMetadata};

/// `sort(v)` and `sort_desc(v)`: orders the series of an instant query by
/// value. NaN and histogram-only series go last either way. Range queries
/// pass through in input order.
pub(crate) struct Sort {
    inner: Box<dyn InstantVectorOperator>,
    descending: bool,
    is_instant: bool,
    output: Vec<InstantVectorSeriesData>,
    next: usize,
}

impl Sort {
    pub(crate) fn new(inner: Box<dyn InstantVectorOperator>, descending: bool, is_instant: bool) -> Self {
        Self {
            inner,
            descending,
            is_instant,
            output: Vec::new(),
            next: 0,
        }
    }

    fn compare(&self, a: f64, b: f64) -> Ordering {
        match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if self.descending => b.total_cmp(&a),
            (false, false) => a.total_cmp(&b),
        }
    }
}

#[async_trait]
impl InstantVectorOperator for Sort {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        if !self.is_instant {
            return self.inner.series_metadata(ctx).await;
        }
        let (mut metadata, data) = materialize(self.inner.as_mut(), ctx).await?;
        let value = |d: &InstantVectorSeriesData| d.floats.first().map(|p| p.f).unwrap_or(f64::NAN);
        let mut paired: Vec<(SeriesMetadata, InstantVectorSeriesData)> = metadata.drain(..).zip(data).collect();
        // stable, so equal values keep their input order
        paired.sort_by(|a, b| self.compare(value(&a.1), value(&b.1)));
        for (m, d) in paired {
            metadata.push(m);
            self.output.push(d);
        }
        Ok(metadata)
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        if !self.is_instant {
            return self.inner.next_series(ctx).await;
        }
        ctx.check_cancelled()?;
        let Some(slot) = self.output.get_mut(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        Ok(Some(std::mem::take(slot)))
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        for data in self.output.drain(..) {
            data.release(&mut ctx.memory);
        }
        self.inner.close(ctx);
    }
}
