//! Random access over the series of a streaming operator.
//!
//! Binary operations consume their operands in an order dictated by the
//! output, not the input. The buffer reads the input forward, holding on to
//! series that are needed later and releasing those that are never needed.

use std::collections::HashMap;

use crate::context::QueryContext;
use crate::error::{EvalResult, EvaluationError};
use crate::operators::InstantVectorOperator;
use crate::types::{InstantVectorSeriesData, get_vec};

/// Copies `data` into freshly tracked buffers.
pub(crate) fn clone_series(
    data: &InstantVectorSeriesData,
    ctx: &mut QueryContext,
) -> EvalResult<InstantVectorSeriesData> {
    let mut floats = get_vec(data.floats.len(), &mut ctx.memory)?;
    floats.extend_from_slice(&data.floats);
    let mut histograms = match get_vec(data.histograms.len(), &mut ctx.memory) {
        Ok(h) => h,
        Err(e) => {
            crate::types::put_vec(floats, &mut ctx.memory);
            return Err(e);
        }
    };
    histograms.extend(data.histograms.iter().cloned());
    Ok(InstantVectorSeriesData { floats, histograms })
}

pub(crate) struct SeriesBuffer {
    source: Box<dyn InstantVectorOperator>,
    series_count: usize,
    next_to_read: usize,
    /// Input series never asked for are discarded as they are read.
    needed: Vec<bool>,
    buffered: HashMap<usize, InstantVectorSeriesData>,
}

impl SeriesBuffer {
    pub(crate) fn new(source: Box<dyn InstantVectorOperator>, needed: Vec<bool>) -> Self {
        Self {
            source,
            series_count: needed.len(),
            next_to_read: 0,
            needed,
            buffered: HashMap::new(),
        }
    }

    /// Returns the data of input series `index`. With `keep`, a copy stays
    /// buffered for a later call.
    pub(crate) async fn get(
        &mut self,
        index: usize,
        keep: bool,
        ctx: &mut QueryContext,
    ) -> EvalResult<InstantVectorSeriesData> {
        while self.next_to_read <= index {
            let Some(data) = self.source.next_series(ctx).await? else {
                return Err(EvaluationError::Internal(format!(
                    "expected {} series but input ended after {}",
                    self.series_count, self.next_to_read
                )));
            };
            let read = self.next_to_read;
            self.next_to_read += 1;
            if read == index || self.needed.get(read).copied().unwrap_or(false) {
                self.buffered.insert(read, data);
            } else {
                data.release(&mut ctx.memory);
            }
        }
        let Some(data) = self.buffered.remove(&index) else {
            return Err(EvaluationError::Internal(format!(
                "series {} was requested after being consumed",
                index
            )));
        };
        if keep {
            let copy = match clone_series(&data, ctx) {
                Ok(copy) => copy,
                Err(e) => {
                    data.release(&mut ctx.memory);
                    return Err(e);
                }
            };
            self.buffered.insert(index, data);
            return Ok(copy);
        }
        Ok(data)
    }

    pub(crate) fn close(&mut self, ctx: &mut QueryContext) {
        for (_, data) in self.buffered.drain() {
            data.release(&mut ctx.memory);
        }
        self.source.close(ctx);
    }
}
