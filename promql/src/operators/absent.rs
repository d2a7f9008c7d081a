//! `absent(v)` and `absent_over_time(v[r])`.

use std::collections::HashSet;

use async_trait::async_trait;
use promql_parser::label::{METRIC_NAME, MatchOp, Matchers};

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::model::{FPoint, Label, Labels};
use crate::operators::{InstantVectorOperator, RangeVectorOperator};
use crate::time_range::QueryTimeRange;
use crate::types::{
    InstantVectorSeriesData, SeriesMetadata, append_series_metadata, get_filled_vec, get_vec, push_tracked,
    put_series_metadata_vec, put_vec,
};

/// Labels of the series `absent` reports: the equality matchers of the
/// selector, except `__name__` and names matched more than once.
pub(crate) fn absent_labels(matchers: &Matchers) -> Labels {
    let mut labels: Vec<Label> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for m in &matchers.matchers {
        if m.name == METRIC_NAME {
            continue;
        }
        labels.retain(|l| l.name != m.name);
        if matches!(m.op, MatchOp::Equal) && seen.insert(m.name.as_str()) {
            labels.push(Label::new(m.name.clone(), m.value.clone()));
        }
    }
    Labels::new(labels)
}

pub(crate) enum AbsentInput {
    Instant(Box<dyn InstantVectorOperator>),
    Range(Box<dyn RangeVectorOperator>),
}

/// Reports 1 at every step where its input has no point (or, for a range
/// input, no sample in the window). Produces at most one series.
pub(crate) struct Absent {
    input: AbsentInput,
    labels: Labels,
    time_range: QueryTimeRange,
    output: Option<InstantVectorSeriesData>,
}

impl Absent {
    pub(crate) fn new(input: AbsentInput, labels: Labels, time_range: QueryTimeRange) -> Self {
        Self {
            input,
            labels,
            time_range,
            output: None,
        }
    }

    async fn mark_present(&mut self, present: &mut [bool], ctx: &mut QueryContext) -> EvalResult<()> {
        match &mut self.input {
            AbsentInput::Instant(inner) => {
                let metadata = inner.series_metadata(ctx).await?;
                let count = metadata.len();
                put_series_metadata_vec(metadata, &mut ctx.memory);
                for _ in 0..count {
                    let Some(data) = inner.next_series(ctx).await? else {
                        break;
                    };
                    for t in data.floats.iter().map(|p| p.t).chain(data.histograms.iter().map(|p| p.t)) {
                        present[self.time_range.point_index(t)] = true;
                    }
                    data.release(&mut ctx.memory);
                }
            }
            AbsentInput::Range(inner) => {
                let metadata = inner.series_metadata(ctx).await?;
                put_series_metadata_vec(metadata, &mut ctx.memory);
                while inner.next_series(ctx).await? {
                    while let Some(step) = inner.next_step_samples(ctx)? {
                        if !step.floats.is_empty() || !step.histograms.is_empty() {
                            present[self.time_range.point_index(step.step_t)] = true;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InstantVectorOperator for Absent {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        let mut present: Vec<bool> = get_filled_vec(self.time_range.step_count, false, &mut ctx.memory)?;
        let marked = self.mark_present(&mut present, ctx).await;
        let result = marked.and_then(|()| {
            let mut data = InstantVectorSeriesData::default();
            for (i, _) in present.iter().enumerate().filter(|(_, p)| !**p) {
                if let Err(e) = push_tracked(
                    &mut data.floats,
                    FPoint::new(self.time_range.step_time(i), 1.0),
                    &mut ctx.memory,
                ) {
                    data.release(&mut ctx.memory);
                    return Err(e);
                }
            }
            Ok(data)
        });
        put_vec(present, &mut ctx.memory);
        let data = result?;

        let mut metadata = get_vec(1, &mut ctx.memory)?;
        if data.is_empty() {
            data.release(&mut ctx.memory);
            return Ok(metadata);
        }
        self.output = Some(data);
        append_series_metadata(&mut metadata, SeriesMetadata::new(self.labels.clone()), &mut ctx.memory)?;
        Ok(metadata)
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        ctx.check_cancelled()?;
        Ok(self.output.take())
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        if let Some(data) = self.output.take() {
            data.release(&mut ctx.memory);
        }
        match &mut self.input {
            AbsentInput::Instant(inner) => inner.close(ctx),
            AbsentInput::Range(inner) => inner.close(ctx),
        }
    }
}
