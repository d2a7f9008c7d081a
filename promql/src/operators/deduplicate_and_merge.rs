//! Merges series whose labels collided after a label transformation.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::{EvalResult, EvaluationError};
use crate::model::{FPoint, HPoint, Labels};
use crate::operators::InstantVectorOperator;
use crate::operators::series_buffer::SeriesBuffer;
use crate::types::{
    InstantVectorSeriesData, SeriesMetadata, get_vec, put_series_metadata_vec, put_vec, release_vec,
};

pub(crate) const DUPLICATE_LABELSET_MESSAGE: &str = "vector cannot contain metrics with the same labelset";

enum Source {
    Inner(Box<dyn InstantVectorOperator>),
    Buffered(SeriesBuffer),
    Closed,
}

/// Passes series through unchanged unless two of them share a label set, in
/// which case each group of colliding series becomes one output series,
/// placed where the group first occurred. Two colliding series with a point
/// at the same timestamp fail the query.
pub(crate) struct DeduplicateAndMerge {
    source: Source,
    conflict_message: String,
    /// Input indices of each output series, present only when something
    /// collided.
    groups: Option<Vec<Vec<usize>>>,
    next_output: usize,
}

impl DeduplicateAndMerge {
    pub(crate) fn new(inner: Box<dyn InstantVectorOperator>) -> Self {
        Self::with_conflict_message(inner, DUPLICATE_LABELSET_MESSAGE)
    }

    pub(crate) fn with_conflict_message(inner: Box<dyn InstantVectorOperator>, message: &str) -> Self {
        Self {
            source: Source::Inner(inner),
            conflict_message: message.to_string(),
            groups: None,
            next_output: 0,
        }
    }

    fn conflict(&self) -> EvaluationError {
        EvaluationError::FunctionEvaluation(self.conflict_message.clone())
    }
}

/// Group input indices by label set, in order of first occurrence.
fn group_by_labels(metadata: &[SeriesMetadata]) -> Vec<Vec<usize>> {
    let mut positions: HashMap<&Labels, usize> = HashMap::with_capacity(metadata.len());
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, m) in metadata.iter().enumerate() {
        match positions.get(&m.labels) {
            Some(&g) => groups[g].push(i),
            None => {
                positions.insert(&m.labels, groups.len());
                groups.push(vec![i]);
            }
        }
    }
    groups
}

/// Merges the points of colliding series. Returns `None` on a timestamp
/// conflict.
pub(crate) fn merge_series(
    members: Vec<InstantVectorSeriesData>,
    ctx: &mut QueryContext,
) -> EvalResult<Option<InstantVectorSeriesData>> {
    let float_count = members.iter().map(|m| m.floats.len()).sum();
    let histogram_count = members.iter().map(|m| m.histograms.len()).sum();
    let mut floats: Vec<FPoint> = match get_vec(float_count, &mut ctx.memory) {
        Ok(v) => v,
        Err(e) => {
            members.into_iter().for_each(|m| m.release(&mut ctx.memory));
            return Err(e);
        }
    };
    let mut histograms: Vec<HPoint> = match get_vec(histogram_count, &mut ctx.memory) {
        Ok(v) => v,
        Err(e) => {
            put_vec(floats, &mut ctx.memory);
            members.into_iter().for_each(|m| m.release(&mut ctx.memory));
            return Err(e);
        }
    };
    for member in members {
        let InstantVectorSeriesData {
            floats: mut member_floats,
            histograms: mut member_histograms,
        } = member;
        floats.append(&mut member_floats);
        histograms.append(&mut member_histograms);
        put_vec(member_floats, &mut ctx.memory);
        put_vec(member_histograms, &mut ctx.memory);
    }
    floats.sort_by_key(|p| p.t);
    histograms.sort_by_key(|p| p.t);

    let float_conflict = floats.windows(2).any(|w| w[0].t == w[1].t);
    let histogram_conflict = histograms.windows(2).any(|w| w[0].t == w[1].t);
    let cross_conflict = {
        let (mut i, mut j) = (0, 0);
        let mut found = false;
        while i < floats.len() && j < histograms.len() {
            match floats[i].t.cmp(&histograms[j].t) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    found = true;
                    break;
                }
            }
        }
        found
    };
    let data = InstantVectorSeriesData { floats, histograms };
    if float_conflict || histogram_conflict || cross_conflict {
        data.release(&mut ctx.memory);
        return Ok(None);
    }
    Ok(Some(data))
}

#[async_trait]
impl InstantVectorOperator for DeduplicateAndMerge {
    async fn series_metadata(&mut self, ctx: &mut QueryContext) -> EvalResult<Vec<SeriesMetadata>> {
        let Source::Inner(inner) = &mut self.source else {
            return Err(EvaluationError::Internal("series metadata requested twice".to_string()));
        };
        let metadata = inner.series_metadata(ctx).await?;
        let groups = group_by_labels(&metadata);
        if groups.len() == metadata.len() {
            return Ok(metadata);
        }
        tracing::trace!(input = metadata.len(), output = groups.len(), "merging colliding series");

        let mut output = match get_vec(groups.len(), &mut ctx.memory) {
            Ok(v) => v,
            Err(e) => {
                put_series_metadata_vec(metadata, &mut ctx.memory);
                return Err(e);
            }
        };
        // slots move to the output one by one; labels of dropped duplicates are released below
        release_vec(&metadata, &mut ctx.memory);
        let input_count = metadata.len();
        let mut slots: Vec<Option<SeriesMetadata>> = metadata.into_iter().map(Some).collect();
        for group in &groups {
            for &i in &group[1..] {
                if let Some(duplicate) = slots[i].take() {
                    ctx.memory.release_labels(&duplicate.labels);
                }
            }
            if let Some(first) = slots[group[0]].take() {
                // capacity was reserved for every group
                output.push(first);
            }
        }

        let needed = vec![true; input_count];
        let Source::Inner(inner) = std::mem::replace(&mut self.source, Source::Closed) else {
            return Err(EvaluationError::Internal("source already taken".to_string()));
        };
        self.source = Source::Buffered(SeriesBuffer::new(inner, needed));
        self.groups = Some(groups);
        Ok(output)
    }

    async fn next_series(&mut self, ctx: &mut QueryContext) -> EvalResult<Option<InstantVectorSeriesData>> {
        let buffer = match &mut self.source {
            Source::Inner(inner) => return inner.next_series(ctx).await,
            Source::Buffered(buffer) => buffer,
            Source::Closed => return Ok(None),
        };
        let Some(groups) = &self.groups else {
            return Ok(None);
        };
        let Some(group) = groups.get(self.next_output) else {
            return Ok(None);
        };
        self.next_output += 1;
        if group.len() == 1 {
            return buffer.get(group[0], false, ctx).await.map(Some);
        }
        let mut members = Vec::with_capacity(group.len());
        for &i in group {
            match buffer.get(i, false, ctx).await {
                Ok(data) => members.push(data),
                Err(e) => {
                    members.into_iter().for_each(|m: InstantVectorSeriesData| m.release(&mut ctx.memory));
                    return Err(e);
                }
            }
        }
        match merge_series(members, ctx)? {
            Some(data) => Ok(Some(data)),
            None => Err(self.conflict()),
        }
    }

    fn close(&mut self, ctx: &mut QueryContext) {
        match std::mem::replace(&mut self.source, Source::Closed) {
            Source::Inner(mut inner) => inner.close(ctx),
            Source::Buffered(mut buffer) => buffer.close(ctx),
            Source::Closed => {}
        }
    }
}
