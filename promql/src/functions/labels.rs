//! Functions that rewrite series labels without touching their data.

use std::sync::LazyLock;

use regex::Regex;

use crate::context::QueryContext;
use crate::error::{EvalResult, EvaluationError};
use crate::types::{SeriesMetadata, replace_labels};

static LABEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-zA-Z_][a-zA-Z0-9_]*$").expect("valid label name pattern"));

pub(crate) fn is_valid_label_name(name: &str) -> bool {
    LABEL_NAME.is_match(name)
}

/// Rewrites the labels of every series in place, charging size changes to
/// the query's tracker.
pub(crate) trait SeriesMetadataFunction: Send + Sync {
    fn apply(&self, series: &mut [SeriesMetadata], ctx: &mut QueryContext) -> EvalResult<()>;
}

/// Removes `__name__`.
pub(crate) struct DropMetricName;

impl SeriesMetadataFunction for DropMetricName {
    fn apply(&self, series: &mut [SeriesMetadata], ctx: &mut QueryContext) -> EvalResult<()> {
        for metadata in series {
            if metadata.labels.metric_name().is_some() {
                let labels = metadata.labels.without_metric_name();
                replace_labels(metadata, labels, &mut ctx.memory)?;
            }
        }
        Ok(())
    }
}

/// `label_replace(v, dst, replacement, src, regex)`.
pub(crate) struct LabelReplace {
    dst: String,
    replacement: String,
    src: String,
    regex: Regex,
}

impl LabelReplace {
    pub(crate) fn new(dst: &str, replacement: &str, src: &str, regex: &str) -> EvalResult<Self> {
        let anchored = Regex::new(&format!("^(?s:{})$", regex)).map_err(|e| {
            EvaluationError::FunctionEvaluation(format!(
                "invalid regular expression in label_replace(): {}: {}",
                regex, e
            ))
        })?;
        if !is_valid_label_name(dst) {
            return Err(EvaluationError::FunctionEvaluation(format!(
                "invalid destination label name in label_replace(): {}",
                dst
            )));
        }
        Ok(Self {
            dst: dst.to_string(),
            replacement: replacement.to_string(),
            src: src.to_string(),
            regex: anchored,
        })
    }
}

impl SeriesMetadataFunction for LabelReplace {
    fn apply(&self, series: &mut [SeriesMetadata], ctx: &mut QueryContext) -> EvalResult<()> {
        for metadata in series {
            let value = metadata.labels.get(&self.src).unwrap_or("");
            let Some(captures) = self.regex.captures(value) else {
                continue;
            };
            let mut replaced = String::new();
            captures.expand(&self.replacement, &mut replaced);
            let labels = metadata.labels.with(&self.dst, &replaced);
            replace_labels(metadata, labels, &mut ctx.memory)?;
        }
        Ok(())
    }
}

/// `label_join(v, dst, separator, src...)`.
pub(crate) struct LabelJoin {
    dst: String,
    separator: String,
    src: Vec<String>,
}

impl LabelJoin {
    pub(crate) fn new(dst: &str, separator: &str, src: Vec<String>) -> EvalResult<Self> {
        if !is_valid_label_name(dst) {
            return Err(EvaluationError::FunctionEvaluation(format!(
                "invalid destination label name in label_join(): {}",
                dst
            )));
        }
        if let Some(name) = src.iter().find(|name| !is_valid_label_name(name)) {
            return Err(EvaluationError::FunctionEvaluation(format!(
                "invalid source label name in label_join(): {}",
                name
            )));
        }
        Ok(Self {
            dst: dst.to_string(),
            separator: separator.to_string(),
            src,
        })
    }
}

impl SeriesMetadataFunction for LabelJoin {
    fn apply(&self, series: &mut [SeriesMetadata], ctx: &mut QueryContext) -> EvalResult<()> {
        for metadata in series {
            let joined = self
                .src
                .iter()
                .map(|name| metadata.labels.get(name).unwrap_or(""))
                .collect::<Vec<_>>()
                .join(&self.separator);
            let labels = metadata.labels.with(&self.dst, &joined);
            replace_labels(metadata, labels, &mut ctx.memory)?;
        }
        Ok(())
    }
}
