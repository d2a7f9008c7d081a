//! Non-fatal warnings and informational notices collected during a query.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnnotationKind {
    Warning,
    Info,
}

/// A warning or notice attached to the part of the expression that raised it.
///
/// `position` is the rendered source text of that sub-expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Annotation {
    pub kind: AnnotationKind,
    pub message: String,
    pub position: String,
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            AnnotationKind::Warning => "PromQL warning",
            AnnotationKind::Info => "PromQL info",
        };
        write!(f, "{}: {} ({})", kind, self.message, self.position)
    }
}

/// Insertion-ordered annotations of one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotations {
    items: Vec<Annotation>,
}

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, annotation: Annotation) {
        tracing::debug!(kind = ?annotation.kind, message = %annotation.message, "annotation emitted");
        self.items.push(annotation);
    }

    /// Adds `annotation` unless an identical one was already recorded.
    pub fn add_if_absent(&mut self, annotation: Annotation) {
        if !self.items.contains(&annotation) {
            self.add(annotation);
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Annotation> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Annotation> {
        self.items.iter().filter(|a| a.kind == AnnotationKind::Warning)
    }

    pub fn infos(&self) -> impl Iterator<Item = &Annotation> {
        self.items.iter().filter(|a| a.kind == AnnotationKind::Info)
    }

    pub fn into_vec(self) -> Vec<Annotation> {
        self.items
    }
}

fn warning(message: String, position: &str) -> Annotation {
    Annotation {
        kind: AnnotationKind::Warning,
        message,
        position: position.to_string(),
    }
}

fn info(message: String, position: &str) -> Annotation {
    Annotation {
        kind: AnnotationKind::Info,
        message,
        position: position.to_string(),
    }
}

fn quoted(metric_name: Option<&str>) -> String {
    format!("{:?}", metric_name.unwrap_or_default())
}

pub(crate) fn possible_non_counter_info(metric_name: Option<&str>, position: &str) -> Annotation {
    info(
        format!(
            "metric might not be a counter, name does not end in _total/_sum/_count/_bucket: {}",
            quoted(metric_name)
        ),
        position,
    )
}

pub(crate) fn mixed_floats_histograms_warning(metric_name: Option<&str>, position: &str) -> Annotation {
    warning(
        format!(
            "encountered a mix of histograms and floats for metric name {}",
            quoted(metric_name)
        ),
        position,
    )
}

pub(crate) fn mixed_floats_histograms_aggregation_warning(position: &str) -> Annotation {
    warning(
        "encountered a mix of histograms and floats for aggregation".to_string(),
        position,
    )
}

pub(crate) fn mixed_exponential_custom_histograms_warning(
    metric_name: Option<&str>,
    position: &str,
) -> Annotation {
    warning(
        format!(
            "vector contains a mix of histograms with exponential and custom buckets schemas for metric name {}",
            quoted(metric_name)
        ),
        position,
    )
}

pub(crate) fn incompatible_custom_buckets_warning(metric_name: Option<&str>, position: &str) -> Annotation {
    warning(
        format!(
            "vector contains histograms with incompatible custom buckets for metric name {}",
            quoted(metric_name)
        ),
        position,
    )
}

pub(crate) fn mixed_classic_native_histograms_warning(metric_name: Option<&str>, position: &str) -> Annotation {
    warning(
        format!(
            "vector contains a mix of classic and native histograms for metric name {}",
            quoted(metric_name)
        ),
        position,
    )
}

pub(crate) fn invalid_quantile_warning(q: f64, position: &str) -> Annotation {
    warning(
        format!("quantile value should be between 0 and 1, got {}", q),
        position,
    )
}

pub(crate) fn invalid_ratio_warning(ratio: f64, capped: f64, position: &str) -> Annotation {
    warning(
        format!(
            "ratio value should be between -1 and 1, got {}, capping to {}",
            ratio, capped
        ),
        position,
    )
}

pub(crate) fn bad_bucket_label_warning(metric_name: Option<&str>, label: &str, position: &str) -> Annotation {
    warning(
        format!(
            "bucket label \"le\" is missing or has a malformed value of {:?} for metric name {}",
            label,
            quoted(metric_name)
        ),
        position,
    )
}

pub(crate) fn forced_monotonicity_info(metric_name: Option<&str>, position: &str) -> Annotation {
    info(
        format!(
            "input to histogram_quantile needed to be fixed for monotonicity for metric name {}",
            quoted(metric_name)
        ),
        position,
    )
}

pub(crate) fn histogram_ignored_in_aggregation_info(aggregation: &str, position: &str) -> Annotation {
    info(
        format!("ignored histogram in {} aggregation", aggregation),
        position,
    )
}

pub(crate) fn incompatible_types_in_binary_operation_info(
    lhs: &str,
    operator: &str,
    rhs: &str,
    position: &str,
) -> Annotation {
    info(
        format!(
            "incompatible sample types encountered for binary operator {:?}: {} {} {}",
            operator, lhs, operator, rhs
        ),
        position,
    )
}
