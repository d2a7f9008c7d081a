//! Binary operators: arithmetic, comparison and set operations between
//! vectors and scalars.

use promql_parser::parser::LabelModifier;
use promql_parser::parser::token::{
    T_ADD, T_ATAN2, T_DIV, T_EQLC, T_GTE, T_GTR, T_LAND, T_LOR, T_LSS, T_LTE, T_LUNLESS, T_MOD, T_MUL, T_NEQ,
    T_POW, T_SUB, TokenType,
};

use crate::annotations::{
    Annotations, incompatible_types_in_binary_operation_info, mixed_exponential_custom_histograms_warning,
    incompatible_custom_buckets_warning,
};
use crate::error::{EvalResult, EvaluationError};
use crate::functions::StepValue;
use crate::histogram::{FloatHistogram, HistogramError};
use crate::memory::MemoryConsumptionTracker;
use crate::model::{FPoint, HPoint, Labels};
use crate::types::{InstantVectorSeriesData, push_tracked};

pub(crate) mod scalar_scalar;
pub(crate) mod set_operation;
pub(crate) mod vector_scalar;
pub(crate) mod vector_vector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Atan2,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Unless,
}

impl BinaryOp {
    pub(crate) fn from_token(op: TokenType) -> EvalResult<Self> {
        let op = match op.id() {
            T_ADD => BinaryOp::Add,
            T_SUB => BinaryOp::Sub,
            T_MUL => BinaryOp::Mul,
            T_DIV => BinaryOp::Div,
            T_MOD => BinaryOp::Mod,
            T_POW => BinaryOp::Pow,
            T_ATAN2 => BinaryOp::Atan2,
            T_EQLC => BinaryOp::Eq,
            T_NEQ => BinaryOp::Ne,
            T_GTR => BinaryOp::Gt,
            T_LSS => BinaryOp::Lt,
            T_GTE => BinaryOp::Ge,
            T_LTE => BinaryOp::Le,
            T_LAND => BinaryOp::And,
            T_LOR => BinaryOp::Or,
            T_LUNLESS => BinaryOp::Unless,
            _ => {
                return Err(EvaluationError::Unsupported(format!("binary operator {:?}", op)));
            }
        };
        Ok(op)
    }

    pub(crate) fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Atan2 => "atan2",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Lt => "<",
            BinaryOp::Ge => ">=",
            BinaryOp::Le => "<=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Unless => "unless",
        }
    }

    pub(crate) fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le
        )
    }

    pub(crate) fn is_set_operator(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Unless)
    }

    /// Arithmetic changes what the series measures, so its name goes.
    pub(crate) fn drops_metric_name(self) -> bool {
        !self.is_comparison() && !self.is_set_operator()
    }

    pub(crate) fn arithmetic(self, l: f64, r: f64) -> f64 {
        match self {
            BinaryOp::Add => l + r,
            BinaryOp::Sub => l - r,
            BinaryOp::Mul => l * r,
            BinaryOp::Div => l / r,
            BinaryOp::Mod => l % r,
            BinaryOp::Pow => l.powf(r),
            BinaryOp::Atan2 => l.atan2(r),
            _ => f64::NAN,
        }
    }

    pub(crate) fn compare(self, l: f64, r: f64) -> bool {
        match self {
            BinaryOp::Eq => l == r,
            BinaryOp::Ne => l != r,
            BinaryOp::Gt => l > r,
            BinaryOp::Lt => l < r,
            BinaryOp::Ge => l >= r,
            BinaryOp::Le => l <= r,
            _ => false,
        }
    }
}

/// One side of a binary operation at a single step.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Operand<'a> {
    Float(f64),
    Histogram(&'a FloatHistogram),
}

impl Operand<'_> {
    fn type_name(&self) -> &'static str {
        match self {
            Operand::Float(_) => "float",
            Operand::Histogram(_) => "histogram",
        }
    }

    fn to_value(self) -> StepValue {
        match self {
            Operand::Float(f) => StepValue::Float(f),
            Operand::Histogram(h) => StepValue::Histogram(h.clone()),
        }
    }
}

fn bool_value(b: bool) -> StepValue {
    StepValue::Float(if b { 1.0 } else { 0.0 })
}

/// Combines two samples. Comparisons without `bool` filter, keeping the left
/// operand; incompatible sample types drop the point with an info notice.
pub(crate) fn evaluate_pair(
    op: BinaryOp,
    lhs: Operand<'_>,
    rhs: Operand<'_>,
    return_bool: bool,
    position: &str,
    annotations: &mut Annotations,
) -> StepValue {
    let incompatible = |annotations: &mut Annotations| {
        annotations.add_if_absent(incompatible_types_in_binary_operation_info(
            lhs.type_name(),
            op.symbol(),
            rhs.type_name(),
            position,
        ));
        StepValue::None
    };
    match (lhs, rhs) {
        (Operand::Float(l), Operand::Float(r)) if op.is_comparison() => {
            let keep = op.compare(l, r);
            if return_bool {
                bool_value(keep)
            } else if keep {
                StepValue::Float(l)
            } else {
                StepValue::None
            }
        }
        (Operand::Float(l), Operand::Float(r)) => StepValue::Float(op.arithmetic(l, r)),
        (Operand::Histogram(l), Operand::Histogram(r)) => match op {
            BinaryOp::Add | BinaryOp::Sub => {
                let mut result = l.clone();
                let combined = if op == BinaryOp::Add {
                    result.add(r)
                } else {
                    result.sub(r)
                };
                match combined {
                    Ok(()) => {
                        result.compact();
                        StepValue::Histogram(result)
                    }
                    Err(e) => {
                        annotations.add_if_absent(histogram_warning(e, position));
                        StepValue::None
                    }
                }
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let keep = (l == r) == (op == BinaryOp::Eq);
                if return_bool {
                    bool_value(keep)
                } else if keep {
                    lhs.to_value()
                } else {
                    StepValue::None
                }
            }
            _ => incompatible(annotations),
        },
        (Operand::Histogram(h), Operand::Float(f)) | (Operand::Float(f), Operand::Histogram(h))
            if op == BinaryOp::Mul =>
        {
            let mut result = h.clone();
            result.mul(f);
            StepValue::Histogram(result)
        }
        (Operand::Histogram(h), Operand::Float(f)) if op == BinaryOp::Div => {
            let mut result = h.clone();
            result.div(f);
            StepValue::Histogram(result)
        }
        _ => incompatible(annotations),
    }
}

fn histogram_warning(e: HistogramError, position: &str) -> crate::annotations::Annotation {
    match e {
        HistogramError::MixedExponentialAndCustom => mixed_exponential_custom_histograms_warning(None, position),
        HistogramError::IncompatibleCustomBounds => incompatible_custom_buckets_warning(None, position),
    }
}

/// Labels two series must share to be matched.
///
/// - no modifier: every label but `__name__`
/// - `on(...)`: only the listed labels
/// - `ignoring(...)`: every label but the listed ones and `__name__`
pub(crate) fn match_key(labels: &Labels, matching: Option<&LabelModifier>) -> Labels {
    match matching {
        None => labels.without_metric_name(),
        Some(LabelModifier::Include(list)) => labels.keep_only(&list.labels),
        Some(LabelModifier::Exclude(list)) => labels.without(&list.labels).without_metric_name(),
    }
}

/// The points of a series in timestamp order, floats and histograms merged.
pub(crate) struct StepPoints<'a> {
    data: &'a InstantVectorSeriesData,
    next_float: usize,
    next_histogram: usize,
}

impl<'a> StepPoints<'a> {
    pub(crate) fn new(data: &'a InstantVectorSeriesData) -> Self {
        Self {
            data,
            next_float: 0,
            next_histogram: 0,
        }
    }
}

impl<'a> Iterator for StepPoints<'a> {
    type Item = (i64, Operand<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let float = self.data.floats.get(self.next_float);
        let histogram = self.data.histograms.get(self.next_histogram);
        match (float, histogram) {
            (Some(f), Some(h)) if h.t < f.t => {
                self.next_histogram += 1;
                Some((h.t, Operand::Histogram(&h.h)))
            }
            (Some(f), _) => {
                self.next_float += 1;
                Some((f.t, Operand::Float(f.f)))
            }
            (None, Some(h)) => {
                self.next_histogram += 1;
                Some((h.t, Operand::Histogram(&h.h)))
            }
            (None, None) => None,
        }
    }
}

pub(crate) fn push_step_value(
    data: &mut InstantVectorSeriesData,
    t: i64,
    value: StepValue,
    tracker: &mut MemoryConsumptionTracker,
) -> EvalResult<()> {
    match value {
        StepValue::None => Ok(()),
        StepValue::Float(f) => push_tracked(&mut data.floats, FPoint::new(t, f), tracker),
        StepValue::Histogram(h) => push_tracked(&mut data.histograms, HPoint::new(t, h), tracker),
    }
}
