//! Built-in PromQL functions.
//!
//! The registry is a static table keyed by function name. The planner
//! resolves each call once and wires the definition into an operator; the
//! operators then call the per-series kernels defined in the submodules.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::annotations::Annotations;
use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::histogram::FloatHistogram;
use crate::time_range::QueryTimeRange;
use crate::types::{InstantVectorSeriesData, RangeVectorStepData, ScalarData};

pub(crate) mod date;
pub(crate) mod histograms;
pub(crate) mod instant;
pub(crate) mod labels;
pub(crate) mod math;
pub(crate) mod range;

/// Transforms the data of one series. Receives the series' points and the
/// per-step values of the function's scalar arguments; must release anything
/// it does not return.
pub(crate) type SeriesDataFn = fn(
    InstantVectorSeriesData,
    &[ScalarData],
    &QueryTimeRange,
    &mut QueryContext,
) -> EvalResult<InstantVectorSeriesData>;

/// Where the vector argument sits among a function's arguments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Signature {
    /// Index of the vector argument.
    pub(crate) vector_index: usize,
    /// Number of scalar arguments.
    pub(crate) scalars: usize,
    /// Value of the last scalar argument when the call omits it.
    pub(crate) default_last_scalar: Option<f64>,
    /// The vector argument may be omitted, standing for `vector(time())`.
    pub(crate) vector_optional: bool,
}

impl Signature {
    const VECTOR: Signature = Signature {
        vector_index: 0,
        scalars: 0,
        default_last_scalar: None,
        vector_optional: false,
    };

    const fn vector_then_scalars(scalars: usize) -> Signature {
        Signature {
            vector_index: 0,
            scalars,
            default_last_scalar: None,
            vector_optional: false,
        }
    }

    const fn scalars_then_vector(scalars: usize) -> Signature {
        Signature {
            vector_index: scalars,
            scalars,
            default_last_scalar: None,
            vector_optional: false,
        }
    }

    const OPTIONAL_VECTOR: Signature = Signature {
        vector_index: 0,
        scalars: 0,
        default_last_scalar: None,
        vector_optional: true,
    };
}

/// A function applied point-wise to an instant vector.
pub(crate) struct InstantVectorFunction {
    pub(crate) series_data: SeriesDataFn,
    pub(crate) drops_metric_name: bool,
    pub(crate) signature: Signature,
}

impl InstantVectorFunction {
    /// Dropping `__name__` may make two series identical.
    pub(crate) fn needs_series_deduplication(&self) -> bool {
        self.drops_metric_name
    }
}

/// Result of a range function for one step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepValue {
    None,
    Float(f64),
    Histogram(FloatHistogram),
}

/// Everything a range function may consult besides the window itself.
pub(crate) struct StepEnv<'a> {
    /// Values of the scalar arguments at this step.
    pub(crate) scalar_args: &'a [f64],
    pub(crate) range_ms: i64,
    pub(crate) metric_name: Option<&'a str>,
    pub(crate) position: &'a str,
    pub(crate) annotations: &'a mut Annotations,
}

pub(crate) type RangeStepFn = fn(&RangeVectorStepData<'_>, &mut StepEnv<'_>) -> EvalResult<StepValue>;

/// Checks a whole series after all its steps were evaluated. One instance is
/// created per query, so it may remember what it already reported.
pub(crate) trait SeriesValidator: Send {
    fn validate(
        &mut self,
        metric_name: Option<&str>,
        saw_floats: bool,
        position: &str,
        annotations: &mut Annotations,
    );
}

pub(crate) type ValidatorFactory = fn() -> Box<dyn SeriesValidator>;

/// A function reducing each window of a range vector to one value.
pub(crate) struct RangeVectorFunction {
    pub(crate) step: RangeStepFn,
    pub(crate) drops_metric_name: bool,
    pub(crate) validator_factory: Option<ValidatorFactory>,
    pub(crate) signature: Signature,
}

impl RangeVectorFunction {
    pub(crate) fn needs_series_deduplication(&self) -> bool {
        self.drops_metric_name
    }
}

/// Functions evaluated by dedicated operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpecialFunction {
    Absent,
    AbsentOverTime,
    Scalar,
    Vector,
    Time,
    Timestamp,
    HistogramQuantile,
    Sort,
    SortDesc,
    LabelReplace,
    LabelJoin,
}

pub(crate) enum FunctionDefinition {
    InstantVector(InstantVectorFunction),
    RangeVector(RangeVectorFunction),
    Special(SpecialFunction),
}

fn instant(series_data: SeriesDataFn, signature: Signature) -> FunctionDefinition {
    FunctionDefinition::InstantVector(InstantVectorFunction {
        series_data,
        drops_metric_name: true,
        signature,
    })
}

fn range(step: RangeStepFn, drops_metric_name: bool) -> FunctionDefinition {
    FunctionDefinition::RangeVector(RangeVectorFunction {
        step,
        drops_metric_name,
        validator_factory: None,
        signature: Signature::VECTOR,
    })
}

static FUNCTIONS: LazyLock<HashMap<&'static str, FunctionDefinition>> = LazyLock::new(|| {
    let mut functions = HashMap::new();

    // Mathematical functions
    functions.insert("abs", instant(instant::abs, Signature::VECTOR));
    functions.insert("ceil", instant(instant::ceil, Signature::VECTOR));
    functions.insert("floor", instant(instant::floor, Signature::VECTOR));
    functions.insert("exp", instant(instant::exp, Signature::VECTOR));
    functions.insert("sqrt", instant(instant::sqrt, Signature::VECTOR));
    functions.insert("ln", instant(instant::ln, Signature::VECTOR));
    functions.insert("log2", instant(instant::log2, Signature::VECTOR));
    functions.insert("log10", instant(instant::log10, Signature::VECTOR));
    functions.insert("sin", instant(instant::sin, Signature::VECTOR));
    functions.insert("cos", instant(instant::cos, Signature::VECTOR));
    functions.insert("tan", instant(instant::tan, Signature::VECTOR));
    functions.insert("asin", instant(instant::asin, Signature::VECTOR));
    functions.insert("acos", instant(instant::acos, Signature::VECTOR));
    functions.insert("atan", instant(instant::atan, Signature::VECTOR));
    functions.insert("sinh", instant(instant::sinh, Signature::VECTOR));
    functions.insert("cosh", instant(instant::cosh, Signature::VECTOR));
    functions.insert("tanh", instant(instant::tanh, Signature::VECTOR));
    functions.insert("asinh", instant(instant::asinh, Signature::VECTOR));
    functions.insert("acosh", instant(instant::acosh, Signature::VECTOR));
    functions.insert("atanh", instant(instant::atanh, Signature::VECTOR));
    functions.insert("deg", instant(instant::deg, Signature::VECTOR));
    functions.insert("rad", instant(instant::rad, Signature::VECTOR));
    functions.insert("sgn", instant(instant::sgn, Signature::VECTOR));

    functions.insert("clamp", instant(instant::clamp, Signature::vector_then_scalars(2)));
    functions.insert("clamp_min", instant(instant::clamp_min, Signature::vector_then_scalars(1)));
    functions.insert("clamp_max", instant(instant::clamp_max, Signature::vector_then_scalars(1)));
    functions.insert(
        "round",
        instant(
            instant::round,
            Signature {
                default_last_scalar: Some(1.0),
                ..Signature::vector_then_scalars(1)
            },
        ),
    );

    // Date functions
    functions.insert("minute", instant(date::minute, Signature::OPTIONAL_VECTOR));
    functions.insert("hour", instant(date::hour, Signature::OPTIONAL_VECTOR));
    functions.insert("day_of_week", instant(date::day_of_week, Signature::OPTIONAL_VECTOR));
    functions.insert("day_of_month", instant(date::day_of_month, Signature::OPTIONAL_VECTOR));
    functions.insert("day_of_year", instant(date::day_of_year, Signature::OPTIONAL_VECTOR));
    functions.insert("days_in_month", instant(date::days_in_month, Signature::OPTIONAL_VECTOR));
    functions.insert("month", instant(date::month, Signature::OPTIONAL_VECTOR));
    functions.insert("year", instant(date::year, Signature::OPTIONAL_VECTOR));

    // Native histogram functions
    functions.insert("histogram_count", instant(histograms::histogram_count, Signature::VECTOR));
    functions.insert("histogram_sum", instant(histograms::histogram_sum, Signature::VECTOR));
    functions.insert("histogram_avg", instant(histograms::histogram_avg, Signature::VECTOR));
    functions.insert("histogram_stddev", instant(histograms::histogram_stddev, Signature::VECTOR));
    functions.insert("histogram_stdvar", instant(histograms::histogram_stdvar, Signature::VECTOR));
    functions.insert(
        "histogram_fraction",
        instant(histograms::histogram_fraction, Signature::scalars_then_vector(2)),
    );

    // Range functions
    functions.insert(
        "rate",
        FunctionDefinition::RangeVector(RangeVectorFunction {
            step: range::rate,
            drops_metric_name: true,
            validator_factory: Some(range::counter_name_validator),
            signature: Signature::VECTOR,
        }),
    );
    functions.insert(
        "increase",
        FunctionDefinition::RangeVector(RangeVectorFunction {
            step: range::increase,
            drops_metric_name: true,
            validator_factory: Some(range::counter_name_validator),
            signature: Signature::VECTOR,
        }),
    );
    functions.insert("delta", range(range::delta, true));
    functions.insert("irate", range(range::irate, true));
    functions.insert("idelta", range(range::idelta, true));
    functions.insert("changes", range(range::changes, true));
    functions.insert("resets", range(range::resets, true));
    functions.insert("deriv", range(range::deriv, true));
    functions.insert(
        "predict_linear",
        FunctionDefinition::RangeVector(RangeVectorFunction {
            step: range::predict_linear,
            drops_metric_name: true,
            validator_factory: None,
            signature: Signature::vector_then_scalars(1),
        }),
    );
    functions.insert("sum_over_time", range(range::sum_over_time, true));
    functions.insert("avg_over_time", range(range::avg_over_time, true));
    functions.insert("min_over_time", range(range::min_over_time, true));
    functions.insert("max_over_time", range(range::max_over_time, true));
    functions.insert("count_over_time", range(range::count_over_time, true));
    functions.insert("stddev_over_time", range(range::stddev_over_time, true));
    functions.insert("stdvar_over_time", range(range::stdvar_over_time, true));
    functions.insert("last_over_time", range(range::last_over_time, false));
    functions.insert("present_over_time", range(range::present_over_time, true));
    functions.insert("mad_over_time", range(range::mad_over_time, true));
    functions.insert(
        "quantile_over_time",
        FunctionDefinition::RangeVector(RangeVectorFunction {
            step: range::quantile_over_time,
            drops_metric_name: true,
            validator_factory: None,
            signature: Signature::scalars_then_vector(1),
        }),
    );

    // Dedicated operators
    functions.insert("absent", FunctionDefinition::Special(SpecialFunction::Absent));
    functions.insert(
        "absent_over_time",
        FunctionDefinition::Special(SpecialFunction::AbsentOverTime),
    );
    functions.insert("scalar", FunctionDefinition::Special(SpecialFunction::Scalar));
    functions.insert("vector", FunctionDefinition::Special(SpecialFunction::Vector));
    functions.insert("time", FunctionDefinition::Special(SpecialFunction::Time));
    functions.insert("timestamp", FunctionDefinition::Special(SpecialFunction::Timestamp));
    functions.insert(
        "histogram_quantile",
        FunctionDefinition::Special(SpecialFunction::HistogramQuantile),
    );
    functions.insert("sort", FunctionDefinition::Special(SpecialFunction::Sort));
    functions.insert("sort_desc", FunctionDefinition::Special(SpecialFunction::SortDesc));
    functions.insert("label_replace", FunctionDefinition::Special(SpecialFunction::LabelReplace));
    functions.insert("label_join", FunctionDefinition::Special(SpecialFunction::LabelJoin));

    functions
});

/// Looks up a built-in function by name.
pub(crate) fn lookup(name: &str) -> Option<&'static FunctionDefinition> {
    FUNCTIONS.get(name)
}
