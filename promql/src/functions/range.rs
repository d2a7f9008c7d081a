//! Kernels reducing one window of a range vector to a single value.
//!
//! Every kernel sees the float and histogram samples of the window
//! separately, in timestamp order, and returns [`StepValue::None`] when the
//! window holds nothing it can use.

use std::collections::HashSet;

use crate::annotations::{
    Annotations, histogram_ignored_in_aggregation_info, incompatible_custom_buckets_warning,
    invalid_quantile_warning, mixed_exponential_custom_histograms_warning, mixed_floats_histograms_warning,
    possible_non_counter_info,
};
use crate::error::EvalResult;
use crate::functions::math::{avg_kahan, linear_regression, quantile, sum_kahan, variance_kahan};
use crate::functions::{SeriesValidator, StepEnv, StepValue};
use crate::histogram::{CounterResetHint, FloatHistogram, HistogramError};
use crate::model::{FPoint, HPoint};
use crate::ring_buffer::RingBufferView;
use crate::types::RangeVectorStepData;

fn histogram_error(err: HistogramError, env: &mut StepEnv<'_>) -> StepValue {
    let annotation = match err {
        HistogramError::MixedExponentialAndCustom => {
            mixed_exponential_custom_histograms_warning(env.metric_name, env.position)
        }
        HistogramError::IncompatibleCustomBounds => incompatible_custom_buckets_warning(env.metric_name, env.position),
    };
    env.annotations.add_if_absent(annotation);
    StepValue::None
}

enum Delta {
    Float(f64),
    Histogram(FloatHistogram),
}

/// `rate`, `increase` and `delta`: the change over the window, extrapolated
/// towards the window edges.
fn extrapolated_rate(
    step: &RangeVectorStepData<'_>,
    env: &mut StepEnv<'_>,
    is_counter: bool,
    is_rate: bool,
) -> StepValue {
    let (floats, histograms) = (step.floats, step.histograms);
    if !floats.is_empty() && !histograms.is_empty() {
        env.annotations
            .add_if_absent(mixed_floats_histograms_warning(env.metric_name, env.position));
        return StepValue::None;
    }

    let (first_t, last_t, samples, result) = if floats.len() >= 2 {
        let (Some(first), Some(last)) = (floats.first(), floats.last()) else {
            return StepValue::None;
        };
        let mut delta = last.f - first.f;
        if is_counter {
            let mut prev = first.f;
            for p in floats.iter().skip(1) {
                if p.f < prev {
                    delta += prev;
                }
                prev = p.f;
            }
        }
        (first.t, last.t, floats.len(), Delta::Float(delta))
    } else if histograms.len() >= 2 {
        let (Some(first), Some(last)) = (histograms.first(), histograms.last()) else {
            return StepValue::None;
        };
        match histogram_delta(histograms, is_counter) {
            Ok(h) => (first.t, last.t, histograms.len(), Delta::Histogram(h)),
            Err(e) => return histogram_error(e, env),
        }
    } else {
        return StepValue::None;
    };

    let range_seconds = env.range_ms as f64 / 1000.0;
    // the window includes the sample at `t - range`, one tick above `range_start`
    let range_start = step.range_start + 1;
    let mut duration_to_start = (first_t - range_start) as f64 / 1000.0;
    let mut duration_to_end = (step.range_end - last_t) as f64 / 1000.0;
    let sampled_interval = (last_t - first_t) as f64 / 1000.0;
    let average_between_samples = sampled_interval / (samples - 1) as f64;
    let threshold = average_between_samples * 1.1;

    if duration_to_start >= threshold {
        duration_to_start = average_between_samples / 2.0;
    }
    if is_counter
        && let Delta::Float(delta) = &result
        && *delta > 0.0
        && let Some(first) = floats.first()
        && first.f >= 0.0
    {
        // a counter cannot have been below zero before the first sample
        let duration_to_zero = sampled_interval * (first.f / *delta);
        if duration_to_zero < duration_to_start {
            duration_to_start = duration_to_zero;
        }
    }
    if duration_to_end >= threshold {
        duration_to_end = average_between_samples / 2.0;
    }

    let mut factor = (sampled_interval + duration_to_start + duration_to_end) / sampled_interval;
    if is_rate {
        factor /= range_seconds;
    }
    match result {
        Delta::Float(delta) => StepValue::Float(delta * factor),
        Delta::Histogram(mut h) => {
            h.mul(factor);
            StepValue::Histogram(h)
        }
    }
}

/// Difference between the last and first histogram of the window, adding
/// back what was lost at counter resets.
fn histogram_delta(histograms: RingBufferView<'_, HPoint>, is_counter: bool) -> Result<FloatHistogram, HistogramError> {
    let (Some(first), Some(last)) = (histograms.first(), histograms.last()) else {
        return Ok(FloatHistogram::default());
    };
    if first.h.uses_custom_buckets() != last.h.uses_custom_buckets() {
        return Err(HistogramError::MixedExponentialAndCustom);
    }
    let mut result = (*last.h).clone();
    result.sub(&first.h)?;
    if is_counter {
        let mut prev = &first.h;
        for p in histograms.iter().skip(1) {
            if p.h.detect_reset(prev) {
                result.add(prev)?;
            }
            prev = &p.h;
        }
    }
    result.counter_reset_hint = CounterResetHint::Gauge;
    result.compact();
    Ok(result)
}

pub(crate) fn rate(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(extrapolated_rate(step, env, true, true))
}

pub(crate) fn increase(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(extrapolated_rate(step, env, true, false))
}

pub(crate) fn delta(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(extrapolated_rate(step, env, false, false))
}

/// The two latest samples of the window, whatever their type.
enum Latest<'a> {
    Floats(&'a FPoint, &'a FPoint),
    Histograms(&'a HPoint, &'a HPoint),
    Mixed,
    TooFew,
}

fn latest_two<'a>(step: &RangeVectorStepData<'a>) -> Latest<'a> {
    let last_float = step.floats.last();
    let last_histogram = step.histograms.last();
    let latest_is_float = match (last_float, last_histogram) {
        (None, None) => return Latest::TooFew,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (Some(f), Some(h)) => f.t > h.t,
    };
    if latest_is_float {
        let other = last_histogram.map(|h| h.t);
        match step.floats.last_two() {
            Some((prev, last)) if other.is_none_or(|t| t < prev.t) => Latest::Floats(prev, last),
            _ if other.is_some() => Latest::Mixed,
            _ => Latest::TooFew,
        }
    } else {
        let other = last_float.map(|f| f.t);
        match step.histograms.last_two() {
            Some((prev, last)) if other.is_none_or(|t| t < prev.t) => Latest::Histograms(prev, last),
            _ if other.is_some() => Latest::Mixed,
            _ => Latest::TooFew,
        }
    }
}

/// `irate` and `idelta`: the change between the two latest samples.
fn instant_value(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>, is_rate: bool) -> StepValue {
    match latest_two(step) {
        Latest::TooFew => StepValue::None,
        Latest::Mixed => {
            env.annotations
                .add_if_absent(mixed_floats_histograms_warning(env.metric_name, env.position));
            StepValue::None
        }
        Latest::Floats(prev, last) => {
            let mut result = last.f - prev.f;
            if is_rate && last.f < prev.f {
                result = last.f;
            }
            if is_rate {
                let interval = last.t - prev.t;
                if interval == 0 {
                    return StepValue::None;
                }
                result /= interval as f64 / 1000.0;
            }
            StepValue::Float(result)
        }
        Latest::Histograms(prev, last) => {
            let mut result = if is_rate && (last.h.counter_reset_hint == CounterResetHint::CounterReset
                || last.h.detect_reset(&prev.h))
            {
                (*last.h).clone()
            } else {
                let mut diff = (*last.h).clone();
                if let Err(e) = diff.sub(&prev.h) {
                    return histogram_error(e, env);
                }
                diff
            };
            if is_rate {
                let interval = last.t - prev.t;
                if interval == 0 {
                    return StepValue::None;
                }
                result.div(interval as f64 / 1000.0);
            }
            result.counter_reset_hint = CounterResetHint::Gauge;
            result.compact();
            StepValue::Histogram(result)
        }
    }
}

pub(crate) fn irate(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(instant_value(step, env, true))
}

pub(crate) fn idelta(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(instant_value(step, env, false))
}

/// A sample of either type, for walking a window in timestamp order.
#[derive(Clone, Copy)]
enum AnyPoint<'a> {
    Float(f64),
    Histogram(&'a FloatHistogram),
}

fn merged<'a>(step: &RangeVectorStepData<'a>) -> impl Iterator<Item = AnyPoint<'a>> + 'a {
    let mut floats = step.floats.iter().peekable();
    let mut histograms = step.histograms.iter().peekable();
    std::iter::from_fn(move || match (floats.peek(), histograms.peek()) {
        (Some(f), Some(h)) if f.t <= h.t => floats.next().map(|p| AnyPoint::Float(p.f)),
        (_, Some(_)) => histograms.next().map(|p| AnyPoint::Histogram(&p.h)),
        (Some(_), None) => floats.next().map(|p| AnyPoint::Float(p.f)),
        (None, None) => None,
    })
}

/// Counts adjacent pairs of samples for which `differs` holds. A switch
/// between float and histogram always counts.
fn count_transitions(
    step: &RangeVectorStepData<'_>,
    differs: impl Fn(AnyPoint<'_>, AnyPoint<'_>) -> bool,
) -> StepValue {
    let mut points = merged(step);
    let Some(mut prev) = points.next() else {
        return StepValue::None;
    };
    let mut count = 0.0;
    for current in points {
        let counted = match (prev, current) {
            (AnyPoint::Float(_), AnyPoint::Float(_)) | (AnyPoint::Histogram(_), AnyPoint::Histogram(_)) => {
                differs(prev, current)
            }
            _ => true,
        };
        if counted {
            count += 1.0;
        }
        prev = current;
    }
    StepValue::Float(count)
}

pub(crate) fn changes(step: &RangeVectorStepData<'_>, _env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(count_transitions(step, |prev, current| match (prev, current) {
        (AnyPoint::Float(a), AnyPoint::Float(b)) => !(a == b || (a.is_nan() && b.is_nan())),
        (AnyPoint::Histogram(a), AnyPoint::Histogram(b)) => a != b,
        _ => true,
    }))
}

pub(crate) fn resets(step: &RangeVectorStepData<'_>, _env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(count_transitions(step, |prev, current| match (prev, current) {
        (AnyPoint::Float(a), AnyPoint::Float(b)) => b < a,
        (AnyPoint::Histogram(a), AnyPoint::Histogram(b)) => b.detect_reset(a),
        _ => true,
    }))
}

/// Float samples of the window, noting ignored histograms.
fn floats_only<'a>(
    step: &RangeVectorStepData<'a>,
    env: &mut StepEnv<'_>,
    function: &str,
) -> Option<RingBufferView<'a, FPoint>> {
    if !step.histograms.is_empty() {
        env.annotations
            .add_if_absent(histogram_ignored_in_aggregation_info(function, env.position));
    }
    (!step.floats.is_empty()).then_some(step.floats)
}

pub(crate) fn deriv(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    let Some(floats) = floats_only(step, env, "deriv") else {
        return Ok(StepValue::None);
    };
    let Some(first) = floats.first() else {
        return Ok(StepValue::None);
    };
    if floats.len() < 2 {
        return Ok(StepValue::None);
    }
    let (slope, _) = linear_regression(floats.iter().copied(), first.t);
    Ok(StepValue::Float(slope))
}

/// Extrapolates the least-squares fit of the window `t` seconds past the
/// step time.
pub(crate) fn predict_linear(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    let duration = env.scalar_args.first().copied().unwrap_or(f64::NAN);
    let Some(floats) = floats_only(step, env, "predict_linear") else {
        return Ok(StepValue::None);
    };
    if floats.len() < 2 {
        return Ok(StepValue::None);
    }
    let (slope, intercept) = linear_regression(floats.iter().copied(), step.step_t);
    Ok(StepValue::Float(slope * duration + intercept))
}

/// Shared shape of the `*_over_time` aggregations that accept both sample
/// types: floats and histograms must not be mixed.
fn over_time(
    step: &RangeVectorStepData<'_>,
    env: &mut StepEnv<'_>,
    float_kernel: impl Fn(RingBufferView<'_, FPoint>) -> f64,
    histogram_kernel: impl Fn(RingBufferView<'_, HPoint>) -> Result<FloatHistogram, HistogramError>,
) -> StepValue {
    match (step.floats.is_empty(), step.histograms.is_empty()) {
        (true, true) => StepValue::None,
        (false, true) => StepValue::Float(float_kernel(step.floats)),
        (true, false) => match histogram_kernel(step.histograms) {
            Ok(h) => StepValue::Histogram(h),
            Err(e) => histogram_error(e, env),
        },
        (false, false) => {
            env.annotations
                .add_if_absent(mixed_floats_histograms_warning(env.metric_name, env.position));
            StepValue::None
        }
    }
}

fn histogram_sum(histograms: RingBufferView<'_, HPoint>) -> Result<FloatHistogram, HistogramError> {
    let mut iter = histograms.iter();
    let Some(first) = iter.next() else {
        return Ok(FloatHistogram::default());
    };
    let mut sum = (*first.h).clone();
    for p in iter {
        sum.add(&p.h)?;
    }
    sum.counter_reset_hint = CounterResetHint::Gauge;
    sum.compact();
    Ok(sum)
}

pub(crate) fn sum_over_time(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(over_time(step, env, |floats| sum_kahan(floats.values()), histogram_sum))
}

pub(crate) fn avg_over_time(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(over_time(
        step,
        env,
        |floats| avg_kahan(floats.values()),
        |histograms| {
            let mut sum = histogram_sum(histograms)?;
            sum.div(histograms.len() as f64);
            Ok(sum)
        },
    ))
}

fn min_max(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>, function: &str, take: fn(f64, f64) -> bool) -> StepValue {
    let Some(floats) = floats_only(step, env, function) else {
        return StepValue::None;
    };
    let mut values = floats.values();
    let Some(mut result) = values.next() else {
        return StepValue::None;
    };
    for v in values {
        // NaN is only kept when every sample is NaN
        if take(v, result) || result.is_nan() {
            result = v;
        }
    }
    StepValue::Float(result)
}

pub(crate) fn min_over_time(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(min_max(step, env, "min_over_time", |v, current| v < current))
}

pub(crate) fn max_over_time(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(min_max(step, env, "max_over_time", |v, current| v > current))
}

pub(crate) fn count_over_time(step: &RangeVectorStepData<'_>, _env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    let count = step.floats.len() + step.histograms.len();
    Ok(if count == 0 {
        StepValue::None
    } else {
        StepValue::Float(count as f64)
    })
}

pub(crate) fn stdvar_over_time(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    let Some(floats) = floats_only(step, env, "stdvar_over_time") else {
        return Ok(StepValue::None);
    };
    Ok(StepValue::Float(variance_kahan(floats.values())))
}

pub(crate) fn stddev_over_time(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    let Some(floats) = floats_only(step, env, "stddev_over_time") else {
        return Ok(StepValue::None);
    };
    Ok(StepValue::Float(variance_kahan(floats.values()).sqrt()))
}

pub(crate) fn last_over_time(step: &RangeVectorStepData<'_>, _env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(match (step.floats.last(), step.histograms.last()) {
        (Some(f), Some(h)) if h.t > f.t => StepValue::Histogram((*h.h).clone()),
        (Some(f), _) => StepValue::Float(f.f),
        (None, Some(h)) => StepValue::Histogram((*h.h).clone()),
        (None, None) => StepValue::None,
    })
}

pub(crate) fn present_over_time(step: &RangeVectorStepData<'_>, _env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    Ok(if step.floats.is_empty() && step.histograms.is_empty() {
        StepValue::None
    } else {
        StepValue::Float(1.0)
    })
}

pub(crate) fn quantile_over_time(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    let q = env.scalar_args.first().copied().unwrap_or(f64::NAN);
    let Some(floats) = floats_only(step, env, "quantile_over_time") else {
        return Ok(StepValue::None);
    };
    if !(0.0..=1.0).contains(&q) {
        env.annotations.add_if_absent(invalid_quantile_warning(q, env.position));
    }
    let mut values: Vec<f64> = floats.values().collect();
    Ok(StepValue::Float(quantile(q, &mut values)))
}

/// Median absolute deviation from the median.
pub(crate) fn mad_over_time(step: &RangeVectorStepData<'_>, env: &mut StepEnv<'_>) -> EvalResult<StepValue> {
    let Some(floats) = floats_only(step, env, "mad_over_time") else {
        return Ok(StepValue::None);
    };
    let mut values: Vec<f64> = floats.values().collect();
    let median = quantile(0.5, &mut values);
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    Ok(StepValue::Float(quantile(0.5, &mut deviations)))
}

/// Flags counter functions applied to series whose name does not look like a
/// counter, once per metric name.
struct CounterNameValidator {
    reported: HashSet<String>,
}

const COUNTER_SUFFIXES: [&str; 4] = ["_total", "_sum", "_count", "_bucket"];

impl SeriesValidator for CounterNameValidator {
    fn validate(
        &mut self,
        metric_name: Option<&str>,
        saw_floats: bool,
        position: &str,
        annotations: &mut Annotations,
    ) {
        if !saw_floats {
            return;
        }
        let name = metric_name.unwrap_or("");
        if COUNTER_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            return;
        }
        if self.reported.insert(name.to_string()) {
            annotations.add(possible_non_counter_info(metric_name, position));
        }
    }
}

pub(crate) fn counter_name_validator() -> Box<dyn SeriesValidator> {
    Box::new(CounterNameValidator {
        reported: HashSet::new(),
    })
}
