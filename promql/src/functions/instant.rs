//! Point-wise kernels over instant vector series.

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::time_range::QueryTimeRange;
use crate::types::{InstantVectorSeriesData, ScalarData, get_vec, push_tracked, put_vec};

/// Applies `op` to every float point and discards histogram points.
pub(crate) fn transform_floats(
    mut data: InstantVectorSeriesData,
    ctx: &mut QueryContext,
    op: impl Fn(f64) -> f64,
) -> EvalResult<InstantVectorSeriesData> {
    put_vec(std::mem::take(&mut data.histograms), &mut ctx.memory);
    for p in &mut data.floats {
        p.f = op(p.f);
    }
    Ok(data)
}

macro_rules! float_functions {
    ($($name:ident => $op:expr),* $(,)?) => {
        $(
            pub(crate) fn $name(
                data: InstantVectorSeriesData,
                _args: &[ScalarData],
                _time_range: &QueryTimeRange,
                ctx: &mut QueryContext,
            ) -> EvalResult<InstantVectorSeriesData> {
                transform_floats(data, ctx, $op)
            }
        )*
    };
}

float_functions! {
    abs => f64::abs,
    ceil => f64::ceil,
    floor => f64::floor,
    exp => f64::exp,
    sqrt => f64::sqrt,
    ln => f64::ln,
    log2 => f64::log2,
    log10 => f64::log10,
    sin => f64::sin,
    cos => f64::cos,
    tan => f64::tan,
    asin => f64::asin,
    acos => f64::acos,
    atan => f64::atan,
    sinh => f64::sinh,
    cosh => f64::cosh,
    tanh => f64::tanh,
    asinh => f64::asinh,
    acosh => f64::acosh,
    atanh => f64::atanh,
    deg => f64::to_degrees,
    rad => f64::to_radians,
    sgn => |f: f64| if f > 0.0 { 1.0 } else if f < 0.0 { -1.0 } else { f },
}

/// `max` that propagates NaN from either side.
pub(crate) fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) }
}

/// `min` that propagates NaN from either side.
pub(crate) fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) }
}

/// Rewrites each float point using the scalar arguments at its step. Points
/// for which `op` returns `None` are dropped.
fn transform_with_args(
    mut data: InstantVectorSeriesData,
    args: &[ScalarData],
    time_range: &QueryTimeRange,
    ctx: &mut QueryContext,
    op: impl Fn(f64, &[f64]) -> Option<f64>,
) -> EvalResult<InstantVectorSeriesData> {
    put_vec(std::mem::take(&mut data.histograms), &mut ctx.memory);
    let mut step_args = Vec::with_capacity(args.len());
    data.floats.retain_mut(|p| {
        let step = time_range.point_index(p.t);
        step_args.clear();
        step_args.extend(args.iter().map(|a| a.value_at(step)));
        match op(p.f, &step_args) {
            Some(f) => {
                p.f = f;
                true
            }
            None => false,
        }
    });
    Ok(data)
}

pub(crate) fn clamp(
    data: InstantVectorSeriesData,
    args: &[ScalarData],
    time_range: &QueryTimeRange,
    ctx: &mut QueryContext,
) -> EvalResult<InstantVectorSeriesData> {
    transform_with_args(data, args, time_range, ctx, |f, a| {
        let (min, max) = (a[0], a[1]);
        // an empty interval yields no value
        (max >= min || min.is_nan() || max.is_nan()).then(|| nan_max(min, nan_min(max, f)))
    })
}

pub(crate) fn clamp_min(
    data: InstantVectorSeriesData,
    args: &[ScalarData],
    time_range: &QueryTimeRange,
    ctx: &mut QueryContext,
) -> EvalResult<InstantVectorSeriesData> {
    transform_with_args(data, args, time_range, ctx, |f, a| Some(nan_max(a[0], f)))
}

pub(crate) fn clamp_max(
    data: InstantVectorSeriesData,
    args: &[ScalarData],
    time_range: &QueryTimeRange,
    ctx: &mut QueryContext,
) -> EvalResult<InstantVectorSeriesData> {
    transform_with_args(data, args, time_range, ctx, |f, a| Some(nan_min(a[0], f)))
}

/// Rounds half up to the nearest multiple of the optional second argument.
pub(crate) fn round(
    data: InstantVectorSeriesData,
    args: &[ScalarData],
    time_range: &QueryTimeRange,
    ctx: &mut QueryContext,
) -> EvalResult<InstantVectorSeriesData> {
    transform_with_args(data, args, time_range, ctx, |f, a| {
        let inverse = 1.0 / a.first().copied().unwrap_or(1.0);
        Some((f * inverse + 0.5).floor() / inverse)
    })
}

/// Unary minus: negates floats and histograms alike.
pub(crate) fn negate(
    mut data: InstantVectorSeriesData,
    _args: &[ScalarData],
    _time_range: &QueryTimeRange,
    _ctx: &mut QueryContext,
) -> EvalResult<InstantVectorSeriesData> {
    for p in &mut data.floats {
        p.f = -p.f;
    }
    for p in &mut data.histograms {
        p.h.mul(-1.0);
    }
    Ok(data)
}

/// Returns the data as is, for functions that only rewrite labels.
pub(crate) fn unchanged(
    data: InstantVectorSeriesData,
    _args: &[ScalarData],
    _time_range: &QueryTimeRange,
    _ctx: &mut QueryContext,
) -> EvalResult<InstantVectorSeriesData> {
    Ok(data)
}

/// `timestamp()` over a computed vector: the step time, in seconds, of every
/// point regardless of its type.
pub(crate) fn step_timestamps(
    data: InstantVectorSeriesData,
    _args: &[ScalarData],
    _time_range: &QueryTimeRange,
    ctx: &mut QueryContext,
) -> EvalResult<InstantVectorSeriesData> {
    let mut floats = get_vec(data.len(), &mut ctx.memory)?;
    let (mut fi, mut hi) = (0, 0);
    while fi < data.floats.len() || hi < data.histograms.len() {
        let t = match (data.floats.get(fi), data.histograms.get(hi)) {
            (Some(f), Some(h)) if f.t <= h.t => {
                fi += 1;
                f.t
            }
            (_, Some(h)) => {
                hi += 1;
                h.t
            }
            (Some(f), None) => {
                fi += 1;
                f.t
            }
            (None, None) => break,
        };
        push_tracked(&mut floats, crate::model::FPoint::new(t, t as f64 / 1000.0), &mut ctx.memory)?;
    }
    data.release(&mut ctx.memory);
    Ok(InstantVectorSeriesData {
        floats,
        histograms: Vec::new(),
    })
}
