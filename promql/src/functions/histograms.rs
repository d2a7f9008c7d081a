//! Functions reading statistics out of native histograms. Float points are
//! ignored.

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::histogram::FloatHistogram;
use crate::model::FPoint;
use crate::time_range::QueryTimeRange;
use crate::types::{InstantVectorSeriesData, ScalarData, get_vec, put_vec};

fn histogram_to_float(
    data: InstantVectorSeriesData,
    args: &[ScalarData],
    time_range: &QueryTimeRange,
    ctx: &mut QueryContext,
    statistic: impl Fn(&FloatHistogram, &[f64]) -> f64,
) -> EvalResult<InstantVectorSeriesData> {
    let InstantVectorSeriesData { floats, histograms } = data;
    put_vec(floats, &mut ctx.memory);
    let mut out = match get_vec(histograms.len(), &mut ctx.memory) {
        Ok(out) => out,
        Err(e) => {
            put_vec(histograms, &mut ctx.memory);
            return Err(e);
        }
    };
    let mut step_args = Vec::with_capacity(args.len());
    for p in &histograms {
        let step = time_range.point_index(p.t);
        step_args.clear();
        step_args.extend(args.iter().map(|a| a.value_at(step)));
        // capacity was reserved up front
        out.push(FPoint::new(p.t, statistic(&p.h, &step_args)));
    }
    put_vec(histograms, &mut ctx.memory);
    Ok(InstantVectorSeriesData {
        floats: out,
        histograms: Vec::new(),
    })
}

macro_rules! histogram_statistics {
    ($($name:ident => $statistic:expr),* $(,)?) => {
        $(
            pub(crate) fn $name(
                data: InstantVectorSeriesData,
                args: &[ScalarData],
                time_range: &QueryTimeRange,
                ctx: &mut QueryContext,
            ) -> EvalResult<InstantVectorSeriesData> {
                histogram_to_float(data, args, time_range, ctx, $statistic)
            }
        )*
    };
}

histogram_statistics! {
    histogram_count => |h: &FloatHistogram, _: &[f64]| h.count,
    histogram_sum => |h: &FloatHistogram, _: &[f64]| h.sum,
    histogram_avg => |h: &FloatHistogram, _: &[f64]| h.sum / h.count,
    histogram_stddev => |h: &FloatHistogram, _: &[f64]| h.stddev(),
    histogram_stdvar => |h: &FloatHistogram, _: &[f64]| h.stdvar(),
    histogram_fraction => |h: &FloatHistogram, a: &[f64]| h.fraction(a[0], a[1]),
}

/// Relative tolerance under which adjacent classic bucket counts are treated
/// as equal, absorbing floating point noise from rate() and sum().
const SMALL_DELTA_TOLERANCE: f64 = 1e-12;

/// A classic histogram bucket: cumulative `count` of observations at or
/// below `upper`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ClassicBucket {
    pub(crate) upper: f64,
    pub(crate) count: f64,
}

/// Outcome of [`bucket_quantile`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BucketQuantile {
    pub(crate) value: f64,
    /// Counts had to be raised to make them cumulative.
    pub(crate) forced_monotonic: bool,
}

fn almost_equal(a: f64, b: f64, tolerance: f64) -> bool {
    if a == b {
        return true;
    }
    let diff = (a - b).abs();
    let norm = (a.abs() + b.abs()).min(f64::MAX);
    if diff < f64::MIN_POSITIVE {
        return diff < tolerance * f64::MIN_POSITIVE;
    }
    diff / norm < tolerance
}

/// Estimates the `q` quantile from classic `le` buckets, interpolating
/// linearly inside the bucket the rank falls in. `buckets` is reordered.
pub(crate) fn bucket_quantile(q: f64, buckets: &mut Vec<ClassicBucket>) -> BucketQuantile {
    let value = |value| BucketQuantile {
        value,
        forced_monotonic: false,
    };
    if q.is_nan() {
        return value(f64::NAN);
    }
    if q < 0.0 {
        return value(f64::NEG_INFINITY);
    }
    if q > 1.0 {
        return value(f64::INFINITY);
    }
    buckets.sort_by(|a, b| a.upper.total_cmp(&b.upper));
    if buckets.last().is_none_or(|b| b.upper != f64::INFINITY) {
        return value(f64::NAN);
    }
    buckets.dedup_by(|next, kept| {
        if next.upper == kept.upper {
            kept.count += next.count;
            true
        } else {
            false
        }
    });

    let mut forced_monotonic = false;
    let mut prev = buckets[0].count;
    for b in buckets.iter_mut().skip(1) {
        if b.count == prev {
            continue;
        }
        if almost_equal(prev, b.count, SMALL_DELTA_TOLERANCE) || b.count < prev {
            forced_monotonic |= b.count < prev && !almost_equal(prev, b.count, SMALL_DELTA_TOLERANCE);
            b.count = prev;
            continue;
        }
        prev = b.count;
    }

    let result = |v| BucketQuantile {
        value: v,
        forced_monotonic,
    };
    let n = buckets.len();
    if n < 2 {
        return result(f64::NAN);
    }
    let observations = buckets[n - 1].count;
    if observations == 0.0 {
        return result(f64::NAN);
    }
    let mut rank = q * observations;
    let b = buckets.iter().position(|b| b.count >= rank).unwrap_or(n - 1);
    if b == n - 1 {
        return result(buckets[n - 2].upper);
    }
    if b == 0 && buckets[0].upper <= 0.0 {
        return result(buckets[0].upper);
    }
    let (mut start, end, mut count) = (0.0, buckets[b].upper, buckets[b].count);
    if b > 0 {
        start = buckets[b - 1].upper;
        count -= buckets[b - 1].count;
        rank -= buckets[b - 1].count;
    }
    result(start + (end - start) * (rank / count))
}
