//! Numeric kernels shared by range functions, aggregations and histograms.

use crate::model::FPoint;

/// Kahan summation increment with Neumaier improvement (1974)
///
/// Performs compensated summation to minimize floating-point rounding errors.
/// The Neumaier variant handles the case where the next term is larger than
/// the running sum, which the original Kahan algorithm (1965) did not address.
///
/// Returns (new_sum, new_compensation)
#[inline(never)]
// Important: do NOT inline.
// Compiler reordering of floating-point operations can cause precision loss.
// This was observed in Prometheus (issue #16714) and we lock the behavior
// to maintain IEEE-754 semantics exactly.
pub(crate) fn kahan_inc(inc: f64, sum: f64, c: f64) -> (f64, f64) {
    let t = sum + inc;

    let new_c = if t.is_infinite() {
        0.0
    } else if sum.abs() >= inc.abs() {
        // Neumaier improvement: swap roles when next term is larger
        c + ((sum - t) + inc)
    } else {
        c + ((inc - t) + sum)
    };

    (t, new_c)
}

/// Compensated sum of a sequence.
pub(crate) fn sum_kahan(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut c = 0.0;
    for v in values {
        (sum, c) = kahan_inc(v, sum, c);
    }
    // an infinite sum must not be turned into NaN by a finite compensation
    if sum.is_infinite() { sum } else { sum + c }
}

/// Running mean that switches from a compensated sum to an incremental mean
/// once the sum overflows.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct KahanMean {
    count: f64,
    sum: f64,
    c: f64,
    mean: f64,
    incremental: bool,
}

impl KahanMean {
    pub(crate) fn push(&mut self, value: f64) {
        self.count += 1.0;
        if self.count == 1.0 {
            self.sum = value;
            return;
        }
        if !self.incremental {
            let (new_sum, new_c) = kahan_inc(value, self.sum, self.c);
            if !new_sum.is_infinite() {
                self.sum = new_sum;
                self.c = new_c;
                return;
            }
            self.incremental = true;
            self.mean = self.sum / (self.count - 1.0);
            self.c /= self.count - 1.0;
        }
        let q = (self.count - 1.0) / self.count;
        (self.mean, self.c) = kahan_inc(value / self.count, q * self.mean, q * self.c);
    }

    pub(crate) fn count(&self) -> f64 {
        self.count
    }

    pub(crate) fn value(&self) -> f64 {
        if self.count == 1.0 {
            self.sum
        } else if self.incremental {
            self.mean + self.c
        } else {
            self.sum / self.count + self.c / self.count
        }
    }
}

/// Average calculation matching Prometheus semantics: Kahan summation, with
/// an incremental mean once the intermediate sum overflows.
pub(crate) fn avg_kahan(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut mean = KahanMean::default();
    for v in values {
        mean.push(v);
    }
    if mean.count() == 0.0 {
        f64::NAN
    } else {
        mean.value()
    }
}

/// Welford's online variance with compensated accumulators.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Welford {
    count: f64,
    mean: f64,
    c_mean: f64,
    m2: f64,
    c_m2: f64,
}

impl Welford {
    pub(crate) fn push(&mut self, value: f64) {
        self.count += 1.0;
        let delta = value - (self.mean + self.c_mean);
        (self.mean, self.c_mean) = kahan_inc(delta / self.count, self.mean, self.c_mean);
        let new_delta = value - (self.mean + self.c_mean);
        (self.m2, self.c_m2) = kahan_inc(delta * new_delta, self.m2, self.c_m2);
    }

    /// Population variance; NaN when nothing was pushed.
    pub(crate) fn variance(&self) -> f64 {
        if self.count == 0.0 {
            return f64::NAN;
        }
        (self.m2 + self.c_m2) / self.count
    }
}

pub(crate) fn variance_kahan(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut w = Welford::default();
    for v in values {
        w.push(v);
    }
    w.variance()
}

/// Interpolated `q` quantile of `values`, which is sorted in place.
pub(crate) fn quantile(q: f64, values: &mut [f64]) -> f64 {
    if values.is_empty() || q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len() as f64;
    let rank = q * (n - 1.0);
    let lower = rank.floor().max(0.0) as usize;
    let upper = (lower + 1).min(values.len() - 1);
    let weight = rank - rank.floor();
    values[lower] * (1.0 - weight) + values[upper] * weight
}

/// Least squares fit of `points`, with x measured in seconds from `intercept_time`.
///
/// Returns `(slope, intercept)`.
pub(crate) fn linear_regression(points: impl Iterator<Item = FPoint>, intercept_time: i64) -> (f64, f64) {
    let (mut n, mut sum_x, mut c_x, mut sum_y, mut c_y) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let (mut sum_xy, mut c_xy, mut sum_x2, mut c_x2) = (0.0, 0.0, 0.0, 0.0);
    let mut init_y = f64::NAN;
    let mut const_y = true;

    for (i, point) in points.enumerate() {
        if i == 0 {
            init_y = point.f;
        } else if const_y && point.f != init_y {
            const_y = false;
        }
        n += 1.0;
        let x = (point.t - intercept_time) as f64 / 1e3;
        (sum_x, c_x) = kahan_inc(x, sum_x, c_x);
        (sum_y, c_y) = kahan_inc(point.f, sum_y, c_y);
        (sum_xy, c_xy) = kahan_inc(x * point.f, sum_xy, c_xy);
        (sum_x2, c_x2) = kahan_inc(x * x, sum_x2, c_x2);
    }

    if const_y {
        if init_y.is_infinite() {
            return (f64::NAN, f64::NAN);
        }
        return (0.0, init_y);
    }
    sum_x += c_x;
    sum_y += c_y;
    sum_xy += c_xy;
    sum_x2 += c_x2;

    let cov_xy = sum_xy - sum_x * sum_y / n;
    let var_x = sum_x2 - sum_x * sum_x / n;
    let slope = cov_xy / var_x;
    let intercept = sum_y / n - slope * sum_x / n;
    (slope, intercept)
}
