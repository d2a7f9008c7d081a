//! Float native histograms.
//!
//! Buckets are stored sparsely by index. For exponential schemas the upper
//! bound of bucket `i` is `2^(i * 2^-schema)`; for the custom-bucket schema
//! bucket `i` spans `(custom_values[i-1], custom_values[i]]`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use crate::functions::math::kahan_inc;

/// Schema marking a histogram with explicitly listed ("custom") bucket bounds.
pub const CUSTOM_BUCKETS_SCHEMA: i32 = -53;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterResetHint {
    #[default]
    Unknown,
    CounterReset,
    NotCounterReset,
    Gauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistogramError {
    /// One operand uses exponential buckets, the other custom buckets.
    MixedExponentialAndCustom,
    /// Both operands use custom buckets but with different bounds.
    IncompatibleCustomBounds,
}

impl fmt::Display for HistogramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistogramError::MixedExponentialAndCustom => {
                write!(f, "cannot combine exponential and custom bucket histograms")
            }
            HistogramError::IncompatibleCustomBounds => {
                write!(f, "histograms have incompatible custom bucket bounds")
            }
        }
    }
}

impl std::error::Error for HistogramError {}

/// A single bucket as seen by iteration, with resolved bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    pub lower: f64,
    pub upper: f64,
    pub count: f64,
    pub is_zero_bucket: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FloatHistogram {
    pub counter_reset_hint: CounterResetHint,
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: f64,
    pub count: f64,
    pub sum: f64,
    pub positive_buckets: BTreeMap<i32, f64>,
    pub negative_buckets: BTreeMap<i32, f64>,
    /// Upper bounds for the custom-bucket schema, ascending.
    pub custom_values: Vec<f64>,
}

impl FloatHistogram {
    pub fn new_exponential(schema: i32) -> Self {
        Self {
            schema,
            ..Default::default()
        }
    }

    pub fn new_custom(bounds: Vec<f64>) -> Self {
        Self {
            schema: CUSTOM_BUCKETS_SCHEMA,
            custom_values: bounds,
            ..Default::default()
        }
    }

    pub fn uses_custom_buckets(&self) -> bool {
        self.schema == CUSTOM_BUCKETS_SCHEMA
    }

    fn exponential_upper(schema: i32, index: i32) -> f64 {
        (index as f64 * 2f64.powi(-schema)).exp2()
    }

    fn custom_bounds(&self, index: i32) -> (f64, f64) {
        let i = index.max(0) as usize;
        let upper = self.custom_values.get(i).copied().unwrap_or(f64::INFINITY);
        let lower = if i == 0 {
            f64::NEG_INFINITY
        } else {
            self.custom_values
                .get(i - 1)
                .copied()
                .unwrap_or(f64::INFINITY)
        };
        (lower, upper)
    }

    /// All non-empty buckets in ascending order of their bounds.
    pub fn buckets(&self) -> Vec<Bucket> {
        let mut out = Vec::with_capacity(self.positive_buckets.len() + self.negative_buckets.len() + 1);
        if self.uses_custom_buckets() {
            for (&idx, &count) in &self.positive_buckets {
                let (lower, upper) = self.custom_bounds(idx);
                out.push(Bucket {
                    lower,
                    upper,
                    count,
                    is_zero_bucket: false,
                });
            }
            return out;
        }
        for (&idx, &count) in self.negative_buckets.iter().rev() {
            out.push(Bucket {
                lower: -Self::exponential_upper(self.schema, idx),
                upper: -Self::exponential_upper(self.schema, idx - 1),
                count,
                is_zero_bucket: false,
            });
        }
        if self.zero_count != 0.0 {
            out.push(Bucket {
                lower: -self.zero_threshold,
                upper: self.zero_threshold,
                count: self.zero_count,
                is_zero_bucket: true,
            });
        }
        for (&idx, &count) in &self.positive_buckets {
            out.push(Bucket {
                lower: Self::exponential_upper(self.schema, idx - 1),
                upper: Self::exponential_upper(self.schema, idx),
                count,
                is_zero_bucket: false,
            });
        }
        out
    }

    pub fn mul(&mut self, factor: f64) {
        self.count *= factor;
        self.sum *= factor;
        self.zero_count *= factor;
        self.positive_buckets.values_mut().for_each(|c| *c *= factor);
        self.negative_buckets.values_mut().for_each(|c| *c *= factor);
    }

    pub fn div(&mut self, divisor: f64) {
        self.count /= divisor;
        self.sum /= divisor;
        self.zero_count /= divisor;
        self.positive_buckets.values_mut().for_each(|c| *c /= divisor);
        self.negative_buckets.values_mut().for_each(|c| *c /= divisor);
    }

    /// Merges buckets down to a coarser schema. No-op for custom buckets or
    /// when `target` is not coarser.
    pub fn reduce_resolution(&mut self, target: i32) {
        if self.uses_custom_buckets() || target >= self.schema {
            return;
        }
        let delta = self.schema - target;
        let reduce = |buckets: &BTreeMap<i32, f64>| {
            let mut out = BTreeMap::new();
            for (&idx, &count) in buckets {
                *out.entry(((idx - 1) >> delta) + 1).or_insert(0.0) += count;
            }
            out
        };
        self.positive_buckets = reduce(&self.positive_buckets);
        self.negative_buckets = reduce(&self.negative_buckets);
        self.schema = target;
    }

    /// Raises the zero threshold, folding buckets that now fall inside it
    /// into the zero bucket.
    fn widen_zero_bucket(&mut self, threshold: f64) {
        if threshold <= self.zero_threshold || self.uses_custom_buckets() {
            return;
        }
        let schema = self.schema;
        let mut absorbed = 0.0;
        for buckets in [&mut self.positive_buckets, &mut self.negative_buckets] {
            buckets.retain(|&idx, count| {
                if Self::exponential_upper(schema, idx) <= threshold {
                    absorbed += *count;
                    false
                } else {
                    true
                }
            });
        }
        self.zero_count += absorbed;
        self.zero_threshold = threshold;
    }

    fn check_compatible(&self, other: &FloatHistogram) -> Result<(), HistogramError> {
        match (self.uses_custom_buckets(), other.uses_custom_buckets()) {
            (true, true) if self.custom_values != other.custom_values => {
                Err(HistogramError::IncompatibleCustomBounds)
            }
            (true, false) | (false, true) => Err(HistogramError::MixedExponentialAndCustom),
            _ => Ok(()),
        }
    }

    /// Adds `other` into `self`, converting both to the coarser schema and the
    /// wider zero bucket first.
    pub fn add(&mut self, other: &FloatHistogram) -> Result<(), HistogramError> {
        self.check_compatible(other)?;
        let mut other = Cow::Borrowed(other);
        if !self.uses_custom_buckets() {
            if other.zero_threshold > self.zero_threshold {
                self.widen_zero_bucket(other.zero_threshold);
            } else if other.zero_threshold < self.zero_threshold {
                other.to_mut().widen_zero_bucket(self.zero_threshold);
            }
            if other.schema < self.schema {
                self.reduce_resolution(other.schema);
            } else if other.schema > self.schema {
                other.to_mut().reduce_resolution(self.schema);
            }
        }

        self.count += other.count;
        self.sum += other.sum;
        self.zero_count += other.zero_count;
        for (&idx, &count) in &other.positive_buckets {
            *self.positive_buckets.entry(idx).or_insert(0.0) += count;
        }
        for (&idx, &count) in &other.negative_buckets {
            *self.negative_buckets.entry(idx).or_insert(0.0) += count;
        }
        if self.counter_reset_hint != other.counter_reset_hint {
            self.counter_reset_hint = CounterResetHint::Unknown;
        }
        Ok(())
    }

    pub fn sub(&mut self, other: &FloatHistogram) -> Result<(), HistogramError> {
        let mut negated = other.clone();
        negated.mul(-1.0);
        self.add(&negated)
    }

    /// Removes empty buckets.
    pub fn compact(&mut self) {
        self.positive_buckets.retain(|_, c| *c != 0.0);
        self.negative_buckets.retain(|_, c| *c != 0.0);
    }

    /// Reports whether `self` must follow a counter reset relative to `previous`.
    pub fn detect_reset(&self, previous: &FloatHistogram) -> bool {
        match self.counter_reset_hint {
            CounterResetHint::CounterReset => return true,
            CounterResetHint::NotCounterReset | CounterResetHint::Gauge => return false,
            CounterResetHint::Unknown => {}
        }
        if self.count < previous.count {
            return true;
        }
        if self.uses_custom_buckets() != previous.uses_custom_buckets() {
            return true;
        }
        if self.uses_custom_buckets() {
            if self.custom_values != previous.custom_values {
                return true;
            }
        } else {
            if self.schema > previous.schema || self.zero_threshold < previous.zero_threshold {
                return true;
            }
            if self.zero_threshold == previous.zero_threshold && self.zero_count < previous.zero_count {
                return true;
            }
        }
        let mut previous = Cow::Borrowed(previous);
        if previous.schema > self.schema {
            previous.to_mut().reduce_resolution(self.schema);
        }
        let decreased = |current: &BTreeMap<i32, f64>, prev: &BTreeMap<i32, f64>| {
            prev.iter()
                .any(|(idx, &count)| current.get(idx).copied().unwrap_or(0.0) < count)
        };
        decreased(&self.positive_buckets, &previous.positive_buckets)
            || decreased(&self.negative_buckets, &previous.negative_buckets)
    }

    /// Estimates the `q` quantile of the observations.
    pub fn quantile(&self, q: f64) -> f64 {
        if q.is_nan() || self.count == 0.0 {
            return f64::NAN;
        }
        if q < 0.0 {
            return f64::NEG_INFINITY;
        }
        if q > 1.0 {
            return f64::INFINITY;
        }
        let buckets = self.buckets();
        let mut rank = q * self.count;
        let mut cumulative = 0.0;
        let mut chosen = None;
        for bucket in &buckets {
            cumulative += bucket.count;
            if bucket.count > 0.0 && cumulative >= rank {
                chosen = Some(*bucket);
                break;
            }
        }
        let Some(mut bucket) = chosen.or_else(|| buckets.iter().rev().find(|b| b.count > 0.0).copied()) else {
            return f64::NAN;
        };
        self.clamp_zero_bucket(&mut bucket);
        if bucket.lower == f64::NEG_INFINITY {
            if bucket.upper <= 0.0 {
                return bucket.upper;
            }
            bucket.lower = 0.0;
        }
        if bucket.upper == f64::INFINITY {
            return bucket.lower;
        }

        rank -= cumulative - bucket.count;
        let fraction = (rank / bucket.count).clamp(0.0, 1.0);
        if self.uses_custom_buckets() || bucket.is_zero_bucket {
            return bucket.lower + (bucket.upper - bucket.lower) * fraction;
        }
        let log_lower = bucket.lower.abs().log2();
        let log_upper = bucket.upper.abs().log2();
        if bucket.lower > 0.0 {
            (log_lower + (log_upper - log_lower) * fraction).exp2()
        } else {
            -(log_upper + (log_lower - log_upper) * (1.0 - fraction)).exp2()
        }
    }

    /// Estimates the fraction of observations between `lower` and `upper`.
    pub fn fraction(&self, lower: f64, upper: f64) -> f64 {
        if self.count == 0.0 || lower.is_nan() || upper.is_nan() {
            return f64::NAN;
        }
        if lower >= upper {
            return 0.0;
        }
        let buckets = self.buckets();
        let upper_rank = self.rank_below(&buckets, upper).min(self.count);
        let lower_rank = self.rank_below(&buckets, lower).min(self.count);
        (upper_rank - lower_rank) / self.count
    }

    fn rank_below(&self, buckets: &[Bucket], v: f64) -> f64 {
        let mut rank = 0.0;
        for bucket in buckets {
            let mut bucket = *bucket;
            if bucket.lower >= v {
                break;
            }
            if bucket.upper <= v {
                rank += bucket.count;
                continue;
            }
            self.clamp_zero_bucket(&mut bucket);
            if bucket.lower == f64::NEG_INFINITY {
                if bucket.upper <= 0.0 || v <= 0.0 {
                    continue;
                }
                bucket.lower = 0.0;
            }
            if bucket.upper == f64::INFINITY || v <= bucket.lower {
                continue;
            }
            rank += bucket.count * self.interpolate(&bucket, v);
        }
        rank
    }

    fn interpolate(&self, bucket: &Bucket, v: f64) -> f64 {
        if self.uses_custom_buckets() || bucket.is_zero_bucket {
            return (v - bucket.lower) / (bucket.upper - bucket.lower);
        }
        if bucket.lower >= 0.0 {
            let log_lower = bucket.lower.log2();
            (v.log2() - log_lower) / (bucket.upper.log2() - log_lower)
        } else {
            let log_near = bucket.upper.abs().log2();
            let log_far = bucket.lower.abs().log2();
            1.0 - (v.abs().log2() - log_near) / (log_far - log_near)
        }
    }

    fn clamp_zero_bucket(&self, bucket: &mut Bucket) {
        if !bucket.is_zero_bucket {
            return;
        }
        if self.negative_buckets.is_empty() && !self.positive_buckets.is_empty() {
            bucket.lower = 0.0;
        } else if self.positive_buckets.is_empty() && !self.negative_buckets.is_empty() {
            bucket.upper = 0.0;
        }
    }

    /// Estimated variance of the observations, using a representative value
    /// per bucket.
    pub fn stdvar(&self) -> f64 {
        if self.count == 0.0 {
            return f64::NAN;
        }
        let mean = self.sum / self.count;
        let mut variance = 0.0;
        let mut c = 0.0;
        for bucket in self.buckets() {
            if bucket.count == 0.0 {
                continue;
            }
            let value = if self.uses_custom_buckets() {
                match (bucket.lower.is_infinite(), bucket.upper.is_infinite()) {
                    (true, _) => bucket.upper,
                    (_, true) => bucket.lower,
                    _ => (bucket.upper + bucket.lower) / 2.0,
                }
            } else if bucket.lower <= 0.0 && 0.0 <= bucket.upper {
                0.0
            } else {
                let v = (bucket.upper * bucket.lower).sqrt();
                if bucket.upper < 0.0 { -v } else { v }
            };
            let delta = value - mean;
            (variance, c) = kahan_inc(bucket.count * delta * delta, variance, c);
        }
        (variance + c) / self.count
    }

    pub fn stddev(&self) -> f64 {
        self.stdvar().sqrt()
    }
}

impl fmt::Display for FloatHistogram {
    /// Renders in the notation used by test scripts.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{{schema:{} count:{} sum:{}",
            self.schema, self.count, self.sum
        )?;
        if self.zero_count != 0.0 || self.zero_threshold != 0.0 {
            write!(f, " z_bucket:{} z_bucket_w:{}", self.zero_count, self.zero_threshold)?;
        }
        for (name, buckets) in [("buckets", &self.positive_buckets), ("n_buckets", &self.negative_buckets)] {
            if !buckets.is_empty() {
                let entries: Vec<String> = buckets.iter().map(|(i, c)| format!("{}:{}", i, c)).collect();
                write!(f, " {}:[{}]", name, entries.join(" "))?;
            }
        }
        if self.uses_custom_buckets() {
            let bounds: Vec<String> = self.custom_values.iter().map(|v| v.to_string()).collect();
            write!(f, " custom_values:[{}]", bounds.join(" "))?;
        }
        write!(f, "}}}}")
    }
}
