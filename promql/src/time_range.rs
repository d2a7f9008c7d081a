//! Evaluation time ranges and millisecond timestamp conversions.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{EvalResult, EvaluationError};

/// Converts wall-clock time to PromQL milliseconds, supporting pre-epoch times.
pub fn millis_from_system_time(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Inverse of [`millis_from_system_time`]. `None` outside `SystemTime`'s range.
pub fn system_time_from_millis(millis: i64) -> Option<SystemTime> {
    if millis >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_millis(millis as u64))
    } else {
        let abs = millis.checked_abs()? as u64;
        UNIX_EPOCH.checked_sub(Duration::from_millis(abs))
    }
}

pub(crate) fn duration_millis(d: Duration) -> i64 {
    d.as_millis() as i64
}

/// The set of timestamps a query (or sub-expression) is evaluated at.
///
/// An instant query is a range with a single step. Step `i` is evaluated at
/// `start_t + i * interval_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTimeRange {
    pub start_t: i64,
    pub end_t: i64,
    pub interval_ms: i64,
    pub step_count: usize,
    pub is_instant: bool,
}

impl QueryTimeRange {
    pub fn new_instant(t: i64) -> Self {
        Self {
            start_t: t,
            end_t: t,
            interval_ms: 1,
            step_count: 1,
            is_instant: true,
        }
    }

    /// Range of steps from `start_t` to `end_t` inclusive. The last step is
    /// the largest `start_t + k * interval_ms` not after `end_t`.
    pub fn new_range(start_t: i64, end_t: i64, interval_ms: i64) -> EvalResult<Self> {
        if interval_ms <= 0 {
            return Err(EvaluationError::InvalidRange(format!(
                "zero or negative query resolution step widths are not accepted, got {}ms",
                interval_ms
            )));
        }
        if end_t < start_t {
            return Err(EvaluationError::InvalidRange(format!(
                "end timestamp {} must not be before start time {}",
                end_t, start_t
            )));
        }
        let steps = (end_t - start_t) / interval_ms + 1;
        Ok(Self {
            start_t,
            end_t: start_t + (steps - 1) * interval_ms,
            interval_ms,
            step_count: steps as usize,
            is_instant: false,
        })
    }

    pub fn step_time(&self, index: usize) -> i64 {
        self.start_t + index as i64 * self.interval_ms
    }

    /// Index of the step evaluated at `t`. `t` must be a step time.
    pub fn point_index(&self, t: i64) -> usize {
        ((t - self.start_t) / self.interval_ms) as usize
    }

    pub fn step_times(&self) -> impl Iterator<Item = i64> + '_ {
        (0..self.step_count).map(|i| self.step_time(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn should_model_instant_query_as_single_step() {
        let range = QueryTimeRange::new_instant(5_000);

        assert_eq!(range.step_count, 1);
        assert_eq!(range.step_times().collect::<Vec<_>>(), vec![5_000]);
        assert!(range.is_instant);
    }

    #[rstest]
    #[case(0, 60_000, 15_000, 5, 60_000)]
    #[case(0, 59_000, 15_000, 4, 45_000)]
    #[case(10, 10, 1_000, 1, 10)]
    fn should_compute_steps(
        #[case] start: i64,
        #[case] end: i64,
        #[case] step: i64,
        #[case] expected_steps: usize,
        #[case] expected_end: i64,
    ) {
        let range = QueryTimeRange::new_range(start, end, step).unwrap();

        assert_eq!(range.step_count, expected_steps);
        assert_eq!(range.end_t, expected_end);
        assert_eq!(range.point_index(expected_end), expected_steps - 1);
    }

    #[rstest]
    #[case(10, 0, 1_000)]
    #[case(0, 10, 0)]
    #[case(0, 10, -5)]
    fn should_reject_invalid_ranges(#[case] start: i64, #[case] end: i64, #[case] step: i64) {
        let result = QueryTimeRange::new_range(start, end, step);

        assert!(matches!(result, Err(EvaluationError::InvalidRange(_))));
    }

    #[test]
    fn should_allow_fine_grained_ranges() {
        // given: four hours at one-second resolution
        let range = QueryTimeRange::new_range(0, 4 * 3_600_000, 1_000).unwrap();

        // then
        assert_eq!(range.step_count, 14_401);
    }

    #[rstest]
    #[case(0)]
    #[case(1_700_000_000_123)]
    #[case(-86_400_000)]
    fn should_round_trip_system_time(#[case] millis: i64) {
        let time = system_time_from_millis(millis).unwrap();

        assert_eq!(millis_from_system_time(time), millis);
    }
}
