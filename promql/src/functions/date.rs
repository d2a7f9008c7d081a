//! Calendar functions. Sample values are read as Unix timestamps in seconds
//! and interpreted in UTC.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

use crate::context::QueryContext;
use crate::error::EvalResult;
use crate::functions::instant::transform_floats;
use crate::time_range::QueryTimeRange;
use crate::types::{InstantVectorSeriesData, ScalarData};

fn to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp(seconds.trunc() as i64, 0)
}

fn with_date(
    data: InstantVectorSeriesData,
    ctx: &mut QueryContext,
    extract: fn(DateTime<Utc>) -> f64,
) -> EvalResult<InstantVectorSeriesData> {
    transform_floats(data, ctx, |f| to_datetime(f).map(extract).unwrap_or(f64::NAN))
}

fn month_length(t: DateTime<Utc>) -> f64 {
    let (year, month) = (t.year(), t.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    match (
        NaiveDate::from_ymd_opt(year, month, 1),
        NaiveDate::from_ymd_opt(next_year, next_month, 1),
    ) {
        (Some(first), Some(next)) => (next - first).num_days() as f64,
        _ => f64::NAN,
    }
}

macro_rules! date_functions {
    ($($name:ident => $extract:expr),* $(,)?) => {
        $(
            pub(crate) fn $name(
                data: InstantVectorSeriesData,
                _args: &[ScalarData],
                _time_range: &QueryTimeRange,
                ctx: &mut QueryContext,
            ) -> EvalResult<InstantVectorSeriesData> {
                with_date(data, ctx, $extract)
            }
        )*
    };
}

date_functions! {
    minute => |t| t.minute() as f64,
    hour => |t| t.hour() as f64,
    day_of_week => |t| t.weekday().num_days_from_sunday() as f64,
    day_of_month => |t| t.day() as f64,
    day_of_year => |t| t.ordinal() as f64,
    days_in_month => month_length,
    month => |t| t.month() as f64,
    year => |t| t.year() as f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::SeriesDataFn;
    use crate::model::FPoint;
    use crate::types::get_vec;
    use rstest::rstest;

    // 2024-02-29T13:45:30Z, a Thursday
    const LEAP_DAY: f64 = 1_709_214_330.0;

    #[rstest]
    #[case(minute as SeriesDataFn, 45.0)]
    #[case(hour as SeriesDataFn, 13.0)]
    #[case(day_of_week as SeriesDataFn, 4.0)]
    #[case(day_of_month as SeriesDataFn, 29.0)]
    #[case(day_of_year as SeriesDataFn, 60.0)]
    #[case(days_in_month as SeriesDataFn, 29.0)]
    #[case(month as SeriesDataFn, 2.0)]
    #[case(year as SeriesDataFn, 2024.0)]
    fn should_extract_calendar_fields(#[case] function: SeriesDataFn, #[case] expected: f64) {
        // given
        let mut ctx = QueryContext::for_tests();
        let mut floats = get_vec(1, &mut ctx.memory).unwrap();
        floats.push(FPoint::new(0, LEAP_DAY));
        let data = InstantVectorSeriesData {
            floats,
            histograms: Vec::new(),
        };

        // when
        let result = function(data, &[], &QueryTimeRange::new_instant(0), &mut ctx).unwrap();

        // then
        assert_eq!(result.floats[0].f, expected);
        result.release(&mut ctx.memory);
        assert_eq!(ctx.memory.current_bytes(), 0);
    }

    #[test]
    fn should_return_nan_for_non_finite_timestamps() {
        assert!(to_datetime(f64::NAN).is_none());
        assert!(to_datetime(f64::INFINITY).is_none());
    }

    #[test]
    fn should_handle_negative_timestamps() {
        // 1969-12-31T23:00:00Z
        let t = to_datetime(-3600.0).unwrap();

        assert_eq!((t.year(), t.hour()), (1969, 23));
    }
}
