use std::collections::BTreeMap;

use crate::engine::QueryResult;
use crate::histogram::FloatHistogram;
use crate::model::{Labels, QueryValue, RangeSeries, SampleValue};
use crate::promqltest::dsl::{EvalCommand, EvalTime, Expectation, SeriesDef, SeriesValue};

/// Compares a query result against the expectations of an `eval` block.
///
/// Labels are compared exactly, including `__name__`. Unless the block is
/// `eval_ordered`, series are paired up by their labels.
pub(super) fn assert_result(result: &QueryResult, eval: &EvalCommand, test_name: &str) -> Result<(), String> {
    let fail = |msg: String| format!("{} line {} (query: {}): {}", test_name, eval.line, eval.query, msg);

    match eval.expectation {
        Expectation::Warn if result.annotations.warnings().next().is_none() => {
            return Err(fail("expected a warning, got none".to_string()));
        }
        Expectation::Info => {
            if let Some(w) = result.annotations.warnings().next() {
                return Err(fail(format!("expected only info annotations, got warning: {}", w.message)));
            }
            if result.annotations.infos().next().is_none() {
                return Err(fail("expected an info annotation, got none".to_string()));
            }
        }
        _ => {}
    }

    let actual = actual_series(&result.value, eval.time).map_err(fail)?;
    if actual.len() != eval.expected.len() {
        return Err(fail(format!(
            "expected {} series, got {}: {:?}",
            eval.expected.len(),
            actual.len(),
            actual.iter().map(|(l, _)| l.to_string()).collect::<Vec<_>>()
        )));
    }

    if eval.ordered {
        for (i, (expected, (labels, values))) in eval.expected.iter().zip(&actual).enumerate() {
            if &expected.labels != labels {
                return Err(fail(format!(
                    "series #{} should be {}, got {}",
                    i, expected.labels, labels
                )));
            }
            compare_values(expected, values).map_err(fail)?;
        }
        return Ok(());
    }

    let by_labels: BTreeMap<&Labels, &Vec<SeriesValue>> = actual.iter().map(|(l, v)| (l, v)).collect();
    for expected in &eval.expected {
        let values = by_labels
            .get(&expected.labels)
            .ok_or_else(|| fail(format!("missing series {}", expected.labels)))?;
        compare_values(expected, values).map_err(fail)?;
    }
    Ok(())
}

/// Flattens a result into labelled value lists. For range queries the list
/// has one slot per step, `Missing` where the series has no value.
fn actual_series(value: &QueryValue, time: EvalTime) -> Result<Vec<(Labels, Vec<SeriesValue>)>, String> {
    let to_value = |v: &SampleValue| match v {
        SampleValue::Float(f) => SeriesValue::Float(*f),
        SampleValue::Histogram(h) => SeriesValue::Histogram(h.clone()),
    };
    match (value, time) {
        (QueryValue::Scalar { value, .. }, _) => Ok(vec![(Labels::empty(), vec![SeriesValue::Float(*value)])]),
        (QueryValue::Vector(samples), _) => Ok(samples
            .iter()
            .map(|s| (s.labels.clone(), vec![to_value(&s.value)]))
            .collect()),
        (QueryValue::Matrix(series), EvalTime::Range {
            start_ms,
            end_ms,
            step_ms,
        }) => {
            let steps = ((end_ms - start_ms) / step_ms.max(1) + 1) as usize;
            series
                .iter()
                .map(|s| {
                    let mut slots = vec![SeriesValue::Missing; steps];
                    for (t, v) in merged(s) {
                        let offset = t - start_ms;
                        if offset < 0 || offset % step_ms != 0 || offset / step_ms >= steps as i64 {
                            return Err(format!("{} has a point off the step grid at {}", s.labels, t));
                        }
                        slots[(offset / step_ms) as usize] = v;
                    }
                    Ok((s.labels.clone(), slots))
                })
                .collect()
        }
        // a range vector evaluated at one instant: the raw samples in order
        (QueryValue::Matrix(series), EvalTime::Instant { .. }) => Ok(series
            .iter()
            .map(|s| (s.labels.clone(), merged(s).into_iter().map(|(_, v)| v).collect()))
            .collect()),
        (QueryValue::String { value, .. }, _) => Err(format!("string results cannot be compared, got {value:?}")),
    }
}

fn merged(series: &RangeSeries) -> Vec<(i64, SeriesValue)> {
    let mut points: Vec<(i64, SeriesValue)> = series
        .floats
        .iter()
        .map(|p| (p.t, SeriesValue::Float(p.f)))
        .chain(series.histograms.iter().map(|p| (p.t, SeriesValue::Histogram((*p.h).clone()))))
        .collect();
    points.sort_by_key(|(t, _)| *t);
    points
}

fn compare_values(expected: &SeriesDef, actual: &[SeriesValue]) -> Result<(), String> {
    if expected.values.len() != actual.len() {
        return Err(format!(
            "{}: expected {} values, got {}: {:?}",
            expected.labels,
            expected.values.len(),
            actual.len(),
            actual
        ));
    }
    for (i, (e, a)) in expected.values.iter().zip(actual).enumerate() {
        let equal = match (e, a) {
            (SeriesValue::Missing, SeriesValue::Missing) => true,
            (SeriesValue::Float(e), SeriesValue::Float(a)) => floats_equal(*e, *a),
            (SeriesValue::Histogram(e), SeriesValue::Histogram(a)) => histograms_equal(e, a),
            _ => false,
        };
        if !equal {
            return Err(format!("{} value #{}: expected {:?}, got {:?}", expected.labels, i, e, a));
        }
    }
    Ok(())
}

fn floats_equal(expected: f64, actual: f64) -> bool {
    if expected.is_nan() || actual.is_nan() {
        return expected.is_nan() && actual.is_nan();
    }
    if expected == actual {
        return true;
    }
    let tolerance = 1e-6 * (expected.abs() + actual.abs()).max(1.0);
    (expected - actual).abs() <= tolerance
}

fn histograms_equal(expected: &FloatHistogram, actual: &FloatHistogram) -> bool {
    let (eb, ab) = (expected.buckets(), actual.buckets());
    expected.schema == actual.schema
        && floats_equal(expected.count, actual.count)
        && floats_equal(expected.sum, actual.sum)
        && floats_equal(expected.zero_count, actual.zero_count)
        && eb.len() == ab.len()
        && eb.iter().zip(&ab).all(|(e, a)| {
            floats_equal(e.lower, a.lower) && floats_equal(e.upper, a.upper) && floats_equal(e.count, a.count)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{Annotation, AnnotationKind, Annotations};
    use crate::context::QueryStats;
    use crate::model::{FPoint, InstantSample};

    fn eval(expectation: Expectation, time: EvalTime, expected: Vec<SeriesDef>) -> EvalCommand {
        EvalCommand {
            line: 1,
            time,
            query: "q".to_string(),
            expectation,
            ordered: false,
            expected,
        }
    }

    fn vector(samples: &[(&[(&str, &str)], f64)]) -> QueryResult {
        QueryResult {
            value: QueryValue::Vector(
                samples
                    .iter()
                    .map(|(labels, f)| InstantSample {
                        labels: Labels::from_pairs(labels),
                        timestamp_ms: 0,
                        value: SampleValue::Float(*f),
                    })
                    .collect(),
            ),
            annotations: Annotations::default(),
            stats: QueryStats::default(),
        }
    }

    fn def(labels: &[(&str, &str)], values: Vec<SeriesValue>) -> SeriesDef {
        SeriesDef {
            labels: Labels::from_pairs(labels),
            values,
        }
    }

    const INSTANT: EvalTime = EvalTime::Instant { at_ms: 0 };

    #[test]
    fn should_match_expected_results_in_any_order() {
        // given
        let result = vector(&[(&[("job", "b")], 2.0), (&[("job", "a")], 1.0)]);
        let expected = eval(
            Expectation::Success,
            INSTANT,
            vec![
                def(&[("job", "a")], vec![SeriesValue::Float(1.0)]),
                def(&[("job", "b")], vec![SeriesValue::Float(2.0)]),
            ],
        );

        // when
        let outcome = assert_result(&result, &expected, "test");

        // then
        assert_eq!(outcome, Ok(()));
    }

    #[test]
    fn should_reject_count_mismatch() {
        let result = vector(&[(&[("job", "a")], 1.0)]);
        let expected = eval(Expectation::Success, INSTANT, vec![]);

        let outcome = assert_result(&result, &expected, "test");

        assert!(outcome.unwrap_err().contains("expected 0 series, got 1"));
    }

    #[test]
    fn should_reject_mismatched_values() {
        let result = vector(&[(&[("job", "a")], 42.0)]);
        let expected = eval(
            Expectation::Success,
            INSTANT,
            vec![def(&[("job", "a")], vec![SeriesValue::Float(99.0)])],
        );

        let outcome = assert_result(&result, &expected, "test");

        assert!(outcome.unwrap_err().contains("value #0"));
    }

    #[test]
    fn should_require_exact_labels() {
        let result = vector(&[(&[("__name__", "up"), ("job", "a")], 1.0)]);
        let expected = eval(
            Expectation::Success,
            INSTANT,
            vec![def(&[("job", "a")], vec![SeriesValue::Float(1.0)])],
        );

        let outcome = assert_result(&result, &expected, "test");

        assert!(outcome.unwrap_err().contains("missing series"));
    }

    #[test]
    fn should_require_warning_for_eval_warn() {
        // given
        let mut result = vector(&[]);
        let expected = eval(Expectation::Warn, INSTANT, vec![]);

        // when
        let without = assert_result(&result, &expected, "test");
        result.annotations.add(Annotation {
            kind: AnnotationKind::Warning,
            message: "careful".to_string(),
            position: "q".to_string(),
        });
        let with = assert_result(&result, &expected, "test");

        // then
        assert!(without.is_err());
        assert_eq!(with, Ok(()));
    }

    #[test]
    fn should_place_range_points_on_step_slots() {
        // given
        let result = QueryResult {
            value: QueryValue::Matrix(vec![RangeSeries {
                labels: Labels::from_pairs(&[("job", "a")]),
                floats: vec![FPoint::new(0, 1.0), FPoint::new(20, 3.0)],
                histograms: Vec::new(),
            }]),
            annotations: Annotations::default(),
            stats: QueryStats::default(),
        };
        let expected = eval(
            Expectation::Success,
            EvalTime::Range {
                start_ms: 0,
                end_ms: 20,
                step_ms: 10,
            },
            vec![def(
                &[("job", "a")],
                vec![SeriesValue::Float(1.0), SeriesValue::Missing, SeriesValue::Float(3.0)],
            )],
        );

        // when
        let outcome = assert_result(&result, &expected, "test");

        // then
        assert_eq!(outcome, Ok(()));
    }

    #[test]
    fn should_compare_floats_with_tolerance() {
        assert!(floats_equal(1.0, 1.0 + 1e-9));
        assert!(floats_equal(f64::NAN, f64::NAN));
        assert!(floats_equal(f64::INFINITY, f64::INFINITY));
        assert!(!floats_equal(1.0, 1.1));
        assert!(!floats_equal(f64::NAN, 0.0));
    }
}
