use std::sync::Arc;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::model::{Labels, Sample};
use crate::promqltest::assert::assert_result;
use crate::promqltest::dsl::{Command, EvalCommand, Expectation, FailMatch, SeriesValue, parse_script};
use crate::promqltest::evaluator::eval_query;
use crate::storage::{InMemoryQueryable, Queryable};

/// Runs every command of a `.test` script, stopping at the first failure.
pub async fn run_test(name: &str, input: &str) -> Result<(), String> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let commands = parse_script(input).map_err(|e| format!("{name}: {e}"))?;
    let engine = Engine::new(EngineConfig::default());
    let mut loaded: Vec<(Labels, Vec<Sample>)> = Vec::new();
    let mut queryable: Arc<dyn Queryable> = Arc::new(InMemoryQueryable::default());

    for command in commands {
        match command {
            Command::Load { interval_ms, series } => {
                for s in series {
                    loaded.push((s.labels, samples(s.values, interval_ms)));
                }
                let mut builder = InMemoryQueryable::builder();
                for (labels, samples) in &loaded {
                    builder.add_series(labels.clone(), samples.iter().cloned());
                }
                queryable = Arc::new(builder.build());
            }
            Command::Clear => {
                loaded.clear();
                queryable = Arc::new(InMemoryQueryable::default());
            }
            Command::Eval(eval) => run_eval(&engine, queryable.clone(), &eval, name).await?,
        }
    }
    Ok(())
}

/// Value `i` of a loaded series lands at `i * interval_ms`.
fn samples(values: Vec<SeriesValue>, interval_ms: i64) -> Vec<Sample> {
    values
        .into_iter()
        .enumerate()
        .filter_map(|(i, v)| {
            let t = i as i64 * interval_ms;
            match v {
                SeriesValue::Missing => None,
                SeriesValue::Stale => Some(Sample::stale(t)),
                SeriesValue::Float(f) => Some(Sample::float(t, f)),
                SeriesValue::Histogram(h) => Some(Sample::histogram(t, h)),
            }
        })
        .collect()
}

async fn run_eval(
    engine: &Engine,
    queryable: Arc<dyn Queryable>,
    eval: &EvalCommand,
    test_name: &str,
) -> Result<(), String> {
    let outcome = eval_query(engine, queryable, eval.time, &eval.query).await;
    let context = || format!("{} line {} (query: {})", test_name, eval.line, eval.query);
    match (&eval.expectation, outcome) {
        (Expectation::Fail(matcher), Err(e)) => {
            let message = e.to_string();
            let matches = match matcher {
                None => true,
                Some(FailMatch::Message(expected)) => message.contains(expected.as_str()),
                Some(FailMatch::Regexp(re)) => re.is_match(&message),
            };
            if matches {
                Ok(())
            } else {
                Err(format!("{}: error {:?} does not match {:?}", context(), message, matcher))
            }
        }
        (Expectation::Fail(_), Ok(result)) => {
            Err(format!("{}: expected an error, got {:?}", context(), result.value))
        }
        (_, Err(e)) => Err(format!("{}: unexpected error: {}", context(), e)),
        (_, Ok(result)) => assert_result(&result, eval, test_name),
    }
}
