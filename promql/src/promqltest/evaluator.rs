use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::engine::{Engine, QueryResult};
use crate::error::EvalResult;
use crate::promqltest::dsl::EvalTime;
use crate::storage::Queryable;
use crate::time_range::system_time_from_millis;

fn system_time(millis: i64) -> EvalResult<SystemTime> {
    system_time_from_millis(millis).ok_or_else(|| {
        crate::error::EvaluationError::InvalidRange(format!("timestamp {millis} is out of range"))
    })
}

/// Runs `query` the way the `eval` directive asks for.
pub(super) async fn eval_query(
    engine: &Engine,
    queryable: Arc<dyn Queryable>,
    time: EvalTime,
    query: &str,
) -> EvalResult<QueryResult> {
    let prepared = match time {
        EvalTime::Instant { at_ms } => engine.instant_query(queryable, query, system_time(at_ms)?)?,
        EvalTime::Range {
            start_ms,
            end_ms,
            step_ms,
        } => engine.range_query(
            queryable,
            query,
            system_time(start_ms)?,
            system_time(end_ms)?,
            Duration::from_millis(step_ms.max(0) as u64),
        )?,
    };
    prepared.exec().await
}
