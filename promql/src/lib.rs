//! A streaming PromQL engine.
//!
//! Queries are planned into a tree of pull-based operators that produce one
//! series at a time, so memory is bounded by what each operator must hold
//! rather than by the size of the result. Every buffer is charged to a
//! per-query [`MemoryConsumptionTracker`], which enforces the memory limit in
//! [`QueryLimits`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::SystemTime;
//! use promql_engine::{Engine, EngineConfig, InMemoryQueryable};
//!
//! # async fn run() -> Result<(), promql_engine::EvaluationError> {
//! let storage = Arc::new(InMemoryQueryable::default());
//! let engine = Engine::new(EngineConfig::default());
//! let result = engine
//!     .instant_query(storage, "sum by (job) (rate(http_requests_total[5m]))", SystemTime::now())?
//!     .exec()
//!     .await?;
//! println!("{:?}", result.value);
//! # Ok(())
//! # }
//! ```

pub mod annotations;
pub mod config;
pub mod context;
mod engine;
pub mod error;
mod functions;
pub mod histogram;
pub mod memory;
pub mod model;
mod operators;
mod planner;
mod ring_buffer;
pub mod storage;
pub mod time_range;
mod types;

#[cfg(test)]
mod promqltest;

pub use annotations::{Annotation, AnnotationKind, Annotations};
pub use config::{EngineConfig, QueryLimits};
pub use context::QueryStats;
pub use engine::{Engine, MAX_POINTS_PER_SERIES, Query, QueryResult};
pub use error::{EvalResult, EvaluationError, LimitedResource, StorageError};
pub use histogram::FloatHistogram;
pub use memory::MemoryConsumptionTracker;
pub use model::{FPoint, HPoint, InstantSample, Label, Labels, QueryValue, RangeSeries, Sample, SampleValue};
pub use storage::{InMemoryQueryable, Queryable};
pub use time_range::QueryTimeRange;
