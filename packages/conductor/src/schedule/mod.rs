//! Schedule evaluation: when is a manifest due?
//!
//! Everything here is pure — time comes in as an argument and the answer is
//! a timestamp or "never". The manager applies these answers; nothing in
//! this module touches the store.

pub mod cron;
pub mod evaluator;

pub use cron::CronExpression;
pub use evaluator::{is_due, next_due_at, to_cron_expression, validate_schedule};

/// Why a schedule is unusable. Fatal for the offending manifest only: it is
/// disabled with a persisted note, other manifests are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("cron expression must have 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("range start {start} is after end {end} in {field} field")]
    InvertedRange {
        field: &'static str,
        start: u32,
        end: u32,
    },

    #[error("step must be positive in {field} field")]
    ZeroStep { field: &'static str },

    #[error("cron schedule requires a cron expression")]
    MissingCronExpression,

    #[error("interval schedule requires a positive interval, got {0:?}")]
    InvalidInterval(Option<i64>),
}
