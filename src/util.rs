use std::any::Any;
use std::time::Duration;

use diesel::data_types::PgInterval;

use crate::errors::JobError;

const MICROS_PER_DAY: i64 = 24 * 60 * 60 * 1_000_000;

pub(crate) fn pg_interval(duration: Duration) -> PgInterval {
    PgInterval::from_microseconds(duration.as_micros() as i64)
}

/// Postgres intervals carry months and days as separate fields; flatten
/// them with the 30-day-month and 24-hour-day conventions Postgres itself
/// uses for interval arithmetic.
pub(crate) fn interval_duration(interval: &PgInterval) -> Duration {
    let micros = interval.microseconds
        + i64::from(interval.days) * MICROS_PER_DAY
        + i64::from(interval.months) * 30 * MICROS_PER_DAY;
    Duration::from_micros(micros.max(0) as u64)
}

/// The payload we get back from `catch_unwind` is untyped. Panics raised
/// through the standard macros carry a `&str` or a `String`, so try both
/// before giving up.
pub(crate) fn panic_to_job_error(payload: &(dyn Any + Send + 'static)) -> JobError {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        JobError::new(format!("job handler panicked: {message}"))
    } else if let Some(message) = payload.downcast_ref::<String>() {
        JobError::new(format!("job handler panicked: {message}"))
    } else {
        JobError::new("job handler panicked")
    }
}
