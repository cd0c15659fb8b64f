use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::data_types::PgInterval;
use diesel::dsl::now;
use diesel::prelude::*;
use diesel::{delete, insert_into, update};

use crate::errors::JobError;
use crate::schema::pgq_jobs;
use crate::util;

/// A claimed job row. Only the columns an attempt needs are selected; the
/// row stays locked until the claiming transaction ends.
#[derive(Queryable, Identifiable, Debug, Clone)]
#[diesel(table_name = pgq_jobs)]
pub(crate) struct Job {
    pub(crate) id: i64,
    pub(crate) queue_name: String,
    pub(crate) data: Vec<u8>,
    pub(crate) retry_waits: Vec<PgInterval>,
}

/// Options accepted by the enqueue calls.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    run_after: Option<DateTime<Utc>>,
    retry_waits: Vec<Duration>,
}

impl EnqueueOptions {
    /// Do not run the job before `t`. Defaults to the enqueue time.
    pub fn after(mut self, t: DateTime<Utc>) -> Self {
        self.run_after = Some(t);
        self
    }

    /// The delays to wait before each successive retry, consumed head-first
    /// when an attempt fails. Defaults to empty, i.e. no retries.
    pub fn retry_waits(mut self, waits: Vec<Duration>) -> Self {
        self.retry_waits = waits;
        self
    }
}

#[derive(Insertable)]
#[diesel(table_name = pgq_jobs)]
struct NewJob<'a> {
    queue_name: &'a str,
    data: &'a [u8],
    run_after: Option<DateTime<Utc>>,
    retry_waits: Vec<PgInterval>,
}

/// Inserts a new job row and returns its id. When `run_after` is not set
/// the column default (the enqueue time) applies.
pub(crate) fn enqueue_job(
    conn: &mut PgConnection,
    queue_name: &str,
    data: &[u8],
    options: &EnqueueOptions,
) -> QueryResult<i64> {
    let job = NewJob {
        queue_name,
        data,
        run_after: options.run_after,
        retry_waits: options
            .retry_waits
            .iter()
            .copied()
            .map(util::pg_interval)
            .collect(),
    };

    insert_into(pgq_jobs::table)
        .values(job)
        .returning(pgq_jobs::id)
        .get_result(conn)
}

/// Finds the oldest eligible job on any of `queue_names` and locks it,
/// skipping rows already locked by other transactions. The lock is held
/// until the enclosing transaction ends.
pub(crate) fn find_next_unlocked_job(
    conn: &mut PgConnection,
    queue_names: &[String],
) -> QueryResult<Job> {
    use crate::schema::pgq_jobs::dsl::*;

    pgq_jobs
        .select((id, queue_name, data, retry_waits))
        .filter(queue_name.eq_any(queue_names))
        .filter(run_after.le(now))
        .filter(ran_at.is_null())
        .order((run_after, id))
        .for_update()
        .skip_locked()
        .first::<Job>(conn)
}

pub(crate) fn delete_job(conn: &mut PgConnection, job_id: i64) -> QueryResult<()> {
    delete(pgq_jobs::table.find(job_id)).execute(conn)?;
    Ok(())
}

/// Marks an attempted job instead of deleting it: stores the attempt time
/// and the handler error, if any.
pub(crate) fn update_job(
    conn: &mut PgConnection,
    job_id: i64,
    attempted_at: DateTime<Utc>,
    error: Option<&JobError>,
) -> QueryResult<()> {
    update(pgq_jobs::table.find(job_id))
        .set((
            pgq_jobs::ran_at.eq(attempted_at),
            pgq_jobs::last_error.eq(error.map(ToString::to_string)),
        ))
        .execute(conn)?;
    Ok(())
}

/// The number of preserved jobs whose last attempt failed.
pub(crate) fn failed_job_count(conn: &mut PgConnection) -> QueryResult<i64> {
    pgq_jobs::table
        .count()
        .filter(pgq_jobs::last_error.is_not_null())
        .get_result(conn)
}
