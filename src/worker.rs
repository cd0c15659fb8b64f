use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use tracing::{debug, error, info, warn};

use crate::errors::{AlreadyRegistered, EnqueueError, JobError, WorkerError};
use crate::registry::QueueRegistry;
use crate::storage::{self, EnqueueOptions};
use crate::util;

pub type ConnectionPool = Pool<ConnectionManager<PgConnection>>;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// A single-threaded job worker: a queue registry plus a poll loop that
/// claims one eligible job at a time and runs it inside the claiming
/// transaction.
///
/// Concurrency comes from running multiple workers (in one process or
/// many) against the same table; the `FOR UPDATE SKIP LOCKED` claim keeps
/// them from ever running the same row twice.
pub struct Worker {
    connection_pool: ConnectionPool,
    registry: QueueRegistry,
    job_polling_interval: Duration,
    delete_job_on_complete: bool,
    verbose: bool,
    stop: Arc<AtomicBool>,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
}

impl Worker {
    /// Creates a worker with the default options: a 10 second polling
    /// interval, and completed jobs deleted from the table.
    pub fn new(connection_pool: ConnectionPool) -> Self {
        Self {
            connection_pool,
            registry: QueueRegistry::default(),
            job_polling_interval: DEFAULT_POLL_INTERVAL,
            delete_job_on_complete: true,
            verbose: false,
            stop: Arc::new(AtomicBool::new(false)),
            on_stop: None,
        }
    }

    /// How long to sleep when a poll finds no eligible job.
    pub fn job_polling_interval(mut self, interval: Duration) -> Self {
        self.job_polling_interval = interval;
        self
    }

    /// Keep completed rows in the table, with `ran_at` and `last_error`
    /// filled in, instead of deleting them.
    pub fn preserve_completed_jobs(mut self) -> Self {
        self.delete_job_on_complete = false;
        self
    }

    /// A callback invoked once after [`Worker::run`] exits.
    pub fn on_stop(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(f));
        self
    }

    /// Log a debug event for every poll, whether or not a job was found.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Registers the handler for a queue. At most one handler per queue
    /// name; registration happens before [`Worker::run`].
    pub fn register_queue(
        &mut self,
        queue_name: &str,
        handler: impl Fn(&[u8]) -> Result<(), JobError> + Send + Sync + 'static,
    ) -> Result<(), AlreadyRegistered> {
        self.registry.register(queue_name, Box::new(handler))
    }

    /// A handle that stops the worker from another thread. The signal is
    /// checked between attempts; an in-flight attempt runs to completion,
    /// commit included, before the loop exits.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Puts a job on a queue. Returns the new job's id.
    pub fn enqueue_job(
        &self,
        queue_name: &str,
        data: &[u8],
        options: EnqueueOptions,
    ) -> Result<i64, EnqueueError> {
        let conn = &mut *self.connection_pool.get()?;
        self.enqueue_job_in_tx(conn, queue_name, data, options)
    }

    /// Enqueues a job on a caller-supplied connection, so that the insert
    /// can ride in the caller's own transaction alongside other writes.
    /// Begin, commit, and rollback are entirely the caller's business.
    pub fn enqueue_job_in_tx(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        data: &[u8],
        options: EnqueueOptions,
    ) -> Result<i64, EnqueueError> {
        match storage::enqueue_job(conn, queue_name, data, &options) {
            Ok(id) => {
                info!(job.id = id, job.queue = %queue_name, "Enqueued job");
                Ok(id)
            }
            Err(error) => {
                error!(job.queue = %queue_name, %error, "Failed to enqueue job");
                Err(error.into())
            }
        }
    }

    /// Polls for jobs until stopped, sleeping for `polling_override` (or
    /// the configured polling interval) whenever no job was attempted.
    ///
    /// Returns `Ok(())` after [`StopHandle::stop`], or the first database
    /// error. Job handler failures never end the loop.
    pub fn run(&mut self, polling_override: Option<Duration>) -> Result<(), WorkerError> {
        info!(queues = ?self.registry.names(), "Starting job worker…");

        let result = self.poll_loop(polling_override);
        match &result {
            Ok(()) => info!("Exiting job worker"),
            Err(error) => error!(%error, "Exiting job worker"),
        }

        if let Some(on_stop) = self.on_stop.take() {
            on_stop();
        }
        result
    }

    fn poll_loop(&mut self, polling_override: Option<Duration>) -> Result<(), WorkerError> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }

            let attempted = self.perform_next_job()?;
            if self.verbose {
                debug!(attempted, "Polled for next job");
            }
            if !attempted {
                thread::sleep(polling_override.unwrap_or(self.job_polling_interval));
            }
        }
    }

    /// Performs one attempt: claim the next eligible job, run its handler,
    /// retire the row, and enqueue any retry, all in one transaction.
    ///
    /// Returns whether a job was attempted. Handler errors are recorded
    /// (or logged) and drive retry and backoff; only database failures
    /// surface as `Err`.
    pub fn perform_next_job(&mut self) -> Result<bool, WorkerError> {
        let eligible = self.registry.eligible_names(Utc::now());
        if eligible.is_empty() {
            // every queue is paused; skip the connection checkout entirely
            return Ok(false);
        }

        let conn = &mut *self.connection_pool.get()?;
        let registry = &mut self.registry;
        let delete_job_on_complete = self.delete_job_on_complete;

        conn.transaction::<_, WorkerError, _>(|conn| {
            let Some(job) = storage::find_next_unlocked_job(conn, &eligible)
                .optional()
                .map_err(WorkerError::LoadJob)?
            else {
                return Ok(false);
            };

            debug!(job.id, job.queue = %job.queue_name, "Claimed job…");

            let queue = registry
                .get_mut(&job.queue_name)
                .ok_or_else(|| WorkerError::UnregisteredQueue(job.queue_name.clone()))?;

            let ran_at = Utc::now();
            let handler = &queue.handler;
            let job_error = catch_unwind(AssertUnwindSafe(|| handler(&job.data)))
                .unwrap_or_else(|payload| Err(util::panic_to_job_error(&*payload)))
                .err();

            if delete_job_on_complete {
                storage::delete_job(conn, job.id)
                    .map_err(|source| WorkerError::DeleteJob { id: job.id, source })?;
            } else {
                storage::update_job(conn, job.id, ran_at, job_error.as_ref())
                    .map_err(|source| WorkerError::UpdateJob { id: job.id, source })?;
            }

            if let Some(error) = &job_error {
                warn!(job.id, job.queue = %job.queue_name, %error, "Job handler failed");

                if error.should_backoff() {
                    queue.increase_backoff();
                }

                if let Some((first_wait, remaining_waits)) = job.retry_waits.split_first() {
                    let after = Utc::now() + util::interval_duration(first_wait);
                    let options = EnqueueOptions::default().after(after).retry_waits(
                        remaining_waits.iter().map(util::interval_duration).collect(),
                    );
                    let retry_id =
                        storage::enqueue_job(conn, &job.queue_name, &job.data, &options)
                            .map_err(|source| WorkerError::EnqueueRetry { id: job.id, source })?;
                    debug!(job.id, retry.id = retry_id, retry.after = %after, "Enqueued retry");
                }
            }

            queue.pause_from(ran_at);
            Ok(true)
        })
    }

    /// Returns an error if any preserved job has a failure recorded.
    /// Intended for tests that drive a worker over a set of jobs and
    /// expect all of them to have succeeded.
    pub fn check_for_failed_jobs(&self) -> anyhow::Result<()> {
        let conn = &mut *self.connection_pool.get()?;
        let failed_jobs = storage::failed_job_count(conn)?;
        if failed_jobs == 0 {
            Ok(())
        } else {
            Err(anyhow!("{failed_jobs} jobs failed"))
        }
    }
}

/// Stops a running [`Worker`]. Obtained from [`Worker::stop_handle`]
/// before the worker is moved onto its own thread.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
