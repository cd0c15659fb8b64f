use diesel::r2d2::PoolError;
use diesel::result::Error as DieselError;

/// An error occurred queueing a job.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EnqueueError {
    /// A connection could not be checked out of the pool.
    #[error("could not acquire a database connection")]
    PoolError(#[from] PoolError),

    /// The insert into the jobs table failed.
    #[error(transparent)]
    DatabaseError(#[from] DieselError),
}

/// A database or transaction failure while claiming or retiring a job.
///
/// Errors returned by job handlers are never `WorkerError`s: they are
/// recorded on the job row (or logged) and drive retry and backoff. A
/// `WorkerError` aborts [`Worker::run`](crate::Worker::run).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// A connection could not be checked out of the pool.
    #[error("could not acquire a database connection")]
    PoolError(#[from] PoolError),

    /// The claim query failed.
    #[error("error loading the next job")]
    LoadJob(#[source] DieselError),

    /// The claimed row names a queue this worker has no handler for. The
    /// claim query filters by the registered queue names, so this indicates
    /// a bug rather than a misconfigured producer.
    #[error("no handler registered for the '{0}' queue")]
    UnregisteredQueue(String),

    #[error("could not delete job {id}")]
    DeleteJob {
        id: i64,
        #[source]
        source: DieselError,
    },

    #[error("could not update job {id}")]
    UpdateJob {
        id: i64,
        #[source]
        source: DieselError,
    },

    #[error("could not enqueue a retry of job {id}")]
    EnqueueRetry {
        id: i64,
        #[source]
        source: DieselError,
    },

    /// A transaction-level failure, usually a failed commit.
    #[error(transparent)]
    Transaction(#[from] DieselError),
}

/// A handler was already registered for this queue name.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("a handler for the '{queue_name}' queue has already been registered")]
pub struct AlreadyRegistered {
    pub queue_name: String,
}

/// An error returned by a job handler.
///
/// A handler signals that its whole queue should pause locally before the
/// next claim (say, because a downstream dependency is struggling) by
/// returning an error built with [`JobError::with_backoff`]. Consecutive
/// backoff errors double the pause, up to one minute.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    message: String,
    backoff: bool,
}

impl JobError {
    /// An error that does not ask for queue backoff.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backoff: false,
        }
    }

    /// An error that pauses the queue locally before the next claim.
    pub fn with_backoff(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backoff: true,
        }
    }

    pub fn should_backoff(&self) -> bool {
        self.backoff
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(format!("{error:#}"))
    }
}
