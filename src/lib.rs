//! A PostgreSQL-backed job queue.
//!
//! Safe concurrent claiming is built on the `FOR UPDATE SKIP LOCKED`
//! support introduced in PostgreSQL 9.5: any number of workers can poll
//! the same jobs table, and each eligible row is handed to at most one of
//! them per attempt. Per-job retry schedules ride on the row itself, and
//! a failing handler can pause its queue locally with exponential backoff.

mod errors;
mod registry;
pub mod schema;
mod storage;
mod util;
mod worker;

pub use self::errors::{AlreadyRegistered, EnqueueError, JobError, WorkerError};
pub use self::storage::EnqueueOptions;
pub use self::worker::{ConnectionPool, StopHandle, Worker};
