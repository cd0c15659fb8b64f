use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::{AlreadyRegistered, JobError};

pub(crate) const MIN_BACKOFF: Duration = Duration::from_millis(100);
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub(crate) type Handler = Box<dyn Fn(&[u8]) -> Result<(), JobError> + Send + Sync>;

/// A registered queue: its handler plus the worker-local backoff state.
pub(crate) struct Queue {
    pub(crate) handler: Handler,
    pub(crate) paused_until: DateTime<Utc>,
    pub(crate) backoff: Duration,
}

impl Queue {
    fn new(handler: Handler) -> Self {
        Self {
            handler,
            paused_until: DateTime::UNIX_EPOCH,
            backoff: Duration::ZERO,
        }
    }

    /// The first backoff-signalling failure starts the backoff at
    /// `MIN_BACKOFF`; each consecutive one doubles it, capped at
    /// `MAX_BACKOFF`.
    pub(crate) fn increase_backoff(&mut self) {
        self.backoff = if self.backoff.is_zero() {
            MIN_BACKOFF
        } else {
            (self.backoff * 2).min(MAX_BACKOFF)
        };
    }

    /// Pauses the queue for the current backoff window. A no-op until a
    /// backoff-signalling failure has happened; after one, every attempt
    /// re-arms the pause, successes included.
    pub(crate) fn pause_from(&mut self, ran_at: DateTime<Utc>) {
        if !self.backoff.is_zero() {
            self.paused_until = ran_at + self.backoff;
        }
    }
}

/// The worker's queue table. Registration all happens before the worker
/// starts polling; nothing here is shared across threads.
#[derive(Default)]
pub(crate) struct QueueRegistry {
    queues: HashMap<String, Queue>,
}

impl QueueRegistry {
    pub(crate) fn register(
        &mut self,
        queue_name: &str,
        handler: Handler,
    ) -> Result<(), AlreadyRegistered> {
        if self.queues.contains_key(queue_name) {
            return Err(AlreadyRegistered {
                queue_name: queue_name.to_string(),
            });
        }
        self.queues.insert(queue_name.to_string(), Queue::new(handler));
        Ok(())
    }

    pub(crate) fn names(&self) -> Vec<&str> {
        self.queues.keys().map(String::as_str).collect()
    }

    /// The queue names that are not locally paused at `now`, in
    /// unspecified order.
    pub(crate) fn eligible_names(&self, now: DateTime<Utc>) -> Vec<String> {
        self.queues
            .iter()
            .filter(|(_, queue)| queue.paused_until < now)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub(crate) fn get_mut(&mut self, queue_name: &str) -> Option<&mut Queue> {
        self.queues.get_mut(queue_name)
    }
}
