//! In-process delayed job queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::{JobHandle, JobScheduler};
use crate::clock::Clock;
use crate::error::{LimiterError, Result};
use crate::job::Job;

/// A job waiting in the queue.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    /// The stored job
    pub job: Job,
    /// Earliest time it may run
    pub run_at: DateTime<Utc>,
    /// Delay requested at submission
    pub delay: Option<Duration>,
}

/// Delayed job queue kept in memory, ordered by run time.
pub struct InMemoryScheduler {
    jobs: Mutex<Vec<ScheduledJob>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryScheduler {
    /// Create an empty queue reading time from `clock`.
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            clock: Arc::new(clock),
        }
    }

    /// Remove and return every job whose run time has arrived, earliest first.
    pub fn take_due(&self) -> Vec<ScheduledJob> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock();
        let (due, waiting): (Vec<_>, Vec<_>) = jobs.drain(..).partition(|s| s.run_at <= now);
        *jobs = waiting;
        due
    }

    /// Snapshot of the queued jobs, earliest first.
    pub fn pending(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().clone()
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobScheduler for InMemoryScheduler {
    async fn submit(&self, mut job: Job, delay: Option<Duration>, queue_name: &str) -> Result<JobHandle> {
        let job_id = job
            .job_id
            .ok_or_else(|| LimiterError::Scheduler("cannot submit a dropped job".to_string()))?;

        let offset = delay
            .map(|d| chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX))
            .unwrap_or_else(chrono::Duration::zero);
        let run_at = self
            .clock
            .now()
            .checked_add_signed(offset)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        job.queue_name = queue_name.to_string();
        debug!(job_id = %job_id, queue = %queue_name, run_at = %run_at, "Job submitted");

        let mut jobs = self.jobs.lock();
        // Stable for equal run times: insert after existing entries
        let position = jobs.partition_point(|s| s.run_at <= run_at);
        jobs.insert(position, ScheduledJob { job, run_at, delay });

        Ok(JobHandle {
            job_id,
            queue_name: queue_name.to_string(),
            run_at,
        })
    }
}
