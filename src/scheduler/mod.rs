//! Job scheduler contract.
//!
//! The scheduler stores, delays and eventually runs job payloads. The gates
//! only need to hand it jobs; they never get feedback about what it does
//! with them.

mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::job::{Job, JobId};

pub use memory::{InMemoryScheduler, ScheduledJob};

/// Receipt for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Identity of the stored instance
    pub job_id: JobId,
    /// Queue the job was placed on
    pub queue_name: String,
    /// Earliest time the job may run
    pub run_at: DateTime<Utc>,
}

/// Trait for job queue backends.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Place `job` on `queue_name`, to run after `delay` (or as soon as possible).
    ///
    /// Must accept copies of already-submitted jobs with a different delay or
    /// queue.
    async fn submit(&self, job: Job, delay: Option<Duration>, queue_name: &str) -> Result<JobHandle>;
}

#[async_trait]
impl<S: JobScheduler + ?Sized> JobScheduler for Arc<S> {
    async fn submit(&self, job: Job, delay: Option<Duration>, queue_name: &str) -> Result<JobHandle> {
        (**self).submit(job, delay, queue_name).await
    }
}
