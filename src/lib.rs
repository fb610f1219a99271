//! Job Limiter - distributed dedup and throttle gates for job pipelines
//!
//! This crate decides, for a stream of job requests addressing the same
//! logical resource, which requests run, which are dropped as redundant, and
//! which are deferred, without losing the effect of the latest request. All
//! coordination goes through an external lock store with atomic
//! set-if-absent and TTL expiry, so the enqueue and perform halves of a job
//! may run in different processes.

pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod extractor;
pub mod gate;
pub mod job;
pub mod key;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod store;

pub use decision::{Decision, GateOutcome};
pub use error::{LimiterError, Result};
pub use job::{Job, JobId};
pub use pipeline::{Gated, JobPolicy, Limiter};
