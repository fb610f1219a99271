//! Lock key generation.

use sha1::{Digest, Sha1};

use crate::error::Result;
use crate::job::Job;

/// Default namespace prefixed to every lock key.
pub const DEFAULT_NAMESPACE: &str = "limiter";

/// The throttle protocol's three lock slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockPhase {
    /// Held from enqueue until the job starts performing
    Enqueue,
    /// Held from start of perform for the throttle duration
    Perform,
    /// Held once a retry has been registered
    Reschedule,
}

impl LockPhase {
    /// Phase tag used as the key suffix.
    pub fn as_str(&self) -> &'static str {
        match self {
            LockPhase::Enqueue => "enqueue",
            LockPhase::Perform => "perform",
            LockPhase::Reschedule => "reschedule",
        }
    }
}

/// A key that uniquely addresses one slot in the lock store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    /// Dedup key: namespace, job class and the SHA-1 of the serialized arguments.
    pub fn for_dedup(namespace: &str, job: &Job) -> Result<Self> {
        let digest = Sha1::digest(job.serialized_arguments()?.as_bytes());
        Ok(Self(format!("{}:{}:{:x}", namespace, job.job_class, digest)))
    }

    /// Throttle key for one phase of a job-resource pair.
    pub fn for_resource(
        namespace: &str,
        job_class: &str,
        resource_id: &str,
        phase: LockPhase,
    ) -> Self {
        Self(format!(
            "{}:{}:{}:{}",
            namespace,
            job_class,
            resource_id,
            phase.as_str()
        ))
    }

    /// The raw key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource id used for enqueue locks: namespaced by destination queue.
///
/// Parts are joined with `:` unescaped, so a resource id containing `:` can
/// collide with another resource on another queue (`x:y` on `z` and `x` on
/// `y:z`). Queue names and resource ids must not contain `:` when that matters.
pub fn enqueue_resource_id(resource_id: &str, queue_name: &str) -> String {
    format!("{}:{}", resource_id, queue_name)
}
