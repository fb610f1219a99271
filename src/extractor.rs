//! Resource id extraction for the throttle gate.

use serde_json::Value;

use crate::error::{LimiterError, Result};
use crate::job::Job;

/// Derives the id of the thing being rate limited from a job.
pub trait ResourceExtractor: Send + Sync {
    /// Compute the resource id. Must be deterministic for equal arguments.
    fn extract(&self, job: &Job) -> Result<String>;
}

/// Builds the resource id from selected job arguments.
///
/// Strings are used verbatim; numbers and booleans by their JSON text.
/// Several indices are joined with `:` without escaping, so `["a:b"]` and
/// `["a", "b"]` name the same resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentExtractor {
    indices: Vec<usize>,
}

impl ArgumentExtractor {
    /// Select the arguments at `indices`, in order.
    pub fn new(indices: Vec<usize>) -> Self {
        Self { indices }
    }

    /// Select only the first argument.
    pub fn first() -> Self {
        Self::new(vec![0])
    }

    fn part(job: &Job, index: usize) -> Result<String> {
        match job.arguments.get(index) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(v.to_string()),
            Some(other) => Err(LimiterError::MisconfiguredResourceExtractor(format!(
                "argument {} of {} is not a scalar: {}",
                index, job.job_class, other
            ))),
            None => Err(LimiterError::MisconfiguredResourceExtractor(format!(
                "{} has no argument at index {}",
                job.job_class, index
            ))),
        }
    }
}

impl ResourceExtractor for ArgumentExtractor {
    fn extract(&self, job: &Job) -> Result<String> {
        if self.indices.is_empty() {
            return Err(LimiterError::MisconfiguredResourceExtractor(
                "no resource arguments selected".to_string(),
            ));
        }

        let parts = self
            .indices
            .iter()
            .map(|&index| Self::part(job, index))
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join(":"))
    }
}

/// Wraps a closure as an extractor.
pub struct FnExtractor<F> {
    f: F,
}

impl<F> FnExtractor<F>
where
    F: Fn(&Job) -> std::result::Result<String, String> + Send + Sync,
{
    /// Wrap `f`. An `Err` or an empty id is reported as a misconfiguration.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ResourceExtractor for FnExtractor<F>
where
    F: Fn(&Job) -> std::result::Result<String, String> + Send + Sync,
{
    fn extract(&self, job: &Job) -> Result<String> {
        let id = (self.f)(job).map_err(LimiterError::MisconfiguredResourceExtractor)?;
        if id.is_empty() {
            return Err(LimiterError::MisconfiguredResourceExtractor(format!(
                "empty resource id for {}",
                job.job_class
            )));
        }
        Ok(id)
    }
}
