//! What the instrumentation needs from the queue engine.
//!
//! The engine itself (persistence, scheduling, retries, worker pools) lives
//! elsewhere. Adapters implement these traits over it, and the traced
//! wrappers in [`crate::intercept`] implement them again on top.

use crate::model::{Job, JobStatus, Metadata};

/// Read access to a job plus write access to its metadata.
pub trait JobHandle {
    fn id(&self) -> &str;

    fn func_name(&self) -> &str;

    /// Qualified class of the bound instance, if the job calls a method.
    fn instance_class(&self) -> Option<&str> {
        None
    }

    /// Queue the job was enqueued on.
    fn origin(&self) -> Option<&str>;

    fn status(&self) -> Option<JobStatus>;

    fn is_failed(&self) -> bool {
        self.status() == Some(JobStatus::Failed)
    }

    fn meta(&self) -> &Metadata;

    fn meta_mut(&mut self) -> &mut Metadata;
}

impl JobHandle for Job {
    fn id(&self) -> &str {
        &self.id
    }

    fn func_name(&self) -> &str {
        &self.func_name
    }

    fn instance_class(&self) -> Option<&str> {
        self.instance_class.as_deref()
    }

    fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    fn status(&self) -> Option<JobStatus> {
        self.status
    }

    fn meta(&self) -> &Metadata {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Metadata {
        &mut self.meta
    }
}

/// Producer side of the engine: a named queue.
pub trait Queue {
    type Job: JobHandle;
    type Error;

    fn name(&self) -> &str;

    /// False when jobs run inline during enqueue, in the same process.
    fn is_async(&self) -> bool;

    /// Hand a job to the engine for persistence. Returns the stored job.
    fn enqueue_job(&self, job: Self::Job) -> Result<Self::Job, Self::Error>;

    /// Look a job up by id without running it.
    fn fetch_job(&self, job_id: &str) -> Result<Option<Self::Job>, Self::Error>;

    /// Look several jobs up at once. Missing ids yield `None` in place.
    fn fetch_many(&self, job_ids: &[&str]) -> Result<Vec<Option<Self::Job>>, Self::Error> {
        job_ids.iter().map(|id| self.fetch_job(id)).collect()
    }
}

/// Consumer side of the engine: runs jobs, usually in a short-lived process.
pub trait Worker {
    type Job: JobHandle;
    type Output;
    type Error;

    fn name(&self) -> &str;

    /// Run the job body and update the job's status.
    fn perform_job(&mut self, job: &mut Self::Job) -> Result<Self::Output, Self::Error>;
}
