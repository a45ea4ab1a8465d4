//! Core data model.
//!
//! A job is owned by the queue engine. This crate only reads it and adds
//! keys to its metadata, so the record here mirrors what an rq job exposes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Free-form job metadata. Persisted by the queue engine alongside the job,
/// which makes it the carrier for trace context.
pub type Metadata = HashMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job record as handed to the queue engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at creation.
    pub id: String,

    /// Dotted path of the function the worker will call (e.g. "tasks.send_email").
    pub func_name: String,

    /// Qualified class of the bound instance when the job calls a method.
    pub instance_class: Option<String>,

    /// Name of the queue the job was enqueued on. Set by the engine.
    pub origin: Option<String>,

    /// Current status. None until the engine first persists the job.
    pub status: Option<JobStatus>,

    /// Positional arguments for the job function. Opaque to this crate.
    pub args: serde_json::Value,

    /// Job metadata, shared by user code and instrumentation.
    pub meta: Metadata,
}

impl Job {
    pub fn new(func_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            func_name: func_name.into(),
            instance_class: None,
            origin: None,
            status: None,
            args: serde_json::Value::Null,
            meta: Metadata::new(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn instance_class(mut self, class: impl Into<String>) -> Self {
        self.instance_class = Some(class.into());
        self
    }

    pub fn origin(mut self, queue: impl Into<String>) -> Self {
        self.origin = Some(queue.into());
        self
    }

    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn meta(mut self, meta: Metadata) -> Self {
        self.meta = meta;
        self
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job, as reported by the queue engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting on a queue.
    Queued,
    /// Picked up by a worker.
    Started,
    /// Job body returned.
    Finished,
    /// Job body raised or the worker gave up on it.
    Failed,
    /// Stopped on request while running.
    Stopped,
    /// Waiting for its scheduled time.
    Scheduled,
    /// Waiting on dependencies.
    Deferred,
    /// Cancelled before it ran.
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Deferred => "deferred",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "started" => Ok(JobStatus::Started),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            "scheduled" => Ok(JobStatus::Scheduled),
            "deferred" => Ok(JobStatus::Deferred),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(crate::error::Error::Other(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}
