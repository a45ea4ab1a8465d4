//! Structured events emitted by the instrumentation after each intercepted
//! call.
//!
//! Listeners subscribe to build audit logs, custom tags or tests. The span
//! and carrier work happens inline; events only report what was done.
//! A listener that panics is logged and skipped so it cannot reach the job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::model::JobStatus;

/// A structured event emitted by the instrumentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    JobEnqueued {
        job_id: String,
        queue: String,
        func_name: String,
        context_injected: bool,
    },
    JobFetched {
        job_id: String,
        queue: String,
        found: bool,
    },
    JobPerformed {
        job_id: String,
        status: Option<JobStatus>,
        origin: Option<String>,
        failed: bool,
        duration_ms: u64,
    },
    /// Emitted last on the consumer path, after the forced flush.
    PerformFinished {
        job_id: String,
        flushed: bool,
    },
}

impl Event {
    /// One-line JSON, for audit logs.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Receives events from an [`EventBus`].
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> Listener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Fan-out of events to registered listeners.
#[derive(Default)]
pub struct EventBus {
    seq: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn Listener>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Listener + 'static) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Stamp `kind` with a sequence number and deliver it to every listener.
    pub fn dispatch(&self, kind: EventKind) -> Event {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };

        // Snapshot so listeners may subscribe others without deadlocking.
        let listeners: Vec<Arc<dyn Listener>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                tracing::warn!(seq = event.seq, "event listener panicked");
            }
        }

        event
    }
}
