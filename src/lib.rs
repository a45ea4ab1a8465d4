//! # rq-tracing
//!
//! Distributed tracing for rq-style job queues.
//!
//! Every enqueue gets a producer span whose context is written into the
//! job's metadata; every execution gets a consumer span that continues that
//! trace, possibly in another process on another host, and is flushed
//! before the worker process can exit.

pub mod carrier;
pub mod config;
pub mod error;
pub mod event;
pub mod integration;
pub mod intercept;
pub mod model;
pub mod pin;
pub mod queue;
pub mod span;
pub mod telemetry;

pub use carrier::TraceContext;
pub use integration::Integration;
pub use intercept::{TracedQueue, TracedWorker};
pub use model::{Job, JobStatus, Metadata};
pub use queue::{JobHandle, Queue, Worker};
