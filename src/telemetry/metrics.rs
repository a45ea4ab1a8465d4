//! Metric instrument factories for rq-tracing.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"rq-tracing"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for rq-tracing instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("rq-tracing")
}

/// Counter: jobs handed to a queue.
/// Labels: `queue`, `result` ("ok" | "error").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("rq.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: job lookups by id.
/// Labels: `queue`, `result` ("found" | "missing" | "error").
pub fn jobs_fetched() -> Counter<u64> {
    meter()
        .u64_counter("rq.jobs.fetched")
        .with_description("Number of job lookups")
        .build()
}

/// Counter: jobs executed by a worker.
/// Labels: `origin`, `status`.
pub fn jobs_performed() -> Counter<u64> {
    meter()
        .u64_counter("rq.jobs.performed")
        .with_description("Number of jobs performed")
        .build()
}

/// Histogram: job execution duration in milliseconds.
/// Labels: `origin`, `status`.
pub fn perform_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("rq.job.perform.duration_ms")
        .with_description("Job execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: trace context carried through job metadata.
/// Labels: `direction` ("inject" | "extract"), `outcome` ("injected" |
/// "sync_queue" | "disabled" | "no_context" | "extracted" | "missing" |
/// "malformed").
pub fn context_propagation() -> Counter<u64> {
    meter()
        .u64_counter("rq.trace.propagation")
        .with_description("Trace context propagation through job metadata")
        .build()
}

/// Counter: forced span flushes after job execution.
/// Labels: `result` ("ok" | "error" | "skipped").
pub fn span_flushes() -> Counter<u64> {
    meter()
        .u64_counter("rq.trace.flushes")
        .with_description("Forced span flushes after job execution")
        .build()
}
