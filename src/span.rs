//! Span lifecycle for intercepted queue operations.
//!
//! One span per intercepted call, opened with the tags its operation
//! requires and closed exactly once on every exit path:
//!
//! | Operation              | Kind     | Resource            | Tags                          |
//! |------------------------|----------|---------------------|-------------------------------|
//! | `rq.queue.enqueue_job` | producer | `[class.]func_name` | queue.name, job.id, job.func_name |
//! | `rq.queue.fetch_job`   | -        | -                   | job.id                        |
//! | `rq.worker.perform_job`| consumer | func_name           | job.id, job.status, job.origin |
//! | `rq.job.perform`       | -        | func_name           | job.id                        |
//! | `rq.job.fetch_many`    | -        | -                   | job.id (comma-joined)         |
//!
//! Spans are `tracing` spans; `tracing-opentelemetry` maps the `otel.*`
//! fields onto the exported span's kind and status.

use crate::carrier::TraceContext;
use crate::model::JobStatus;
use opentelemetry::Context;
use opentelemetry_semantic_conventions::attribute::{
    ERROR_TYPE, MESSAGING_DESTINATION_NAME, MESSAGING_MESSAGE_ID, MESSAGING_OPERATION_TYPE,
    MESSAGING_SYSTEM,
};
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::Span;
use tracing::field::Empty;
use tracing::warn;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Run instrumentation code, containing any panic.
pub(crate) fn isolate<T>(what: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(step = what, "rq instrumentation panicked, continuing without it");
            None
        }
    }
}

/// Value of the `component` tag and `messaging.system` attribute.
pub const COMPONENT: &str = "rq";

/// Messaging role of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Producer,
    Consumer,
}

/// The intercepted call a span describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    EnqueueJob,
    FetchJob,
    PerformJob,
    JobPerform,
    FetchMany,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::EnqueueJob => "rq.queue.enqueue_job",
            Operation::FetchJob => "rq.queue.fetch_job",
            Operation::PerformJob => "rq.worker.perform_job",
            Operation::JobPerform => "rq.job.perform",
            Operation::FetchMany => "rq.job.fetch_many",
        }
    }

    pub fn kind(self) -> Option<SpanKind> {
        match self {
            Operation::EnqueueJob => Some(SpanKind::Producer),
            Operation::PerformJob => Some(SpanKind::Consumer),
            Operation::FetchJob | Operation::JobPerform | Operation::FetchMany => None,
        }
    }

    fn messaging_operation(self) -> Option<&'static str> {
        match self {
            Operation::EnqueueJob => Some("send"),
            Operation::PerformJob => Some("process"),
            Operation::FetchJob | Operation::JobPerform | Operation::FetchMany => None,
        }
    }
}

/// Values the span's tags are filled from.
#[derive(Debug, Clone, Default)]
pub struct SpanRequest<'a> {
    /// None inherits the service of the enclosing span.
    pub service: Option<&'a str>,
    pub resource: Option<&'a str>,
    pub job_id: &'a str,
    pub queue: Option<&'a str>,
    pub func_name: Option<&'a str>,
}

/// `<class>.<func_name>` for bound methods, `<func_name>` otherwise.
pub fn resource_name(instance_class: Option<&str>, func_name: &str) -> String {
    match instance_class {
        Some(class) if !class.is_empty() => format!("{class}.{func_name}"),
        _ => func_name.to_string(),
    }
}

/// Where a span is in its lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    Active,
    Ok,
    Error,
    Closed,
}

/// A span that is closed when dropped, or earlier by [`ScopedSpan::close`].
#[derive(Debug)]
pub struct ScopedSpan {
    span: Option<Span>,
    state: Cell<SpanState>,
    operation: Operation,
}

/// Open the span for `operation`.
///
/// With a `parent`, the span joins the carried trace. Without one it nests
/// under the current span, which in a fresh worker makes it a root. If the
/// subscriber panics while the span is built, the returned span is already
/// closed and every later call on it is a no-op.
pub fn open(
    operation: Operation,
    request: &SpanRequest<'_>,
    parent: Option<&TraceContext>,
) -> ScopedSpan {
    let span = isolate("open span", || build(operation, request, parent));
    let state = if span.is_some() {
        SpanState::Active
    } else {
        SpanState::Closed
    };
    ScopedSpan {
        span,
        state: Cell::new(state),
        operation,
    }
}

fn build(
    operation: Operation,
    request: &SpanRequest<'_>,
    parent: Option<&TraceContext>,
) -> Span {
    let span = match operation {
        Operation::EnqueueJob => tracing::info_span!(
            "rq.queue.enqueue_job",
            "otel.kind" = "producer",
            "otel.status_code" = Empty,
            "otel.status_description" = Empty,
            "component" = COMPONENT,
            "service.name" = request.service,
            "resource.name" = request.resource,
            "queue.name" = request.queue,
            "job.id" = request.job_id,
            "job.func_name" = request.func_name,
        ),
        Operation::FetchJob => tracing::info_span!(
            "rq.queue.fetch_job",
            "otel.status_code" = Empty,
            "otel.status_description" = Empty,
            "component" = COMPONENT,
            "service.name" = request.service,
            "job.id" = request.job_id,
        ),
        Operation::PerformJob => tracing::info_span!(
            "rq.worker.perform_job",
            "otel.kind" = "consumer",
            "otel.status_code" = Empty,
            "otel.status_description" = Empty,
            "component" = COMPONENT,
            "service.name" = request.service,
            "resource.name" = request.resource,
            "job.id" = request.job_id,
            "job.status" = Empty,
            "job.origin" = Empty,
        ),
        Operation::JobPerform => tracing::info_span!(
            "rq.job.perform",
            "otel.status_code" = Empty,
            "otel.status_description" = Empty,
            "component" = COMPONENT,
            "resource.name" = request.resource,
            "job.id" = request.job_id,
        ),
        Operation::FetchMany => tracing::info_span!(
            "rq.job.fetch_many",
            "otel.status_code" = Empty,
            "otel.status_description" = Empty,
            "component" = COMPONENT,
            "service.name" = request.service,
            "job.id" = request.job_id,
        ),
    };

    if let Some(parent) = parent {
        let _ = span.set_parent(parent.as_context().clone());
    }

    span.set_attribute(MESSAGING_SYSTEM, COMPONENT);
    if let Some(op) = operation.messaging_operation() {
        span.set_attribute(MESSAGING_OPERATION_TYPE, op);
        span.set_attribute(MESSAGING_MESSAGE_ID, request.job_id.to_string());
    }
    if let Some(queue) = request.queue {
        span.set_attribute(MESSAGING_DESTINATION_NAME, queue.to_string());
    }
    span
}

impl ScopedSpan {
    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn state(&self) -> SpanState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state.get() == SpanState::Closed
    }

    /// The underlying span, until closed.
    pub fn span(&self) -> Option<&Span> {
        self.span.as_ref()
    }

    /// Run `f` with this span entered. After close, or when entering the
    /// span panics in the subscriber, `f` runs bare. `f` itself always runs.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        let entered = self
            .span
            .as_ref()
            .and_then(|span| isolate("enter span", || span.enter()));
        let value = f();
        if let Some(entered) = entered {
            isolate("exit span", move || drop(entered));
        }
        value
    }

    /// Propagable context of this span. Invalid once closed.
    pub fn context(&self) -> TraceContext {
        match &self.span {
            Some(span) => TraceContext::from_span(span),
            None => TraceContext::from_context(Context::new()),
        }
    }

    /// Record `job.status` and `job.origin`. A job without status reports
    /// `"None"`.
    pub fn record_job_outcome(&self, status: Option<JobStatus>, origin: Option<&str>) {
        let Some(span) = &self.span else {
            return;
        };
        isolate("record outcome", || {
            span.record("job.status", status.map_or("None", JobStatus::as_str));
            if let Some(origin) = origin {
                span.record("job.origin", origin);
            }
        });
    }

    pub fn mark_ok(&self) {
        if self.state.get() == SpanState::Active {
            self.state.set(SpanState::Ok);
        }
    }

    /// Mark the span failed. The last error recorded wins.
    pub fn mark_error(&self, error_type: &str, message: &str) {
        let Some(span) = &self.span else {
            return;
        };
        isolate("mark error", || {
            span.record("otel.status_code", "error");
            span.record("otel.status_description", message);
            span.set_attribute(ERROR_TYPE, error_type.to_string());
        });
        self.state.set(SpanState::Error);
    }

    /// End the span. Closing again does nothing.
    pub fn close(&mut self) {
        if let Some(span) = self.span.take() {
            isolate("close span", move || drop(span));
            self.state.set(SpanState::Closed);
        }
    }
}

impl Drop for ScopedSpan {
    fn drop(&mut self) {
        if std::thread::panicking() && self.state.get() == SpanState::Active {
            self.mark_error("panic", "panicked while span was active");
        }
        self.close();
    }
}
