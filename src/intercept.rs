//! Traced wrappers around a queue engine's lifecycle calls.
//!
//! [`TracedQueue`] and [`TracedWorker`] implement the same traits as the
//! instances they wrap. The original call always runs and its result is
//! returned unchanged; anything that goes wrong in the instrumentation is
//! logged and dropped.

use crate::carrier;
use crate::config::Role;
use crate::event::EventKind;
use crate::integration::Integration;
use crate::pin::PinTarget;
use crate::queue::{JobHandle, Queue, Worker};
use crate::span::{self, Operation, SpanRequest, isolate, resource_name};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::any::Any;
use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

fn record_propagation(direction: &'static str, outcome: &'static str) {
    metrics::context_propagation().add(
        1,
        &[
            KeyValue::new("direction", direction),
            KeyValue::new("outcome", outcome),
        ],
    );
}

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// A queue whose enqueue and fetch calls are traced.
pub struct TracedQueue<Q> {
    inner: Q,
    integration: Arc<Integration>,
}

impl<Q: Queue> TracedQueue<Q> {
    pub fn new(inner: Q, integration: Arc<Integration>) -> Self {
        Self { inner, integration }
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    /// Unwrap, returning the original queue untouched.
    pub fn into_inner(self) -> Q {
        self.inner
    }

    fn target(&self) -> PinTarget {
        PinTarget::queue(self.inner.name())
    }

    /// Write the enqueue span's context into the job, if policy allows.
    fn inject(&self, span: &span::ScopedSpan, job: &mut Q::Job) -> bool {
        if !self.inner.is_async() {
            // Runs inline in this process, nothing to carry.
            record_propagation("inject", "sync_queue");
            return false;
        }
        if !self.integration.config().producer.distributed_tracing_enabled {
            record_propagation("inject", "disabled");
            return false;
        }

        let injected = isolate("inject", || carrier::inject(&span.context(), job.meta_mut()))
            .unwrap_or(false);
        record_propagation("inject", if injected { "injected" } else { "no_context" });
        injected
    }
}

impl<Q> Queue for TracedQueue<Q>
where
    Q: Queue,
    Q::Error: Display,
{
    type Job = Q::Job;
    type Error = Q::Error;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn is_async(&self) -> bool {
        self.inner.is_async()
    }

    fn enqueue_job(&self, mut job: Q::Job) -> Result<Q::Job, Q::Error> {
        let target = self.target();
        if !self.integration.traces(&target) {
            return self.inner.enqueue_job(job);
        }

        let service = self.integration.service_for(Role::Producer, &target, false);
        let resource = resource_name(job.instance_class(), job.func_name());
        let job_id = job.id().to_string();
        let func_name = job.func_name().to_string();
        let queue = self.inner.name().to_string();

        let span = span::open(
            Operation::EnqueueJob,
            &SpanRequest {
                service: Some(&service),
                resource: Some(&resource),
                job_id: &job_id,
                queue: Some(&queue),
                func_name: Some(&func_name),
            },
            None,
        );

        let context_injected = self.inject(&span, &mut job);
        let result = span.in_scope(|| self.inner.enqueue_job(job));

        isolate("finish enqueue", || {
            let outcome = match &result {
                Ok(_) => {
                    span.mark_ok();
                    "ok"
                }
                Err(e) => {
                    span.mark_error(std::any::type_name::<Q::Error>(), &e.to_string());
                    "error"
                }
            };
            metrics::jobs_enqueued().add(
                1,
                &[
                    KeyValue::new("queue", queue.clone()),
                    KeyValue::new("result", outcome),
                ],
            );

            self.integration.events().dispatch(EventKind::JobEnqueued {
                job_id,
                queue,
                func_name,
                context_injected,
            });
        });

        result
    }

    fn fetch_job(&self, job_id: &str) -> Result<Option<Q::Job>, Q::Error> {
        let target = self.target();
        if !self.integration.traces(&target) {
            return self.inner.fetch_job(job_id);
        }

        let service = self.integration.service_for(Role::Producer, &target, false);
        let span = span::open(
            Operation::FetchJob,
            &SpanRequest {
                service: Some(&service),
                job_id,
                ..SpanRequest::default()
            },
            None,
        );

        let result = span.in_scope(|| self.inner.fetch_job(job_id));

        isolate("finish fetch", || {
            let outcome = match &result {
                Ok(found) => {
                    span.mark_ok();
                    if found.is_some() { "found" } else { "missing" }
                }
                Err(e) => {
                    span.mark_error(std::any::type_name::<Q::Error>(), &e.to_string());
                    "error"
                }
            };
            metrics::jobs_fetched().add(
                1,
                &[
                    KeyValue::new("queue", self.inner.name().to_string()),
                    KeyValue::new("result", outcome),
                ],
            );

            self.integration.events().dispatch(EventKind::JobFetched {
                job_id: job_id.to_string(),
                queue: self.inner.name().to_string(),
                found: outcome == "found",
            });
        });

        result
    }

    fn fetch_many(&self, job_ids: &[&str]) -> Result<Vec<Option<Q::Job>>, Q::Error> {
        let target = self.target();
        if !self.integration.traces(&target) {
            return self.inner.fetch_many(job_ids);
        }

        let service = self.integration.service_for(Role::Worker, &target, true);
        let joined = job_ids.join(",");
        let span = span::open(
            Operation::FetchMany,
            &SpanRequest {
                service: Some(&service),
                job_id: &joined,
                ..SpanRequest::default()
            },
            None,
        );

        let result = span.in_scope(|| self.inner.fetch_many(job_ids));
        isolate("finish fetch_many", || match &result {
            Ok(_) => span.mark_ok(),
            Err(e) => span.mark_error(std::any::type_name::<Q::Error>(), &e.to_string()),
        });
        result
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// A worker whose job executions are traced and followed by a span flush.
pub struct TracedWorker<W> {
    inner: W,
    integration: Arc<Integration>,
}

impl<W: Worker> TracedWorker<W> {
    pub fn new(inner: W, integration: Arc<Integration>) -> Self {
        Self { inner, integration }
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwrap, returning the original worker untouched.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Flushes spans when dropped, after the perform span has closed.
struct FlushOnDrop<'a> {
    integration: &'a Integration,
    job_id: &'a str,
}

impl Drop for FlushOnDrop<'_> {
    fn drop(&mut self) {
        let result = match isolate("flush", || self.integration.flush()) {
            Some(Ok(true)) => "ok",
            Some(Ok(false)) => {
                debug!(job_id = self.job_id, "no span flusher configured");
                "skipped"
            }
            Some(Err(e)) => {
                warn!(job_id = self.job_id, error = %e, "failed to flush spans after job");
                "error"
            }
            None => "error",
        };
        metrics::span_flushes().add(1, &[KeyValue::new("result", result)]);

        self.integration.events().dispatch(EventKind::PerformFinished {
            job_id: self.job_id.to_string(),
            flushed: result == "ok",
        });
    }
}

/// Milliseconds in `elapsed`, saturating at `u64::MAX`.
fn whole_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("job panicked")
}

fn extract_parent(meta: &crate::model::Metadata) -> Option<carrier::TraceContext> {
    match carrier::try_extract(meta) {
        Ok(Some(context)) => {
            record_propagation("extract", "extracted");
            Some(context)
        }
        Ok(None) => {
            record_propagation("extract", "missing");
            None
        }
        Err(e) => {
            debug!(error = %e, "job carries unusable trace context, starting a new trace");
            record_propagation("extract", "malformed");
            None
        }
    }
}

impl<W> Worker for TracedWorker<W>
where
    W: Worker,
    W::Error: Display,
{
    type Job = W::Job;
    type Output = W::Output;
    type Error = W::Error;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn perform_job(&mut self, job: &mut W::Job) -> Result<W::Output, W::Error> {
        let target = PinTarget::worker(self.inner.name());
        if !self.integration.traces(&target) {
            return self.inner.perform_job(job);
        }

        let integration = Arc::clone(&self.integration);
        let job_id = job.id().to_string();

        // Dropped last: the flush runs after the span below has closed, on
        // success, error and panic alike.
        let _flush = FlushOnDrop {
            integration: &integration,
            job_id: &job_id,
        };

        let service = integration.service_for(Role::Worker, &target, false);
        let parent = if integration.config().worker.distributed_tracing_enabled {
            isolate("extract", || extract_parent(job.meta())).flatten()
        } else {
            None
        };

        let func_name = job.func_name().to_string();
        let mut span = span::open(
            Operation::PerformJob,
            &SpanRequest {
                service: Some(&service),
                resource: Some(&func_name),
                job_id: &job_id,
                queue: job.origin(),
                func_name: Some(&func_name),
            },
            parent.as_ref(),
        );

        // A panicking job is recorded like a failed one, then resumed.
        let started = Instant::now();
        let call = span.in_scope(|| {
            catch_unwind(AssertUnwindSafe(|| self.inner.perform_job(job)))
        });
        let duration_ms = whole_millis(started.elapsed());

        isolate("finish perform", || {
            let status = job.status();
            let failed = job.is_failed();
            let origin = job.origin().map(str::to_string);
            span.record_job_outcome(status, origin.as_deref());
            match &call {
                Err(payload) => span.mark_error("panic", panic_message(&**payload)),
                Ok(Err(e)) => span.mark_error(std::any::type_name::<W::Error>(), &e.to_string()),
                Ok(Ok(_)) if failed => {
                    span.mark_error("JobFailed", "job finished with status failed")
                }
                Ok(Ok(_)) => span.mark_ok(),
            }
            span.close();

            let labels = [
                KeyValue::new("origin", origin.clone().unwrap_or_default()),
                KeyValue::new("status", status.map_or("None", |s| s.as_str())),
            ];
            metrics::jobs_performed().add(1, &labels);
            metrics::perform_duration_ms().record(duration_ms as f64, &labels);

            integration.events().dispatch(EventKind::JobPerformed {
                job_id: job_id.clone(),
                status,
                origin,
                failed,
                duration_ms,
            });
        });
        span.close();

        match call {
            Ok(result) => result,
            Err(payload) => resume_unwind(payload),
        }
    }
}
