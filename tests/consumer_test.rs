//! Consumer side: perform spans, parent linking and the forced flush.

#![allow(clippy::unwrap_used)]

mod common;

use common::{
    CountingFlusher, EngineError, FailingFlusher, Harness, MemoryQueue, attr, mail_worker,
};
use opentelemetry::trace::{SpanId, SpanKind, Status};
use rq_tracing::carrier::CARRIER_KEY;
use rq_tracing::config::RqConfig;
use rq_tracing::event::{Event, EventKind};
use rq_tracing::telemetry::SpanFlush;
use rq_tracing::{Integration, Job, JobStatus, Queue, Worker};
use serde_json::json;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

fn installed() -> (Arc<Integration>, Arc<CountingFlusher>) {
    let integration = Integration::install(RqConfig::default());
    let flusher = Arc::new(CountingFlusher::default());
    integration.set_flusher(Some(flusher.clone() as Arc<dyn SpanFlush>));
    (integration, flusher)
}

#[test]
fn finished_job_continues_the_enqueue_trace() {
    let harness = Harness::new();
    let (integration, flusher) = installed();
    let queue = integration.instrument_queue(MemoryQueue::new("emails"));
    let mut worker = integration.instrument_worker(mail_worker());

    let mut job = harness.run(|| queue.enqueue_job(Job::new("send_email")).unwrap());
    let output = harness.run(|| worker.perform_job(&mut job).unwrap());

    assert_eq!(output.as_deref(), Some("sent null"));
    assert_eq!(job.status, Some(JobStatus::Finished));

    let producer = harness.span("rq.queue.enqueue_job");
    let consumer = harness.span("rq.worker.perform_job");
    assert_eq!(consumer.span_kind, SpanKind::Consumer);
    assert_eq!(attr(&consumer, "job.status").as_deref(), Some("finished"));
    assert_eq!(attr(&consumer, "job.origin").as_deref(), Some("emails"));
    assert_eq!(attr(&consumer, "job.id").as_deref(), Some(job.id.as_str()));
    assert_eq!(attr(&consumer, "resource.name").as_deref(), Some("send_email"));
    assert_eq!(attr(&consumer, "service.name").as_deref(), Some("rq-worker"));
    assert_eq!(
        attr(&consumer, "messaging.operation.type").as_deref(),
        Some("process")
    );
    assert_eq!(consumer.status, Status::Unset);

    assert_eq!(
        consumer.span_context.trace_id(),
        producer.span_context.trace_id()
    );
    assert_eq!(consumer.parent_span_id, producer.span_context.span_id());
    assert_eq!(flusher.calls(), 1);
}

#[test]
fn context_crosses_to_a_worker_on_another_thread() {
    let (integration, _flusher) = installed();
    let queue = integration.instrument_queue(MemoryQueue::new("emails"));

    let producer_side = Harness::new();
    let job = producer_side.run(|| queue.enqueue_job(Job::new("send_email")).unwrap());
    let producer = producer_side.span("rq.queue.enqueue_job");

    let worker_integration = Arc::clone(&integration);
    let consumer = std::thread::spawn(move || {
        let worker_side = Harness::new();
        let mut worker = worker_integration.instrument_worker(mail_worker());
        let mut job = job;
        worker_side.run(|| worker.perform_job(&mut job).unwrap());
        worker_side.span("rq.worker.perform_job")
    })
    .join()
    .unwrap();

    assert_eq!(
        consumer.span_context.trace_id(),
        producer.span_context.trace_id()
    );
    assert_eq!(consumer.parent_span_id, producer.span_context.span_id());
}

#[test]
fn raising_job_marks_error_returns_it_unchanged_and_flushes() {
    let harness = Harness::new();
    let (integration, flusher) = installed();
    let queue = integration.instrument_queue(MemoryQueue::new("emails"));
    let mut worker = integration.instrument_worker(mail_worker());

    let mut job = harness.run(|| queue.enqueue_job(Job::new("explode")).unwrap());
    let result = harness.run(|| worker.perform_job(&mut job));

    assert_eq!(
        result.unwrap_err(),
        EngineError("smtp relay rejected message".to_string())
    );
    let span = harness.span("rq.worker.perform_job");
    assert_eq!(span.status, Status::error("smtp relay rejected message"));
    assert_eq!(attr(&span, "job.status").as_deref(), Some("failed"));
    assert_eq!(flusher.calls(), 1);
}

#[test]
fn failed_status_marks_error_even_when_worker_returns_ok() {
    let harness = Harness::new();
    let (integration, flusher) = installed();
    let mut worker = integration.instrument_worker(mail_worker().swallowing_errors());

    let mut job = Job::new("explode").origin("emails");
    let result = harness.run(|| worker.perform_job(&mut job));

    assert_eq!(result.unwrap(), None);
    let span = harness.span("rq.worker.perform_job");
    assert!(matches!(span.status, Status::Error { .. }));
    assert_eq!(attr(&span, "error.type").as_deref(), Some("JobFailed"));
    assert_eq!(flusher.calls(), 1);
}

#[test]
fn panicking_job_records_its_outcome_closes_the_span_and_flushes() {
    let harness = Harness::new();
    let (integration, flusher) = installed();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    integration.subscribe(move |event: &Event| sink.lock().unwrap().push(event.kind.clone()));
    let mut worker = integration.instrument_worker(
        mail_worker().handle("crash", |_| panic!("worker horse died")),
    );

    let mut job = Job::new("crash").origin("emails");
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        harness.run(|| worker.perform_job(&mut job))
    }));

    assert!(outcome.is_err());
    let span = harness.span("rq.worker.perform_job");
    assert_eq!(span.status, Status::error("worker horse died"));
    assert_eq!(attr(&span, "error.type").as_deref(), Some("panic"));
    assert_eq!(attr(&span, "job.origin").as_deref(), Some("emails"));
    assert_eq!(attr(&span, "job.status").as_deref(), Some("started"));
    assert_eq!(flusher.calls(), 1);

    let kinds = seen.lock().unwrap();
    assert_eq!(kinds.len(), 2);
    assert!(matches!(
        &kinds[0],
        EventKind::JobPerformed {
            status: Some(JobStatus::Started),
            origin: Some(origin),
            failed: false,
            ..
        } if origin == "emails"
    ));
    assert!(matches!(
        kinds[1],
        EventKind::PerformFinished { flushed: true, .. }
    ));
}

#[test]
fn missing_or_malformed_context_yields_a_root_span() {
    let harness = Harness::new();
    let (integration, _flusher) = installed();
    let mut worker = integration.instrument_worker(mail_worker());

    let mut bare = Job::new("send_email").origin("emails");
    let mut malformed = Job::new("send_email").origin("emails");
    malformed
        .meta
        .insert(CARRIER_KEY.to_string(), json!({"v": 1, "traceparent": "garbage"}));
    let mut wrong_shape = Job::new("send_email").origin("emails");
    wrong_shape
        .meta
        .insert(CARRIER_KEY.to_string(), json!("00-abc-def-01"));

    harness.run(|| {
        worker.perform_job(&mut bare).unwrap();
        worker.perform_job(&mut malformed).unwrap();
        worker.perform_job(&mut wrong_shape).unwrap();
    });

    let spans = harness.spans_named("rq.worker.perform_job");
    assert_eq!(spans.len(), 3);
    for span in spans {
        assert_eq!(span.parent_span_id, SpanId::INVALID);
        assert_eq!(attr(&span, "job.status").as_deref(), Some("finished"));
    }
}

#[test]
fn worker_ignores_context_when_distributed_tracing_is_off() {
    let harness = Harness::new();
    let integration = Integration::install(RqConfig::default());
    let queue = integration.instrument_queue(MemoryQueue::new("emails"));
    let mut job = harness.run(|| queue.enqueue_job(Job::new("send_email")).unwrap());

    let mut config = RqConfig::default();
    config.worker.distributed_tracing_enabled = false;
    integration.set_config(config);
    let mut worker = integration.instrument_worker(mail_worker());
    harness.run(|| worker.perform_job(&mut job).unwrap());

    let producer = harness.span("rq.queue.enqueue_job");
    let consumer = harness.span("rq.worker.perform_job");
    assert_eq!(consumer.parent_span_id, SpanId::INVALID);
    assert_ne!(
        consumer.span_context.trace_id(),
        producer.span_context.trace_id()
    );
}

#[test]
fn each_execution_produces_exactly_one_span_and_one_flush() {
    let harness = Harness::new();
    let (integration, flusher) = installed();
    let mut worker = integration.instrument_worker(mail_worker());

    harness.run(|| {
        for func in ["send_email", "explode", "send_email"] {
            let mut job = Job::new(func).origin("emails");
            let _ = worker.perform_job(&mut job);
        }
    });

    assert_eq!(harness.spans_named("rq.worker.perform_job").len(), 3);
    assert_eq!(flusher.calls(), 3);
}

#[test]
fn flush_failure_does_not_reach_the_caller() {
    let harness = Harness::new();
    let integration = Integration::install(RqConfig::default());
    integration.set_flusher(Some(Arc::new(FailingFlusher) as Arc<dyn SpanFlush>));
    let mut worker = integration.instrument_worker(mail_worker());

    let mut job = Job::new("send_email").origin("emails");
    let output = harness.run(|| worker.perform_job(&mut job));

    assert_eq!(output.unwrap().as_deref(), Some("sent null"));
    assert_eq!(harness.spans_named("rq.worker.perform_job").len(), 1);
}

#[test]
fn provider_flush_exports_through_the_sdk() {
    let harness = Harness::new();
    let integration = Integration::install(RqConfig::default());
    integration.set_flusher(Some(Arc::new(harness.provider().clone()) as Arc<dyn SpanFlush>));
    let mut worker = integration.instrument_worker(mail_worker());

    let mut job = Job::new("send_email").origin("emails");
    harness.run(|| worker.perform_job(&mut job).unwrap());

    assert_eq!(harness.spans_named("rq.worker.perform_job").len(), 1);
    assert!(integration.flush().unwrap());
}

#[test]
fn job_body_span_nests_under_the_perform_span() {
    let harness = Harness::new();
    let (integration, _flusher) = installed();
    let body_integration = Arc::clone(&integration);
    let mut worker = integration.instrument_worker(mail_worker().handle("report", move |job| {
        body_integration.perform(job, || Ok::<_, String>("report built".to_string()))
    }));

    let mut job = Job::new("report").origin("reports");
    harness.run(|| worker.perform_job(&mut job).unwrap());

    let perform = harness.span("rq.worker.perform_job");
    let body = harness.span("rq.job.perform");
    assert_eq!(body.parent_span_id, perform.span_context.span_id());
    assert_eq!(attr(&body, "resource.name").as_deref(), Some("report"));
    assert_eq!(attr(&body, "job.id").as_deref(), Some(job.id.as_str()));
    assert_eq!(attr(&body, "service.name"), None);
}

/// Leaves the job exactly as it found it.
struct NoStatusWorker;

impl Worker for NoStatusWorker {
    type Job = Job;
    type Output = ();
    type Error = EngineError;

    fn name(&self) -> &str {
        "no-status"
    }

    fn perform_job(&mut self, _job: &mut Job) -> Result<(), EngineError> {
        Ok(())
    }
}

#[test]
fn job_without_status_reports_none() {
    let harness = Harness::new();
    let (integration, _flusher) = installed();
    let mut worker = integration.instrument_worker(NoStatusWorker);

    let mut job = Job::new("noop");
    harness.run(|| worker.perform_job(&mut job).unwrap());

    let span = harness.span("rq.worker.perform_job");
    assert_eq!(attr(&span, "job.status").as_deref(), Some("None"));
    assert_eq!(attr(&span, "job.origin"), None);
}
