//! Shared fixtures: an in-memory queue engine and a span-capturing subscriber.

#![allow(dead_code, clippy::unwrap_used)]

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
use rq_tracing::error::{Error, Result};
use rq_tracing::telemetry::SpanFlush;
use rq_tracing::{Job, JobStatus, Queue, Worker};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::span::{Attributes, Id, Record};
use tracing::{Dispatch, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt as _};
use tracing_subscriber::registry::LookupSpan;

// ---------------------------------------------------------------------------
// Span capture
// ---------------------------------------------------------------------------

/// A subscriber exporting every finished span into memory.
///
/// Spans only reach it inside [`Harness::run`], so tests running in
/// parallel do not see each other's spans.
pub struct Harness {
    exporter: InMemorySpanExporter,
    provider: SdkTracerProvider,
    dispatch: Dispatch,
}

impl Harness {
    pub fn new() -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = provider.tracer("rq-tracing-test");
        let subscriber =
            tracing_subscriber::registry().with(tracing_opentelemetry::layer().with_tracer(tracer));

        Self {
            exporter,
            provider,
            dispatch: Dispatch::new(subscriber),
        }
    }

    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    pub fn provider(&self) -> &SdkTracerProvider {
        &self.provider
    }

    pub fn spans(&self) -> Vec<SpanData> {
        self.exporter.get_finished_spans().unwrap()
    }

    pub fn spans_named(&self, name: &str) -> Vec<SpanData> {
        self.spans()
            .into_iter()
            .filter(|span| span.name == name)
            .collect()
    }

    /// The single finished span called `name`.
    pub fn span(&self, name: &str) -> SpanData {
        let mut spans = self.spans_named(name);
        assert_eq!(spans.len(), 1, "expected exactly one {name} span");
        spans.remove(0)
    }
}

/// String value of a span attribute.
pub fn attr(span: &SpanData, key: &str) -> Option<String> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.as_str().into_owned())
}

// ---------------------------------------------------------------------------
// Faulty subscriber
// ---------------------------------------------------------------------------

/// The subscriber callback a [`PanickingLayer`] blows up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NewSpan,
    Enter,
    Record,
    Close,
}

pub const FAULTS: [Fault; 4] = [Fault::NewSpan, Fault::Enter, Fault::Record, Fault::Close];

/// Panics in one callback, and only for `rq.*` spans.
pub struct PanickingLayer(pub Fault);

impl PanickingLayer {
    fn trip<S>(&self, fault: Fault, id: &Id, ctx: &Context<'_, S>)
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let ours = ctx
            .span(id)
            .is_some_and(|span| span.name().starts_with("rq."));
        if self.0 == fault && ours {
            panic!("subscriber bug in {fault:?}");
        }
    }
}

impl<S> Layer<S> for PanickingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        if self.0 == Fault::NewSpan && attrs.metadata().name().starts_with("rq.") {
            panic!("subscriber bug in {:?}", Fault::NewSpan);
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        self.trip(Fault::Enter, id, &ctx);
    }

    fn on_record(&self, id: &Id, _values: &Record<'_>, ctx: Context<'_, S>) {
        self.trip(Fault::Record, id, &ctx);
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        self.trip(Fault::Close, &id, &ctx);
    }
}

/// Run `f` under a subscriber that panics on `fault`.
pub fn with_fault<T>(fault: Fault, f: impl FnOnce() -> T) -> T {
    let dispatch = Dispatch::new(tracing_subscriber::registry().with(PanickingLayer(fault)));
    tracing::dispatcher::with_default(&dispatch, f)
}

// ---------------------------------------------------------------------------
// Flushers
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CountingFlusher {
    calls: AtomicUsize,
}

impl CountingFlusher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SpanFlush for CountingFlusher {
    fn flush(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Always fails, like an exporter whose collector went away.
pub struct FailingFlusher;

impl SpanFlush for FailingFlusher {
    fn flush(&self) -> Result<()> {
        Err(Error::Flush("collector unreachable".to_string()))
    }
}

// ---------------------------------------------------------------------------
// In-memory queue engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError(pub String);

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Store = Arc<Mutex<HashMap<String, Job>>>;

pub struct MemoryQueue {
    name: String,
    is_async: bool,
    store: Store,
    reject: bool,
}

impl MemoryQueue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_async: true,
            store: Store::default(),
            reject: false,
        }
    }

    /// Jobs run inline, in the enqueuing process.
    pub fn sync(mut self) -> Self {
        self.is_async = false;
        self
    }

    /// Every enqueue fails, like a queue whose backend is down.
    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }

    pub fn store(&self) -> Store {
        Arc::clone(&self.store)
    }
}

impl Queue for MemoryQueue {
    type Job = Job;
    type Error = EngineError;

    fn name(&self) -> &str {
        &self.name
    }

    fn is_async(&self) -> bool {
        self.is_async
    }

    fn enqueue_job(&self, mut job: Job) -> std::result::Result<Job, EngineError> {
        if self.reject {
            return Err(EngineError("connection refused".to_string()));
        }
        job.origin = Some(self.name.clone());
        job.status = Some(JobStatus::Queued);
        self.store
            .lock()
            .unwrap()
            .insert(job.id.clone(), job.clone());
        Ok(job)
    }

    fn fetch_job(&self, job_id: &str) -> std::result::Result<Option<Job>, EngineError> {
        Ok(self.store.lock().unwrap().get(job_id).cloned())
    }
}

type Handler = Box<dyn Fn(&Job) -> std::result::Result<String, String> + Send>;

/// Runs jobs by looking their function up in a handler table.
pub struct MemoryWorker {
    name: String,
    handlers: HashMap<String, Handler>,
    swallow_errors: bool,
}

impl MemoryWorker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handlers: HashMap::new(),
            swallow_errors: false,
        }
    }

    pub fn handle(
        mut self,
        func_name: &str,
        handler: impl Fn(&Job) -> std::result::Result<String, String> + Send + 'static,
    ) -> Self {
        self.handlers.insert(func_name.to_string(), Box::new(handler));
        self
    }

    /// Failed jobs are recorded as failed but `perform_job` still returns Ok,
    /// the way a worker that moves failures to a registry behaves.
    pub fn swallowing_errors(mut self) -> Self {
        self.swallow_errors = true;
        self
    }
}

impl Worker for MemoryWorker {
    type Job = Job;
    type Output = Option<String>;
    type Error = EngineError;

    fn name(&self) -> &str {
        &self.name
    }

    fn perform_job(&mut self, job: &mut Job) -> std::result::Result<Option<String>, EngineError> {
        job.status = Some(JobStatus::Started);
        let handler = self
            .handlers
            .get(&job.func_name)
            .ok_or_else(|| EngineError(format!("no handler for {}", job.func_name)))?;

        match handler(job) {
            Ok(output) => {
                job.status = Some(JobStatus::Finished);
                Ok(Some(output))
            }
            Err(message) => {
                job.status = Some(JobStatus::Failed);
                if self.swallow_errors {
                    Ok(None)
                } else {
                    Err(EngineError(message))
                }
            }
        }
    }
}

/// The worker used by most tests: `send_email` succeeds, `explode` fails.
pub fn mail_worker() -> MemoryWorker {
    MemoryWorker::new("mail-worker")
        .handle("send_email", |job| Ok(format!("sent {}", job.args)))
        .handle("explode", |_| Err("smtp relay rejected message".to_string()))
}
