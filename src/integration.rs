//! The application context that owns the instrumentation.
//!
//! One `Integration` is created at startup and shared (`Arc`) by every
//! traced queue and worker. It holds the install guard, the config, the pin
//! side-table, the event bus and the span flusher.
//!
//! ```ignore
//! let integration = Integration::install(config.rq);
//! integration.set_flusher(guard.span_flusher());
//! let queue = integration.instrument_queue(RedisQueue::new("emails"));
//! queue.enqueue_job(Job::new("tasks.send_email"))?;
//! ```

use crate::config::{Role, RqConfig};
use crate::error::Result;
use crate::event::{EventBus, Listener};
use crate::intercept::{TracedQueue, TracedWorker};
use crate::pin::{Pin, PinRegistry, PinTarget};
use crate::queue::{JobHandle, Queue, Worker};
use crate::span::{self, Operation, SpanRequest};
use crate::telemetry::SpanFlush;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;

pub struct Integration {
    config: RwLock<RqConfig>,
    patched: AtomicBool,
    pins: PinRegistry,
    events: EventBus,
    flusher: RwLock<Option<Arc<dyn SpanFlush>>>,
}

impl std::fmt::Debug for Integration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Integration")
            .field("patched", &self.is_patched())
            .field("config", &self.config())
            .field("pins", &self.pins.len())
            .field("events", &self.events)
            .finish()
    }
}

impl Integration {
    /// Create an integration that is not yet patched. Wrapped instances
    /// pass straight through until [`Integration::patch`] is called.
    pub fn new(config: RqConfig) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            patched: AtomicBool::new(false),
            pins: PinRegistry::new(),
            events: EventBus::new(),
            flusher: RwLock::new(None),
        })
    }

    /// Create and patch in one step.
    pub fn install(config: RqConfig) -> Arc<Self> {
        let integration = Self::new(config);
        integration.patch();
        integration
    }

    /// Turn tracing on. Returns true only for the call that installed it.
    pub fn patch(&self) -> bool {
        let installed = !self.patched.swap(true, Ordering::AcqRel);
        if installed {
            info!("rq instrumentation installed");
        }
        installed
    }

    /// Turn tracing off and drop every pin. Wrapped instances behave exactly
    /// like the originals afterwards. Returns false if it was not patched.
    pub fn unpatch(&self) -> bool {
        let removed = self.patched.swap(false, Ordering::AcqRel);
        if removed {
            self.pins.clear();
            info!("rq instrumentation removed");
        }
        removed
    }

    pub fn is_patched(&self) -> bool {
        self.patched.load(Ordering::Acquire)
    }

    /// Snapshot of the current config. Read on every traced call.
    pub fn config(&self) -> RqConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_config(&self, config: RqConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn pins(&self) -> &PinRegistry {
        &self.pins
    }

    pub fn override_pin(&self, target: PinTarget, pin: Pin) {
        self.pins.override_pin(target, pin);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self, listener: impl Listener + 'static) {
        self.events.subscribe(listener);
    }

    /// Set what the consumer path flushes. `None` disables flushing.
    pub fn set_flusher(&self, flusher: Option<Arc<dyn SpanFlush>>) {
        *self.flusher.write().unwrap_or_else(|e| e.into_inner()) = flusher;
    }

    /// Flush buffered spans. `Ok(false)` when no flusher is set.
    pub fn flush(&self) -> Result<bool> {
        let flusher = self
            .flusher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match flusher {
            Some(flusher) => flusher.flush().map(|()| true),
            None => Ok(false),
        }
    }

    pub fn instrument_queue<Q: Queue>(self: &Arc<Self>, queue: Q) -> TracedQueue<Q> {
        TracedQueue::new(queue, Arc::clone(self))
    }

    pub fn instrument_worker<W: Worker>(self: &Arc<Self>, worker: W) -> TracedWorker<W> {
        TracedWorker::new(worker, Arc::clone(self))
    }

    /// Trace a job body (`rq.job.perform`). Call from inside
    /// `Worker::perform_job` around the user function. The span inherits its
    /// service from the enclosing perform span.
    pub fn perform<J, T, E>(
        &self,
        job: &J,
        body: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        J: JobHandle + ?Sized,
        E: std::fmt::Display,
    {
        if !self.is_patched() {
            return body();
        }

        let span = span::open(
            Operation::JobPerform,
            &SpanRequest {
                resource: Some(job.func_name()),
                job_id: job.id(),
                ..SpanRequest::default()
            },
            None,
        );

        let result = span.in_scope(body);
        match &result {
            Ok(_) => span.mark_ok(),
            Err(e) => span.mark_error(std::any::type_name::<E>(), &e.to_string()),
        }
        result
    }

    /// Whether calls on `target` should be traced right now.
    pub(crate) fn traces(&self, target: &PinTarget) -> bool {
        self.is_patched() && self.pins.is_enabled(target)
    }

    /// Service name for a span on `target`, honoring its pin.
    pub(crate) fn service_for(&self, role: Role, target: &PinTarget, external: bool) -> String {
        let pin = self.pins.get(target);
        let pinned = pin.as_ref().and_then(|p| p.service.as_deref());
        let config = self.config();
        if external {
            config.external_service(role, pinned)
        } else {
            config.integration_service(role, pinned)
        }
    }
}
