//! Trace context carried in job metadata.
//!
//! Job metadata is the only thing guaranteed to travel from the enqueuing
//! process to the worker that eventually runs the job, possibly on another
//! host and much later. The context is stored under one reserved key as a
//! small versioned JSON object holding the W3C headers:
//!
//! ```json
//! {"__rq_trace": {"v": 1, "traceparent": "00-...-...-01", "baggage": "k=v"}}
//! ```
//!
//! Other metadata keys are never read or touched. Unknown keys inside the
//! carrier object are ignored so newer producers can add fields.

use crate::error::{Error, Result};
use crate::model::Metadata;
use opentelemetry::Context;
use opentelemetry::baggage::BaggageExt;
use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceId};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Reserved metadata key holding the carrier object.
pub const CARRIER_KEY: &str = "__rq_trace";

/// Current carrier encoding version.
pub const CARRIER_VERSION: u64 = 1;

const VERSION_FIELD: &str = "v";

/// Header fields copied between the propagator and the carrier object.
const PROPAGATED_FIELDS: [&str; 3] = ["traceparent", "tracestate", "baggage"];

/// The propagable causal reference of a span: trace id, span id, flags,
/// trace state and baggage.
#[derive(Debug, Clone)]
pub struct TraceContext {
    cx: Context,
}

impl TraceContext {
    /// Context of the current `tracing` span.
    pub fn current() -> Self {
        Self::from_span(&tracing::Span::current())
    }

    pub fn from_span(span: &tracing::Span) -> Self {
        Self {
            cx: span.context(),
        }
    }

    pub fn from_context(cx: Context) -> Self {
        Self { cx }
    }

    pub fn span_context(&self) -> SpanContext {
        self.cx.span().span_context().clone()
    }

    pub fn trace_id(&self) -> TraceId {
        self.cx.span().span_context().trace_id()
    }

    pub fn span_id(&self) -> SpanId {
        self.cx.span().span_context().span_id()
    }

    pub fn is_sampled(&self) -> bool {
        self.cx.span().span_context().is_sampled()
    }

    /// True when the context names a real trace and span.
    pub fn is_valid(&self) -> bool {
        self.cx.span().span_context().is_valid()
    }

    pub fn baggage_item(&self, key: &str) -> Option<String> {
        self.cx
            .baggage()
            .get(key)
            .map(|value| value.as_str().to_string())
    }

    pub fn as_context(&self) -> &Context {
        &self.cx
    }

    pub fn into_context(self) -> Context {
        self.cx
    }
}

/// Two contexts are equal when they point at the same span of the same trace
/// with the same flags. Whether the span is local or remote does not matter.
impl PartialEq for TraceContext {
    fn eq(&self, other: &Self) -> bool {
        let a = self.cx.span().span_context().clone();
        let b = other.cx.span().span_context().clone();
        a.trace_id() == b.trace_id()
            && a.span_id() == b.span_id()
            && a.trace_flags() == b.trace_flags()
    }
}

/// Wrapper to implement `Injector` for HashMap<String, String>
struct HashMapInjector<'a>(&'a mut HashMap<String, String>);

impl Injector for HashMapInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Wrapper to implement `Extractor` for HashMap<String, String>
struct HashMapExtractor<'a>(&'a HashMap<String, String>);

impl Extractor for HashMapExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

pub(crate) fn propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Write `context` into job metadata under [`CARRIER_KEY`].
///
/// Returns false, leaving the metadata untouched, when the context does not
/// hold a valid span (e.g. no tracing subscriber is installed).
pub fn inject(context: &TraceContext, meta: &mut Metadata) -> bool {
    if !context.is_valid() {
        return false;
    }

    let mut headers = HashMap::new();
    propagator().inject_context(context.as_context(), &mut HashMapInjector(&mut headers));

    let mut carrier = serde_json::Map::new();
    carrier.insert(VERSION_FIELD.to_string(), JsonValue::from(CARRIER_VERSION));
    for field in PROPAGATED_FIELDS {
        if let Some(value) = headers.remove(field)
            && !value.is_empty()
        {
            carrier.insert(field.to_string(), JsonValue::String(value));
        }
    }

    meta.insert(CARRIER_KEY.to_string(), JsonValue::Object(carrier));
    true
}

/// Read the carried context back.
///
/// `Ok(None)` means no context was carried. An error means one was carried
/// but cannot be decoded.
pub fn try_extract(meta: &Metadata) -> Result<Option<TraceContext>> {
    let Some(raw) = meta.get(CARRIER_KEY) else {
        return Ok(None);
    };

    let carrier = raw
        .as_object()
        .ok_or_else(|| Error::MalformedContext("carrier is not an object".to_string()))?;

    match carrier.get(VERSION_FIELD).and_then(JsonValue::as_u64) {
        Some(CARRIER_VERSION) => {}
        Some(other) => {
            return Err(Error::MalformedContext(format!(
                "unsupported carrier version {other}"
            )));
        }
        None => {
            return Err(Error::MalformedContext(
                "missing carrier version".to_string(),
            ));
        }
    }

    let mut headers = HashMap::new();
    for field in PROPAGATED_FIELDS {
        match carrier.get(field) {
            None => {}
            Some(JsonValue::String(value)) => {
                headers.insert(field.to_string(), value.clone());
            }
            Some(_) => {
                return Err(Error::MalformedContext(format!(
                    "{field} is not a string"
                )));
            }
        }
    }

    let cx = propagator().extract(&HashMapExtractor(&headers));
    if !cx.span().span_context().is_valid() {
        return Err(Error::MalformedContext(
            "no valid traceparent".to_string(),
        ));
    }

    Ok(Some(TraceContext::from_context(cx)))
}

/// Read the carried context back, treating anything undecodable as absent.
pub fn extract(meta: &Metadata) -> Option<TraceContext> {
    match try_extract(meta) {
        Ok(context) => context,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring carried trace context");
            None
        }
    }
}

/// Check if metadata carries a trace context (decodable or not).
pub fn has_trace_context(meta: &Metadata) -> bool {
    meta.contains_key(CARRIER_KEY)
}
