//! Telemetry setup and the span flush used by workers.
//!
//! [`init_telemetry`] installs the global `tracing` subscriber. Diagnostics
//! always go to stderr so command output on stdout stays clean. With an OTLP
//! endpoint, spans, metrics and logs are also exported over gRPC and the W3C
//! propagators are registered globally.

pub mod metrics;

use crate::error::{Error, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::fmt::Display;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// Optional OTLP endpoint (e.g. "http://localhost:4317").
    /// When `None`, only the fmt layer is installed.
    pub endpoint: Option<String>,
    /// The service name reported in telemetry signals.
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

/// Synchronously export buffered spans.
///
/// Workers often run each job in a process that exits as soon as the job
/// returns, so the consumer path calls this before handing control back.
pub trait SpanFlush: Send + Sync {
    fn flush(&self) -> Result<()>;
}

impl SpanFlush for SdkTracerProvider {
    fn flush(&self) -> Result<()> {
        self.force_flush()
            .map_err(|e| Error::Flush(e.to_string()))
    }
}

/// The three OTLP export pipelines.
struct Pipelines {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

fn exporter_error<E: Display>(signal: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Telemetry(format!("failed to create OTLP {signal} exporter: {e}"))
}

impl Pipelines {
    fn build(endpoint: &str, service_name: String) -> Result<Self> {
        let resource = Resource::builder().with_service_name(service_name).build();

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("span"))?;
        let traces = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("metric"))?;
        let metrics = SdkMeterProvider::builder()
            .with_periodic_exporter(metric_exporter)
            .with_resource(resource.clone())
            .build();

        let log_exporter = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("log"))?;
        let logs = SdkLoggerProvider::builder()
            .with_batch_exporter(log_exporter)
            .with_resource(resource)
            .build();

        Ok(Self {
            traces,
            metrics,
            logs,
        })
    }

    fn flush(&self) {
        let _ = self.traces.force_flush();
        let _ = self.metrics.force_flush();
        let _ = self.logs.force_flush();
    }

    /// Logs first, traces last.
    fn shutdown(self) {
        let _ = self.logs.shutdown();
        let _ = self.metrics.shutdown();
        let _ = self.traces.shutdown();
    }
}

/// Keeps the export pipelines alive. Dropping it shuts them down, which
/// exports whatever is still buffered.
pub struct TelemetryGuard {
    pipelines: Option<Pipelines>,
}

impl TelemetryGuard {
    /// Force-flush all telemetry pipelines.
    ///
    /// Useful in tests to ensure data is exported before querying backends.
    pub fn force_flush(&self) {
        if let Some(pipelines) = &self.pipelines {
            pipelines.flush();
        }
    }

    /// Handle for the consumer path to flush spans with. None without an
    /// OTLP endpoint, since nothing is buffered then.
    pub fn span_flusher(&self) -> Option<Arc<dyn SpanFlush>> {
        self.pipelines
            .as_ref()
            .map(|pipelines| Arc::new(pipelines.traces.clone()) as Arc<dyn SpanFlush>)
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(pipelines) = self.pipelines.take() {
            pipelines.shutdown();
        }
    }
}

fn subscriber_error(e: impl Display) -> Error {
    Error::Telemetry(format!("failed to init tracing subscriber: {e}"))
}

/// Install the global subscriber, plus OTLP export when an endpoint is set.
///
/// Hold the returned guard for the lifetime of the process.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(endpoint) = config.endpoint else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard { pipelines: None });
    };

    let pipelines = Pipelines::build(&endpoint, config.service_name)?;
    let tracer = pipelines.traces.tracer("rq-tracing");

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt.compact())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(OpenTelemetryTracingBridge::new(&pipelines.logs))
        .try_init()
        .map_err(subscriber_error)?;

    opentelemetry::global::set_meter_provider(pipelines.metrics.clone());
    opentelemetry::global::set_text_map_propagator(crate::carrier::propagator());

    Ok(TelemetryGuard {
        pipelines: Some(pipelines),
    })
}
