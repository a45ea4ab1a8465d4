//! rqtrace: operator tools for trace context carried in rq job metadata.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use rq_tracing::carrier::{self, CARRIER_KEY, CARRIER_VERSION};
use rq_tracing::config::{Config, Role};
use rq_tracing::model::Metadata;
use rq_tracing::telemetry::{TelemetryConfig, init_telemetry};
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rqtrace", about = "Inspect and build rq trace context carriers")]
struct Cli {
    /// Optional TOML config file (environment variables still override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode the trace context carried in a job's metadata
    Inspect {
        /// Job metadata as a JSON object, or "-" to read it from stdin
        meta: String,
    },
    /// Build job metadata carrying the given W3C trace context
    Inject {
        /// W3C traceparent header value
        #[arg(long)]
        traceparent: String,
        /// W3C tracestate header value
        #[arg(long)]
        tracestate: Option<String>,
        /// W3C baggage header value
        #[arg(long)]
        baggage: Option<String>,
    },
    /// Show the resolved per-role configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: None,
        service_name: "rqtrace".to_string(),
        log_level: config.log_level.clone(),
    })?;

    match cli.command {
        Command::Inspect { meta } => cmd_inspect(&meta),
        Command::Inject {
            traceparent,
            tracestate,
            baggage,
        } => cmd_inject(traceparent, tracestate, baggage),
        Command::Config => cmd_config(&config),
    }
}

fn cmd_inspect(raw: &str) -> anyhow::Result<()> {
    let json = if raw == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read metadata from stdin")?;
        buf
    } else {
        raw.to_string()
    };

    let meta: Metadata =
        serde_json::from_str(&json).context("metadata must be a JSON object")?;

    match carrier::try_extract(&meta) {
        Ok(Some(context)) => {
            println!("Trace ID:   {}", context.trace_id());
            println!("Parent ID:  {}", context.span_id());
            println!("Sampled:    {}", context.is_sampled());
            let baggage = meta[CARRIER_KEY].get("baggage").and_then(|b| b.as_str());
            if let Some(baggage) = baggage {
                println!("Baggage:    {baggage}");
            }
        }
        Ok(None) => println!("No trace context carried (key {CARRIER_KEY} absent)."),
        Err(e) => println!("Unusable trace context, worker would start a new trace: {e}"),
    }

    Ok(())
}

fn cmd_inject(
    traceparent: String,
    tracestate: Option<String>,
    baggage: Option<String>,
) -> anyhow::Result<()> {
    let mut raw = serde_json::Map::new();
    raw.insert("v".to_string(), CARRIER_VERSION.into());
    raw.insert("traceparent".to_string(), traceparent.into());
    if let Some(tracestate) = tracestate {
        raw.insert("tracestate".to_string(), tracestate.into());
    }
    if let Some(baggage) = baggage {
        raw.insert("baggage".to_string(), baggage.into());
    }

    let mut given = Metadata::new();
    given.insert(CARRIER_KEY.to_string(), raw.into());
    let context = carrier::try_extract(&given)?
        .ok_or_else(|| anyhow::anyhow!("no trace context in input"))?;

    // Re-encode so the output is exactly what a traced producer would write.
    let mut meta = Metadata::new();
    carrier::inject(&context, &mut meta);
    println!("{}", serde_json::to_string_pretty(&meta)?);
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    println!(
        "OTLP endpoint:  {}",
        config.otel_endpoint.as_deref().unwrap_or("-")
    );
    println!("Log level:      {}", config.log_level);
    for (label, role) in [("producer", Role::Producer), ("worker", Role::Worker)] {
        let settings = config.rq.role(role);
        println!("---");
        println!("Role:           {label}");
        println!(
            "Service:        {}",
            config.rq.integration_service(role, None)
        );
        println!(
            "Distributed:    {}",
            if settings.distributed_tracing_enabled {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
    Ok(())
}
