//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast on values that cannot be parsed.
//! Environment variables override the file.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_PRODUCER_SERVICE: &str = "rq";
pub const DEFAULT_WORKER_SERVICE: &str = "rq-worker";

/// Which side of the queue an operation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The application enqueuing and fetching jobs.
    Producer,
    /// The worker process executing jobs.
    Worker,
}

/// Settings for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationConfig {
    /// Carry trace context from enqueue to execution.
    pub distributed_tracing_enabled: bool,
    /// Explicitly configured service name for this role.
    pub service: Option<String>,
    /// Service name used when nothing else is configured.
    pub default_service: String,
}

impl IntegrationConfig {
    pub fn producer() -> Self {
        Self {
            distributed_tracing_enabled: true,
            service: None,
            default_service: DEFAULT_PRODUCER_SERVICE.to_string(),
        }
    }

    pub fn worker() -> Self {
        Self {
            distributed_tracing_enabled: true,
            service: None,
            default_service: DEFAULT_WORKER_SERVICE.to_string(),
        }
    }
}

/// Process-wide integration settings. Producer and worker may report under
/// different services for the same logical job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RqConfig {
    pub producer: IntegrationConfig,
    pub worker: IntegrationConfig,
    /// Application-wide service name (`OTEL_SERVICE_NAME`).
    pub global_service: Option<String>,
}

impl Default for RqConfig {
    fn default() -> Self {
        Self {
            producer: IntegrationConfig::producer(),
            worker: IntegrationConfig::worker(),
            global_service: None,
        }
    }
}

impl RqConfig {
    pub fn role(&self, role: Role) -> &IntegrationConfig {
        match role {
            Role::Producer => &self.producer,
            Role::Worker => &self.worker,
        }
    }

    /// Service for spans the integration owns: pin, then role service, then
    /// the global service, then the role default.
    pub fn integration_service(&self, role: Role, pinned: Option<&str>) -> String {
        let config = self.role(role);
        pinned
            .or(config.service.as_deref())
            .or(self.global_service.as_deref())
            .unwrap_or(config.default_service.as_str())
            .to_string()
    }

    /// Service for spans describing an external system: like
    /// [`Self::integration_service`] but the global service is skipped.
    pub fn external_service(&self, role: Role, pinned: Option<&str>) -> String {
        let config = self.role(role);
        pinned
            .or(config.service.as_deref())
            .unwrap_or(config.default_service.as_str())
            .to_string()
    }
}

/// Everything the process needs at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub rq: RqConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            otel_endpoint: None,
            log_level: "info".to_string(),
            rq: RqConfig::default(),
        }
    }
}

/// On-disk layout.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    otel_endpoint: Option<String>,
    log_level: Option<String>,
    service: Option<String>,
    #[serde(default)]
    rq: RoleFile,
    #[serde(default)]
    rq_worker: RoleFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoleFile {
    distributed_tracing_enabled: Option<bool>,
    service: Option<String>,
}

impl RoleFile {
    fn apply(self, config: &mut IntegrationConfig) {
        if let Some(enabled) = self.distributed_tracing_enabled {
            config.distributed_tracing_enabled = enabled;
        }
        if self.service.is_some() {
            config.service = self.service;
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_lookup(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Parse a TOML document.
    ///
    /// ```toml
    /// otel_endpoint = "http://localhost:4317"
    /// service = "billing"
    ///
    /// [rq]
    /// distributed_tracing_enabled = true
    ///
    /// [rq_worker]
    /// service = "billing-worker"
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad config file: {e}")))?;

        let mut config = Self::default();
        if file.otel_endpoint.is_some() {
            config.otel_endpoint = file.otel_endpoint;
        }
        if let Some(level) = file.log_level {
            config.log_level = level;
        }
        config.rq.global_service = file.service;
        file.rq.apply(&mut config.rq.producer);
        file.rq_worker.apply(&mut config.rq.worker);
        Ok(config)
    }

    /// Load an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read config {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_lookup(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the environment, or a map in
    /// tests).
    pub fn apply_lookup(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(endpoint) = lookup("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(endpoint);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(service) = lookup("OTEL_SERVICE_NAME") {
            self.rq.global_service = Some(service);
        }
        if let Some(service) = lookup("RQ_SERVICE") {
            self.rq.producer.service = Some(service);
        }
        if let Some(service) = lookup("RQ_WORKER_SERVICE") {
            self.rq.worker.service = Some(service);
        }
        // Shared by both roles.
        if let Some(raw) = lookup("RQ_DISTRIBUTED_TRACING_ENABLED") {
            let enabled = parse_bool("RQ_DISTRIBUTED_TRACING_ENABLED", &raw)?;
            self.rq.producer.distributed_tracing_enabled = enabled;
            self.rq.worker.distributed_tracing_enabled = enabled;
        }
        Ok(())
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "environment variable {name} is not a boolean: {raw:?}"
        ))),
    }
}
