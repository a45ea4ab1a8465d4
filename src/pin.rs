//! Per-instance overrides of the process-wide integration config.
//!
//! A pin lets one queue or worker report under its own service name, or opt
//! out of tracing entirely. Pins live in a side-table keyed by the engine's
//! instance name rather than on the instances themselves.

use std::collections::HashMap;
use std::sync::RwLock;

/// Which instance a pin applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PinTarget {
    Queue(String),
    Worker(String),
}

impl PinTarget {
    pub fn queue(name: impl Into<String>) -> Self {
        PinTarget::Queue(name.into())
    }

    pub fn worker(name: impl Into<String>) -> Self {
        PinTarget::Worker(name.into())
    }
}

/// Override for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    /// Service name to report instead of the role's default.
    pub service: Option<String>,
    /// When false, the instance runs uninstrumented.
    pub enabled: bool,
}

impl Default for Pin {
    fn default() -> Self {
        Self {
            service: None,
            enabled: true,
        }
    }
}

impl Pin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Side-table of pins.
#[derive(Debug, Default)]
pub struct PinRegistry {
    pins: RwLock<HashMap<PinTarget, Pin>>,
}

impl PinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pin for `target`, replacing any previous one.
    pub fn override_pin(&self, target: PinTarget, pin: Pin) {
        self.write().insert(target, pin);
    }

    pub fn get(&self, target: &PinTarget) -> Option<Pin> {
        self.read().get(target).cloned()
    }

    pub fn remove(&self, target: &PinTarget) -> Option<Pin> {
        self.write().remove(target)
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Instances without a pin are traced.
    pub fn is_enabled(&self, target: &PinTarget) -> bool {
        self.read().get(target).is_none_or(|pin| pin.enabled)
    }

    // A poisoned lock only means a writer panicked mid-insert; the map is
    // still usable.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PinTarget, Pin>> {
        self.pins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PinTarget, Pin>> {
        self.pins.write().unwrap_or_else(|e| e.into_inner())
    }
}
