//! Broker configuration.
//!
//! The configuration is a TOML document listing the fleet plus the tunables of
//! the recycle pipeline. Every field has a default except the fleet itself:
//!
//! ```toml
//! application_port = 3000
//! health_endpoint = "/healthz"
//!
//! [[virtual_machines]]
//! name = "VM1"
//! id = "eca3bda4-3a11-43d7-af13-24ee576dd354"
//! pipe_name = "TestPipe"
//! ip_address = "172.20.174.194"
//!
//! [recycle]
//! initial_workers = 15
//! max_workers = 20
//! ```
//!
//! Durations are written in milliseconds (`*_ms` keys). [`BrokerConfig::validate`]
//! checks the whole document and reports every violation at once.

use crate::descriptor::VmDescriptor;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_APPLICATION_PORT: u16 = 3000;
pub const DEFAULT_HEALTH_ENDPOINT: &str = "/healthz";

/// Every violation found while validating a [`BrokerConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .violations.join("\n"))]
pub struct ConfigError {
    violations: Vec<String>,
}

impl ConfigError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }
}

/// One `[[virtual_machines]]` entry as written in the file.
///
/// Fields are kept as strings so that malformed entries surface as validation
/// messages instead of parse errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMachineEntry {
    pub name: String,
    pub id: String,
    pub pipe_name: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub virtual_machines: Vec<VirtualMachineEntry>,
    pub application_port: u16,
    pub health_endpoint: String,
    pub recycle: RecycleSettings,
    pub health: HealthSettings,
    pub sticky: StickySettings,
    pub hypervisor: HypervisorSettings,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            virtual_machines: Vec::new(),
            application_port: DEFAULT_APPLICATION_PORT,
            health_endpoint: DEFAULT_HEALTH_ENDPOINT.to_string(),
            recycle: RecycleSettings::default(),
            health: HealthSettings::default(),
            sticky: StickySettings::default(),
            hypervisor: HypervisorSettings::default(),
        }
    }
}

/// What the recycler does when a reset or health check fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Log the failure and take the VM out of circulation.
    #[default]
    Drop,
    /// Retry the whole reset and health sequence with doubling backoff.
    Retry,
}

/// Resolved failure handling for the recycler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleFailurePolicy {
    Drop,
    Retry { attempts: u32, backoff: Duration },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecycleSettings {
    pub channel_capacity: usize,
    pub initial_workers: usize,
    pub queue_depth_threshold: usize,
    pub max_workers: usize,
    #[serde(rename = "scale_interval_ms", with = "duration_ms")]
    pub scale_interval: Duration,
    pub on_failure: FailureMode,
    pub retry_attempts: u32,
    #[serde(rename = "retry_backoff_ms", with = "duration_ms")]
    pub retry_backoff: Duration,
}

impl Default for RecycleSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            initial_workers: 15,
            queue_depth_threshold: 2,
            max_workers: 20,
            scale_interval: Duration::from_secs(10),
            on_failure: FailureMode::Drop,
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl RecycleSettings {
    pub fn failure_policy(&self) -> RecycleFailurePolicy {
        match self.on_failure {
            FailureMode::Drop => RecycleFailurePolicy::Drop,
            FailureMode::Retry => RecycleFailurePolicy::Retry {
                attempts: self.retry_attempts,
                backoff: self.retry_backoff,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub attempts: u32,
    #[serde(rename = "attempt_timeout_ms", with = "duration_ms")]
    pub attempt_timeout: Duration,
    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            attempts: 10,
            attempt_timeout: Duration::from_secs(2),
            retry_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StickySettings {
    #[serde(rename = "idle_expiry_ms", with = "duration_ms")]
    pub idle_expiry: Duration,
    #[serde(rename = "grace_period_ms", with = "duration_ms")]
    pub grace_period: Duration,
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for StickySettings {
    fn default() -> Self {
        Self {
            idle_expiry: Duration::from_secs(90),
            grace_period: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorSettings {
    pub program: String,
    pub connect_uri: Option<String>,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            program: "virsh".to_string(),
            connect_uri: None,
        }
    }
}

impl BrokerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Checks the fleet and the tunables, returning the fleet descriptors in
    /// configuration order.
    pub fn validate(&self) -> std::result::Result<Vec<VmDescriptor>, ConfigError> {
        let mut violations = Vec::new();
        let mut descriptors = Vec::with_capacity(self.virtual_machines.len());

        if self.virtual_machines.is_empty() {
            violations.push("No virtual machines configured.".to_string());
        }

        let mut seen_ids: HashMap<Uuid, usize> = HashMap::new();
        for (index, vm) in self.virtual_machines.iter().enumerate() {
            let label = if vm.name.is_empty() {
                format!("virtual machine #{index}")
            } else {
                format!("virtual machine #{index} ('{}')", vm.name)
            };

            if vm.name.is_empty() {
                violations.push(format!("{label}: name is required."));
            }
            if vm.pipe_name.is_empty() {
                violations.push(format!("{label}: pipe_name is required."));
            }

            let ip_address = if vm.ip_address.is_empty() {
                violations.push(format!("{label}: ip_address is required."));
                None
            } else {
                match vm.ip_address.parse::<IpAddr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        violations.push(format!(
                            "{label}: ip_address '{}' is not a valid IP address.",
                            vm.ip_address
                        ));
                        None
                    }
                }
            };

            let id = if vm.id.is_empty() {
                violations.push(format!("{label}: id is required."));
                None
            } else {
                match Uuid::parse_str(&vm.id) {
                    Ok(id) => Some(id),
                    Err(_) => {
                        violations.push(format!("{label}: id '{}' is not a valid UUID.", vm.id));
                        None
                    }
                }
            };

            if let Some(id) = id {
                if let Some(first) = seen_ids.insert(id, index) {
                    violations.push(format!(
                        "{label}: id {id} is already used by virtual machine #{first}."
                    ));
                }
            }

            if let (Some(id), Some(ip_address)) = (id, ip_address) {
                if !vm.name.is_empty() && !vm.pipe_name.is_empty() {
                    descriptors.push(VmDescriptor::new(&vm.name, id, &vm.pipe_name, ip_address));
                }
            }
        }

        self.validate_tunables(&mut violations);

        if violations.is_empty() {
            Ok(descriptors)
        } else {
            Err(ConfigError::new(violations))
        }
    }

    fn validate_tunables(&self, violations: &mut Vec<String>) {
        if self.application_port == 0 {
            violations.push("application_port must not be 0.".to_string());
        }
        if self.recycle.channel_capacity == 0 {
            violations.push("recycle.channel_capacity must be at least 1.".to_string());
        }
        if self.recycle.initial_workers == 0 {
            violations.push("recycle.initial_workers must be at least 1.".to_string());
        }
        if self.recycle.max_workers < self.recycle.initial_workers {
            violations.push(format!(
                "recycle.max_workers ({}) must be at least recycle.initial_workers ({}).",
                self.recycle.max_workers, self.recycle.initial_workers
            ));
        }
        if self.recycle.on_failure == FailureMode::Retry && self.recycle.retry_attempts == 0 {
            violations.push(
                "recycle.retry_attempts must be at least 1 when recycle.on_failure is \"retry\"."
                    .to_string(),
            );
        }
        if self.health.attempts == 0 {
            violations.push("health.attempts must be at least 1.".to_string());
        }
        let timings = [
            ("recycle.scale_interval_ms", self.recycle.scale_interval),
            ("health.attempt_timeout_ms", self.health.attempt_timeout),
            ("sticky.idle_expiry_ms", self.sticky.idle_expiry),
            ("sticky.sweep_interval_ms", self.sticky.sweep_interval),
        ];
        for (name, value) in timings {
            if value.is_zero() {
                violations.push(format!("{name} must be at least 1."));
            }
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
