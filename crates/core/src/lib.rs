//! Core types for the vmbroker VM lease broker: configuration, VM
//! descriptors, errors and the hypervisor control trait.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod hypervisor;

pub use config::{
    BrokerConfig, ConfigError, DEFAULT_APPLICATION_PORT, DEFAULT_HEALTH_ENDPOINT, FailureMode,
    HealthSettings, HypervisorSettings, RecycleFailurePolicy, RecycleSettings, StickySettings,
    VirtualMachineEntry,
};
pub use descriptor::VmDescriptor;
pub use error::{Error, Result};
pub use hypervisor::{HypervisorControl, VmState};
