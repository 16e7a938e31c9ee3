//! Lease broker for a fixed fleet of backend VMs.
//!
//! The broker hands out exclusive leases on VMs, and once a lease ends it
//! resets the VM and probes its health before the VM can be leased again.
//! Released VMs flow through a bounded recycle channel to a pool of recycle
//! workers that grows with the backlog.
//!
//! # Quick Start
//!
//! All interaction starts with [`Broker`]:
//!
//! ```rust,no_run
//! use vmbroker::{Broker, BrokerConfig, split_path_prefix};
//!
//! # async fn example() -> vmbroker::Result<()> {
//! let config = BrokerConfig::load("broker.toml")?;
//! let broker = Broker::builder(config).start().await?;
//!
//! // One VM per request
//! let status = broker
//!     .per_request()
//!     .serve(|address| async move {
//!         println!("forwarding to {address}");
//!         Ok::<_, vmbroker::Error>(200)
//!     })
//!     .await?;
//!
//! // One VM per path prefix, kept until the prefix goes idle
//! let (prefix, rest) = split_path_prefix("/session-42/api/items");
//! let address = broker.per_path().address_for(prefix).await?;
//! println!("forwarding {rest} to {address}");
//!
//! broker.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Hypervisor control and health probing are pluggable through
//! [`HypervisorControl`] and [`HealthCheck`]; by default the broker shells out
//! to `virsh` and probes `GET http://{ip}:{port}/healthz`.

mod broker;
mod channel;
mod control;
mod health;
mod policy;
mod pool;
mod recycler;
mod workers;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// ============================================================================
// Core API
// ============================================================================

pub use broker::{Broker, BrokerBuilder};
pub use policy::{PerPathAllocator, PerRequestAllocator, split_path_prefix};
pub use pool::{AvailablePool, Lease, PoolStats};

// Configuration
pub use vmbroker_core::{
    BrokerConfig, ConfigError, FailureMode, HealthSettings, HypervisorSettings,
    RecycleFailurePolicy, RecycleSettings, StickySettings, VirtualMachineEntry,
};

// VM identity and hypervisor control
pub use vmbroker_core::{HypervisorControl, VmDescriptor, VmState};

// Errors
pub use vmbroker_core::{Error, Result};

// ============================================================================
// Advanced API - Building blocks of the recycle pipeline
// ============================================================================

pub use channel::{DEFAULT_RECYCLE_CAPACITY, RecycleChannel, RecycleSendError};
pub use control::CommandControl;
pub use health::{HealthCheck, HealthGate, HttpHealthCheck};
pub use recycler::VmRecycler;
pub use workers::RecycleWorkers;
