use crate::config::ConfigError;
use crate::hypervisor::VmState;
use uuid::Uuid;

/// Errors that can occur while brokering virtual machines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration:\n{0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("hypervisor control '{name}' is not available: {reason}")]
    BackendUnavailable { name: String, reason: String },

    #[error("no virtual machine found with id {0}")]
    VmNotFound(Uuid),

    #[error("changing state of virtual machine {id} to {state} failed: {reason}")]
    StateChangeFailed {
        id: Uuid,
        state: VmState,
        reason: String,
    },

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error("virtual machine '{name}' is not healthy after {attempts} attempts: {reason}")]
    Unhealthy {
        name: String,
        attempts: u32,
        reason: String,
    },

    #[error("no VMs available in pool")]
    PoolEmpty,

    #[error("pool is shutting down")]
    PoolShutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::ConfigParse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
