use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// State transitions the broker can request from the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Start,
    Stop,
    Reset,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmState::Start => "start",
            VmState::Stop => "stop",
            VmState::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Control channel to whatever hypervisor hosts the fleet.
///
/// Implementations resolve the VM by its hypervisor id and complete once the
/// hypervisor has confirmed (or rejected) the transition. A VM that cannot be
/// located must be reported as [`Error::VmNotFound`](crate::Error::VmNotFound).
#[async_trait]
pub trait HypervisorControl: Send + Sync {
    fn name(&self) -> &str;
    async fn request_state_change(&self, id: Uuid, state: VmState) -> Result<()>;
}
