use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

/// Identity and address of one member of the VM fleet.
///
/// Descriptors are produced by validating a [`BrokerConfig`](crate::BrokerConfig)
/// and never change afterwards. They are moved between the available pool, the
/// leases that hold them and the recycle channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub name: String,
    pub id: Uuid,
    pub pipe_name: String,
    pub ip_address: IpAddr,
}

impl VmDescriptor {
    pub fn new(
        name: impl Into<String>,
        id: Uuid,
        pipe_name: impl Into<String>,
        ip_address: IpAddr,
    ) -> Self {
        Self {
            name: name.into(),
            id,
            pipe_name: pipe_name.into(),
            ip_address,
        }
    }

    /// Address of the application listening on `port` inside the VM.
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.ip_address, port)
    }
}

impl fmt::Display for VmDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
