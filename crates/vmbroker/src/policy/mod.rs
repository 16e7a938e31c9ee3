//! Allocation policies deciding which lease serves an inbound request.
//!
//! - [`PerRequestAllocator`] leases a fresh VM for every request and releases
//!   it as soon as forwarding completes.
//! - [`PerPathAllocator`] binds one lease to each routing-path prefix and
//!   releases it after the prefix has been idle long enough.
//!
//! Both hand the caller a backend [`SocketAddr`](std::net::SocketAddr); the
//! forwarding itself is left to the caller's proxy.

mod per_path;
mod per_request;

pub use per_path::{PerPathAllocator, split_path_prefix};
pub use per_request::PerRequestAllocator;
