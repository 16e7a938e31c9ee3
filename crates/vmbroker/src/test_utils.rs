//! Scripted collaborators for exercising the broker without a hypervisor or
//! a fleet of real VMs.

use crate::health::HealthCheck;
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Semaphore;
use uuid::Uuid;
use vmbroker_core::{
    BrokerConfig, Error, HypervisorControl, Result, VirtualMachineEntry, VmDescriptor, VmState,
};

/// Deterministic descriptor number `n`: `vm-NN` at `10.0.x.y`.
pub fn descriptor(n: usize) -> VmDescriptor {
    let ip = Ipv4Addr::new(10, 0, (n / 250) as u8, (n % 250 + 1) as u8);
    VmDescriptor::new(
        format!("vm-{n:02}"),
        Uuid::from_u128(n as u128 + 1),
        format!("pipe-{n}"),
        IpAddr::V4(ip),
    )
}

pub fn fleet(size: usize) -> Vec<VmDescriptor> {
    (0..size).map(descriptor).collect()
}

/// Default configuration whose fleet is `fleet(size)`.
pub fn config(size: usize) -> BrokerConfig {
    let virtual_machines = fleet(size)
        .into_iter()
        .map(|vm| VirtualMachineEntry {
            name: vm.name,
            id: vm.id.to_string(),
            pipe_name: vm.pipe_name,
            ip_address: vm.ip_address.to_string(),
        })
        .collect();
    BrokerConfig {
        virtual_machines,
        ..BrokerConfig::default()
    }
}

/// Hypervisor that records every request and answers from a script.
pub struct ScriptedHypervisor {
    calls: Mutex<Vec<(Uuid, VmState)>>,
    missing: Mutex<HashSet<Uuid>>,
    failing: Mutex<HashSet<Uuid>>,
    gate: Option<Semaphore>,
}

impl ScriptedHypervisor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            missing: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            gate: None,
        }
    }

    /// Every request blocks until [`resume`](Self::resume) hands out a permit.
    pub fn paused() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn with_missing(self, id: Uuid) -> Self {
        lock(&self.missing).insert(id);
        self
    }

    pub fn with_failure(self, id: Uuid) -> Self {
        lock(&self.failing).insert(id);
        self
    }

    pub fn heal(&self, id: Uuid) {
        lock(&self.failing).remove(&id);
    }

    /// Lets `requests` paused requests complete.
    pub fn resume(&self, requests: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(requests);
        }
    }

    pub fn calls(&self) -> Vec<(Uuid, VmState)> {
        lock(&self.calls).clone()
    }

    pub fn reset_count(&self, id: Uuid) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|(call_id, state)| *call_id == id && *state == VmState::Reset)
            .count()
    }
}

impl Default for ScriptedHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorControl for ScriptedHypervisor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn request_state_change(&self, id: Uuid, state: VmState) -> Result<()> {
        lock(&self.calls).push((id, state));

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if lock(&self.missing).contains(&id) {
            return Err(Error::VmNotFound(id));
        }
        if lock(&self.failing).contains(&id) {
            return Err(Error::StateChangeFailed {
                id,
                state,
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

enum Script {
    Healthy,
    Unhealthy,
    FailFirst(usize),
    Hang,
}

/// Health check that follows a fixed script and counts attempts.
pub struct ScriptedHealthCheck {
    script: Script,
    attempts: AtomicUsize,
    panics_for: Mutex<HashSet<Uuid>>,
}

impl ScriptedHealthCheck {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            attempts: AtomicUsize::new(0),
            panics_for: Mutex::new(HashSet::new()),
        }
    }

    pub fn healthy() -> Self {
        Self::with_script(Script::Healthy)
    }

    pub fn unhealthy() -> Self {
        Self::with_script(Script::Unhealthy)
    }

    /// Fails the first `attempts` probes, then reports healthy.
    pub fn failing_first(attempts: usize) -> Self {
        Self::with_script(Script::FailFirst(attempts))
    }

    /// Never answers.
    pub fn hanging() -> Self {
        Self::with_script(Script::Hang)
    }

    /// Panics instead of answering whenever `id` is checked.
    pub fn panic_for(&self, id: Uuid) {
        lock(&self.panics_for).insert(id);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for ScriptedHealthCheck {
    async fn check(&self, vm: &VmDescriptor) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if lock(&self.panics_for).contains(&vm.id) {
            panic!("health check crashed for {}", vm.name);
        }
        match self.script {
            Script::Healthy => Ok(()),
            Script::Unhealthy => Err(Error::HealthCheck(format!("{} returned 503", vm.name))),
            Script::FailFirst(failures) if attempt < failures => {
                Err(Error::HealthCheck("connection refused".to_string()))
            }
            Script::FailFirst(_) => Ok(()),
            Script::Hang => std::future::pending().await,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
