//! Available-VM pool and leases.
//!
//! The pool is the only place free VMs live. Leasing a VM removes it from the
//! pool; releasing the lease sends the VM to the [`RecycleChannel`] rather than
//! back into the pool, so a VM is never handed out twice without being reset
//! and health-checked in between.
//!
//! # Example
//!
//! ```no_run
//! # async fn example(pool: vmbroker::AvailablePool) -> vmbroker::Result<()> {
//! // Waits until a VM is free
//! let lease = pool.acquire().await?;
//! println!("forwarding to {}", lease.address());
//!
//! // Queue the VM for reset and health check
//! lease.release().await;
//! # Ok(())
//! # }
//! ```

use crate::channel::{RecycleChannel, RecycleSendError};
use crate::health::HealthGate;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vmbroker_core::{Error, Result, VmDescriptor};

#[derive(Default)]
struct Available {
    queue: VecDeque<VmDescriptor>,
    ids: HashSet<Uuid>,
}

impl Available {
    fn push(&mut self, vm: VmDescriptor) -> bool {
        if !self.ids.insert(vm.id) {
            return false;
        }
        self.queue.push_back(vm);
        true
    }

    fn pop(&mut self) -> Option<VmDescriptor> {
        let vm = self.queue.pop_front()?;
        self.ids.remove(&vm.id);
        Some(vm)
    }
}

struct PoolInner {
    available: Mutex<Available>,
    notify: Notify,
    channel: Arc<RecycleChannel>,
    gate: HealthGate,
    application_port: u16,
    shutdown: CancellationToken,
    total: usize,
    leased: AtomicUsize,
    recycling: AtomicUsize,
    dropped: AtomicUsize,
}

impl PoolInner {
    fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Moves a released VM into the recycle channel, waiting for room.
    async fn recycle(&self, vm: VmDescriptor) {
        self.start_recycling();
        tracing::debug!(
            vm = %vm.name,
            id = %vm.id,
            depth = self.channel.count(),
            "queueing VM for recycling"
        );
        if let Err(err) = self.channel.write(vm, &self.shutdown).await {
            self.recycle_or_abandon(err.into_inner());
        }
    }

    fn recycle_now(&self, vm: VmDescriptor) {
        self.start_recycling();
        if let Err(err) = self.channel.try_write(vm) {
            self.recycle_or_abandon(err.into_inner());
        }
    }

    fn start_recycling(&self) {
        decrement(&self.leased);
        self.recycling.fetch_add(1, Ordering::SeqCst);
    }

    // Last resort once shutdown has cancelled the blocking write.
    fn recycle_or_abandon(&self, vm: VmDescriptor) {
        match self.channel.try_write(vm) {
            Ok(()) => {}
            Err(RecycleSendError::Full(vm) | RecycleSendError::Cancelled(vm)) => {
                tracing::error!(
                    vm = %vm.name,
                    id = %vm.id,
                    "recycle channel unavailable during shutdown, abandoning VM"
                );
                self.mark_dropped();
            }
        }
    }

    fn mark_dropped(&self) {
        decrement(&self.recycling);
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

/// Snapshot of where every configured VM currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub leased: usize,
    pub recycling: usize,
    pub dropped: usize,
}

impl PoolStats {
    pub fn accounted(&self) -> usize {
        self.available + self.leased + self.recycling + self.dropped
    }
}

/// Blocking queue of VMs that are ready to be leased.
///
/// `AvailablePool` is a cheap handle; clones share the same pool.
#[derive(Clone)]
pub struct AvailablePool {
    inner: Arc<PoolInner>,
}

impl AvailablePool {
    /// Creates a pool holding every VM in `vms`.
    ///
    /// Configured VMs are trusted and inserted without a health probe.
    pub fn new(
        vms: Vec<VmDescriptor>,
        channel: Arc<RecycleChannel>,
        gate: HealthGate,
        application_port: u16,
        shutdown: CancellationToken,
    ) -> Self {
        let mut available = Available::default();
        for vm in vms {
            tracing::trace!(vm = %vm.name, id = %vm.id, "adding VM to available pool");
            if !available.push(vm) {
                tracing::warn!("ignoring duplicate VM in fleet");
            }
        }
        let total = available.queue.len();

        Self {
            inner: Arc::new(PoolInner {
                available: Mutex::new(available),
                notify: Notify::new(),
                channel,
                gate,
                application_port,
                shutdown,
                total,
                leased: AtomicUsize::new(0),
                recycling: AtomicUsize::new(0),
                dropped: AtomicUsize::new(0),
            }),
        }
    }

    /// Leases a VM, waiting until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolShutdown`] once the shutdown token is cancelled.
    pub async fn acquire(&self) -> Result<Lease> {
        let started = Instant::now();
        loop {
            // Register for notification BEFORE checking state to avoid race
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.is_shutting_down() {
                return Err(Error::PoolShutdown);
            }

            {
                let mut available = self.inner.available.lock().await;
                let depth = available.queue.len();
                if let Some(vm) = available.pop() {
                    drop(available);
                    return Ok(self.lease(vm, depth, started));
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.shutdown.cancelled() => return Err(Error::PoolShutdown),
            }
        }
    }

    /// Leases a VM without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolEmpty`] - No VMs available or lock is contended
    /// - [`Error::PoolShutdown`] - Pool is being shut down
    pub fn try_acquire(&self) -> Result<Lease> {
        if self.inner.is_shutting_down() {
            return Err(Error::PoolShutdown);
        }

        let mut available = match self.inner.available.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Err(Error::PoolEmpty),
        };

        let depth = available.queue.len();
        match available.pop() {
            Some(vm) => {
                drop(available);
                Ok(self.lease(vm, depth, Instant::now()))
            }
            None => Err(Error::PoolEmpty),
        }
    }

    fn lease(&self, vm: VmDescriptor, depth: usize, started: Instant) -> Lease {
        self.inner.leased.fetch_add(1, Ordering::SeqCst);
        let wait_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            vm = %vm.name,
            id = %vm.id,
            available = depth,
            wait_ms,
            "leased VM"
        );
        Lease::new(vm, Arc::clone(&self.inner))
    }

    /// Releases `lease`; equivalent to [`Lease::release`].
    pub async fn release(&self, lease: &Lease) -> bool {
        lease.release().await
    }

    /// Returns a recycled VM to the pool once it passes the health gate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unhealthy`] if every probe failed. The VM is not
    /// inserted; deciding what happens to it is up to the caller.
    pub async fn make_available(&self, vm: VmDescriptor) -> Result<()> {
        self.inner.gate.wait_healthy(&vm).await?;

        let inserted = {
            let mut available = self.inner.available.lock().await;
            available.push(vm.clone())
        };
        decrement(&self.inner.recycling);

        if inserted {
            tracing::trace!(vm = %vm.name, id = %vm.id, "VM available");
            self.inner.notify.notify_one();
        } else {
            tracing::warn!(vm = %vm.name, id = %vm.id, "VM is already available, ignoring");
        }
        Ok(())
    }

    /// Records that a VM which was being recycled has left circulation.
    pub fn drop_from_circulation(&self, vm: &VmDescriptor) {
        tracing::warn!(vm = %vm.name, id = %vm.id, "VM dropped from circulation");
        self.inner.mark_dropped();
    }

    pub async fn available_count(&self) -> usize {
        self.inner.available.lock().await.queue.len()
    }

    /// Best-effort snapshot of where the fleet currently is.
    ///
    /// The counters are read one after another, so on a multi-threaded
    /// runtime a VM moving between states can be missed or counted twice and
    /// [`PoolStats::accounted`] may briefly differ from `total`. Once the
    /// pool is quiescent the fields add up exactly.
    pub async fn stats(&self) -> PoolStats {
        let available = self.available_count().await;
        PoolStats {
            total: self.inner.total,
            available,
            leased: self.inner.leased.load(Ordering::SeqCst),
            recycling: self.inner.recycling.load(Ordering::SeqCst),
            dropped: self.inner.dropped.load(Ordering::SeqCst),
        }
    }

    pub fn application_port(&self) -> u16 {
        self.inner.application_port
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }
}

/// Exclusive right to use one VM.
///
/// Releasing the lease queues the VM for recycling. Only the first release has
/// any effect; later calls return `false`. A lease dropped without being
/// released is released from a background task, so the VM is recycled on
/// every exit path.
pub struct Lease {
    vm: VmDescriptor,
    address: SocketAddr,
    released: AtomicBool,
    pool: Arc<PoolInner>,
}

impl Lease {
    fn new(vm: VmDescriptor, pool: Arc<PoolInner>) -> Self {
        let address = vm.socket_addr(pool.application_port);
        Self {
            vm,
            address,
            released: AtomicBool::new(false),
            pool,
        }
    }

    /// Backend address (`ip:application_port`) of the leased VM.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn id(&self) -> Uuid {
        self.vm.id
    }

    pub fn descriptor(&self) -> &VmDescriptor {
        &self.vm
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Queues the VM for recycling, waiting while the recycle channel is full.
    ///
    /// Returns `true` if this call released the lease.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            tracing::debug!(vm = %self.vm.name, id = %self.vm.id, "lease already released");
            return false;
        }
        self.pool.recycle(self.vm.clone()).await;
        true
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("vm", &self.vm)
            .field("address", &self.address)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let vm = self.vm.clone();
        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { pool.recycle(vm).await });
            }
            Err(_) => pool.recycle_now(vm),
        }
    }
}
