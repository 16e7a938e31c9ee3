//! Bounded queue of VMs waiting to be reset.
//!
//! Writers suspend while the channel is full, so a recycler pool that falls
//! behind slows down lease release instead of losing track of VMs.

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use vmbroker_core::VmDescriptor;

pub const DEFAULT_RECYCLE_CAPACITY: usize = 1024;

/// A write that did not make it into the channel. The descriptor is handed
/// back so the caller still owns the VM.
#[derive(Debug, thiserror::Error)]
pub enum RecycleSendError {
    #[error("recycle channel is full")]
    Full(VmDescriptor),

    #[error("recycle channel write cancelled")]
    Cancelled(VmDescriptor),
}

impl RecycleSendError {
    pub fn into_inner(self) -> VmDescriptor {
        match self {
            RecycleSendError::Full(vm) | RecycleSendError::Cancelled(vm) => vm,
        }
    }
}

/// FIFO of descriptors awaiting reset, shared by every releasing lease and
/// every recycle worker.
#[derive(Debug)]
pub struct RecycleChannel {
    tx: mpsc::Sender<VmDescriptor>,
    // Workers take turns on the receiver; whoever holds the lock gets the next entry.
    rx: Mutex<mpsc::Receiver<VmDescriptor>>,
}

impl RecycleChannel {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "recycle channel capacity must be at least 1");
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueues `vm`, waiting for room while the channel is full.
    pub async fn write(
        &self,
        vm: VmDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), RecycleSendError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RecycleSendError::Cancelled(vm)),
            permit = self.tx.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                permit.send(vm);
                Ok(())
            }
            // The receiver lives as long as `self`, so this is only reachable
            // if the channel is being torn down.
            Err(_) => Err(RecycleSendError::Cancelled(vm)),
        }
    }

    pub fn try_write(&self, vm: VmDescriptor) -> Result<(), RecycleSendError> {
        self.tx.try_send(vm).map_err(|err| match err {
            mpsc::error::TrySendError::Full(vm) => RecycleSendError::Full(vm),
            mpsc::error::TrySendError::Closed(vm) => RecycleSendError::Cancelled(vm),
        })
    }

    /// Dequeues the oldest entry, waiting while the channel is empty.
    ///
    /// Returns `None` once `cancel` fires.
    pub async fn read(&self, cancel: &CancellationToken) -> Option<VmDescriptor> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            vm = rx.recv() => vm,
        }
    }

    pub fn try_read(&self) -> Option<VmDescriptor> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Approximate number of queued entries. Only meant for scaling heuristics.
    pub fn count(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl Default for RecycleChannel {
    fn default() -> Self {
        Self::new(DEFAULT_RECYCLE_CAPACITY)
    }
}
