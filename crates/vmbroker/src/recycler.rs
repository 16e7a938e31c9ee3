use crate::pool::AvailablePool;
use std::sync::Arc;
use vmbroker_core::{HypervisorControl, RecycleFailurePolicy, Result, VmDescriptor, VmState};

/// Resets a released VM and hands it back to the pool once it is healthy.
pub struct VmRecycler {
    control: Arc<dyn HypervisorControl>,
    pool: AvailablePool,
    policy: RecycleFailurePolicy,
}

impl VmRecycler {
    pub fn new(
        control: Arc<dyn HypervisorControl>,
        pool: AvailablePool,
        policy: RecycleFailurePolicy,
    ) -> Self {
        Self {
            control,
            pool,
            policy,
        }
    }

    pub fn pool(&self) -> &AvailablePool {
        &self.pool
    }

    /// Runs reset and health gate for `vm`.
    ///
    /// # Errors
    ///
    /// Returns the last reset or health failure once the failure policy gives
    /// up. The VM has then been dropped from circulation.
    pub async fn recycle(&self, vm: VmDescriptor) -> Result<()> {
        let (attempts, mut backoff) = match self.policy {
            RecycleFailurePolicy::Drop => (1, std::time::Duration::ZERO),
            RecycleFailurePolicy::Retry { attempts, backoff } => (attempts.max(1), backoff),
        };

        let mut attempt = 1;
        let err = loop {
            let err = match self.reset_and_restore(&vm).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if attempt >= attempts {
                break err;
            }

            tracing::warn!(
                vm = %vm.name,
                id = %vm.id,
                attempt,
                retry_in_ms = backoff.as_millis() as u64,
                error = %err,
                "recycling VM failed, retrying"
            );
            let shutdown = self.pool.shutdown_token();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break err,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = backoff.saturating_mul(2);
            attempt += 1;
        };

        tracing::error!(vm = %vm.name, id = %vm.id, error = %err, "error recycling VM");
        self.pool.drop_from_circulation(&vm);
        Err(err)
    }

    async fn reset_and_restore(&self, vm: &VmDescriptor) -> Result<()> {
        tracing::trace!(vm = %vm.name, id = %vm.id, "resetting VM");
        self.control
            .request_state_change(vm.id, VmState::Reset)
            .await?;
        tracing::trace!(vm = %vm.name, id = %vm.id, "reset VM");
        self.pool.make_available(vm.clone()).await
    }
}
