//! Self-scaling pool of recycle workers.
//!
//! A fixed number of workers start immediately. A scaler polls the recycle
//! backlog and adds one worker per poll while the backlog is above the
//! threshold, up to the configured maximum. Workers never scale down.

use crate::channel::RecycleChannel;
use crate::recycler::VmRecycler;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use vmbroker_core::RecycleSettings;

struct WorkerContext {
    channel: Arc<RecycleChannel>,
    recycler: Arc<VmRecycler>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    workers: AtomicUsize,
}

impl WorkerContext {
    fn spawn_worker(self: &Arc<Self>) -> usize {
        let num = self.workers.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(worker = num, "starting recycle worker");
        self.tracker.spawn(run_worker(Arc::clone(self), num));
        num + 1
    }
}

/// Handle to the running recycle workers and their scaler.
pub struct RecycleWorkers {
    context: Arc<WorkerContext>,
}

impl RecycleWorkers {
    /// Starts `settings.initial_workers` workers and the scaler.
    ///
    /// Everything stops once `shutdown` is cancelled; use [`join`](Self::join)
    /// to wait for in-flight recycles to finish.
    pub fn spawn(
        channel: Arc<RecycleChannel>,
        recycler: Arc<VmRecycler>,
        settings: &RecycleSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let context = Arc::new(WorkerContext {
            channel,
            recycler,
            shutdown,
            tracker: TaskTracker::new(),
            workers: AtomicUsize::new(0),
        });

        for _ in 0..settings.initial_workers {
            context.spawn_worker();
        }
        tracing::debug!(workers = settings.initial_workers, "started recycle workers");

        context.tracker.spawn(run_scaler(
            Arc::clone(&context),
            settings.queue_depth_threshold,
            settings.max_workers,
            settings.scale_interval,
        ));

        Self { context }
    }

    pub fn worker_count(&self) -> usize {
        self.context.workers.load(Ordering::SeqCst)
    }

    /// Waits for the scaler and every worker to exit.
    ///
    /// Only returns after the shutdown token has been cancelled.
    pub async fn join(&self) {
        self.context.tracker.close();
        self.context.tracker.wait().await;
    }
}

async fn run_worker(context: Arc<WorkerContext>, num: usize) {
    loop {
        tracing::trace!(worker = num, "waiting to recycle a VM");
        let Some(vm) = context.channel.read(&context.shutdown).await else {
            break;
        };
        tracing::trace!(worker = num, vm = %vm.name, id = %vm.id, "recycling VM");

        // Run the recycle as its own task so a panic is contained to this VM.
        let recycler = Arc::clone(&context.recycler);
        let job = tokio::spawn({
            let vm = vm.clone();
            async move { recycler.recycle(vm).await }
        });

        match job.await {
            Ok(Ok(())) => {
                tracing::trace!(worker = num, vm = %vm.name, id = %vm.id, "recycled VM");
            }
            Ok(Err(err)) => {
                tracing::debug!(worker = num, vm = %vm.name, error = %err, "recycle failed");
            }
            Err(err) => {
                tracing::error!(worker = num, vm = %vm.name, id = %vm.id, error = %err, "recycle task failed");
                context.recycler.pool().drop_from_circulation(&vm);
            }
        }
    }
    tracing::trace!(worker = num, "recycle worker exited");
}

async fn run_scaler(
    context: Arc<WorkerContext>,
    queue_depth_threshold: usize,
    max_workers: usize,
    interval: Duration,
) {
    loop {
        let current = context.workers.load(Ordering::SeqCst);
        if current >= max_workers {
            tracing::debug!(max_workers, "reached maximum recycle worker count");
            context.shutdown.cancelled().await;
            break;
        }

        tracing::trace!(
            workers = current,
            depth = context.channel.count(),
            "checking recycle backlog"
        );
        tokio::select! {
            biased;
            _ = context.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let depth = context.channel.count();
        if depth > queue_depth_threshold {
            let workers = context.spawn_worker();
            tracing::info!(
                depth,
                threshold = queue_depth_threshold,
                workers,
                "recycle backlog above threshold, added worker"
            );
        }
    }
    tracing::trace!("recycle scaler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthGate;
    use crate::pool::AvailablePool;
    use crate::test_utils::{ScriptedHealthCheck, ScriptedHypervisor, descriptor, fleet};
    use vmbroker_core::{HealthSettings, RecycleFailurePolicy, VmDescriptor};

    struct Harness {
        pool: AvailablePool,
        channel: Arc<RecycleChannel>,
        control: Arc<ScriptedHypervisor>,
        shutdown: CancellationToken,
        workers: RecycleWorkers,
    }

    fn settings(initial: usize, max: usize) -> RecycleSettings {
        RecycleSettings {
            initial_workers: initial,
            max_workers: max,
            queue_depth_threshold: 2,
            scale_interval: Duration::from_secs(10),
            ..RecycleSettings::default()
        }
    }

    fn harness(
        vms: Vec<VmDescriptor>,
        control: ScriptedHypervisor,
        settings: RecycleSettings,
    ) -> Harness {
        harness_with_check(vms, control, settings, ScriptedHealthCheck::healthy())
    }

    fn harness_with_check(
        vms: Vec<VmDescriptor>,
        control: ScriptedHypervisor,
        settings: RecycleSettings,
        check: ScriptedHealthCheck,
    ) -> Harness {
        let channel = Arc::new(RecycleChannel::new(16));
        let shutdown = CancellationToken::new();
        let pool = AvailablePool::new(
            vms,
            Arc::clone(&channel),
            HealthGate::new(Arc::new(check), &HealthSettings::default()),
            3000,
            shutdown.clone(),
        );
        let control = Arc::new(control);
        let recycler = Arc::new(VmRecycler::new(
            control.clone(),
            pool.clone(),
            RecycleFailurePolicy::Drop,
        ));
        let workers = RecycleWorkers::spawn(
            Arc::clone(&channel),
            recycler,
            &settings,
            shutdown.clone(),
        );
        Harness {
            pool,
            channel,
            control,
            shutdown,
            workers,
        }
    }

    async fn lease_and_release_all(h: &Harness, count: usize) {
        let mut leases = Vec::new();
        for _ in 0..count {
            leases.push(h.pool.acquire().await.unwrap());
        }
        for lease in leases {
            lease.release().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn starts_initial_workers() {
        let h = harness(fleet(1), ScriptedHypervisor::new(), settings(3, 5));
        assert_eq!(h.workers.worker_count(), 3);
        h.shutdown.cancel();
        h.workers.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn workers_return_released_vms_to_pool() {
        let h = harness(fleet(3), ScriptedHypervisor::new(), settings(2, 2));
        lease_and_release_all(&h, 3).await;

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.pool.available_count().await, 3);
        for n in 0..3 {
            assert_eq!(h.control.reset_count(descriptor(n).id), 1);
        }
        h.shutdown.cancel();
        h.workers.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn adds_one_worker_per_poll_while_backlog_exceeds_threshold() {
        let h = harness(fleet(4), ScriptedHypervisor::paused(), settings(1, 3));
        lease_and_release_all(&h, 4).await;

        // One worker is stuck in a reset, three VMs wait behind it.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.channel.count(), 3);
        assert_eq!(h.workers.worker_count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.workers.worker_count(), 2);
        assert_eq!(h.channel.count(), 2);

        // Backlog is at the threshold, not above it.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.workers.worker_count(), 2);

        h.control.resume(4);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.pool.available_count().await, 4);

        h.shutdown.cancel();
        h.workers.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_workers() {
        let h = harness(fleet(10), ScriptedHypervisor::paused(), settings(1, 3));
        lease_and_release_all(&h, 10).await;

        let mut previous = h.workers.worker_count();
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let current = h.workers.worker_count();
            assert!(current >= previous, "worker count decreased");
            assert!(current <= 3);
            previous = current;
        }
        assert_eq!(h.workers.worker_count(), 3);

        h.control.resume(10);
        h.shutdown.cancel();
        h.workers.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recycle_does_not_stop_worker() {
        let control = ScriptedHypervisor::new().with_missing(descriptor(0).id);
        let h = harness(fleet(2), control, settings(1, 1));
        lease_and_release_all(&h, 2).await;

        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = h.pool.stats().await;
        assert_eq!(stats.available, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(h.control.reset_count(descriptor(1).id), 1);
        h.shutdown.cancel();
        h.workers.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_recycle_does_not_stop_worker() {
        let check = ScriptedHealthCheck::healthy();
        check.panic_for(descriptor(0).id);
        let h = harness_with_check(fleet(2), ScriptedHypervisor::new(), settings(1, 1), check);
        lease_and_release_all(&h, 2).await;

        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = h.pool.stats().await;
        assert_eq!(stats.available, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.accounted(), stats.total);
        assert_eq!(h.workers.worker_count(), 1);
        assert_eq!(h.control.reset_count(descriptor(1).id), 1);
        h.shutdown.cancel();
        h.workers.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_in_flight_recycle_finish() {
        let h = harness(fleet(2), ScriptedHypervisor::paused(), settings(1, 1));
        lease_and_release_all(&h, 2).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.shutdown.cancel();
        h.control.resume(1);
        h.workers.join().await;

        // The in-flight VM made it back, the queued one was left in the channel.
        assert_eq!(h.pool.available_count().await, 1);
        assert_eq!(h.channel.count(), 1);
    }
}
