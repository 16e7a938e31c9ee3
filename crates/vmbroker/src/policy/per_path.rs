use crate::pool::{AvailablePool, Lease};
use dashmap::DashMap;
use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use vmbroker_core::{Error, Result, StickySettings};

/// Splits a request path into its routing prefix and the path to forward.
///
/// The first segment selects the binding; the rest, without a trailing
/// slash, is what the backend sees. Any query string is dropped; callers
/// forward it separately.
///
/// ```
/// use vmbroker::split_path_prefix;
///
/// assert_eq!(split_path_prefix("/foo/a/b/"), ("foo", "/a/b".to_string()));
/// assert_eq!(split_path_prefix("/foo/a/b?q"), ("foo", "/a/b".to_string()));
/// assert_eq!(split_path_prefix("/foo"), ("foo", "/".to_string()));
/// ```
pub fn split_path_prefix(path: &str) -> (&str, String) {
    let path = path.split_once('?').map_or(path, |(path, _)| path);
    let path = path.strip_prefix('/').unwrap_or(path);
    match path.split_once('/') {
        Some((prefix, rest)) => (prefix, format!("/{}", rest.trim_end_matches('/'))),
        None => (path, "/".to_string()),
    }
}

/// A prefix's lease, when it was last used and how many requests are
/// resolving it right now.
struct PathBinding {
    lease: OnceCell<Lease>,
    last_access: Mutex<Instant>,
    resolving: AtomicUsize,
}

impl PathBinding {
    fn new() -> Self {
        Self {
            lease: OnceCell::new(),
            last_access: Mutex::new(Instant::now()),
            resolving: AtomicUsize::new(1),
        }
    }

    /// Registers another request; called under the map's shard lock.
    fn enter(&self) {
        self.touch();
        self.resolving.fetch_add(1, Ordering::SeqCst);
    }

    fn is_abandoned(&self) -> bool {
        !self.lease.initialized() && self.resolving.load(Ordering::SeqCst) == 0
    }

    fn touch(&self) {
        *self.last_access.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last = *self.last_access.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last)
    }

    // Bindings still waiting on their first acquire are never expired.
    fn is_expired(&self, now: Instant, idle_expiry: Duration) -> bool {
        self.lease.initialized() && self.idle_for(now) > idle_expiry
    }
}

struct PerPathInner {
    pool: AvailablePool,
    bindings: DashMap<String, Arc<PathBinding>>,
    settings: StickySettings,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    sweeper_started: AtomicBool,
}

/// Leaves a binding on drop. Once the last request waiting on a binding that
/// never got a lease gives up, the binding is removed from the map.
struct Resolving<'a> {
    bindings: &'a DashMap<String, Arc<PathBinding>>,
    prefix: &'a str,
    binding: &'a Arc<PathBinding>,
}

impl Drop for Resolving<'_> {
    fn drop(&mut self) {
        self.binding.resolving.fetch_sub(1, Ordering::SeqCst);
        if self.binding.lease.initialized() {
            return;
        }
        let removed = self.bindings.remove_if(self.prefix, |_, binding| {
            Arc::ptr_eq(binding, self.binding) && binding.is_abandoned()
        });
        if removed.is_some() {
            tracing::trace!(prefix = self.prefix, "dropped abandoned path binding");
        }
    }
}

/// One lease per routing-path prefix, released once the prefix goes idle.
///
/// The first request for a prefix leases a VM; later requests for the same
/// prefix reuse it and refresh its idle timer. [`sweep`](Self::sweep) removes
/// bindings idle for longer than `idle_expiry` and releases their leases
/// after `grace_period`, so requests that already resolved the address can
/// finish. The periodic sweeper starts with the first request.
///
/// The allocator shares the broker's shutdown token;
/// [`shutdown`](Self::shutdown) cancels it for the whole broker.
#[derive(Clone)]
pub struct PerPathAllocator {
    inner: Arc<PerPathInner>,
}

impl PerPathAllocator {
    pub fn new(pool: AvailablePool, settings: StickySettings, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(PerPathInner {
                pool,
                bindings: DashMap::new(),
                settings,
                shutdown,
                tracker: TaskTracker::new(),
                sweeper_started: AtomicBool::new(false),
            }),
        }
    }

    /// Backend address for `prefix`, leasing a VM on first use.
    ///
    /// Concurrent first requests for the same prefix share one acquire. If
    /// every request waiting on that acquire is cancelled or fails, the
    /// prefix is unbound again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolShutdown`] if the broker shuts down while waiting
    /// for a VM.
    pub async fn address_for(&self, prefix: &str) -> Result<SocketAddr> {
        self.spawn_sweeper();

        let binding = Arc::clone(
            self.inner
                .bindings
                .entry(prefix.to_string())
                .and_modify(|binding| binding.enter())
                .or_insert_with(|| Arc::new(PathBinding::new()))
                .value(),
        );
        let _resolving = Resolving {
            bindings: &self.inner.bindings,
            prefix,
            binding: &binding,
        };

        let lease = binding
            .lease
            .get_or_try_init(|| async {
                let lease = self.inner.pool.acquire().await?;
                tracing::debug!(prefix, vm = %lease.descriptor().name, "bound path prefix to VM");
                Ok::<_, Error>(lease)
            })
            .await?;
        binding.touch();
        Ok(lease.address())
    }

    /// Resolves the address for `prefix` and hands it to `forward`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolShutdown`] (converted into `E`) if the broker is
    /// shutting down, otherwise whatever `forward` returns.
    pub async fn serve<F, Fut, T, E>(&self, prefix: &str, forward: F) -> std::result::Result<T, E>
    where
        F: FnOnce(SocketAddr) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error> + Display,
    {
        let started = Instant::now();
        let address = self.address_for(prefix).await?;

        let result = forward(address).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::trace!(prefix, %address, elapsed_ms, "request completed"),
            Err(err) => {
                tracing::error!(prefix, %address, elapsed_ms, error = %err, "error forwarding request")
            }
        }
        result
    }

    /// Number of prefixes currently bound.
    pub fn len(&self) -> usize {
        self.inner.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bindings.is_empty()
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.inner.bindings.contains_key(prefix)
    }

    /// Removes every binding idle for longer than `idle_expiry` and schedules
    /// its lease for release after the grace period.
    ///
    /// Returns the number of bindings removed.
    pub fn sweep(&self) -> usize {
        let idle_expiry = self.inner.settings.idle_expiry;
        let candidates: Vec<String> = self
            .inner
            .bindings
            .iter()
            .filter(|entry| entry.value().is_expired(Instant::now(), idle_expiry))
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0;
        for prefix in candidates {
            // A request may have touched the binding since it was collected.
            let removed = self.inner.bindings.remove_if(&prefix, |_, binding| {
                binding.is_expired(Instant::now(), idle_expiry)
            });
            if let Some((prefix, binding)) = removed {
                self.release_after_grace(prefix, binding);
                expired += 1;
            }
        }

        tracing::trace!(expired, bound = self.len(), "swept path bindings");
        expired
    }

    fn release_after_grace(&self, prefix: String, binding: Arc<PathBinding>) {
        let grace = self.inner.settings.grace_period;
        let shutdown = self.inner.shutdown.clone();
        tracing::trace!(prefix = %prefix, grace_ms = grace.as_millis() as u64, "waiting for requests to drain");

        self.inner.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::debug!(prefix = %prefix, "shutting down, releasing before grace period ends");
                }
                _ = tokio::time::sleep(grace) => {}
            }
            if let Some(lease) = binding.lease.get() {
                tracing::debug!(prefix = %prefix, vm = %lease.descriptor().name, "releasing expired path binding");
                lease.release().await;
            }
        });
    }

    /// Runs [`sweep`](Self::sweep) every `sweep_interval` until shutdown.
    ///
    /// Called by the first [`address_for`](Self::address_for); later calls
    /// do nothing.
    pub fn spawn_sweeper(&self) {
        if self.inner.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let allocator = self.clone();
        let interval = self.inner.settings.sweep_interval;
        self.inner.tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = allocator.inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                allocator.sweep();
            }
            tracing::trace!("path binding sweeper stopped");
        });
    }

    /// Cancels the shared shutdown token, which stops the whole broker,
    /// releases every remaining binding and waits for pending grace-period
    /// releases.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let prefixes: Vec<String> = self
            .inner
            .bindings
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for prefix in prefixes {
            let Some((prefix, binding)) = self.inner.bindings.remove(&prefix) else {
                continue;
            };
            if let Some(lease) = binding.lease.get() {
                tracing::debug!(prefix = %prefix, vm = %lease.descriptor().name, "releasing path binding on shutdown");
                lease.release().await;
            }
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}
