use crate::pool::AvailablePool;
use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use tokio::time::Instant;
use vmbroker_core::Error;

/// One lease per request, released on every exit path.
#[derive(Clone)]
pub struct PerRequestAllocator {
    pool: AvailablePool,
}

impl PerRequestAllocator {
    pub fn new(pool: AvailablePool) -> Self {
        Self { pool }
    }

    /// Leases a VM, hands its address to `forward` and releases the lease
    /// once `forward` completes.
    ///
    /// Suspends until a VM is available. If the returned future is dropped
    /// while forwarding, the lease is released in the background.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolShutdown`] (converted into `E`) if the broker is
    /// shutting down, otherwise whatever `forward` returns.
    pub async fn serve<F, Fut, T, E>(&self, forward: F) -> Result<T, E>
    where
        F: FnOnce(SocketAddr) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error> + Display,
    {
        let started = Instant::now();
        let lease = self.pool.acquire().await?;
        let address = lease.address();

        let result = forward(address).await;
        lease.release().await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::trace!(%address, elapsed_ms, "request completed"),
            Err(err) => {
                tracing::error!(%address, elapsed_ms, error = %err, "error forwarding request")
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecycleChannel;
    use crate::health::HealthGate;
    use crate::test_utils::{ScriptedHealthCheck, descriptor, fleet};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use vmbroker_core::HealthSettings;

    fn allocator(size: usize) -> (PerRequestAllocator, AvailablePool, Arc<RecycleChannel>) {
        let channel = Arc::new(RecycleChannel::new(8));
        let pool = AvailablePool::new(
            fleet(size),
            Arc::clone(&channel),
            HealthGate::new(
                Arc::new(ScriptedHealthCheck::healthy()),
                &HealthSettings::default(),
            ),
            3000,
            CancellationToken::new(),
        );
        (PerRequestAllocator::new(pool.clone()), pool, channel)
    }

    #[tokio::test]
    async fn forwards_to_leased_vm_and_releases() {
        let (allocator, pool, channel) = allocator(1);

        let address = allocator
            .serve(|address| async move { Ok::<_, Error>(address) })
            .await
            .unwrap();

        assert_eq!(address, descriptor(0).socket_addr(3000));
        assert_eq!(channel.try_read(), Some(descriptor(0)));
        assert_eq!(pool.stats().await.leased, 0);
    }

    #[tokio::test]
    async fn releases_when_forwarding_fails() {
        let (allocator, pool, channel) = allocator(1);

        let err = allocator
            .serve(|_| async { Err::<(), _>(Error::HealthCheck("connection reset".to_string())) })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::HealthCheck(_)));
        assert_eq!(channel.count(), 1);
        assert_eq!(pool.stats().await.leased, 0);
    }

    #[tokio::test]
    async fn releases_when_request_is_abandoned() {
        let (allocator, pool, channel) = allocator(1);

        let request = allocator.serve(|_| async {
            std::future::pending::<()>().await;
            Ok::<_, Error>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), request).await;
        assert!(timed_out.is_err());

        let vm = tokio::time::timeout(Duration::from_secs(1), channel.read(&CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(vm, Some(descriptor(0)));
        assert_eq!(pool.stats().await.leased, 0);
    }

    #[tokio::test]
    async fn concurrent_requests_use_distinct_vms() {
        let (allocator, _pool, _channel) = allocator(2);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let allocator = allocator.clone();
            tokio::spawn(async move {
                allocator
                    .serve(|address| async move {
                        let _ = rx.await;
                        Ok::<_, Error>(address)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = allocator
            .serve(|address| async move { Ok::<_, Error>(address) })
            .await
            .unwrap();
        tx.send(()).unwrap();
        let first = first.await.unwrap().unwrap();

        assert_ne!(first, second);
    }
}
