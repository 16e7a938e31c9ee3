use crate::channel::RecycleChannel;
use crate::control::CommandControl;
use crate::health::{HealthCheck, HealthGate, HttpHealthCheck};
use crate::policy::{PerPathAllocator, PerRequestAllocator};
use crate::pool::{AvailablePool, PoolStats};
use crate::recycler::VmRecycler;
use crate::workers::RecycleWorkers;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vmbroker_core::{BrokerConfig, HypervisorControl, Result};

/// Builder for a running [`Broker`].
///
/// Created with [`Broker::builder`]. Hypervisor control and health probing
/// default to [`CommandControl`] and [`HttpHealthCheck`] built from the
/// configuration.
pub struct BrokerBuilder {
    config: BrokerConfig,
    hypervisor: Option<Arc<dyn HypervisorControl>>,
    health_check: Option<Arc<dyn HealthCheck>>,
    shutdown: Option<CancellationToken>,
}

impl BrokerBuilder {
    /// Uses `hypervisor` instead of the configured command line tool.
    pub fn hypervisor(mut self, hypervisor: Arc<dyn HypervisorControl>) -> Self {
        self.hypervisor = Some(hypervisor);
        self
    }

    /// Uses `check` instead of the HTTP probe.
    pub fn health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_check = Some(check);
        self
    }

    /// Ties the broker to an existing shutdown token.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Validates the configuration, seeds the pool and starts the recycle
    /// workers. The path binding sweeper starts with the first per-path
    /// request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) listing
    /// every configuration problem, or an error building the HTTP client.
    pub async fn start(self) -> Result<Broker> {
        let fleet = self.config.validate()?;
        let settings = &self.config;

        let health_check: Arc<dyn HealthCheck> = match self.health_check {
            Some(check) => check,
            None => Arc::new(HttpHealthCheck::new(
                settings.application_port,
                settings.health_endpoint.clone(),
            )?),
        };
        let hypervisor: Arc<dyn HypervisorControl> = match self.hypervisor {
            Some(hypervisor) => hypervisor,
            None => Arc::new(CommandControl::new(&settings.hypervisor)),
        };
        let shutdown = self.shutdown.unwrap_or_default();

        tracing::info!(
            vms = fleet.len(),
            hypervisor = hypervisor.name(),
            port = settings.application_port,
            "starting VM broker"
        );

        let channel = Arc::new(RecycleChannel::new(settings.recycle.channel_capacity));
        let pool = AvailablePool::new(
            fleet,
            Arc::clone(&channel),
            HealthGate::new(health_check, &settings.health),
            settings.application_port,
            shutdown.clone(),
        );
        let recycler = Arc::new(VmRecycler::new(
            hypervisor,
            pool.clone(),
            settings.recycle.failure_policy(),
        ));
        let workers = RecycleWorkers::spawn(
            Arc::clone(&channel),
            recycler,
            &settings.recycle,
            shutdown.clone(),
        );

        let per_path = PerPathAllocator::new(pool.clone(), settings.sticky.clone(), shutdown.clone());

        Ok(Broker {
            per_request: PerRequestAllocator::new(pool.clone()),
            per_path,
            pool,
            channel,
            workers,
            shutdown,
        })
    }
}

/// A running VM broker: the available pool, the recycle pipeline behind it
/// and both allocation policies.
///
/// # Example
///
/// ```no_run
/// use vmbroker::{Broker, BrokerConfig};
///
/// # async fn example() -> vmbroker::Result<()> {
/// let config = BrokerConfig::load("broker.toml")?;
/// let broker = Broker::builder(config).start().await?;
///
/// let lease = broker.pool().acquire().await?;
/// println!("forwarding to {}", lease.address());
/// lease.release().await;
///
/// broker.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Broker {
    pool: AvailablePool,
    channel: Arc<RecycleChannel>,
    workers: RecycleWorkers,
    per_request: PerRequestAllocator,
    per_path: PerPathAllocator,
    shutdown: CancellationToken,
}

impl Broker {
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder {
            config,
            hypervisor: None,
            health_check: None,
            shutdown: None,
        }
    }

    pub fn pool(&self) -> &AvailablePool {
        &self.pool
    }

    pub fn per_request(&self) -> &PerRequestAllocator {
        &self.per_request
    }

    pub fn per_path(&self) -> &PerPathAllocator {
        &self.per_path
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub fn worker_count(&self) -> usize {
        self.workers.worker_count()
    }

    /// Number of VMs waiting to be recycled.
    pub fn recycle_backlog(&self) -> usize {
        self.channel.count()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops accepting acquires, releases every path binding and waits for
    /// the recycle workers to finish their in-flight VMs.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down VM broker");
        self.shutdown.cancel();
        self.per_path.shutdown().await;
        self.workers.join().await;
        tracing::debug!("VM broker stopped");
    }
}
