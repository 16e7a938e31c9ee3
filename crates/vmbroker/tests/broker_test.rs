//! Broker integration tests.
//!
//! These drive a full broker (pool, recycle channel, workers and policies)
//! against scripted hypervisor and health collaborators.

use std::sync::Arc;
use std::time::Duration;
use vmbroker::test_utils::{ScriptedHealthCheck, ScriptedHypervisor, config, descriptor};
use vmbroker::{Broker, BrokerConfig, Error};

async fn start_broker(
    config: BrokerConfig,
    hypervisor: Arc<ScriptedHypervisor>,
    health: Arc<ScriptedHealthCheck>,
) -> Broker {
    Broker::builder(config)
        .hypervisor(hypervisor)
        .health_check(health)
        .start()
        .await
        .expect("Failed to start broker")
}

fn with_workers(mut config: BrokerConfig, initial: usize, max: usize) -> BrokerConfig {
    config.recycle.initial_workers = initial;
    config.recycle.max_workers = max;
    config
}

#[tokio::test(start_paused = true)]
async fn test_second_acquire_waits_for_recycled_vm() {
    let hypervisor = Arc::new(ScriptedHypervisor::new());
    let broker = start_broker(
        with_workers(config(1), 1, 1),
        hypervisor.clone(),
        Arc::new(ScriptedHealthCheck::healthy()),
    )
    .await;

    let first = broker.pool().acquire().await.expect("Failed to acquire VM");
    let waiter = {
        let pool = broker.pool().clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!waiter.is_finished());
    assert_eq!(hypervisor.reset_count(descriptor(0).id), 0);

    first.release().await;
    let second = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("Second acquire did not complete")
        .unwrap()
        .expect("Failed to acquire recycled VM");

    assert_eq!(second.id(), descriptor(0).id);
    assert_eq!(hypervisor.reset_count(descriptor(0).id), 1);

    drop(second);
    broker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_vm_never_returns_to_pool() {
    let health = Arc::new(ScriptedHealthCheck::unhealthy());
    let broker = start_broker(
        with_workers(config(1), 1, 1),
        Arc::new(ScriptedHypervisor::new()),
        health.clone(),
    )
    .await;

    let lease = broker.pool().acquire().await.expect("Failed to acquire VM");
    lease.release().await;

    let attempt = tokio::time::timeout(Duration::from_secs(300), broker.pool().acquire()).await;
    assert!(attempt.is_err(), "unhealthy VM was leased again");
    assert_eq!(health.attempts(), 10);

    let stats = broker.stats().await;
    assert_eq!(stats.available, 0);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.accounted(), stats.total);

    broker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_full_recycle_channel_blocks_release() {
    let hypervisor = Arc::new(ScriptedHypervisor::paused());
    let mut config = with_workers(config(3), 1, 1);
    config.recycle.channel_capacity = 1;
    let broker = start_broker(
        config,
        hypervisor.clone(),
        Arc::new(ScriptedHealthCheck::healthy()),
    )
    .await;

    let a = broker.pool().acquire().await.expect("Failed to acquire VM");
    let b = broker.pool().acquire().await.expect("Failed to acquire VM");
    let c = broker.pool().acquire().await.expect("Failed to acquire VM");

    // The only worker takes `a` and stalls in its reset; `b` fills the channel.
    a.release().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    b.release().await;
    assert_eq!(broker.recycle_backlog(), 1);

    let blocked = tokio::spawn(async move {
        c.release().await;
    });
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!blocked.is_finished(), "release did not wait for room");

    hypervisor.resume(1);
    tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("Release stayed blocked after the recycler drained")
        .unwrap();
    assert_eq!(broker.recycle_backlog(), 1);

    hypervisor.resume(2);
    broker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sticky_path_reuses_lease_until_idle() {
    let hypervisor = Arc::new(ScriptedHypervisor::new());
    let broker = start_broker(
        with_workers(config(2), 1, 1),
        hypervisor.clone(),
        Arc::new(ScriptedHealthCheck::healthy()),
    )
    .await;
    let per_path = broker.per_path();

    let first = per_path.address_for("foo").await.expect("Failed to bind /foo");

    tokio::time::sleep(Duration::from_secs(80)).await;
    let reused = per_path.address_for("foo").await.expect("Failed to reuse /foo");
    assert_eq!(reused, first);
    assert_eq!(hypervisor.reset_count(descriptor(0).id), 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    let replaced = per_path.address_for("foo").await.expect("Failed to rebind /foo");
    assert_ne!(replaced, first);
    assert_eq!(hypervisor.reset_count(descriptor(0).id), 1);
    assert_eq!(hypervisor.reset_count(descriptor(1).id), 0);

    let stats = broker.stats().await;
    assert_eq!(stats.leased, 1);
    assert_eq!(stats.available, 1);

    broker.shutdown().await;
    assert_eq!(hypervisor.reset_count(descriptor(0).id), 1);
}

#[tokio::test]
async fn test_empty_fleet_fails_startup() {
    let result = Broker::builder(BrokerConfig::default())
        .hypervisor(Arc::new(ScriptedHypervisor::new()))
        .health_check(Arc::new(ScriptedHealthCheck::healthy()))
        .start()
        .await;

    match result {
        Err(Error::InvalidConfig(err)) => {
            assert_eq!(err.violations(), ["No virtual machines configured."]);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("broker started without any VMs"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_backlog_above_threshold_adds_one_worker_per_poll() {
    let hypervisor = Arc::new(ScriptedHypervisor::paused());
    let mut config = with_workers(config(4), 1, 3);
    config.recycle.queue_depth_threshold = 2;
    config.recycle.scale_interval = Duration::from_secs(10);
    let broker = start_broker(
        config,
        hypervisor.clone(),
        Arc::new(ScriptedHealthCheck::healthy()),
    )
    .await;

    let mut leases = Vec::new();
    for _ in 0..4 {
        leases.push(broker.pool().acquire().await.expect("Failed to acquire VM"));
    }
    for lease in leases {
        lease.release().await;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.recycle_backlog(), 3);
    assert_eq!(broker.worker_count(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.worker_count(), 2);

    hypervisor.resume(4);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.stats().await.available, 4);

    broker.shutdown().await;
    assert_eq!(broker.worker_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_conserve_fleet() {
    let broker = Arc::new(
        start_broker(
            with_workers(config(3), 2, 4),
            Arc::new(ScriptedHypervisor::new()),
            Arc::new(ScriptedHealthCheck::healthy()),
        )
        .await,
    );

    let mut requests = Vec::new();
    for n in 0..24u64 {
        let broker = Arc::clone(&broker);
        requests.push(tokio::spawn(async move {
            broker
                .per_request()
                .serve(|address| async move {
                    tokio::time::sleep(Duration::from_millis(10 * (n % 4 + 1))).await;
                    Ok::<_, Error>(address)
                })
                .await
        }));
    }

    for request in requests {
        request.await.unwrap().expect("Request failed");
        let stats = broker.stats().await;
        assert_eq!(stats.accounted(), stats.total);
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stats = broker.stats().await;
    assert_eq!(stats.available, 3);
    assert_eq!(stats.dropped, 0);

    broker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_wakes_waiting_requests() {
    let broker = start_broker(
        with_workers(config(1), 1, 1),
        Arc::new(ScriptedHypervisor::new()),
        Arc::new(ScriptedHealthCheck::healthy()),
    )
    .await;

    let _held = broker.pool().acquire().await.expect("Failed to acquire VM");
    let waiter = {
        let pool = broker.pool().clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    broker.shutdown().await;

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::PoolShutdown)));
}
