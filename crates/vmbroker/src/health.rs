use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use vmbroker_core::{Error, HealthSettings, Result, VmDescriptor};

/// A single readiness probe against the application inside a VM.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, vm: &VmDescriptor) -> Result<()>;
}

/// Probes `GET http://{ip}:{port}/{endpoint}`; any 2xx status is healthy.
pub struct HttpHealthCheck {
    client: reqwest::Client,
    port: u16,
    endpoint: String,
}

impl HttpHealthCheck {
    pub fn new(port: u16, endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::HealthCheck(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            port,
            endpoint: endpoint.into(),
        })
    }

    pub fn url_for(&self, vm: &VmDescriptor) -> String {
        format!(
            "http://{}/{}",
            vm.socket_addr(self.port),
            self.endpoint.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, vm: &VmDescriptor) -> Result<()> {
        let url = self.url_for(vm);
        tracing::trace!(vm = %vm.name, %url, "sending health probe");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::HealthCheck(format!("GET {url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::HealthCheck(format!("GET {url} returned {status}")))
        }
    }
}

/// Retry and timeout policy wrapped around a [`HealthCheck`].
///
/// A VM is healthy as soon as one attempt succeeds within the per-attempt
/// timeout; it is unhealthy once every attempt has failed or timed out.
#[derive(Clone)]
pub struct HealthGate {
    check: Arc<dyn HealthCheck>,
    attempts: u32,
    attempt_timeout: Duration,
    retry_delay: Duration,
}

impl HealthGate {
    pub fn new(check: Arc<dyn HealthCheck>, settings: &HealthSettings) -> Self {
        Self {
            check,
            attempts: settings.attempts.max(1),
            attempt_timeout: settings.attempt_timeout,
            retry_delay: settings.retry_delay,
        }
    }

    pub async fn wait_healthy(&self, vm: &VmDescriptor) -> Result<()> {
        tracing::trace!(vm = %vm.name, id = %vm.id, ip = %vm.ip_address, "waiting for VM ready");
        let mut last_failure = String::new();

        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.attempt_timeout, self.check.check(vm)).await {
                Ok(Ok(())) => {
                    tracing::trace!(vm = %vm.name, id = %vm.id, attempt, "VM ready");
                    return Ok(());
                }
                Ok(Err(err)) => last_failure = err.to_string(),
                Err(_) => {
                    last_failure = format!("no response within {:?}", self.attempt_timeout);
                }
            }
            tracing::trace!(vm = %vm.name, attempt, reason = %last_failure, "health probe failed");

            if attempt < self.attempts && !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(Error::Unhealthy {
            name: vm.name.clone(),
            attempts: self.attempts,
            reason: last_failure,
        })
    }
}
