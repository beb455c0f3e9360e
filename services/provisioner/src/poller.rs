//! Readiness polling.
//!
//! Instances are described on a fixed interval until all of them report
//! `running` or the deadline passes. The first describe happens one
//! interval after the watch starts, and ticks that fall behind are
//! delayed rather than bunched, so the provider never sees back-to-back
//! polls.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::instance::ProvisionedInstance;
use crate::provider::{ComputeProvider, InstanceId, InstanceStatus};

/// Default delay between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default time allowed for instances to reach `running`.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval and deadline for readiness polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPoller {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

impl ReadinessPoller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Start watching `ids`. The deadline runs from `started`, so several
    /// watches over one launch share a single timeout.
    pub fn watch<'a>(
        &self,
        provider: &'a dyn ComputeProvider,
        ids: impl IntoIterator<Item = InstanceId>,
        operation: &'static str,
        started: Instant,
    ) -> ReadinessWatch<'a> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        ReadinessWatch {
            provider,
            operation,
            pending: ids.into_iter().collect(),
            ticker,
            started,
            timeout: self.timeout,
        }
    }

    /// Block until every instance is running, returning them with the
    /// addresses the provider has assigned.
    pub async fn wait_until_ready(
        &self,
        provider: &dyn ComputeProvider,
        mut instances: Vec<ProvisionedInstance>,
        started: Instant,
    ) -> Result<Vec<ProvisionedInstance>, ProvisionError> {
        info!(
            count = instances.len(),
            remaining_secs = self.timeout.saturating_sub(started.elapsed()).as_secs(),
            "Waiting for instances to reach running state"
        );

        let mut watch = self.watch(
            provider,
            instances.iter().map(|i| i.id().clone()),
            "instances to become ready",
            started,
        );

        let mut observed = BTreeMap::new();
        while !watch.is_done() {
            for status in watch.next_ready().await? {
                observed.insert(status.instance_id.clone(), status);
            }
        }

        for instance in &mut instances {
            if let Some(status) = observed.remove(instance.id()) {
                instance.status = status;
            }
        }

        info!("All instances in running state");
        Ok(instances)
    }
}

/// An in-progress readiness watch over a set of instance ids.
pub struct ReadinessWatch<'a> {
    provider: &'a dyn ComputeProvider,
    operation: &'static str,
    pending: BTreeSet<InstanceId>,
    ticker: Interval,
    started: Instant,
    timeout: Duration,
}

impl ReadinessWatch<'_> {
    /// True once every watched instance has been seen running.
    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait for the next poll and return the statuses of instances that
    /// became running in it. Returns an empty list when nothing changed.
    pub async fn next_ready(&mut self) -> Result<Vec<InstanceStatus>, ProvisionError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        self.ticker.tick().await;

        let elapsed = self.started.elapsed();
        if elapsed > self.timeout {
            return Err(ProvisionError::Timeout {
                operation: self.operation,
                elapsed,
                pending: self.pending.iter().map(ToString::to_string).collect(),
            });
        }

        let statuses = self.describe_pending().await?;
        let mut ready = Vec::new();
        for status in statuses {
            if !self.pending.contains(&status.instance_id) {
                continue;
            }
            if status.state.is_failed() {
                return Err(ProvisionError::InstanceFailed {
                    instance_id: status.instance_id.to_string(),
                    state: status.state,
                });
            }
            if status.state.is_running() {
                self.pending.remove(&status.instance_id);
                ready.push(status);
            }
        }

        debug!(
            ready = ready.len(),
            pending = self.pending.len(),
            elapsed_secs = elapsed.as_secs(),
            "Polled instance status"
        );
        Ok(ready)
    }

    async fn describe_pending(&self) -> Result<Vec<InstanceStatus>, ProvisionError> {
        let ids: Vec<InstanceId> = self.pending.iter().cloned().collect();
        let page_size = self.provider.describe_page_size().max(1);

        let mut statuses = Vec::with_capacity(ids.len());
        for page in ids.chunks(page_size) {
            statuses.extend(self.provider.describe_status(page).await?);
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mock::{MockProvider, ProviderCall};
    use crate::params::tests::request;
    use crate::params::{build_create_params, SecurityGroups};
    use crate::provider::InstanceState;

    async fn launch(provider: &MockProvider, count: u32) -> Vec<ProvisionedInstance> {
        let mut req = request("production");
        req.count = count;
        let params = build_create_params(&req, SecurityGroups::default(), String::new(), Default::default());
        let req = Arc::new(req);
        provider
            .create(&params)
            .await
            .unwrap()
            .into_iter()
            .map(|status| ProvisionedInstance::new(status, Arc::clone(&req)))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_slow_instance_in_pages() {
        let provider = MockProvider::new()
            .with_boot_polls(vec![0, 2])
            .with_page_size(1);
        let instances = launch(&provider, 2).await;

        let start = Instant::now();
        let ready = ReadinessPoller::default()
            .wait_until_ready(&provider, instances, start)
            .await
            .unwrap();

        assert_eq!(start.elapsed(), DEFAULT_POLL_INTERVAL * 3);
        assert!(ready.iter().all(|i| i.state() == InstanceState::Running));
        assert!(ready.iter().all(|i| i.public_ip_address().is_some()));

        let describes: Vec<_> = provider
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::Describe(ids) => Some(ids),
                _ => None,
            })
            .collect();
        assert!(describes.iter().all(|ids| ids.len() == 1));
        assert_eq!(describes.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_pending() {
        let provider = MockProvider::new().never_ready();
        let instances = launch(&provider, 1).await;
        let id = instances[0].id().to_string();

        let poller = ReadinessPoller::new(Duration::from_secs(5), Duration::from_secs(12));
        let err = poller
            .wait_until_ready(&provider, instances, Instant::now())
            .await
            .unwrap_err();

        match err {
            ProvisionError::Timeout { pending, elapsed, .. } => {
                assert_eq!(pending, vec![id]);
                assert_eq!(elapsed, Duration::from_secs(15));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_instance_fails_fast() {
        let provider = MockProvider::new().never_ready();
        let instances = launch(&provider, 1).await;
        provider.set_state(instances[0].id(), InstanceState::Terminated);

        let err = ReadinessPoller::default()
            .wait_until_ready(&provider, instances, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::InstanceFailed {
                state: InstanceState::Terminated,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_yields_instances_as_they_boot() {
        let provider = MockProvider::new().with_boot_polls(vec![1, 0]);
        let instances = launch(&provider, 2).await;
        let ids: Vec<_> = instances.iter().map(|i| i.id().clone()).collect();

        let poller = ReadinessPoller::default();
        let mut watch = poller.watch(&provider, ids.clone(), "test", Instant::now());

        let first = watch.next_ready().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].instance_id, ids[1]);

        let second = watch.next_ready().await.unwrap();
        assert_eq!(second[0].instance_id, ids[0]);
        assert!(watch.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_counts_time_spent_before_the_wait() {
        let provider = MockProvider::new().with_boot_polls(vec![2]);
        let instances = launch(&provider, 1).await;

        let poller = ReadinessPoller::new(Duration::from_secs(5), Duration::from_secs(20));
        let started = Instant::now();
        tokio::time::advance(Duration::from_secs(10)).await;

        let err = poller
            .wait_until_ready(&provider, instances, started)
            .await
            .unwrap_err();
        match err {
            ProvisionError::Timeout { elapsed, .. } => {
                assert_eq!(elapsed, Duration::from_secs(25));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
