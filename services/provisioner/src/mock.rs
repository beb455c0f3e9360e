//! In-memory compute provider.
//!
//! Used by tests and by dry-run launches. Instances boot after a
//! configurable number of describe polls, every call is recorded, and
//! individual operations can be made to fail a fixed number of times.
//! Instances with termination protection refuse to terminate.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use crate::params::CreateParams;
use crate::provider::{
    ComputeProvider, InstanceId, InstanceState, InstanceStatus, ProviderError, TerminateOutcome,
    DEFAULT_DESCRIBE_PAGE_SIZE,
};

/// Provider operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MockOperation {
    Create,
    Terminate,
    Describe,
    DescribeSecurityGroups,
    Tag,
    Link,
    TerminationProtection,
}

/// How an injected failure surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InjectedFailure {
    Unavailable,
    NotFound,
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    Create { count: u32 },
    Terminate(Vec<InstanceId>),
    Describe(Vec<InstanceId>),
    DescribeSecurityGroups { vpc_id: String, names: Vec<String> },
    Tag(InstanceId),
    Link { instance_id: InstanceId, vpc_id: String },
    TerminationProtection { instance_id: InstanceId, enabled: bool },
}

#[derive(Debug)]
struct MockInstance {
    status: InstanceStatus,
    polls_until_running: u32,
    tags: BTreeMap<String, String>,
    termination_protection: bool,
    linked_to: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u32,
    instances: BTreeMap<InstanceId, MockInstance>,
    boot_polls: VecDeque<u32>,
    failures: BTreeMap<MockOperation, (InjectedFailure, u32)>,
    security_groups: BTreeMap<String, String>,
    calls: Vec<ProviderCall>,
    last_create: Option<CreateParams>,
}

/// Mock compute provider for testing.
#[derive(Debug)]
pub struct MockProvider {
    state: Mutex<MockState>,
    creation_tags: bool,
    page_size: usize,
    never_ready: bool,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            creation_tags: true,
            page_size: DEFAULT_DESCRIBE_PAGE_SIZE,
            never_ready: false,
        }
    }

    /// Number of describe polls each created instance stays pending for,
    /// in creation order. Instances beyond the list boot on the first poll.
    pub fn with_boot_polls(self, polls: Vec<u32>) -> Self {
        self.lock().boot_polls = polls.into();
        self
    }

    /// Report that tags cannot be attached at creation time.
    pub fn without_creation_tags(mut self) -> Self {
        self.creation_tags = false;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_security_group(self, name: &str, id: &str) -> Self {
        self.lock()
            .security_groups
            .insert(name.to_string(), id.to_string());
        self
    }

    /// Fail the next `times` calls of `operation` with a transient error.
    pub fn fail_times(self, operation: MockOperation, times: u32) -> Self {
        self.lock()
            .failures
            .insert(operation, (InjectedFailure::Unavailable, times));
        self
    }

    /// Fail the next `times` calls of `operation` as a whole with
    /// `NotFound`, the way a real provider rejects a call naming one
    /// unknown id.
    pub fn fail_not_found(self, operation: MockOperation, times: u32) -> Self {
        self.lock()
            .failures
            .insert(operation, (InjectedFailure::NotFound, times));
        self
    }

    /// Keep every instance pending forever.
    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    /// Forget an instance, as if it was terminated out of band.
    pub fn vanish(&self, id: &InstanceId) {
        self.lock().instances.remove(id);
    }

    /// Move an instance to `state`.
    pub fn set_state(&self, id: &InstanceId, state: InstanceState) {
        if let Some(instance) = self.lock().instances.get_mut(id) {
            instance.status.state = state;
        }
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Number of terminate calls that included `id`.
    pub fn terminate_calls_for(&self, id: &InstanceId) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, ProviderCall::Terminate(ids) if ids.contains(id)))
            .count()
    }

    /// Parameters of the most recent create call.
    pub fn last_create(&self) -> Option<CreateParams> {
        self.lock().last_create.clone()
    }

    pub fn tags_for(&self, id: &InstanceId) -> BTreeMap<String, String> {
        self.lock()
            .instances
            .get(id)
            .map(|instance| instance.tags.clone())
            .unwrap_or_default()
    }

    /// Current state of an instance, `None` once it is forgotten.
    pub fn state_of(&self, id: &InstanceId) -> Option<InstanceState> {
        self.lock()
            .instances
            .get(id)
            .map(|instance| instance.status.state)
    }

    pub fn is_protected(&self, id: &InstanceId) -> bool {
        self.lock()
            .instances
            .get(id)
            .is_some_and(|instance| instance.termination_protection)
    }

    pub fn linked_vpc(&self, id: &InstanceId) -> Option<String> {
        self.lock()
            .instances
            .get(id)
            .and_then(|instance| instance.linked_to.clone())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MockState {
    fn record(&mut self, operation: MockOperation, call: ProviderCall) -> Result<(), ProviderError> {
        self.calls.push(call);
        match self.failures.get_mut(&operation) {
            Some((kind, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(match kind {
                    InjectedFailure::Unavailable => ProviderError::api(
                        503,
                        "ServiceUnavailable",
                        format!("injected {:?} failure", operation),
                    ),
                    InjectedFailure::NotFound => {
                        ProviderError::NotFound(format!("injected {:?} failure", operation))
                    }
                })
            }
            _ => Ok(()),
        }
    }

    fn instance_mut(&mut self, id: &InstanceId) -> Result<&mut MockInstance, ProviderError> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl ComputeProvider for MockProvider {
    async fn create(&self, params: &CreateParams) -> Result<Vec<InstanceStatus>, ProviderError> {
        let mut state = self.lock();
        state.record(MockOperation::Create, ProviderCall::Create { count: params.count })?;
        state.last_create = Some(params.clone());

        let mut created = Vec::with_capacity(params.count as usize);
        for _ in 0..params.count {
            state.next_id += 1;
            let n = state.next_id;
            let status = InstanceStatus {
                instance_id: InstanceId::new(format!("i-{:08x}", n)),
                state: InstanceState::Pending,
                public_ip_address: None,
                private_ip_address: Some(format!("10.0.{}.{}", n / 256, n % 256)),
                public_dns_name: None,
                launch_time: Some(Utc::now()),
            };
            let polls_until_running = state.boot_polls.pop_front().unwrap_or(0);
            state.instances.insert(
                status.instance_id.clone(),
                MockInstance {
                    status: status.clone(),
                    polls_until_running,
                    tags: params.tags.clone(),
                    termination_protection: false,
                    linked_to: None,
                },
            );
            created.push(status);
        }
        Ok(created)
    }

    async fn terminate(&self, ids: &[InstanceId]) -> Result<Vec<TerminateOutcome>, ProviderError> {
        let mut state = self.lock();
        state.record(MockOperation::Terminate, ProviderCall::Terminate(ids.to_vec()))?;

        let outcomes = ids
            .iter()
            .map(|id| {
                let result = state.instance_mut(id).and_then(|instance| {
                    if instance.termination_protection {
                        return Err(ProviderError::api(
                            400,
                            "OperationNotPermitted",
                            format!("{} has termination protection enabled", id),
                        ));
                    }
                    instance.status.state = InstanceState::Terminated;
                    Ok(())
                });
                TerminateOutcome {
                    instance_id: id.clone(),
                    result,
                }
            })
            .collect();
        Ok(outcomes)
    }

    async fn describe_status(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<InstanceStatus>, ProviderError> {
        if ids.len() > self.page_size {
            return Err(ProviderError::api(
                400,
                "InvalidParameterValue",
                format!("at most {} ids per call", self.page_size),
            ));
        }

        let mut state = self.lock();
        state.record(MockOperation::Describe, ProviderCall::Describe(ids.to_vec()))?;

        let mut statuses = Vec::new();
        for id in ids {
            let Some(instance) = state.instances.get_mut(id) else {
                continue;
            };
            if instance.status.state == InstanceState::Pending && !self.never_ready {
                if instance.polls_until_running == 0 {
                    let octet = instance.status.private_ip_address.as_deref().map_or(1, |ip| {
                        ip.rsplit('.').next().and_then(|s| s.parse().ok()).unwrap_or(1u8)
                    });
                    instance.status.state = InstanceState::Running;
                    instance.status.public_ip_address = Some(format!("203.0.113.{}", octet));
                } else {
                    instance.polls_until_running -= 1;
                }
            }
            statuses.push(instance.status.clone());
        }
        Ok(statuses)
    }

    async fn describe_security_groups(
        &self,
        vpc_id: &str,
        names: &[String],
    ) -> Result<BTreeMap<String, String>, ProviderError> {
        let mut state = self.lock();
        state.record(
            MockOperation::DescribeSecurityGroups,
            ProviderCall::DescribeSecurityGroups {
                vpc_id: vpc_id.to_string(),
                names: names.to_vec(),
            },
        )?;

        Ok(names
            .iter()
            .filter_map(|name| {
                state
                    .security_groups
                    .get(name)
                    .map(|id| (name.clone(), id.clone()))
            })
            .collect())
    }

    async fn tag(
        &self,
        id: &InstanceId,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.record(MockOperation::Tag, ProviderCall::Tag(id.clone()))?;
        state.instance_mut(id)?.tags.extend(tags.clone());
        Ok(())
    }

    async fn link(
        &self,
        id: &InstanceId,
        vpc_id: &str,
        _groups: &[String],
    ) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.record(
            MockOperation::Link,
            ProviderCall::Link {
                instance_id: id.clone(),
                vpc_id: vpc_id.to_string(),
            },
        )?;

        let instance = state.instance_mut(id)?;
        if !instance.status.state.is_running() {
            return Err(ProviderError::api(
                400,
                "IncorrectState",
                format!("{} is not running", id),
            ));
        }
        instance.linked_to = Some(vpc_id.to_string());
        Ok(())
    }

    async fn set_termination_protection(
        &self,
        id: &InstanceId,
        enabled: bool,
    ) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.record(
            MockOperation::TerminationProtection,
            ProviderCall::TerminationProtection {
                instance_id: id.clone(),
                enabled,
            },
        )?;
        state.instance_mut(id)?.termination_protection = enabled;
        Ok(())
    }

    fn supports_creation_tags(&self) -> bool {
        self.creation_tags
    }

    fn describe_page_size(&self) -> usize {
        self.page_size
    }
}
