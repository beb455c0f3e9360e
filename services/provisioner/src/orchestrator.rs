//! Launch orchestration.
//!
//! A launch runs strictly in order:
//!
//! 1. Build creation parameters (resolving security group names when a
//!    VPC is targeted, rendering the bootstrap payload)
//! 2. Create all instances in one call
//! 3. Tag them, if the provider could not tag at creation
//! 4. Classic-link each instance as soon as it is seen running
//! 5. Enable termination protection
//! 6. Wait for every instance to be running
//!
//! Steps 4 and 6 share one readiness deadline, counted from creation.
//!
//! Any failure after step 2 terminates everything the launch created and
//! returns the original error. Protected instances have their protection
//! lifted first. Dropping the launch future after step 2 schedules the
//! same termination on the current runtime.

use std::collections::BTreeMap;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use sprout_cascade::LaunchRequest;
use sprout_retry::{BatchExecutor, RetryPolicy, DEFAULT_CONCURRENCY};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{BootstrapRenderer, ScriptRenderer};
use crate::error::ProvisionError;
use crate::instance::ProvisionedInstance;
use crate::params::{build_create_params, launch_tags, CreateParams, SecurityGroups};
use crate::poller::{ReadinessPoller, DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT};
use crate::provider::{ComputeProvider, InstanceId, ProviderError, TerminateOutcome};

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Identity recorded in the `created_by` tag.
    pub created_by: String,

    /// Retry policy for per-instance mutations.
    pub retry_policy: RetryPolicy,

    /// Instances mutated at the same time within one batch.
    pub batch_concurrency: usize,

    pub poll_interval: Duration,
    pub ready_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            created_by: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            retry_policy: RetryPolicy::default(),
            batch_concurrency: DEFAULT_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Per-launch options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Wait for every instance to be running before returning.
    pub wait: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self { wait: true }
    }
}

/// How `kill` treats ids the provider does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillPolicy {
    /// Unknown ids are errors.
    #[default]
    Strict,

    /// Unknown ids count as already terminated.
    IgnoreNotFound,
}

/// Drives launches and kills against a compute provider.
pub struct Orchestrator {
    provider: Arc<dyn ComputeProvider>,
    renderer: Arc<dyn BootstrapRenderer>,
    executor: BatchExecutor,
    poller: ReadinessPoller,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn ComputeProvider>, settings: OrchestratorSettings) -> Self {
        Self {
            provider,
            renderer: Arc::new(ScriptRenderer::default()),
            executor: BatchExecutor::new(settings.retry_policy)
                .with_concurrency(settings.batch_concurrency),
            poller: ReadinessPoller::new(settings.poll_interval, settings.ready_timeout),
            settings,
        }
    }

    /// Replace the bootstrap renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn BootstrapRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn provider(&self) -> &Arc<dyn ComputeProvider> {
        &self.provider
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Launch `request.count` instances.
    pub async fn launch(
        &self,
        request: LaunchRequest,
        options: LaunchOptions,
    ) -> Result<Vec<ProvisionedInstance>, ProvisionError> {
        let request = Arc::new(request);
        let tags = launch_tags(&request, &self.settings.created_by);
        let params = self.build_params(&request, &tags).await?;

        info!(
            role = %request.chef_role,
            environment = %request.chef_environment,
            count = params.count,
            instance_type = %params.instance_type,
            image_id = %params.image_id,
            "Launching instances"
        );

        let created = self.provider.create(&params).await?;
        let started = Instant::now();
        if created.is_empty() {
            return Err(ProvisionError::NothingCreated);
        }

        let instances: Vec<ProvisionedInstance> = created
            .into_iter()
            .map(|status| ProvisionedInstance::new(status, Arc::clone(&request)))
            .collect();
        let ids: Vec<InstanceId> = instances.iter().map(|i| i.id().clone()).collect();
        for id in &ids {
            info!(instance_id = %id, "Launched instance");
        }

        let protected = request.termination_protection;
        let mut guard = RollbackGuard::new(Arc::clone(&self.provider), ids.clone(), protected);
        let result = self
            .configure(&request, instances, &tags, options, started)
            .await;
        guard.disarm();

        match result {
            Ok(instances) => Ok(instances),
            Err(error) => {
                warn!(
                    error = %error,
                    count = ids.len(),
                    "Launch failed, terminating created instances"
                );
                if let Err(rollback) = roll_back(self.provider.as_ref(), &ids, protected).await {
                    error!(error = %rollback, "Rollback failed, instances may be orphaned");
                }
                Err(error)
            }
        }
    }

    /// Terminate instances by id. Returns the ids that were terminated.
    pub async fn kill(
        &self,
        ids: &[InstanceId],
        policy: KillPolicy,
    ) -> Result<Vec<InstanceId>, ProvisionError> {
        terminate_all(self.provider.as_ref(), ids, policy).await
    }

    async fn build_params(
        &self,
        request: &LaunchRequest,
        tags: &BTreeMap<String, String>,
    ) -> Result<CreateParams, ProvisionError> {
        let mut groups = SecurityGroups::split(&request.security_groups);

        if let Some(vpc_id) = &request.vpc_id {
            if !groups.names.is_empty() {
                let resolved = self
                    .provider
                    .describe_security_groups(vpc_id, &groups.names)
                    .await?;

                let unknown: Vec<String> = groups
                    .names
                    .iter()
                    .filter(|name| !resolved.contains_key(*name))
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    return Err(ProvisionError::UnknownSecurityGroups {
                        vpc_id: vpc_id.clone(),
                        names: unknown,
                    });
                }

                debug!(vpc_id = %vpc_id, groups = ?resolved, "Resolved security group names");
                groups
                    .ids
                    .extend(groups.names.drain(..).filter_map(|name| resolved.get(&name).cloned()));
            }
        }

        let user_data = match &request.user_data {
            Some(user_data) => user_data.clone(),
            None => self.renderer.render(request)?,
        };

        let creation_tags = if self.provider.supports_creation_tags() {
            tags.clone()
        } else {
            BTreeMap::new()
        };

        Ok(build_create_params(request, groups, user_data, creation_tags))
    }

    async fn configure(
        &self,
        request: &LaunchRequest,
        mut instances: Vec<ProvisionedInstance>,
        tags: &BTreeMap<String, String>,
        options: LaunchOptions,
        started: Instant,
    ) -> Result<Vec<ProvisionedInstance>, ProvisionError> {
        let provider = self.provider.as_ref();
        let ids: Vec<InstanceId> = instances.iter().map(|i| i.id().clone()).collect();

        if !provider.supports_creation_tags() {
            info!(count = ids.len(), "Tagging instances");
            self.executor
                .run_batch_operation("tag", &ids, |id| {
                    let id = id.clone();
                    async move { provider.tag(&id, tags).await }
                })
                .await?;
        }

        if let (Some(link), None) = (&request.classic_link, &request.vpc_subnet_id) {
            let vpc_id = link.vpc_id.as_str();
            let groups = link.security_group_ids.as_slice();
            let mut watch = self.poller.watch(
                provider,
                ids.clone(),
                "instances to classic link",
                started,
            );

            while !watch.is_done() {
                let ready = watch.next_ready().await?;
                if ready.is_empty() {
                    continue;
                }

                let ready_ids: Vec<InstanceId> =
                    ready.iter().map(|s| s.instance_id.clone()).collect();
                self.executor
                    .run_batch_operation("classic_link", &ready_ids, |id| {
                        let id = id.clone();
                        async move { provider.link(&id, vpc_id, groups).await }
                    })
                    .await?;

                for status in ready {
                    info!(instance_id = %status.instance_id, vpc_id, "Classic linked instance");
                    if let Some(instance) =
                        instances.iter_mut().find(|i| i.id() == &status.instance_id)
                    {
                        instance.status = status;
                    }
                }
            }
        }

        if request.termination_protection {
            info!(count = ids.len(), "Enabling termination protection");
            self.executor
                .run_batch_operation("termination_protection", &ids, |id| {
                    let id = id.clone();
                    async move { provider.set_termination_protection(&id, true).await }
                })
                .await?;
        }

        if options.wait {
            instances = self
                .poller
                .wait_until_ready(provider, instances, started)
                .await?;
        }

        Ok(instances)
    }
}

/// Best-effort teardown of a failed launch.
async fn roll_back(
    provider: &dyn ComputeProvider,
    ids: &[InstanceId],
    protected: bool,
) -> Result<Vec<InstanceId>, ProvisionError> {
    if protected {
        release_protection(provider, ids).await;
    }
    terminate_all(provider, ids, KillPolicy::IgnoreNotFound).await
}

/// Protected instances refuse termination, so lift it first. Failures are
/// logged; the terminate that follows reports what is left.
async fn release_protection(provider: &dyn ComputeProvider, ids: &[InstanceId]) {
    for id in ids {
        match provider.set_termination_protection(id, false).await {
            Ok(()) => debug!(instance_id = %id, "Disabled termination protection"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(instance_id = %id, error = %e, "Failed to disable termination protection");
            }
        }
    }
}

async fn terminate_all(
    provider: &dyn ComputeProvider,
    ids: &[InstanceId],
    policy: KillPolicy,
) -> Result<Vec<InstanceId>, ProvisionError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    info!(count = ids.len(), "Terminating instances");

    let outcomes = match provider.terminate(ids).await {
        Ok(outcomes) => outcomes,
        // A single unknown id can fail the whole call; retry one by one so
        // the known ids still go away.
        Err(e) if e.is_not_found() && policy == KillPolicy::IgnoreNotFound && ids.len() > 1 => {
            debug!(error = %e, "Batch terminate hit an unknown id, retrying per instance");
            let mut outcomes = Vec::with_capacity(ids.len());
            for id in ids {
                match provider.terminate(slice::from_ref(id)).await {
                    Ok(mut single) => outcomes.append(&mut single),
                    Err(error) => outcomes.push(TerminateOutcome {
                        instance_id: id.clone(),
                        result: Err(error),
                    }),
                }
            }
            outcomes
        }
        Err(e) if e.is_not_found() && policy == KillPolicy::IgnoreNotFound => {
            debug!(error = %e, "Instance already gone");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut terminated = Vec::new();
    let mut errors: BTreeMap<String, ProviderError> = BTreeMap::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(()) => {
                info!(instance_id = %outcome.instance_id, "Terminated instance");
                terminated.push(outcome.instance_id);
            }
            Err(e) if e.is_not_found() && policy == KillPolicy::IgnoreNotFound => {
                debug!(instance_id = %outcome.instance_id, "Instance already gone");
            }
            Err(e) => {
                warn!(instance_id = %outcome.instance_id, error = %e, "Failed to terminate instance");
                errors.insert(outcome.instance_id.to_string(), e);
            }
        }
    }

    if errors.is_empty() {
        Ok(terminated)
    } else {
        Err(ProvisionError::TerminationFailed { errors })
    }
}

/// Terminates a launch's instances if the launch future is dropped before
/// it finishes configuring them.
struct RollbackGuard {
    provider: Arc<dyn ComputeProvider>,
    ids: Vec<InstanceId>,
    protected: bool,
    armed: bool,
}

impl RollbackGuard {
    fn new(provider: Arc<dyn ComputeProvider>, ids: Vec<InstanceId>, protected: bool) -> Self {
        Self {
            provider,
            ids,
            protected,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let ids = std::mem::take(&mut self.ids);
        let Ok(handle) = Handle::try_current() else {
            error!(count = ids.len(), "Launch cancelled outside a runtime, instances orphaned");
            return;
        };

        warn!(count = ids.len(), "Launch cancelled, terminating created instances");
        let provider = Arc::clone(&self.provider);
        let protected = self.protected;
        handle.spawn(async move {
            if let Err(e) = roll_back(provider.as_ref(), &ids, protected).await {
                error!(error = %e, "Rollback after cancellation failed");
            }
        });
    }
}
