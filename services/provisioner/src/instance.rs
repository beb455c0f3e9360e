//! Provisioned instance handles.

use std::sync::Arc;

use serde::Serialize;
use sprout_cascade::LaunchRequest;

use crate::provider::{InstanceId, InstanceState, InstanceStatus};

/// One compute resource created by a launch.
///
/// The status is replaced as polling observes new provider state; the
/// request is shared by every instance from the same launch.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedInstance {
    #[serde(flatten)]
    pub status: InstanceStatus,

    #[serde(skip)]
    pub request: Arc<LaunchRequest>,
}

impl ProvisionedInstance {
    pub fn new(status: InstanceStatus, request: Arc<LaunchRequest>) -> Self {
        Self { status, request }
    }

    pub fn id(&self) -> &InstanceId {
        &self.status.instance_id
    }

    pub fn state(&self) -> InstanceState {
        self.status.state
    }

    pub fn public_ip_address(&self) -> Option<&str> {
        self.status.public_ip_address.as_deref()
    }

    pub fn private_ip_address(&self) -> Option<&str> {
        self.status.private_ip_address.as_deref()
    }
}
