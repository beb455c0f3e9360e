//! Compute provider interface.
//!
//! The provider interface abstracts the remote compute API:
//! - Creating and terminating instances
//! - Describing instance status (paged)
//! - Per-instance mutations (tags, classic link, termination protection)
//!
//! An HTTP implementation talks to a compute endpoint; an in-memory mock is
//! provided for testing and dry runs.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::CreateParams;

/// Default number of ids a single describe call may carry.
pub const DEFAULT_DESCRIBE_PAGE_SIZE: usize = 100;

/// Provider-assigned instance id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Provider-observed lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Error,
}

impl InstanceState {
    /// Returns true once the instance has finished booting.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true for states an instance never recovers from.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated | Self::Error)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Status of one instance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub state: InstanceState,
    #[serde(default)]
    pub public_ip_address: Option<String>,
    #[serde(default)]
    pub private_ip_address: Option<String>,
    #[serde(default)]
    pub public_dns_name: Option<String>,
    #[serde(default)]
    pub launch_time: Option<DateTime<Utc>>,
}

/// Result of terminating one instance.
#[derive(Debug)]
pub struct TerminateOutcome {
    pub instance_id: InstanceId,
    pub result: Result<(), ProviderError>,
}

/// Errors returned by a compute provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The instance id is unknown to the provider.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// The provider rejected the request.
    #[error("provider error {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The request never reached the provider.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The provider answered with something unexpected.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Create an API error from response details.
    pub fn api(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Compute provider interface.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Create instances in a single call.
    async fn create(&self, params: &CreateParams) -> Result<Vec<InstanceStatus>, ProviderError>;

    /// Terminate instances, reporting per-id success or failure.
    async fn terminate(&self, ids: &[InstanceId]) -> Result<Vec<TerminateOutcome>, ProviderError>;

    /// Describe up to [`describe_page_size`](Self::describe_page_size)
    /// instances. Ids the provider does not know yet may be omitted.
    async fn describe_status(&self, ids: &[InstanceId])
        -> Result<Vec<InstanceStatus>, ProviderError>;

    /// Map security group names to ids within a VPC. Unknown names are
    /// omitted from the result.
    async fn describe_security_groups(
        &self,
        vpc_id: &str,
        names: &[String],
    ) -> Result<BTreeMap<String, String>, ProviderError>;

    /// Tag an instance after creation.
    async fn tag(
        &self,
        id: &InstanceId,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError>;

    /// Link an instance outside a VPC to groups inside it.
    async fn link(&self, id: &InstanceId, vpc_id: &str, groups: &[String])
        -> Result<(), ProviderError>;

    /// Enable or disable API termination protection.
    async fn set_termination_protection(
        &self,
        id: &InstanceId,
        enabled: bool,
    ) -> Result<(), ProviderError>;

    /// Whether tags can be attached in the create call.
    fn supports_creation_tags(&self) -> bool {
        true
    }

    /// Maximum ids per describe call.
    fn describe_page_size(&self) -> usize {
        DEFAULT_DESCRIBE_PAGE_SIZE
    }
}
