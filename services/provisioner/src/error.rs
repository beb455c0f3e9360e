//! Provisioning errors.

use std::collections::BTreeMap;
use std::time::Duration;

use sprout_retry::IncompleteOperation;
use thiserror::Error;

use crate::provider::{InstanceState, ProviderError};

/// Errors from launching or killing instances.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A provider call failed outright.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A batched per-instance operation failed for some instances.
    #[error(transparent)]
    Incomplete(#[from] IncompleteOperation<ProviderError>),

    /// Instances did not reach the running state before the deadline.
    #[error("timed out after {elapsed:?} waiting for {operation}; pending: {}", .pending.join(", "))]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
        pending: Vec<String>,
    },

    /// An instance entered a state it cannot boot from.
    #[error("instance {instance_id} entered state {state} while booting")]
    InstanceFailed {
        instance_id: String,
        state: InstanceState,
    },

    /// Security group names that do not exist in the VPC.
    #[error("unknown security groups in {vpc_id}: {}", .names.join(", "))]
    UnknownSecurityGroups { vpc_id: String, names: Vec<String> },

    /// The create call succeeded but returned no instances.
    #[error("provider created no instances")]
    NothingCreated,

    /// The bootstrap payload could not be rendered.
    #[error("failed to render bootstrap script: {0}")]
    Bootstrap(String),

    /// Some instances could not be terminated.
    #[error("failed to terminate instances: {}", describe(.errors))]
    TerminationFailed {
        errors: BTreeMap<String, ProviderError>,
    },
}

impl ProvisionError {
    /// Returns true if the error is a readiness timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

fn describe(errors: &BTreeMap<String, ProviderError>) -> String {
    errors
        .iter()
        .map(|(id, e)| format!("{} ({})", id, e))
        .collect::<Vec<_>>()
        .join(", ")
}
