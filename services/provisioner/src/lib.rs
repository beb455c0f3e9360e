//! # sprout-provisioner
//!
//! Launches instances for a resolved [`LaunchRequest`] and tears them down
//! again when any step after creation fails.
//!
//! The compute API is reached through the [`ComputeProvider`] trait. Two
//! implementations ship with the crate:
//!
//! - [`HttpComputeProvider`]: JSON over HTTP
//! - [`MockProvider`]: in-memory, for tests and dry runs
//!
//! Per-instance mutations (tags, classic link, termination protection) run
//! through a [`BatchExecutor`](sprout_retry::BatchExecutor) so that each
//! instance is retried on its own.
//!
//! [`LaunchRequest`]: sprout_cascade::LaunchRequest

pub mod bootstrap;
pub mod error;
pub mod http;
pub mod instance;
pub mod mock;
pub mod orchestrator;
pub mod params;
pub mod poller;
pub mod provider;

pub use bootstrap::{BootstrapRenderer, ScriptRenderer, LAST_BOOTSTRAP_LINE};
pub use error::ProvisionError;
pub use http::{Credentials, HttpComputeProvider, HttpProviderConfig};
pub use instance::ProvisionedInstance;
pub use mock::{MockOperation, MockProvider, ProviderCall};
pub use orchestrator::{KillPolicy, LaunchOptions, Orchestrator, OrchestratorSettings};
pub use params::{CreateParams, SecurityGroups};
pub use poller::{ReadinessPoller, ReadinessWatch, DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT};
pub use provider::{
    ComputeProvider, InstanceId, InstanceState, InstanceStatus, ProviderError, TerminateOutcome,
};
