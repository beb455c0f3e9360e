//! Error handling and display for the CLI.

use std::path::PathBuf;

use colored::Colorize;
use sprout_cascade::{ConfigError, ResolveError};
use sprout_provisioner::{ProviderError, ProvisionError};
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{} is not a chef repository (no roles/ directory)", .0.display())]
    NotAChefRoot(PathBuf),

    #[error("No compute endpoint configured")]
    MissingEndpoint,

    #[error("Missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("No environment given and no default chef_environment configured")]
    MissingEnvironment,

    #[error("Invalid tag '{0}', expected key=value")]
    InvalidTag(String),

    #[error("Invalid value for --{flag}: {message}")]
    InvalidFlag { flag: &'static str, message: String },

    #[error("Launch aborted")]
    Aborted,
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(hint) = hint_for(err) {
        eprintln!("\n{}", format!("Hint: {}", hint).yellow());
    }
}

fn hint_for(err: &anyhow::Error) -> Option<String> {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::NotAChefRoot(_) => {
                Some("Pass --local-chef-root or set LOCAL_CHEF_ROOT.".to_string())
            }
            CliError::MissingEndpoint => Some(
                "Pass --endpoint, set SPROUT_ENDPOINT, or add \"endpoint\" to config.json."
                    .to_string(),
            ),
            CliError::MissingCredentials(_) => {
                Some("Set AWS_ACCESS_KEY and AWS_SECRET_KEY.".to_string())
            }
            CliError::MissingEnvironment => {
                Some("Pass an environment or set CHEF_ENVIRONMENT.".to_string())
            }
            _ => None,
        };
    }

    if let Some(resolve_err) = err.downcast_ref::<ResolveError>() {
        return match resolve_err {
            ResolveError::MissingOptions(missing) => Some(format!(
                "Set them in the role metadata, sprout.json defaults, or with {}.",
                missing_option_sources(missing).join(", ")
            )),
            ResolveError::EmptyRole { role } => Some(format!(
                "Add instance_metadata to roles/{}.json, or confirm the empty-role launch.",
                role
            )),
            ResolveError::UnknownBackingStore { .. } => {
                Some("Define the backing store under \"backing_store\" in sprout.json.".to_string())
            }
            _ => None,
        };
    }

    if let Some(ConfigError::NotFound(_)) = err.downcast_ref::<ConfigError>() {
        return Some("Check --local-chef-root and --config-file.".to_string());
    }

    if let Some(provision_err) = err.downcast_ref::<ProvisionError>() {
        return match provision_err {
            ProvisionError::Timeout { .. } => Some(
                "Created instances were terminated. Raise --ready-timeout if boots are slow."
                    .to_string(),
            ),
            ProvisionError::Incomplete(incomplete) => Some(format!(
                "Created instances were terminated. Failed: {}",
                incomplete.failed_item_ids().join(", ")
            )),
            ProvisionError::Provider(ProviderError::Transport(_)) => {
                Some("Check your network connection and compute endpoint.".to_string())
            }
            ProvisionError::TerminationFailed { .. } => {
                Some("Use --ignore-not-found to skip instances that are already gone.".to_string())
            }
            _ => None,
        };
    }

    None
}

/// `--flag` / `ENV_VAR` pairs for missing option groups such as
/// `availability_zone or vpc_subnet_id`.
pub fn missing_option_sources(missing: &[String]) -> Vec<String> {
    missing
        .iter()
        .flat_map(|group| group.split(" or "))
        .map(|key| format!("--{} ({})", key.replace('_', "-"), key.to_uppercase()))
        .collect()
}
