//! Error types for configuration loading and option resolution.

use std::path::PathBuf;

use thiserror::Error;

/// Errors loading the cascade configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file could not be read.
    #[error("failed to read configuration file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON, or a section has the wrong shape.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Required sections are missing or empty. Every violation is listed.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Errors expanding role metadata.
#[derive(Debug, Error)]
pub enum RoleExpansionError {
    /// A role named in the run list has no definition.
    #[error("role not found: {0}")]
    RoleNotFound(String),

    /// A role definition could not be read or parsed.
    #[error("failed to load role {role}: {message}")]
    InvalidRole { role: String, message: String },
}

/// Errors resolving a launch request.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A structurally required argument was not supplied.
    #[error("missing {0}")]
    MissingArgument(&'static str),

    /// The role has no provisioning metadata and empty roles are not allowed.
    #[error("role {role} contains no launch metadata")]
    EmptyRole { role: String },

    /// The backing store has no definition (for the region, if given).
    #[error("unknown backing store: {backing_store}{}", region_suffix(.region))]
    UnknownBackingStore {
        backing_store: String,
        region: Option<String>,
    },

    /// The role-metadata capability failed.
    #[error(transparent)]
    RoleExpansion(#[from] RoleExpansionError),

    /// Required launch options are absent after merging every layer.
    #[error("missing options: {}", .0.join(", "))]
    MissingOptions(Vec<String>),

    /// An option value has the wrong type.
    #[error("invalid launch options: {0}")]
    InvalidOptions(String),
}

impl ResolveError {
    /// Returns true for errors the caller caused with bad input.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Self::MissingArgument(_) | Self::MissingOptions(_) | Self::InvalidOptions(_)
        )
    }
}

fn region_suffix(region: &Option<String>) -> String {
    match region {
        Some(region) => format!(" (region {})", region),
        None => String::new(),
    }
}
