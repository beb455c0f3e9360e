//! # sprout-cascade
//!
//! Layered resolution of launch options.
//!
//! A launch request is assembled from five layers, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. Operator defaults from the cascade configuration file
//! 3. Backing-store options (optionally per region)
//! 4. Role metadata, with requested context overrides applied in order
//! 5. Explicit caller overrides
//!
//! The merge is a shallow per-key replace. After merging, an availability
//! zone is picked for the region when none is set and no subnet pins one,
//! and the caller's role and environment are written over whatever the
//! layers said.

mod config;
mod error;
mod layer;
mod request;
mod resolver;
mod roles;

pub use config::{CascadeConfig, CONFIG_FILE};
pub use error::{ConfigError, ResolveError, RoleExpansionError};
pub use layer::{
    apply_context_overrides, is_set, merge_layers, object_to_options, string_option,
    ConfigurationLayers, LayerKind, OptionMap, CONTEXT_OVERRIDES_KEY,
};
pub use request::{
    missing_options, BlockDeviceMapping, ClassicLink, LaunchRequest, REQUIRED_OPTIONS,
    SECRET_OPTIONS,
};
pub use resolver::{built_in_defaults, ResolveOptions, Resolver, DEFAULT_BACKING_STORE};
pub use roles::{deep_merge, ExpandOptions, RoleDirectory, RoleMetadataSource, METADATA_ATTRIBUTES};
