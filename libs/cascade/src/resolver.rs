//! Configuration cascade resolver.
//!
//! Merges, in increasing precedence: built-in defaults, configuration
//! defaults, backing-store options, role metadata (with context overrides
//! applied) and caller overrides. The role and environment passed by the
//! caller always win over any merged value.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::CascadeConfig;
use crate::error::ResolveError;
use crate::layer::{apply_context_overrides, is_set, string_option, ConfigurationLayers, OptionMap};
use crate::request::LaunchRequest;
use crate::roles::{ExpandOptions, RoleMetadataSource};

/// Backing store used when no layer names one.
pub const DEFAULT_BACKING_STORE: &str = "instance_store";

/// Built-in defaults, the lowest-precedence layer.
pub fn built_in_defaults() -> OptionMap {
    [
        ("chef_environment", json!("production")),
        ("git_branch", json!("production")),
        ("count", json!(1)),
        ("instance_hostname", json!("")),
        ("instance_domain_name", json!("")),
        (
            "chef_package_source",
            json!("http://www.opscode.com/chef/download?p=${platform}&pv=${platform_version}&m=${arch}&v=${chef_version}&prerelease=false"),
        ),
        ("chef_version", json!("11.4.0")),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Caller-controlled resolution switches.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Accept a role without launch metadata.
    pub allow_empty_roles: bool,

    /// Attributes at normal precedence forwarded to role expansion.
    pub normal_attributes: OptionMap,
}

/// Resolves launch requests from the configuration cascade.
#[derive(Clone)]
pub struct Resolver {
    config: CascadeConfig,
    roles: Arc<dyn RoleMetadataSource>,
}

impl Resolver {
    /// Create a resolver over a loaded configuration and a role source.
    pub fn new(config: CascadeConfig, roles: Arc<dyn RoleMetadataSource>) -> Self {
        Self { config, roles }
    }

    /// The loaded configuration.
    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Built-in defaults with the configuration defaults merged on top.
    pub fn default_options(&self) -> OptionMap {
        let mut options = built_in_defaults();
        options.extend(self.config.defaults.clone());
        options
    }

    /// Environment to use when the caller did not name one: the override,
    /// else the configured default.
    pub fn default_environment(&self, overrides: &OptionMap) -> Option<String> {
        let defaults = self.default_options();
        string_option(overrides, "chef_environment")
            .or_else(|| string_option(&defaults, "chef_environment"))
            .map(str::to_string)
    }

    /// Merge every layer into a flat option map.
    pub fn expand(
        &self,
        role: &str,
        environment: &str,
        contexts: &[String],
        overrides: &OptionMap,
        options: &ResolveOptions,
    ) -> Result<OptionMap, ResolveError> {
        if role.is_empty() {
            return Err(ResolveError::MissingArgument("chef role"));
        }
        if environment.is_empty() {
            return Err(ResolveError::MissingArgument("chef environment"));
        }

        let expand_options = ExpandOptions {
            cookbook_attributes: self.cookbook_attributes(overrides),
            normal_attributes: options.normal_attributes.clone(),
        };
        let role_metadata = self
            .roles
            .metadata_for_role(role, environment, &expand_options)?;

        let role_empty = role_metadata.as_ref().is_none_or(|m| m.is_empty());
        if role_empty && !options.allow_empty_roles {
            return Err(ResolveError::EmptyRole {
                role: role.to_string(),
            });
        }

        let mut role_metadata = role_metadata.unwrap_or_default();
        apply_context_overrides(&mut role_metadata, contexts);

        let backing_store = self.pick(overrides, &role_metadata, "backing_store");
        let backing_store = backing_store.unwrap_or_else(|| DEFAULT_BACKING_STORE.to_string());
        let region = self.pick(overrides, &role_metadata, "region");

        let mut store_options = self
            .config
            .options_for_backing_store(&backing_store, region.as_deref())?;
        store_options.insert("backing_store".to_string(), Value::String(backing_store));

        let layers = ConfigurationLayers {
            built_in: built_in_defaults(),
            config_defaults: self.config.defaults.clone(),
            backing_store: store_options,
            role_metadata,
            overrides: overrides.clone(),
        };
        let mut merged = layers.merge();

        if !is_set(&merged, "availability_zone") && !is_set(&merged, "vpc_subnet_id") {
            if let Some(region) = string_option(&merged, "region").map(str::to_string) {
                match self.config.random_zone(&region) {
                    Some(zone) => {
                        debug!(region = %region, zone = %zone, "Selected availability zone");
                        merged.insert("availability_zone".to_string(), Value::String(zone));
                    }
                    None => debug!(region = %region, "No availability zones configured"),
                }
            }
        }

        merged.insert("chef_role".to_string(), Value::String(role.to_string()));
        merged.insert(
            "chef_environment".to_string(),
            Value::String(environment.to_string()),
        );

        info!(
            role,
            environment,
            backing_store = ?string_option(&merged, "backing_store"),
            image_origin = ?layers.origin("image_id"),
            "Resolved launch options"
        );

        Ok(merged)
    }

    /// Merge every layer and validate the result into a launch request.
    pub fn resolve(
        &self,
        role: &str,
        environment: &str,
        contexts: &[String],
        overrides: &OptionMap,
        options: &ResolveOptions,
    ) -> Result<LaunchRequest, ResolveError> {
        let merged = self.expand(role, environment, contexts, overrides, options)?;
        LaunchRequest::from_options(merged)
    }

    /// First string value for `key` from overrides, role metadata, then
    /// configuration defaults.
    fn pick(&self, overrides: &OptionMap, role_metadata: &OptionMap, key: &str) -> Option<String> {
        [overrides, role_metadata, &self.config.defaults]
            .into_iter()
            .find_map(|layer| string_option(layer, key))
            .map(str::to_string)
    }

    fn cookbook_attributes(&self, overrides: &OptionMap) -> Vec<String> {
        [overrides, &self.config.defaults]
            .into_iter()
            .find_map(|layer| layer.get("chef_cookbook_attributes"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
