//! Role metadata capability.
//!
//! The resolver treats role metadata as opaque: anything implementing
//! [`RoleMetadataSource`] can supply the per-role option dictionary.
//! [`RoleDirectory`] reads JSON role files from a chef repository checkout.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::RoleExpansionError;
use crate::layer::{object_to_options, OptionMap};

/// Role attributes searched for launch metadata, first match wins.
pub const METADATA_ATTRIBUTES: &[&str] = &["instance_metadata", "stemcell"];

/// Extra inputs forwarded to role expansion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpandOptions {
    /// Cookbook attribute files (`cookbook::file`) to load as defaults.
    pub cookbook_attributes: Vec<String>,

    /// Attributes at normal precedence (between defaults and overrides).
    pub normal_attributes: OptionMap,
}

/// Source of per-role launch metadata.
pub trait RoleMetadataSource: Send + Sync {
    /// Launch metadata for `role` in `environment`, or `None` if the role
    /// carries none.
    fn metadata_for_role(
        &self,
        role: &str,
        environment: &str,
        options: &ExpandOptions,
    ) -> Result<Option<OptionMap>, RoleExpansionError>;
}

/// A role definition on disk (`roles/<name>.json`).
#[derive(Debug, Default, Deserialize)]
struct RoleDefinition {
    #[serde(default)]
    default_attributes: Map<String, Value>,

    #[serde(default)]
    override_attributes: Map<String, Value>,

    #[serde(default)]
    run_list: Vec<String>,

    #[serde(default)]
    env_run_lists: Map<String, Value>,
}

impl RoleDefinition {
    fn run_list_for(&self, environment: &str) -> Vec<String> {
        match self.env_run_lists.get(environment) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => self.run_list.clone(),
        }
    }
}

/// Role metadata read from a chef repository's `roles/` directory.
#[derive(Debug, Clone)]
pub struct RoleDirectory {
    chef_root: PathBuf,
}

impl RoleDirectory {
    /// Create a source rooted at a local chef repository checkout.
    pub fn new(chef_root: impl Into<PathBuf>) -> Self {
        Self {
            chef_root: chef_root.into(),
        }
    }

    /// Root of the chef repository.
    pub fn chef_root(&self) -> &Path {
        &self.chef_root
    }

    /// Whether the root looks like a chef repository.
    pub fn is_valid(&self) -> bool {
        self.chef_root.join("roles").is_dir()
    }

    fn load_role(&self, name: &str) -> Result<RoleDefinition, RoleExpansionError> {
        let path = self.chef_root.join("roles").join(format!("{}.json", name));
        let contents = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RoleExpansionError::RoleNotFound(name.to_string())
            } else {
                RoleExpansionError::InvalidRole {
                    role: name.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        serde_json::from_str(&contents).map_err(|e| RoleExpansionError::InvalidRole {
            role: name.to_string(),
            message: e.to_string(),
        })
    }

    fn load_cookbook_attributes(&self, attribute_file: &str) -> Result<Value, RoleExpansionError> {
        let (cookbook, file) = attribute_file.split_once("::").unwrap_or((attribute_file, "default"));
        let path = self
            .chef_root
            .join("cookbooks")
            .join(cookbook)
            .join("attributes")
            .join(format!("{}.json", file));

        let invalid = |message: String| RoleExpansionError::InvalidRole {
            role: attribute_file.to_string(),
            message,
        };
        let contents = fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| invalid(e.to_string()))
    }

    /// Expand `role` depth-first: included roles apply before the role that
    /// includes them, and each role applies once.
    fn expand(
        &self,
        role: &str,
        environment: &str,
        visited: &mut BTreeSet<String>,
        defaults: &mut Value,
        overrides: &mut Value,
    ) -> Result<(), RoleExpansionError> {
        if !visited.insert(role.to_string()) {
            return Ok(());
        }

        let definition = self.load_role(role)?;
        for item in definition.run_list_for(environment) {
            if let Some(included) = parse_role_item(&item) {
                self.expand(included, environment, visited, defaults, overrides)?;
            }
        }

        deep_merge(defaults, Value::Object(definition.default_attributes));
        deep_merge(overrides, Value::Object(definition.override_attributes));
        Ok(())
    }
}

impl RoleMetadataSource for RoleDirectory {
    fn metadata_for_role(
        &self,
        role: &str,
        environment: &str,
        options: &ExpandOptions,
    ) -> Result<Option<OptionMap>, RoleExpansionError> {
        let mut attributes = Value::Object(Map::new());
        for attribute_file in &options.cookbook_attributes {
            deep_merge(&mut attributes, self.load_cookbook_attributes(attribute_file)?);
        }

        let mut overrides = Value::Object(Map::new());
        let mut visited = BTreeSet::new();
        self.expand(role, environment, &mut visited, &mut attributes, &mut overrides)?;

        let normal: Map<String, Value> = options
            .normal_attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        deep_merge(&mut attributes, Value::Object(normal));
        deep_merge(&mut attributes, overrides);

        debug!(
            role,
            environment,
            roles_applied = visited.len(),
            "Expanded role attributes"
        );

        let metadata = METADATA_ATTRIBUTES
            .iter()
            .find_map(|key| attributes.get(*key).cloned())
            .and_then(object_to_options);
        Ok(metadata)
    }
}

fn parse_role_item(item: &str) -> Option<&str> {
    item.trim()
        .strip_prefix("role[")
        .and_then(|rest| rest.strip_suffix(']'))
}

/// Recursive merge for role attributes: objects merge key by key, anything
/// else is replaced.
pub fn deep_merge(into: &mut Value, from: Value) {
    match (into, from) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, value) => *target = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge() {
        let mut base = json!({"a": {"x": 1, "y": [1, 2]}, "b": 1});
        deep_merge(&mut base, json!({"a": {"y": [3], "z": true}, "c": "new"}));
        assert_eq!(
            base,
            json!({"a": {"x": 1, "y": [3], "z": true}, "b": 1, "c": "new"})
        );
    }

    #[test]
    fn test_parse_role_item() {
        assert_eq!(parse_role_item("role[base]"), Some("base"));
        assert_eq!(parse_role_item(" role[web] "), Some("web"));
        assert_eq!(parse_role_item("recipe[nginx]"), None);
    }
}
