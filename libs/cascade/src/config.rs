//! Cascade configuration file.
//!
//! The file lives in the root of the local chef repository and holds three
//! required sections:
//!
//! - `defaults`: site-level default launch options
//! - `backing_store`: store id -> options, or store id -> region -> options
//! - `availability_zones`: region -> zones eligible for automatic placement

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, ResolveError};
use crate::layer::{object_to_options, OptionMap};

/// Default configuration file name inside the chef root.
pub const CONFIG_FILE: &str = "sprout.json";

/// Parsed and validated cascade configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Operator default launch options.
    pub defaults: OptionMap,

    /// Backing store id -> options (flat, or keyed by region).
    pub backing_store: BTreeMap<String, OptionMap>,

    /// Region -> availability zones.
    pub availability_zones: BTreeMap<String, Vec<String>>,
}

impl CascadeConfig {
    /// Load and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        Self::from_json_str(&contents)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validate a parsed JSON document. Every violation is collected before
    /// failing.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Some(sections) = object_to_options(value) else {
            return Err(ConfigError::Parse(
                "configuration must be a JSON object".to_string(),
            ));
        };

        let mut errors = Vec::new();

        if !sections.get("defaults").is_some_and(Value::is_object) {
            errors.push(
                "missing required section 'defaults'; \
                 should be a hash containing default launch options"
                    .to_string(),
            );
        }

        let has_stores = sections
            .get("backing_store")
            .and_then(Value::as_object)
            .is_some_and(|stores| !stores.is_empty());
        if !has_stores {
            errors.push("missing or empty section 'backing_store'".to_string());
            errors.push(
                "'backing_store' should be a hash from store type (like 'ebs') \
                 => hash of options for that store"
                    .to_string(),
            );
        }

        if !sections
            .get("availability_zones")
            .is_some_and(Value::is_object)
        {
            errors.push("missing or empty section 'availability_zones'".to_string());
            errors.push(
                "'availability_zones' should be a hash from region name \
                 => list of allowed zones in that region"
                    .to_string(),
            );
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        let document = Value::Object(sections.into_iter().collect());
        serde_json::from_value(document).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Options for a backing store, narrowed to `region` when the store is
    /// defined per region. A flat definition applies to every region.
    pub fn options_for_backing_store(
        &self,
        backing_store: &str,
        region: Option<&str>,
    ) -> Result<OptionMap, ResolveError> {
        let unknown = || ResolveError::UnknownBackingStore {
            backing_store: backing_store.to_string(),
            region: region.map(str::to_string),
        };

        let options = self.backing_store.get(backing_store).ok_or_else(unknown)?;

        if let Some(region) = region {
            if let Some(Value::Object(per_region)) = options.get(region) {
                return Ok(per_region
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect());
            }
        }

        if self.is_region_keyed(options) {
            return Err(unknown());
        }

        Ok(options.clone())
    }

    /// Pick an availability zone in `region` at random. Regions without
    /// configured zones yield `None`.
    pub fn random_zone(&self, region: &str) -> Option<String> {
        self.availability_zones
            .get(region)
            .and_then(|zones| zones.choose(&mut rand::rng()))
            .cloned()
    }

    /// A definition is region keyed as soon as one key is a configured
    /// region holding an object. Other keys may name regions without zones.
    fn is_region_keyed(&self, options: &OptionMap) -> bool {
        options.iter().any(|(key, value)| {
            value.is_object() && self.availability_zones.contains_key(key)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> CascadeConfig {
        CascadeConfig::from_value(json!({
            "defaults": {"instance_type": "m1.small"},
            "backing_store": {
                "instance_store": {"image_id": "ami-flat"},
                "ebs": {
                    "us-east-1": {"image_id": "ami-east"},
                    "us-west-2": {"image_id": "ami-west"}
                }
            },
            "availability_zones": {
                "us-east-1": ["us-east-1a"],
                "us-west-2": ["us-west-2a", "us-west-2b"],
                "eu-west-1": []
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_collects_every_violation() {
        let err = CascadeConfig::from_value(json!({})).unwrap_err();
        match err {
            ConfigError::Invalid(errors) => {
                assert_eq!(errors.len(), 5);
                assert!(errors[0].contains("'defaults'"));
                assert!(errors[1].contains("'backing_store'"));
                assert!(errors[3].contains("'availability_zones'"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_backing_store_is_invalid() {
        let err = CascadeConfig::from_value(json!({
            "defaults": {},
            "backing_store": {},
            "availability_zones": {}
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref e) if e.len() == 2));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = CascadeConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_flat_backing_store_applies_to_any_region() {
        let config = sample();
        let east = config
            .options_for_backing_store("instance_store", Some("us-east-1"))
            .unwrap();
        let none = config.options_for_backing_store("instance_store", None).unwrap();
        assert_eq!(east["image_id"], json!("ami-flat"));
        assert_eq!(east, none);
    }

    #[test]
    fn test_region_keyed_backing_store() {
        let config = sample();
        let west = config
            .options_for_backing_store("ebs", Some("us-west-2"))
            .unwrap();
        assert_eq!(west["image_id"], json!("ami-west"));
    }

    #[test]
    fn test_region_keyed_backing_store_missing_region() {
        let config = sample();
        let err = config
            .options_for_backing_store("ebs", Some("eu-west-1"))
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::UnknownBackingStore { ref region, .. } if region.as_deref() == Some("eu-west-1")
        ));
    }

    #[test]
    fn test_partially_configured_region_keys_still_region_keyed() {
        let config = CascadeConfig::from_value(json!({
            "defaults": {"flavor": "m1.small"},
            "backing_store": {
                "ebs": {
                    "us-east-1": {"image_id": "ami-east"},
                    "us-west-2": {"image_id": "ami-west"}
                }
            },
            "availability_zones": {"us-east-1": ["us-east-1a"]}
        }))
        .unwrap();

        let err = config
            .options_for_backing_store("ebs", Some("eu-west-1"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnknownBackingStore { .. }));

        let west = config
            .options_for_backing_store("ebs", Some("us-west-2"))
            .unwrap();
        assert_eq!(west["image_id"], json!("ami-west"));
    }

    #[test]
    fn test_unknown_backing_store() {
        let err = sample()
            .options_for_backing_store("nfs", None)
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown backing store: nfs");
    }

    #[test]
    fn test_random_zone() {
        let config = sample();
        assert_eq!(config.random_zone("us-east-1").as_deref(), Some("us-east-1a"));
        let west = config.random_zone("us-west-2").unwrap();
        assert!(west == "us-west-2a" || west == "us-west-2b");
        assert_eq!(config.random_zone("eu-west-1"), None);
        assert_eq!(config.random_zone("ap-south-1"), None);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CascadeConfig::load(&dir.path().join(CONFIG_FILE)).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
