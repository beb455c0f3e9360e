//! The fully resolved launch request.

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ResolveError;
use crate::layer::{is_set, OptionMap};

/// Options that must be set after every layer is merged. A group is
/// satisfied when any one of its keys is set.
pub const REQUIRED_OPTIONS: &[&[&str]] = &[
    &["chef_role"],
    &["chef_environment"],
    &["chef_data_bag_secret"],
    &["git_branch"],
    &["git_key"],
    &["git_origin"],
    &["key_name"],
    &["instance_type"],
    &["image_id"],
    &["region"],
    &["availability_zone", "vpc_subnet_id"],
    &["count"],
];

/// Options never shown when describing a request.
pub const SECRET_OPTIONS: &[&str] = &["aws_secret_key", "chef_data_bag_secret", "git_key"];

/// An explicit block device mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub device_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ebs: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_device: Option<String>,
}

impl BlockDeviceMapping {
    /// Mapping of an instance-store volume onto a device name.
    pub fn ephemeral(device_name: &str, index: usize) -> Self {
        Self {
            device_name: device_name.to_string(),
            virtual_name: Some(format!("ephemeral{}", index)),
            ebs: None,
            no_device: None,
        }
    }
}

/// Target of a classic link: a VPC and the groups to join in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassicLink {
    pub vpc_id: String,

    #[serde(default, deserialize_with = "string_list")]
    pub security_group_ids: Vec<String>,
}

/// A fully resolved launch request. Exactly one value per option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub chef_role: String,
    pub chef_environment: String,
    /// Secret, or a path to a file holding it.
    pub chef_data_bag_secret: String,
    #[serde(default)]
    pub chef_package_source: Option<String>,
    #[serde(default)]
    pub chef_version: Option<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub chef_cookbook_attributes: Vec<String>,

    pub git_branch: String,
    pub git_origin: String,
    /// Deploy key, or a path to a file holding it.
    pub git_key: String,

    pub key_name: String,
    pub instance_type: String,
    pub image_id: String,
    pub region: String,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(deserialize_with = "count")]
    pub count: u32,
    #[serde(default)]
    pub backing_store: String,

    #[serde(default, deserialize_with = "string_list")]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub iam_role: Option<String>,
    #[serde(default)]
    pub placement_group: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub ebs_optimized: bool,
    #[serde(default)]
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    #[serde(default, deserialize_with = "string_list")]
    pub ephemeral_devices: Vec<String>,

    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub vpc_subnet_id: Option<String>,
    #[serde(default)]
    pub private_ip_address: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub dedicated_tenancy: bool,
    #[serde(default)]
    pub associate_public_ip_address: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub termination_protection: bool,
    #[serde(default)]
    pub classic_link: Option<ClassicLink>,
    #[serde(default)]
    pub instance_initiated_shutdown_behavior: Option<String>,

    #[serde(default)]
    pub instance_hostname: String,
    #[serde(default)]
    pub instance_domain_name: String,
    #[serde(default, deserialize_with = "tag_map")]
    pub tags: BTreeMap<String, String>,
    /// Pre-rendered bootstrap payload; skips rendering when set.
    #[serde(default)]
    pub user_data: Option<String>,

    /// Options with no dedicated field, kept for the bootstrap renderer.
    #[serde(flatten)]
    pub extra: OptionMap,
}

impl LaunchRequest {
    /// Validate merged options and convert them into a request.
    pub fn from_options(options: OptionMap) -> Result<Self, ResolveError> {
        let missing = missing_options(&options);
        if !missing.is_empty() {
            return Err(ResolveError::MissingOptions(missing));
        }

        // Nulls mean "unset" at this point; drop them so defaults apply.
        let document: serde_json::Map<String, Value> = options
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect();

        serde_json::from_value(Value::Object(document))
            .map_err(|e| ResolveError::InvalidOptions(e.to_string()))
    }
}

/// Required option groups that are not satisfied, labelled for display.
pub fn missing_options(options: &OptionMap) -> Vec<String> {
    REQUIRED_OPTIONS
        .iter()
        .filter(|group| !group.iter().any(|key| is_set(options, key)))
        .map(|group| group.join(" or "))
        .collect()
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<StringOrList>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(StringOrList::One(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(StringOrList::Many(list)) => list,
    })
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(false),
        Some(Flag::Bool(b)) => Ok(b),
        Some(Flag::Text(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" | "" => Ok(false),
            other => Err(de::Error::custom(format!("invalid flag value '{}'", other))),
        },
    }
}

fn count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Number(u32),
        Text(String),
    }

    let count = match Count::deserialize(deserializer)? {
        Count::Number(n) => n,
        Count::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid count '{}'", s)))?,
    };

    if count == 0 {
        return Err(de::Error::custom("count must be at least 1"));
    }
    Ok(count)
}

fn tag_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::object_to_options;
    use serde_json::json;

    fn complete() -> OptionMap {
        object_to_options(json!({
            "chef_role": "web",
            "chef_environment": "production",
            "chef_data_bag_secret": "s3cret",
            "git_branch": "production",
            "git_key": "deploy-key",
            "git_origin": "git@example.com:chef.git",
            "key_name": "ops",
            "instance_type": "m3.large",
            "image_id": "ami-123",
            "region": "us-east-1",
            "availability_zone": "us-east-1a",
            "count": 2,
            "backing_store": "instance_store"
        }))
        .unwrap()
    }

    #[test]
    fn test_complete_request() {
        let request = LaunchRequest::from_options(complete()).unwrap();
        assert_eq!(request.chef_role, "web");
        assert_eq!(request.count, 2);
        assert!(request.security_groups.is_empty());
        assert!(!request.ebs_optimized);
        assert!(request.extra.is_empty());
    }

    #[test]
    fn test_missing_options_reported_together() {
        let mut options = complete();
        options.remove("git_key");
        options.remove("image_id");
        options.remove("availability_zone");
        options.insert("key_name".to_string(), Value::Null);

        let err = LaunchRequest::from_options(options).unwrap_err();
        match err {
            ResolveError::MissingOptions(missing) => assert_eq!(
                missing,
                vec![
                    "git_key",
                    "key_name",
                    "image_id",
                    "availability_zone or vpc_subnet_id"
                ]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_subnet_satisfies_zone_requirement() {
        let mut options = complete();
        options.remove("availability_zone");
        options.insert("vpc_subnet_id".to_string(), json!("subnet-1"));

        let request = LaunchRequest::from_options(options).unwrap();
        assert_eq!(request.availability_zone, None);
        assert_eq!(request.vpc_subnet_id.as_deref(), Some("subnet-1"));
    }

    #[test]
    fn test_lenient_value_shapes() {
        let mut options = complete();
        options.insert("security_groups".to_string(), json!("web, default"));
        options.insert("ephemeral_devices".to_string(), json!(["/dev/sdb", "/dev/sdc"]));
        options.insert("ebs_optimized".to_string(), json!("true"));
        options.insert("count".to_string(), json!("3"));
        options.insert("tags".to_string(), json!({"team": "infra", "cost": 12}));
        options.insert("custom_option".to_string(), json!("kept"));

        let request = LaunchRequest::from_options(options).unwrap();
        assert_eq!(request.security_groups, vec!["web", "default"]);
        assert_eq!(request.ephemeral_devices.len(), 2);
        assert!(request.ebs_optimized);
        assert_eq!(request.count, 3);
        assert_eq!(request.tags["cost"], "12");
        assert_eq!(request.extra["custom_option"], json!("kept"));
    }

    #[test]
    fn test_zero_count_rejected() {
        let mut options = complete();
        options.insert("count".to_string(), json!(0));
        let err = LaunchRequest::from_options(options).unwrap_err();
        assert!(err.is_argument_error());
    }
}
