//! Creation parameters assembled from a launch request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sprout_cascade::{BlockDeviceMapping, LaunchRequest};

/// Tag carrying the version of the tool that launched the instance.
pub const VERSION_TAG: &str = "sprout";

/// Environment whose instances get the short `Name` tag.
pub const PRODUCTION_ENVIRONMENT: &str = "production";

/// Placement block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenancy: Option<String>,
}

/// Primary network interface, used when launching into a subnet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub subnet_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associate_public_ip_address: Option<bool>,

    #[serde(default)]
    pub security_group_ids: Vec<String>,
}

/// Parameters for a single create call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateParams {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub count: u32,

    /// Group ids, when not carried by the network interface.
    #[serde(default)]
    pub security_group_ids: Vec<String>,

    /// Group names, for launches outside a VPC.
    #[serde(default)]
    pub security_groups: Vec<String>,

    #[serde(default)]
    pub placement: Placement,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interface: Option<NetworkInterface>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_instance_profile: Option<String>,

    #[serde(default)]
    pub ebs_optimized: bool,

    #[serde(default)]
    pub block_device_mappings: Vec<BlockDeviceMapping>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_initiated_shutdown_behavior: Option<String>,

    pub user_data: String,

    /// Tags attached at creation time. Empty when the provider tags later.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Security groups split into ids (`sg-` prefix) and names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityGroups {
    pub ids: Vec<String>,
    pub names: Vec<String>,
}

impl SecurityGroups {
    pub fn split(groups: &[String]) -> Self {
        let (ids, names): (Vec<String>, Vec<String>) = groups
            .iter()
            .cloned()
            .partition(|group| group.starts_with("sg-"));
        Self { ids, names }
    }
}

/// Tags every launched instance carries. Caller tags are merged on top.
pub fn launch_tags(request: &LaunchRequest, created_by: &str) -> BTreeMap<String, String> {
    let group = format!("{}-{}", request.chef_role, request.chef_environment);
    let name = if request.chef_environment == PRODUCTION_ENVIRONMENT {
        request.chef_role.clone()
    } else {
        group.clone()
    };

    let mut tags = BTreeMap::from([
        ("Name".to_string(), name),
        ("Group".to_string(), group),
        ("created_by".to_string(), created_by.to_string()),
        (VERSION_TAG.to_string(), env!("CARGO_PKG_VERSION").to_string()),
    ]);
    tags.extend(request.tags.clone());
    tags
}

/// Explicit block device mappings followed by ephemeral devices mapped
/// positionally (`ephemeral0`, `ephemeral1`, ...).
pub fn block_device_mappings(request: &LaunchRequest) -> Vec<BlockDeviceMapping> {
    let mut mappings = request.block_device_mappings.clone();
    mappings.extend(
        request
            .ephemeral_devices
            .iter()
            .enumerate()
            .map(|(index, device)| BlockDeviceMapping::ephemeral(device, index)),
    );
    mappings
}

/// Assemble create parameters. `groups` must already have names resolved
/// to ids when launching into a VPC.
pub fn build_create_params(
    request: &LaunchRequest,
    groups: SecurityGroups,
    user_data: String,
    tags: BTreeMap<String, String>,
) -> CreateParams {
    let placement = Placement {
        availability_zone: request.availability_zone.clone(),
        group_name: request.placement_group.clone(),
        tenancy: request.dedicated_tenancy.then(|| "dedicated".to_string()),
    };

    let (security_group_ids, network_interface) = match &request.vpc_subnet_id {
        Some(subnet_id) => (
            Vec::new(),
            Some(NetworkInterface {
                subnet_id: subnet_id.clone(),
                private_ip_address: request.private_ip_address.clone(),
                associate_public_ip_address: request.associate_public_ip_address,
                security_group_ids: groups.ids,
            }),
        ),
        None => (groups.ids, None),
    };

    CreateParams {
        image_id: request.image_id.clone(),
        instance_type: request.instance_type.clone(),
        key_name: request.key_name.clone(),
        count: request.count,
        security_group_ids,
        security_groups: groups.names,
        placement,
        network_interface,
        iam_instance_profile: request.iam_role.clone(),
        ebs_optimized: request.ebs_optimized,
        block_device_mappings: block_device_mappings(request),
        instance_initiated_shutdown_behavior: request.instance_initiated_shutdown_behavior.clone(),
        user_data,
        tags,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use sprout_cascade::{object_to_options, LaunchRequest};

    pub(crate) fn request(environment: &str) -> LaunchRequest {
        LaunchRequest::from_options(
            object_to_options(json!({
                "chef_role": "web",
                "chef_environment": environment,
                "chef_data_bag_secret": "secret",
                "git_branch": "production",
                "git_key": "key",
                "git_origin": "git@example.com:chef.git",
                "key_name": "ops",
                "instance_type": "m3.large",
                "image_id": "ami-123",
                "region": "us-east-1",
                "availability_zone": "us-east-1a",
                "count": 2,
                "backing_store": "instance_store"
            }))
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_production_uses_short_name() {
        let tags = launch_tags(&request("production"), "alice");
        assert_eq!(tags["Name"], "web");
        assert_eq!(tags["Group"], "web-production");
        assert_eq!(tags["created_by"], "alice");
        assert!(tags.contains_key(VERSION_TAG));
    }

    #[test]
    fn test_caller_tags_merge_on_top() {
        let mut req = request("staging");
        req.tags.insert("Name".to_string(), "custom".to_string());
        req.tags.insert("team".to_string(), "infra".to_string());

        let tags = launch_tags(&req, "alice");
        assert_eq!(tags["Name"], "custom");
        assert_eq!(tags["Group"], "web-staging");
        assert_eq!(tags["team"], "infra");
    }

    #[test]
    fn test_split_security_groups() {
        let groups = SecurityGroups::split(&[
            "sg-123".to_string(),
            "web".to_string(),
            "sg-456".to_string(),
        ]);
        assert_eq!(groups.ids, vec!["sg-123", "sg-456"]);
        assert_eq!(groups.names, vec!["web"]);
    }

    #[test]
    fn test_ephemeral_devices_follow_explicit_mappings() {
        let mut req = request("production");
        req.block_device_mappings.push(BlockDeviceMapping {
            device_name: "/dev/sda1".to_string(),
            virtual_name: None,
            ebs: Some(json!({"volume_size": 50})),
            no_device: None,
        });
        req.ephemeral_devices = vec!["/dev/sdb".to_string(), "/dev/sdc".to_string()];

        let mappings = block_device_mappings(&req);
        assert_eq!(mappings.len(), 3);
        assert_eq!(mappings[1].virtual_name.as_deref(), Some("ephemeral0"));
        assert_eq!(mappings[2].device_name, "/dev/sdc");
        assert_eq!(mappings[2].virtual_name.as_deref(), Some("ephemeral1"));
    }

    #[test]
    fn test_subnet_moves_groups_to_network_interface() {
        let mut req = request("production");
        req.vpc_subnet_id = Some("subnet-1".to_string());
        req.private_ip_address = Some("10.0.0.5".to_string());
        req.dedicated_tenancy = true;

        let groups = SecurityGroups {
            ids: vec!["sg-1".to_string()],
            names: vec![],
        };
        let params = build_create_params(&req, groups, "#!/bin/bash".to_string(), BTreeMap::new());

        assert!(params.security_group_ids.is_empty());
        let nic = params.network_interface.unwrap();
        assert_eq!(nic.subnet_id, "subnet-1");
        assert_eq!(nic.private_ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(nic.security_group_ids, vec!["sg-1"]);
        assert_eq!(params.placement.tenancy.as_deref(), Some("dedicated"));
        assert_eq!(params.count, 2);
    }
}
