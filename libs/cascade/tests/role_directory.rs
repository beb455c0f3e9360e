//! Integration tests for role expansion from a chef repository checkout
//! and for end-to-end resolution against it.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use sprout_cascade::{
    CascadeConfig, ExpandOptions, OptionMap, ResolveError, ResolveOptions, Resolver,
    RoleDirectory, RoleExpansionError, RoleMetadataSource, CONFIG_FILE,
};

fn write_json(path: &Path, value: Value) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
}

fn chef_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let roles = dir.path().join("roles");

    write_json(
        &roles.join("unit-inherit-base.json"),
        json!({
            "default_attributes": {
                "instance_metadata": {
                    "instance_type": "m1.xlarge",
                    "security_groups": ["all", "base"],
                    "tags": {"tag1": "tag1_value_base", "tag2": "tag2_value"}
                }
            },
            "run_list": ["role[unit-inherit-base]"]
        }),
    );
    write_json(
        &roles.join("unit-inherit-both.json"),
        json!({
            "default_attributes": {
                "instance_metadata": {
                    "instance_type": "c1.xlarge",
                    "tags": {"tag1": "tag1_value_default", "tag3": "tag3_value_default"}
                }
            },
            "override_attributes": {
                "instance_metadata": {
                    "instance_type": "m3.xlarge",
                    "tags": {"tag3": "tag3_value_override", "tag5": "tag5_value"}
                }
            },
            "run_list": ["role[unit-inherit-base]", "recipe[nginx]"]
        }),
    );
    write_json(
        &roles.join("unit-simple-none.json"),
        json!({"default_attributes": {"nginx": {"workers": 4}}}),
    );
    write_json(
        &roles.join("unit-legacy.json"),
        json!({"default_attributes": {"stemcell": {"instance_type": "t1.micro"}}}),
    );
    write_json(
        &roles.join("web.json"),
        json!({
            "default_attributes": {
                "instance_metadata": {
                    "instance_type": "c3.large",
                    "key_name": "ops",
                    "chef_data_bag_secret": "secret",
                    "git_key": "key",
                    "git_origin": "git@example.com:chef.git",
                    "region": "us-east-1"
                }
            },
            "env_run_lists": {"staging": []}
        }),
    );
    write_json(
        &dir.path().join(CONFIG_FILE),
        json!({
            "defaults": {"chef_environment": "production"},
            "backing_store": {
                "instance_store": {"image_id": "ami-instance-store"},
                "ebs": {"image_id": "ami-ebs"}
            },
            "availability_zones": {"us-east-1": ["us-east-1a", "us-east-1b"]}
        }),
    );
    write_json(
        &dir
            .path()
            .join("cookbooks/sizing/attributes/default.json"),
        json!({"instance_metadata": {"instance_type": "from-cookbook", "ebs_optimized": true}}),
    );

    dir
}

fn metadata(source: &RoleDirectory, role: &str, options: &ExpandOptions) -> Option<OptionMap> {
    source.metadata_for_role(role, "production", options).unwrap()
}

#[test]
fn test_inherited_role_merges_defaults_and_overrides() {
    let repo = chef_repo();
    let source = RoleDirectory::new(repo.path());
    assert!(source.is_valid());

    let meta = metadata(&source, "unit-inherit-both", &ExpandOptions::default()).unwrap();

    assert_eq!(meta["instance_type"], json!("m3.xlarge"));
    assert_eq!(meta["security_groups"], json!(["all", "base"]));
    assert_eq!(
        meta["tags"],
        json!({
            "tag1": "tag1_value_default",
            "tag2": "tag2_value",
            "tag3": "tag3_value_override",
            "tag5": "tag5_value"
        })
    );
}

#[test]
fn test_role_without_metadata_is_none() {
    let repo = chef_repo();
    let source = RoleDirectory::new(repo.path());
    assert_eq!(metadata(&source, "unit-simple-none", &ExpandOptions::default()), None);
}

#[test]
fn test_legacy_metadata_attribute() {
    let repo = chef_repo();
    let source = RoleDirectory::new(repo.path());
    let meta = metadata(&source, "unit-legacy", &ExpandOptions::default()).unwrap();
    assert_eq!(meta["instance_type"], json!("t1.micro"));
}

#[test]
fn test_missing_role_is_expansion_error() {
    let repo = chef_repo();
    let source = RoleDirectory::new(repo.path());
    let err = source
        .metadata_for_role("nope", "production", &ExpandOptions::default())
        .unwrap_err();
    assert!(matches!(err, RoleExpansionError::RoleNotFound(ref r) if r == "nope"));
}

#[test]
fn test_cookbook_and_normal_attribute_precedence() {
    let repo = chef_repo();
    let source = RoleDirectory::new(repo.path());

    let options = ExpandOptions {
        cookbook_attributes: vec!["sizing".to_string()],
        normal_attributes: [(
            "instance_metadata".to_string(),
            json!({"placement_group": "from-normal", "instance_type": "from-normal"}),
        )]
        .into_iter()
        .collect(),
    };
    let meta = metadata(&source, "unit-legacy", &options).unwrap_or_default();
    // unit-legacy only has the `stemcell` attribute; instance_metadata wins
    // the lookup once cookbook and normal attributes define it.
    assert_eq!(meta["ebs_optimized"], json!(true));
    assert_eq!(meta["instance_type"], json!("from-normal"));
    assert_eq!(meta["placement_group"], json!("from-normal"));
}

#[test]
fn test_end_to_end_production_resolution() {
    let repo = chef_repo();
    let config = CascadeConfig::load(&repo.path().join(CONFIG_FILE)).unwrap();
    let resolver = Resolver::new(config, Arc::new(RoleDirectory::new(repo.path())));

    let overrides: OptionMap = [("count".to_string(), json!(2))].into_iter().collect();
    let environment = resolver.default_environment(&overrides).unwrap();
    let request = resolver
        .resolve("web", &environment, &[], &overrides, &ResolveOptions::default())
        .unwrap();

    assert_eq!(request.chef_environment, "production");
    assert_eq!(request.backing_store, "instance_store");
    assert_eq!(request.image_id, "ami-instance-store");
    assert_eq!(request.count, 2);
    assert_eq!(request.git_branch, "production");
    let zone = request.availability_zone.unwrap();
    assert!(zone == "us-east-1a" || zone == "us-east-1b");
}

#[test]
fn test_env_run_list_and_empty_role_retry() {
    let repo = chef_repo();
    let config = CascadeConfig::load(&repo.path().join(CONFIG_FILE)).unwrap();
    let resolver = Resolver::new(config, Arc::new(RoleDirectory::new(repo.path())));

    let err = resolver
        .expand(
            "unit-simple-none",
            "production",
            &[],
            &OptionMap::new(),
            &ResolveOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, ResolveError::EmptyRole { .. }));

    let retried = resolver
        .expand(
            "unit-simple-none",
            "production",
            &[],
            &OptionMap::new(),
            &ResolveOptions {
                allow_empty_roles: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(retried["chef_role"], json!("unit-simple-none"));

    let staging = resolver
        .expand("web", "staging", &[], &OptionMap::new(), &ResolveOptions::default())
        .unwrap();
    assert_eq!(staging["instance_type"], json!("c3.large"));
}
