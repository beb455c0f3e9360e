//! Launch command.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use serde_json::Value;
use sprout_cascade::{LaunchRequest, OptionMap, ResolveError, ResolveOptions, Resolver};
use sprout_provisioner::{
    ComputeProvider, LaunchOptions, MockProvider, Orchestrator, OrchestratorSettings,
    DEFAULT_POLL_INTERVAL,
};
use sprout_retry::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use tracing::info;

use crate::error::CliError;
use crate::output::{describe_options, print_instances, print_success, print_warning};

use super::CommandContext;

/// Launch instances for a role.
#[derive(Debug, Args)]
pub struct LaunchCommand {
    /// Chef role to launch.
    role: String,

    /// Chef environment. Defaults to the configured chef_environment.
    #[arg(long, env = "CHEF_ENVIRONMENT")]
    environment: Option<String>,

    /// Context overrides from the role metadata to apply, in order.
    #[arg(long, value_delimiter = ',')]
    contexts: Vec<String>,

    #[command(flatten)]
    options: LaunchFlags,

    /// Skip the confirmation prompt.
    #[arg(long, env = "NON_INTERACTIVE")]
    non_interactive: bool,

    /// Return as soon as the instances are created.
    #[arg(long)]
    no_wait: bool,

    /// Run against an in-memory provider instead of the compute API.
    #[arg(long)]
    dry_run: bool,

    /// Attempts per instance for tagging, linking and protection calls.
    #[arg(long, env = "BATCH_OPERATION_RETRIES", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    batch_operation_retries: u32,

    /// Seconds to wait for instances to reach the running state.
    #[arg(long, env = "READY_TIMEOUT", default_value_t = 300)]
    ready_timeout: u64,
}

/// Flags that override launch options. Each maps to the option of the same
/// name (dashes become underscores).
#[derive(Debug, Default, Args)]
struct LaunchFlags {
    #[arg(long, env = "CHEF_DATA_BAG_SECRET", hide_env_values = true)]
    chef_data_bag_secret: Option<String>,
    #[arg(long, env = "CHEF_PACKAGE_SOURCE")]
    chef_package_source: Option<String>,
    #[arg(long, env = "CHEF_VERSION")]
    chef_version: Option<String>,
    /// Cookbook attribute files (`cookbook::file`), comma separated.
    #[arg(long, env = "CHEF_COOKBOOK_ATTRIBUTES", value_delimiter = ',')]
    chef_cookbook_attributes: Vec<String>,
    #[arg(long, env = "GIT_BRANCH")]
    git_branch: Option<String>,
    /// Deploy key, or a path to it.
    #[arg(long, env = "GIT_KEY", hide_env_values = true)]
    git_key: Option<String>,
    #[arg(long, env = "GIT_ORIGIN")]
    git_origin: Option<String>,
    #[arg(long, env = "KEY_NAME")]
    key_name: Option<String>,
    #[arg(long, env = "INSTANCE_TYPE")]
    instance_type: Option<String>,
    #[arg(long, env = "IMAGE_ID")]
    image_id: Option<String>,
    #[arg(long, env = "REGION")]
    region: Option<String>,
    #[arg(long, env = "AVAILABILITY_ZONE")]
    availability_zone: Option<String>,
    #[arg(long, env = "COUNT")]
    count: Option<u32>,
    #[arg(long, env = "BACKING_STORE")]
    backing_store: Option<String>,
    /// Security group names or `sg-` ids, comma separated.
    #[arg(long, env = "SECURITY_GROUPS", value_delimiter = ',')]
    security_groups: Vec<String>,
    #[arg(long, env = "IAM_ROLE")]
    iam_role: Option<String>,
    #[arg(long, env = "PLACEMENT_GROUP")]
    placement_group: Option<String>,
    #[arg(long)]
    ebs_optimized: bool,
    /// Block device mappings as a JSON array.
    #[arg(long, env = "BLOCK_DEVICE_MAPPINGS")]
    block_device_mappings: Option<String>,
    /// Ephemeral device names, comma separated.
    #[arg(long, env = "EPHEMERAL_DEVICES", value_delimiter = ',')]
    ephemeral_devices: Vec<String>,
    #[arg(long, env = "VPC_ID")]
    vpc_id: Option<String>,
    #[arg(long, env = "VPC_SUBNET_ID")]
    vpc_subnet_id: Option<String>,
    #[arg(long, env = "PRIVATE_IP_ADDRESS")]
    private_ip_address: Option<String>,
    #[arg(long)]
    dedicated_tenancy: bool,
    #[arg(long)]
    associate_public_ip_address: bool,
    #[arg(long)]
    termination_protection: bool,
    /// VPC to classic link instances into.
    #[arg(long, env = "CLASSIC_LINK_VPC_ID")]
    classic_link_vpc_id: Option<String>,
    /// Security group ids for the classic link, comma separated.
    #[arg(long, env = "CLASSIC_LINK_SECURITY_GROUP_IDS", value_delimiter = ',')]
    classic_link_security_group_ids: Vec<String>,
    #[arg(long, env = "INSTANCE_INITIATED_SHUTDOWN_BEHAVIOR")]
    instance_initiated_shutdown_behavior: Option<String>,
    #[arg(long, env = "INSTANCE_HOSTNAME")]
    instance_hostname: Option<String>,
    #[arg(long, env = "INSTANCE_DOMAIN_NAME")]
    instance_domain_name: Option<String>,
    /// Tags as `key=value` pairs, comma separated.
    #[arg(long, env = "TAGS")]
    tags: Option<String>,
    /// Pre-rendered user data. Skips the bootstrap script.
    #[arg(long, env = "USER_DATA")]
    user_data: Option<String>,
}

impl LaunchFlags {
    /// Options given on the command line. Unset flags are left out so lower
    /// layers apply.
    fn overrides(&self) -> Result<OptionMap, CliError> {
        let mut options = OptionMap::new();

        let strings = [
            ("chef_data_bag_secret", &self.chef_data_bag_secret),
            ("chef_package_source", &self.chef_package_source),
            ("chef_version", &self.chef_version),
            ("git_branch", &self.git_branch),
            ("git_key", &self.git_key),
            ("git_origin", &self.git_origin),
            ("key_name", &self.key_name),
            ("instance_type", &self.instance_type),
            ("image_id", &self.image_id),
            ("region", &self.region),
            ("availability_zone", &self.availability_zone),
            ("backing_store", &self.backing_store),
            ("iam_role", &self.iam_role),
            ("placement_group", &self.placement_group),
            ("vpc_id", &self.vpc_id),
            ("vpc_subnet_id", &self.vpc_subnet_id),
            ("private_ip_address", &self.private_ip_address),
            (
                "instance_initiated_shutdown_behavior",
                &self.instance_initiated_shutdown_behavior,
            ),
            ("instance_hostname", &self.instance_hostname),
            ("instance_domain_name", &self.instance_domain_name),
            ("user_data", &self.user_data),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                options.insert(key.to_string(), Value::String(value.clone()));
            }
        }

        let lists = [
            ("chef_cookbook_attributes", &self.chef_cookbook_attributes),
            ("security_groups", &self.security_groups),
            ("ephemeral_devices", &self.ephemeral_devices),
        ];
        for (key, values) in lists {
            if !values.is_empty() {
                options.insert(key.to_string(), Value::from(values.clone()));
            }
        }

        let flags = [
            ("ebs_optimized", self.ebs_optimized),
            ("dedicated_tenancy", self.dedicated_tenancy),
            ("associate_public_ip_address", self.associate_public_ip_address),
            ("termination_protection", self.termination_protection),
        ];
        for (key, set) in flags {
            if set {
                options.insert(key.to_string(), Value::Bool(true));
            }
        }

        if let Some(count) = self.count {
            options.insert("count".to_string(), Value::from(count));
        }

        if let Some(mappings) = &self.block_device_mappings {
            let parsed: Value =
                serde_json::from_str(mappings).map_err(|e| CliError::InvalidFlag {
                    flag: "block-device-mappings",
                    message: e.to_string(),
                })?;
            options.insert("block_device_mappings".to_string(), parsed);
        }

        if let Some(vpc_id) = &self.classic_link_vpc_id {
            options.insert(
                "classic_link".to_string(),
                serde_json::json!({
                    "vpc_id": vpc_id,
                    "security_group_ids": self.classic_link_security_group_ids,
                }),
            );
        }

        if let Some(tags) = &self.tags {
            let tags: serde_json::Map<String, Value> = parse_tags(tags)?
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            options.insert("tags".to_string(), Value::Object(tags));
        }

        Ok(options)
    }
}

/// Parse `key=value,key2=value2`.
fn parse_tags(input: &str) -> Result<BTreeMap<String, String>, CliError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(CliError::InvalidTag(pair.to_string())),
        })
        .collect()
}

impl LaunchCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let resolver = ctx.resolver()?;
        let overrides = self.options.overrides()?;

        let environment = match &self.environment {
            Some(environment) => environment.clone(),
            None => resolver
                .default_environment(&overrides)
                .ok_or(CliError::MissingEnvironment)?,
        };

        let request = self.resolve(&resolver, &environment, &overrides)?;

        eprintln!(
            "Launching {} instance(s) of {} in {} with options:",
            request.count, request.chef_role, request.chef_environment
        );
        for line in describe_options(&request_options(&request)?) {
            eprintln!("{}", line);
        }

        if !self.non_interactive && !confirm("Launch?")? {
            return Err(CliError::Aborted.into());
        }

        let provider: Arc<dyn ComputeProvider> = if self.dry_run {
            print_warning("Dry run, using the in-memory provider");
            Arc::new(MockProvider::new())
        } else {
            ctx.provider(&request.region)?
        };

        let settings = OrchestratorSettings {
            created_by: ctx.created_by(),
            retry_policy: RetryPolicy::new(self.batch_operation_retries, DEFAULT_BASE_DELAY),
            poll_interval: DEFAULT_POLL_INTERVAL,
            ready_timeout: Duration::from_secs(self.ready_timeout),
            ..OrchestratorSettings::default()
        };
        let orchestrator = Orchestrator::new(provider, settings);

        let options = LaunchOptions {
            wait: !self.no_wait,
        };
        let instances = orchestrator.launch(request, options).await?;

        info!(count = instances.len(), "Launch complete");
        if ctx.format == crate::output::OutputFormat::Table {
            print_success(&format!("Launched {} instance(s)", instances.len()));
        }
        print_instances(&instances, ctx.format);
        Ok(())
    }

    /// Resolve the request, offering one retry that accepts a role without
    /// launch metadata.
    fn resolve(
        &self,
        resolver: &Resolver,
        environment: &str,
        overrides: &OptionMap,
    ) -> Result<LaunchRequest> {
        let options = ResolveOptions::default();
        match resolver.resolve(&self.role, environment, &self.contexts, overrides, &options) {
            Err(ResolveError::EmptyRole { role }) => {
                print_warning(&format!(
                    "Role {} has no launch metadata, only defaults and flags will apply",
                    role
                ));
                if !self.non_interactive && !confirm("Continue anyway?")? {
                    return Err(CliError::Aborted.into());
                }

                let options = ResolveOptions {
                    allow_empty_roles: true,
                    ..options
                };
                Ok(resolver.resolve(&self.role, environment, &self.contexts, overrides, &options)?)
            }
            other => Ok(other?),
        }
    }
}

fn request_options(request: &LaunchRequest) -> Result<OptionMap> {
    match serde_json::to_value(request)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Ok(OptionMap::new()),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{} [y/N] ", prompt);
    io::stderr().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("team=infra", &[("team", "infra")])]
    #[case("team=infra, owner = ops", &[("owner", "ops"), ("team", "infra")])]
    #[case("empty=", &[("empty", "")])]
    #[case("", &[])]
    fn test_parse_tags(#[case] input: &str, #[case] expected: &[(&str, &str)]) {
        let tags = parse_tags(input).unwrap();
        let expected: BTreeMap<String, String> = expected
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(tags, expected);
    }

    #[rstest]
    #[case("novalue")]
    #[case("=value")]
    fn test_parse_tags_rejects(#[case] input: &str) {
        assert!(matches!(parse_tags(input), Err(CliError::InvalidTag(_))));
    }

    #[test]
    fn test_overrides_only_include_set_flags() {
        let flags = LaunchFlags {
            instance_type: Some("m3.large".to_string()),
            count: Some(3),
            security_groups: vec!["sg-1".to_string(), "web".to_string()],
            termination_protection: true,
            tags: Some("team=infra".to_string()),
            classic_link_vpc_id: Some("vpc-1".to_string()),
            ..LaunchFlags::default()
        };

        let options = flags.overrides().unwrap();
        assert_eq!(options["instance_type"], "m3.large");
        assert_eq!(options["count"], 3);
        assert_eq!(options["security_groups"], serde_json::json!(["sg-1", "web"]));
        assert_eq!(options["termination_protection"], true);
        assert_eq!(options["tags"], serde_json::json!({"team": "infra"}));
        assert_eq!(options["classic_link"]["vpc_id"], "vpc-1");
        assert!(!options.contains_key("region"));
        assert!(!options.contains_key("ebs_optimized"));
    }

    #[test]
    fn test_bad_block_device_mappings() {
        let flags = LaunchFlags {
            block_device_mappings: Some("not json".to_string()),
            ..LaunchFlags::default()
        };
        assert!(matches!(
            flags.overrides(),
            Err(CliError::InvalidFlag { flag: "block-device-mappings", .. })
        ));
    }
}
