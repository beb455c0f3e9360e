//! CLI commands.

mod kill;
mod launch;
mod show;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sprout_cascade::{CascadeConfig, Resolver, RoleDirectory, CONFIG_FILE};
use sprout_provisioner::{ComputeProvider, Credentials, HttpComputeProvider, HttpProviderConfig};
use tracing::debug;

use crate::config::Settings;
use crate::error::CliError;
use crate::output::OutputFormat;

/// sprout - launch instances for a chef role and environment.
#[derive(Debug, Parser)]
#[command(name = "sprout")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Local chef repository checkout.
    #[arg(long, global = true, env = "LOCAL_CHEF_ROOT", default_value = ".")]
    local_chef_root: PathBuf,

    /// Cascade configuration file, relative to the chef root.
    #[arg(long, global = true, env = "SPROUT_CONFIG_FILE", default_value = CONFIG_FILE)]
    config_file: PathBuf,

    /// Compute API endpoint. `{region}` is replaced with the region.
    #[arg(long, global = true, env = "SPROUT_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, global = true, env = "AWS_ACCESS_KEY", hide_env_values = true)]
    aws_access_key: Option<String>,

    #[arg(long, global = true, env = "AWS_SECRET_KEY", hide_env_values = true)]
    aws_secret_key: Option<String>,

    #[arg(long, global = true, env = "AWS_SECURITY_TOKEN", hide_env_values = true)]
    security_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Launch instances for a role.
    Launch(launch::LaunchCommand),

    /// Terminate instances by id.
    Kill(kill::KillCommand),

    /// Print the resolved launch options for a role.
    Show(show::ShowCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let settings = Settings::load()?;

        let ctx = CommandContext {
            settings,
            format: self.format,
            chef_root: self.local_chef_root,
            config_file: self.config_file,
            endpoint: self.endpoint,
            access_key: self.aws_access_key,
            secret_key: self.aws_secret_key,
            session_token: self.security_token,
        };

        match self.command {
            Commands::Launch(cmd) => cmd.run(ctx).await,
            Commands::Kill(cmd) => cmd.run(ctx).await,
            Commands::Show(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("sprout {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub settings: Settings,
    pub format: OutputFormat,
    pub chef_root: PathBuf,
    pub config_file: PathBuf,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
}

impl CommandContext {
    /// Build a resolver over the chef repository and its cascade config.
    pub fn resolver(&self) -> Result<Resolver> {
        let roles = RoleDirectory::new(&self.chef_root);
        if !roles.is_valid() {
            return Err(CliError::NotAChefRoot(self.chef_root.clone()).into());
        }

        let path = self.chef_root.join(&self.config_file);
        debug!(path = %path.display(), "Loading cascade configuration");
        let config = CascadeConfig::load(&path)?;

        Ok(Resolver::new(config, Arc::new(roles)))
    }

    /// HTTP provider for `region`, holding the configured credentials.
    pub fn provider(&self, region: &str) -> Result<Arc<dyn ComputeProvider>> {
        let endpoint = self
            .endpoint
            .clone()
            .or_else(|| self.settings.endpoint.clone())
            .ok_or(CliError::MissingEndpoint)?;

        let credentials = Credentials {
            access_key: self
                .access_key
                .clone()
                .ok_or(CliError::MissingCredentials("access key"))?,
            secret_key: self
                .secret_key
                .clone()
                .ok_or(CliError::MissingCredentials("secret key"))?,
            session_token: self.session_token.clone(),
        };

        let mut config = HttpProviderConfig::new(endpoint, region, credentials);
        config.creation_tags = self.settings.creation_tags;

        let provider = HttpComputeProvider::new(config)?;
        debug!(base_url = provider.base_url(), region, "Using HTTP compute provider");
        Ok(Arc::new(provider))
    }

    /// Identity recorded in the `created_by` tag.
    pub fn created_by(&self) -> String {
        self.settings
            .created_by
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
