//! Show command.

use anyhow::Result;
use clap::Args;
use sprout_cascade::ResolveOptions;

use crate::error::CliError;
use crate::output::{print_json, redact};

use super::CommandContext;

/// Print the options a launch of `role` would resolve to.
#[derive(Debug, Args)]
pub struct ShowCommand {
    /// Chef role.
    role: String,

    /// Chef environment. Defaults to the configured chef_environment.
    environment: Option<String>,

    /// Context overrides to apply, in order.
    #[arg(long, value_delimiter = ',')]
    contexts: Vec<String>,
}

impl ShowCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let resolver = ctx.resolver()?;
        let overrides = Default::default();

        let environment = match self.environment {
            Some(environment) => environment,
            None => resolver
                .default_environment(&overrides)
                .ok_or(CliError::MissingEnvironment)?,
        };

        let options = ResolveOptions {
            allow_empty_roles: true,
            ..ResolveOptions::default()
        };
        let expanded =
            resolver.expand(&self.role, &environment, &self.contexts, &overrides, &options)?;

        print_json(&redact(&expanded));
        Ok(())
    }
}
