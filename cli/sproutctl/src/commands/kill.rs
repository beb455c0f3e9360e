//! Kill command.

use anyhow::{Context, Result};
use clap::Args;
use sprout_provisioner::{InstanceId, KillPolicy, Orchestrator, OrchestratorSettings};

use crate::output::{print_json, print_success, OutputFormat};

use super::CommandContext;

/// Terminate instances by id.
#[derive(Debug, Args)]
pub struct KillCommand {
    /// Instance ids to terminate.
    #[arg(required = true)]
    instance_ids: Vec<String>,

    /// Region the instances run in. Defaults to the configured region.
    #[arg(long, env = "REGION")]
    region: Option<String>,

    /// Treat unknown instance ids as already terminated.
    #[arg(long)]
    ignore_not_found: bool,
}

impl KillCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let region = self
            .region
            .clone()
            .or_else(|| ctx.settings.default_region.clone())
            .context("No region given. Pass --region or set REGION.")?;

        let orchestrator = Orchestrator::new(
            ctx.provider(&region)?,
            OrchestratorSettings {
                created_by: ctx.created_by(),
                ..OrchestratorSettings::default()
            },
        );

        let ids: Vec<InstanceId> = self
            .instance_ids
            .iter()
            .map(|id| InstanceId::new(id.as_str()))
            .collect();
        let policy = if self.ignore_not_found {
            KillPolicy::IgnoreNotFound
        } else {
            KillPolicy::Strict
        };

        let terminated = orchestrator.kill(&ids, policy).await?;

        match ctx.format {
            OutputFormat::Table => {
                print_success(&format!("Terminated {} instance(s)", terminated.len()));
                for id in &terminated {
                    println!("  {}", id);
                }
            }
            OutputFormat::Json => print_json(&terminated),
        }
        Ok(())
    }
}
