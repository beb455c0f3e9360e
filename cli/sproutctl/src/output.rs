//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use sprout_cascade::{OptionMap, SECRET_OPTIONS};
use sprout_provisioner::ProvisionedInstance;
use tabled::{Table, Tabled};

/// Placeholder printed instead of secret values.
const HIDDEN: &str = "<hidden>";

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

#[derive(Debug, Tabled)]
struct InstanceRow {
    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Public IP")]
    public_ip: String,

    #[tabled(rename = "Private IP")]
    private_ip: String,

    #[tabled(rename = "Zone")]
    zone: String,
}

impl From<&ProvisionedInstance> for InstanceRow {
    fn from(instance: &ProvisionedInstance) -> Self {
        Self {
            id: instance.id().to_string(),
            state: instance.state().to_string(),
            public_ip: instance.public_ip_address().unwrap_or("-").to_string(),
            private_ip: instance.private_ip_address().unwrap_or("-").to_string(),
            zone: instance
                .request
                .availability_zone
                .clone()
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Print launched instances.
pub fn print_instances(instances: &[ProvisionedInstance], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if instances.is_empty() {
                println!("{}", "No instances.".dimmed());
            } else {
                let rows: Vec<InstanceRow> = instances.iter().map(InstanceRow::from).collect();
                println!("{}", Table::new(rows));
                println!(
                    "{}",
                    "Install logs will be in /var/log/init and /var/log/init.err".dimmed()
                );
            }
        }
        OutputFormat::Json => print_json(&instances),
    }
}

/// Print a value as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(data: &T) {
    match serde_json::to_string_pretty(data) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("{} failed to encode output: {}", "Error:".red().bold(), e),
    }
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Print a warning to stderr.
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "Warning:".yellow().bold(), message);
}

/// Replace secret option values with a placeholder.
pub fn redact(options: &OptionMap) -> OptionMap {
    options
        .iter()
        .map(|(key, value)| {
            let value = if SECRET_OPTIONS.contains(&key.as_str()) && !value.is_null() {
                Value::String(HIDDEN.to_string())
            } else {
                value.clone()
            };
            (key.clone(), value)
        })
        .collect()
}

/// Lines describing launch options, sorted by key, secrets hidden.
pub fn describe_options(options: &OptionMap) -> Vec<String> {
    redact(options)
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| match value {
            Value::String(s) => format!("  {}: {}", key, s),
            other => format!("  {}: {}", key, other),
        })
        .collect()
}
