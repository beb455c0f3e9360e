//! Bootstrap payload rendering.
//!
//! The payload attached as instance user-data is opaque to the
//! orchestrator; anything implementing [`BootstrapRenderer`] can produce
//! it. [`ScriptRenderer`] fills `{{name}}` placeholders in a shell script.
//!
//! Placeholders land inside double-quoted shell words, so values are
//! limited to characters the shell leaves alone there. Key material is
//! written through quoted heredocs and may hold anything except a line
//! equal to the heredoc terminator.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use sprout_cascade::LaunchRequest;
use tracing::debug;

use crate::error::ProvisionError;

/// Built-in bootstrap script.
pub const DEFAULT_TEMPLATE: &str = include_str!("../templates/bootstrap.sh");

/// Final line the bootstrap script prints on success.
pub const LAST_BOOTSTRAP_LINE: &str = "Sprout bootstrap finished successfully!";

/// Variables written into quoted heredoc bodies.
const HEREDOC_VARIABLES: &[&str] = &["chef_data_bag_secret", "git_key"];

/// Variables that may reference script variables as `${name}`.
const EXPANDING_VARIABLES: &[&str] = &["chef_package_source"];

/// Produces the user-data payload for a launch request.
pub trait BootstrapRenderer: Send + Sync {
    fn render(&self, request: &LaunchRequest) -> Result<String, ProvisionError>;
}

/// Placeholder-substituting shell script renderer.
#[derive(Debug, Clone)]
pub struct ScriptRenderer {
    template: String,
    terminators: Vec<String>,
}

impl Default for ScriptRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE)
    }
}

impl ScriptRenderer {
    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into();
        let terminators = heredoc_terminators(&template);
        Self {
            template,
            terminators,
        }
    }

    fn variables(request: &LaunchRequest) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("chef_role", request.chef_role.clone()),
            ("chef_environment", request.chef_environment.clone()),
            (
                "chef_data_bag_secret",
                read_key_material(&request.chef_data_bag_secret),
            ),
            ("git_key", read_key_material(&request.git_key)),
            ("git_branch", request.git_branch.clone()),
            ("git_origin", request.git_origin.clone()),
            (
                "chef_version",
                request.chef_version.clone().unwrap_or_default(),
            ),
            (
                "chef_package_source",
                request.chef_package_source.clone().unwrap_or_default(),
            ),
            ("instance_hostname", request.instance_hostname.clone()),
            ("instance_domain_name", request.instance_domain_name.clone()),
        ])
    }

    fn check_value(&self, name: &str, value: &str) -> Result<(), ProvisionError> {
        if HEREDOC_VARIABLES.contains(&name) {
            return match value
                .lines()
                .find(|line| self.terminators.iter().any(|t| t.as_str() == *line))
            {
                Some(line) => Err(ProvisionError::Bootstrap(format!(
                    "{} contains the line '{}', which would end its heredoc",
                    name, line
                ))),
                None => Ok(()),
            };
        }

        let literal = if EXPANDING_VARIABLES.contains(&name) {
            without_variable_references(value)
        } else {
            value.to_string()
        };
        match literal.chars().find(|c| !is_shell_safe(*c)) {
            Some(c) => Err(ProvisionError::Bootstrap(format!(
                "{} contains {:?}, which is not allowed in the bootstrap script",
                name, c
            ))),
            None => Ok(()),
        }
    }
}

impl BootstrapRenderer for ScriptRenderer {
    fn render(&self, request: &LaunchRequest) -> Result<String, ProvisionError> {
        let variables = Self::variables(request);
        let mut output = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                ProvisionError::Bootstrap("unterminated placeholder".to_string())
            })?;
            let name = after[..end].trim();
            if name == "last_bootstrap_line" {
                output.push_str(LAST_BOOTSTRAP_LINE);
            } else {
                let value = variables.get(name).ok_or_else(|| {
                    ProvisionError::Bootstrap(format!("unknown template variable '{}'", name))
                })?;
                self.check_value(name, value)?;
                output.push_str(value);
            }
            rest = &after[end + 2..];
        }
        output.push_str(rest);

        debug!(bytes = output.len(), "Rendered bootstrap script");
        Ok(output)
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || " -_.,/:@+=%?&~[]".contains(c)
}

/// Drop `${name}` references, keeping any other `$` so it is rejected.
fn without_variable_references(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end)
                if end > 0
                    && after[..end]
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c == '_') =>
            {
                rest = &after[end + 1..];
            }
            _ => {
                output.push_str("${");
                rest = after;
            }
        }
    }
    output.push_str(rest);
    output
}

/// Terminators of the quoted heredocs (`<<'WORD'`) in a template.
fn heredoc_terminators(template: &str) -> Vec<String> {
    template
        .split("<<'")
        .skip(1)
        .filter_map(|rest| rest.split_once('\'').map(|(word, _)| word.to_string()))
        .collect()
}

/// Use the contents of `value` as a file path when it names a readable
/// file, otherwise the value itself.
pub fn read_key_material(value: &str) -> String {
    let path = Path::new(value);
    if value.is_empty() || value.contains('\n') || !path.is_file() {
        return value.to_string();
    }

    match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Could not read key file, using literal");
            value.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::tests::request;

    #[test]
    fn test_renders_default_template() {
        let script = ScriptRenderer::default().render(&request("production")).unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("role[web]"));
        assert!(script.contains("git clone --branch \"production\""));
        assert!(script.trim_end().ends_with(&format!("echo \"{}\"", LAST_BOOTSTRAP_LINE)));
        assert!(!script.contains("{{"));
    }

    #[test]
    fn test_unknown_variable_is_error() {
        let renderer = ScriptRenderer::new("echo {{nope}}");
        let err = renderer.render(&request("production")).unwrap_err();
        assert!(err.to_string().contains("'nope'"));
    }

    #[test]
    fn test_rejects_values_that_escape_their_quotes() {
        let renderer = ScriptRenderer::default();
        for branch in ["main\"; rm -rf /; \"", "$(reboot)", "`id`", "a\\b", "a\nb"] {
            let mut req = request("production");
            req.git_branch = branch.to_string();
            let err = renderer.render(&req).unwrap_err();
            assert!(err.to_string().contains("git_branch"), "{branch}: {err}");
        }
    }

    #[test]
    fn test_package_source_keeps_variable_references() {
        let mut req = request("production");
        req.chef_package_source =
            Some("https://packages.example.com/chef?v=${chef_version}&m=${arch}".to_string());
        let script = ScriptRenderer::default().render(&req).unwrap();
        assert!(script.contains("v=${chef_version}&m=${arch}"));

        req.chef_package_source = Some("https://example.com/$(whoami)".to_string());
        assert!(ScriptRenderer::default().render(&req).is_err());
    }

    #[test]
    fn test_secret_cannot_end_its_heredoc() {
        let mut req = request("production");
        req.chef_data_bag_secret = "line one\nSECRET\nrm -rf /".to_string();
        let err = ScriptRenderer::default().render(&req).unwrap_err();
        assert!(err.to_string().contains("chef_data_bag_secret"));

        req.chef_data_bag_secret = "quotes \" and $dollars are fine".to_string();
        let script = ScriptRenderer::default().render(&req).unwrap();
        assert!(script.contains("quotes \" and $dollars are fine"));
    }

    #[test]
    fn test_key_material_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy_key");
        fs::write(&path, "-----BEGIN KEY-----").unwrap();

        assert_eq!(
            read_key_material(path.to_str().unwrap()),
            "-----BEGIN KEY-----"
        );
        assert_eq!(read_key_material("literal-secret"), "literal-secret");
    }
}
