//! User settings.
//!
//! Handles:
//! - Compute endpoint
//! - Identity recorded on launched instances
//! - Default region for `kill`

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Settings file name.
const SETTINGS_FILE: &str = "config.json";

/// Get the settings directory path.
fn config_dir() -> Result<PathBuf> {
    ProjectDirs::from("com", "sprout", "sprout")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}

/// CLI user settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Compute API endpoint. May contain a `{region}` placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Identity for the `created_by` tag. Defaults to `$USER`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_region: Option<String>,

    /// Whether the endpoint accepts tags in the create call.
    #[serde(default = "default_creation_tags")]
    pub creation_tags: bool,
}

fn default_creation_tags() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            created_by: None,
            default_region: None,
            creation_tags: default_creation_tags(),
        }
    }
}

impl Settings {
    /// Load settings from disk, or return defaults.
    pub fn load() -> Result<Self> {
        let path = config_dir()?.join(SETTINGS_FILE);
        Self::load_from(&path)
    }

    fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings from {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("config.json")).unwrap();
        assert!(settings.endpoint.is_none());
        assert!(settings.creation_tags);
    }

    #[test]
    fn test_load_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"endpoint": "https://compute.{region}.example.com", "created_by": "ops"}"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.created_by.as_deref(), Some("ops"));
        assert!(settings.creation_tags);
    }
}
