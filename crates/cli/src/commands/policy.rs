//! Policy validation and plugin listing

use anyhow::{Context, Result};
use descheduler_lib::{plugins, ExtensionPoint, Handle, Policy, ProfileExecutor};
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;

use crate::output::{
    color_status, print_error, print_json, print_success, print_table, OutputFormat,
};

/// Build result for one profile
#[derive(Debug, Serialize)]
pub struct ProfileCheck {
    pub profile: String,
    pub plugins: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Tabled)]
struct ProfileRow {
    #[tabled(rename = "Profile")]
    profile: String,
    #[tabled(rename = "Plugins")]
    plugins: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Debug, Serialize)]
struct PluginInfo {
    name: String,
    extension_points: Vec<ExtensionPoint>,
}

#[derive(Tabled)]
struct PluginRow {
    #[tabled(rename = "Plugin")]
    name: String,
    #[tabled(rename = "Extension points")]
    extension_points: String,
}

/// Load a policy and build every profile against the built-in registry
pub fn check_policy(path: &Path) -> Result<Vec<ProfileCheck>> {
    let policy =
        Policy::load(path).with_context(|| format!("Invalid policy {}", path.display()))?;
    let registry = plugins::registry();
    let handle = Handle::empty();

    Ok(policy
        .profiles
        .iter()
        .map(|profile| ProfileCheck {
            profile: profile.name.clone(),
            plugins: profile
                .enabled_plugins()
                .into_iter()
                .map(str::to_string)
                .collect(),
            error: ProfileExecutor::build(profile, &registry, &handle)
                .err()
                .map(|err| err.to_string()),
        })
        .collect())
}

/// Validate a policy file; fails when any profile cannot be built
pub fn validate(path: &Path, format: OutputFormat) -> Result<()> {
    let checks = check_policy(path)?;
    let failed = checks.iter().filter(|check| check.error.is_some()).count();

    match format {
        OutputFormat::Json => print_json(&checks)?,
        OutputFormat::Table => {
            let rows = checks
                .iter()
                .map(|check| ProfileRow {
                    profile: check.profile.clone(),
                    plugins: check.plugins.join(", "),
                    status: match &check.error {
                        Some(err) => color_status("error") + ": " + err,
                        None => color_status("ok"),
                    },
                })
                .collect();
            print_table(rows, "Policy has no profiles");
        }
    }

    if failed > 0 {
        print_error(&format!("{} of {} profiles are invalid", failed, checks.len()));
        anyhow::bail!("policy {} is invalid", path.display());
    }
    if format == OutputFormat::Table {
        print_success(&format!("{} is valid", path.display()));
    }
    Ok(())
}

/// List the built-in plugins and their extension points
pub fn list_plugins(format: OutputFormat) -> Result<()> {
    let registry = plugins::registry();
    let plugins: Vec<PluginInfo> = registry
        .entries()
        .map(|(name, entry)| PluginInfo {
            name: name.to_string(),
            extension_points: entry.capabilities.to_vec(),
        })
        .collect();

    match format {
        OutputFormat::Json => print_json(&plugins)?,
        OutputFormat::Table => {
            let rows = plugins
                .iter()
                .map(|plugin| PluginRow {
                    name: plugin.name.clone(),
                    extension_points: plugin
                        .extension_points
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                })
                .collect();
            print_table(rows, "No plugins registered");
        }
    }
    Ok(())
}
