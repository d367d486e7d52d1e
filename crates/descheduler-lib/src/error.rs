//! Error types shared across the framework

use crate::api::ExtensionPoint;
use thiserror::Error;

/// A profile cannot be constructed; fatal for that profile only
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("profile {profile:?}: unknown plugin {plugin:?}")]
    UnknownPlugin { profile: String, plugin: String },

    #[error("profile {profile:?}: plugin {plugin:?} is enabled but has no pluginConfig entry")]
    MissingPluginConfig { profile: String, plugin: String },

    #[error("profile {profile:?}: plugin {plugin:?} has more than one pluginConfig entry")]
    DuplicatePluginConfig { profile: String, plugin: String },

    #[error("profile {profile:?}: plugin {plugin:?} is enabled twice in the {stage} stage")]
    DuplicateStageEntry {
        profile: String,
        plugin: String,
        stage: ExtensionPoint,
    },

    #[error("profile {profile:?}: plugin {plugin:?} does not implement the {stage} extension point")]
    CapabilityMismatch {
        profile: String,
        plugin: String,
        stage: ExtensionPoint,
    },

    #[error("plugin {plugin:?}: invalid arguments: {message}")]
    InvalidArgs { plugin: String, message: String },
}

impl ConfigError {
    pub fn invalid_args(plugin: &str, message: impl std::fmt::Display) -> Self {
        ConfigError::InvalidArgs {
            plugin: plugin.to_string(),
            message: message.to_string(),
        }
    }
}

/// A plugin failed while evaluating; recovered at the plugin boundary
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("plugin {plugin:?} failed: {message}")]
pub struct PluginError {
    pub plugin: String,
    pub message: String,
}

impl PluginError {
    pub fn new(plugin: &str, message: impl std::fmt::Display) -> Self {
        Self {
            plugin: plugin.to_string(),
            message: message.to_string(),
        }
    }
}
