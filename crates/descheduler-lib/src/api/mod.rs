//! Descheduler policy document
//!
//! The policy follows the `descheduler/v1alpha2` `DeschedulerPolicy` shape:
//! an ordered list of profiles, each pairing plugin arguments with the
//! extension points the plugins are enabled for, plus cluster-wide eviction
//! ceilings and metrics configuration.

use crate::error::ConfigError;
use crate::models::{LabelSelector, SelectorError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

pub const API_VERSION: &str = "descheduler/v1alpha2";
pub const KIND: &str = "DeschedulerPolicy";

/// Errors that reject a whole policy document
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse policy JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported policy {field} {value:?} (expected {expected:?})")]
    UnsupportedVersion {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("profile name must not be empty")]
    EmptyProfileName,

    #[error("duplicate profile name {0:?}")]
    DuplicateProfile(String),

    #[error("invalid node selector: {0}")]
    NodeSelector(#[from] SelectorError),

    #[error("metricsCollector and prometheus cannot be enabled at the same time")]
    ConflictingMetricsSources,

    #[error("prometheus url must not be empty")]
    MissingPrometheusUrl,
}

/// One of the six pipeline stages a plugin can be enabled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExtensionPoint {
    PreSort,
    Sort,
    Deschedule,
    Balance,
    Filter,
    PreEvictionFilter,
}

impl ExtensionPoint {
    pub const ALL: [ExtensionPoint; 6] = [
        ExtensionPoint::PreSort,
        ExtensionPoint::Sort,
        ExtensionPoint::Deschedule,
        ExtensionPoint::Balance,
        ExtensionPoint::Filter,
        ExtensionPoint::PreEvictionFilter,
    ];
}

impl std::fmt::Display for ExtensionPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtensionPoint::PreSort => write!(f, "presort"),
            ExtensionPoint::Sort => write!(f, "sort"),
            ExtensionPoint::Deschedule => write!(f, "deschedule"),
            ExtensionPoint::Balance => write!(f, "balance"),
            ExtensionPoint::Filter => write!(f, "filter"),
            ExtensionPoint::PreEvictionFilter => write!(f, "preevictionfilter"),
        }
    }
}

/// Top-level policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub profiles: Vec<Profile>,

    /// Label selector restricting the nodes the descheduler operates on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_no_of_pods_to_evict_per_node: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_no_of_pods_to_evict_per_namespace: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_no_of_pods_to_evict_total: Option<u32>,

    #[serde(default)]
    pub metrics_collector: MetricsCollector,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<Prometheus>,
}

/// Enables utilization collection from the in-cluster metrics API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsCollector {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prometheus {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub auth_token: AuthToken,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_reference: Option<SecretReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretReference {
    pub namespace: String,
    pub name: String,
}

/// A named set of plugins and their stage assignment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub plugin_config: Vec<PluginConfig>,
    #[serde(default)]
    pub plugins: Plugins,
}

/// Arguments for one plugin; the blob is interpreted by the plugin itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plugins {
    #[serde(default, rename = "presort")]
    pub pre_sort: PluginSet,
    #[serde(default)]
    pub sort: PluginSet,
    #[serde(default)]
    pub deschedule: PluginSet,
    #[serde(default)]
    pub balance: PluginSet,
    #[serde(default)]
    pub filter: PluginSet,
    #[serde(default, rename = "preevictionfilter")]
    pub pre_eviction_filter: PluginSet,
}

impl Plugins {
    pub fn stage(&self, point: ExtensionPoint) -> &PluginSet {
        match point {
            ExtensionPoint::PreSort => &self.pre_sort,
            ExtensionPoint::Sort => &self.sort,
            ExtensionPoint::Deschedule => &self.deschedule,
            ExtensionPoint::Balance => &self.balance,
            ExtensionPoint::Filter => &self.filter,
            ExtensionPoint::PreEvictionFilter => &self.pre_eviction_filter,
        }
    }

    pub fn stage_mut(&mut self, point: ExtensionPoint) -> &mut PluginSet {
        match point {
            ExtensionPoint::PreSort => &mut self.pre_sort,
            ExtensionPoint::Sort => &mut self.sort,
            ExtensionPoint::Deschedule => &mut self.deschedule,
            ExtensionPoint::Balance => &mut self.balance,
            ExtensionPoint::Filter => &mut self.filter,
            ExtensionPoint::PreEvictionFilter => &mut self.pre_eviction_filter,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSet {
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub disabled: Vec<String>,
}

impl PluginSet {
    /// Enabled plugins that are not also disabled, in configured order
    pub fn effective(&self) -> Vec<&str> {
        self.enabled
            .iter()
            .filter(|name| !self.disabled.contains(name))
            .map(String::as_str)
            .collect()
    }
}

impl Profile {
    /// Start building a profile programmatically
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a plugin configuration and enable it for the given stages
    pub fn with_plugin(
        mut self,
        name: &str,
        args: serde_json::Value,
        stages: &[ExtensionPoint],
    ) -> Self {
        self.plugin_config.push(PluginConfig {
            name: name.to_string(),
            args,
        });
        for stage in stages {
            self.plugins.stage_mut(*stage).enabled.push(name.to_string());
        }
        self
    }

    /// Arguments configured for `plugin`
    pub fn args_for(&self, plugin: &str) -> Option<&serde_json::Value> {
        self.plugin_config
            .iter()
            .find(|c| c.name == plugin)
            .map(|c| &c.args)
    }

    /// Every distinct plugin referenced by a stage, in first-seen order
    pub fn enabled_plugins(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for point in ExtensionPoint::ALL {
            for name in self.plugins.stage(point).effective() {
                if seen.insert(name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Check the stage assignment against the plugin configuration list
    pub fn validate(&self) -> Result<(), ConfigError> {
        for point in ExtensionPoint::ALL {
            let mut seen = HashSet::new();
            for name in self.plugins.stage(point).effective() {
                if !seen.insert(name) {
                    return Err(ConfigError::DuplicateStageEntry {
                        profile: self.name.clone(),
                        plugin: name.to_string(),
                        stage: point,
                    });
                }
            }
        }

        for name in self.enabled_plugins() {
            let count = self.plugin_config.iter().filter(|c| c.name == name).count();
            match count {
                0 => {
                    return Err(ConfigError::MissingPluginConfig {
                        profile: self.name.clone(),
                        plugin: name.to_string(),
                    })
                }
                1 => {}
                _ => {
                    return Err(ConfigError::DuplicatePluginConfig {
                        profile: self.name.clone(),
                        plugin: name.to_string(),
                    })
                }
            }
        }

        Ok(())
    }
}

impl Policy {
    pub fn from_yaml_str(raw: &str) -> Result<Self, PolicyError> {
        let policy: Policy = serde_yaml::from_str(raw)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PolicyError> {
        let policy: Policy = serde_json::from_str(raw)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Load a policy file; `.json` files are parsed as JSON, anything else as YAML
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    /// Policy-level validation; profile contents are checked when each
    /// profile is built so that one bad profile does not reject the others
    pub fn validate(&self) -> Result<(), PolicyError> {
        if let Some(version) = &self.api_version {
            if version != API_VERSION {
                return Err(PolicyError::UnsupportedVersion {
                    field: "apiVersion",
                    value: version.clone(),
                    expected: API_VERSION,
                });
            }
        }
        if let Some(kind) = &self.kind {
            if kind != KIND {
                return Err(PolicyError::UnsupportedVersion {
                    field: "kind",
                    value: kind.clone(),
                    expected: KIND,
                });
            }
        }

        let mut names = HashSet::new();
        for profile in &self.profiles {
            if profile.name.trim().is_empty() {
                return Err(PolicyError::EmptyProfileName);
            }
            if !names.insert(profile.name.as_str()) {
                return Err(PolicyError::DuplicateProfile(profile.name.clone()));
            }
        }

        self.node_selector()?;

        if let Some(prometheus) = &self.prometheus {
            if prometheus.url.trim().is_empty() {
                return Err(PolicyError::MissingPrometheusUrl);
            }
            if self.metrics_collector.enabled {
                return Err(PolicyError::ConflictingMetricsSources);
            }
        }

        Ok(())
    }

    /// Parsed node selector; `None` selects every node
    pub fn node_selector(&self) -> Result<Option<LabelSelector>, SelectorError> {
        self.node_selector
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(LabelSelector::parse)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const POLICY_YAML: &str = r#"
apiVersion: "descheduler/v1alpha2"
kind: "DeschedulerPolicy"
nodeSelector: "node-role.kubernetes.io/worker="
maxNoOfPodsToEvictPerNode: 5
maxNoOfPodsToEvictTotal: 20
profiles:
  - name: ProfileName
    pluginConfig:
      - name: "DefaultEvictor"
        args:
          evictLocalStoragePods: true
      - name: "RemoveFailedPods"
        args:
          reasons: ["OutOfcpu"]
          minPodLifetimeSeconds: 3600
    plugins:
      filter:
        enabled: ["DefaultEvictor"]
      preevictionfilter:
        enabled: ["DefaultEvictor"]
      deschedule:
        enabled: ["RemoveFailedPods"]
"#;

    #[test]
    fn test_parse_yaml_policy() {
        let policy = Policy::from_yaml_str(POLICY_YAML).unwrap();

        assert_eq!(policy.profiles.len(), 1);
        assert_eq!(policy.max_no_of_pods_to_evict_per_node, Some(5));
        assert_eq!(policy.max_no_of_pods_to_evict_per_namespace, None);
        assert_eq!(policy.max_no_of_pods_to_evict_total, Some(20));

        let profile = &policy.profiles[0];
        assert_eq!(profile.plugins.deschedule.effective(), vec!["RemoveFailedPods"]);
        assert_eq!(
            profile.args_for("RemoveFailedPods").unwrap()["minPodLifetimeSeconds"],
            3600
        );
        assert_eq!(
            profile.enabled_plugins(),
            vec!["RemoveFailedPods", "DefaultEvictor"]
        );
        assert!(profile.validate().is_ok());

        let selector = policy.node_selector().unwrap().unwrap();
        assert_eq!(selector.match_labels.len(), 1);
    }

    #[test]
    fn test_load_json_policy_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"profiles":[{{"name":"p","pluginConfig":[],"plugins":{{}}}}]}}"#
        )
        .unwrap();

        let policy = Policy::load(file.path()).unwrap();
        assert_eq!(policy.profiles[0].name, "p");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Policy::load("/nonexistent/policy.yaml").unwrap_err();
        assert!(matches!(err, PolicyError::Io { .. }));
    }

    #[test]
    fn test_rejects_wrong_api_version() {
        let err = Policy::from_yaml_str("apiVersion: descheduler/v1alpha1\n").unwrap_err();
        assert!(matches!(
            err,
            PolicyError::UnsupportedVersion {
                field: "apiVersion",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_duplicate_profiles() {
        let raw = "profiles:\n  - name: a\n  - name: a\n";
        assert!(matches!(
            Policy::from_yaml_str(raw),
            Err(PolicyError::DuplicateProfile(name)) if name == "a"
        ));
    }

    #[test]
    fn test_rejects_conflicting_metrics_sources() {
        let raw = "metricsCollector:\n  enabled: true\nprometheus:\n  url: http://prom:9090\n";
        assert!(matches!(
            Policy::from_yaml_str(raw),
            Err(PolicyError::ConflictingMetricsSources)
        ));
    }

    #[test]
    fn test_disabled_plugins_are_removed_from_stage() {
        let set = PluginSet {
            enabled: vec!["A".into(), "B".into(), "C".into()],
            disabled: vec!["B".into()],
        };
        assert_eq!(set.effective(), vec!["A", "C"]);
    }

    #[test]
    fn test_profile_validation_errors() {
        let missing = Profile::new("p");
        let mut missing = missing;
        missing.plugins.deschedule.enabled.push("RemoveFailedPods".into());
        assert!(matches!(
            missing.validate(),
            Err(ConfigError::MissingPluginConfig { .. })
        ));

        let duplicate = Profile::new("p")
            .with_plugin("A", serde_json::Value::Null, &[ExtensionPoint::Deschedule])
            .with_plugin("A", serde_json::Value::Null, &[]);
        assert!(matches!(
            duplicate.validate(),
            Err(ConfigError::DuplicatePluginConfig { .. })
        ));

        let twice = Profile::new("p").with_plugin(
            "A",
            serde_json::Value::Null,
            &[ExtensionPoint::Deschedule, ExtensionPoint::Deschedule],
        );
        assert!(matches!(
            twice.validate(),
            Err(ConfigError::DuplicateStageEntry { .. })
        ));
    }
}
