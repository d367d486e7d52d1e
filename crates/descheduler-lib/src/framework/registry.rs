use super::handle::Handle;
use super::types::PluginInstance;
use crate::api::ExtensionPoint;
use crate::error::ConfigError;
use std::collections::BTreeMap;

/// Builds a plugin from its args blob and the cycle handle
pub type PluginFactory = fn(&serde_json::Value, &Handle) -> Result<PluginInstance, ConfigError>;

#[derive(Clone)]
pub struct RegistryEntry {
    pub factory: PluginFactory,
    /// Extension points the plugin implements, for listing
    pub capabilities: &'static [ExtensionPoint],
}

/// Plugin name to factory map
#[derive(Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; a later registration under the same name replaces it
    pub fn register(
        &mut self,
        name: &str,
        capabilities: &'static [ExtensionPoint],
        factory: PluginFactory,
    ) -> &mut Self {
        self.entries.insert(
            name.to_string(),
            RegistryEntry {
                factory,
                capabilities,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered plugins in name order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &RegistryEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Construct a plugin instance
    pub fn instantiate(
        &self,
        profile: &str,
        name: &str,
        args: &serde_json::Value,
        handle: &Handle,
    ) -> Result<PluginInstance, ConfigError> {
        let entry = self.get(name).ok_or_else(|| ConfigError::UnknownPlugin {
            profile: profile.to_string(),
            plugin: name.to_string(),
        })?;
        (entry.factory)(args, handle)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

/// Decode a plugin's args blob; `null` means all defaults
pub fn decode_args<T>(plugin: &str, args: &serde_json::Value) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if args.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(args.clone()).map_err(|e| ConfigError::invalid_args(plugin, e))
}
