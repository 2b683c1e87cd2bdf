//! Plugin catalog - the descriptors the supervisor may mount by name

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::application::errors::BotError;
use crate::infrastructure::config::Config;

use super::descriptor::PluginDescriptor;
use super::{core, dice};

/// Known plugins, keyed by lowercase name
#[derive(Debug, Default, Clone)]
pub struct PluginCatalog {
    plugins: BTreeMap<String, Arc<PluginDescriptor>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the core surface and every bundled plugin
    pub fn builtin(config: &Config) -> Result<Self, BotError> {
        let mut catalog = Self::new();
        catalog.register(core::descriptor(&config.prefix)?)?;
        catalog.register(dice::descriptor()?)?;
        Ok(catalog)
    }

    pub fn register(&mut self, plugin: PluginDescriptor) -> Result<(), BotError> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(BotError::lifecycle(format!("plugin '{}' already registered", name)));
        }

        info!(plugin = %name, commands = plugin.commands().len(), "registered plugin");
        self.plugins.insert(name, Arc::new(plugin));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins.get(&name.to_lowercase()).cloned()
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// Core plugins, mounted before anything else
    pub fn core_plugins(&self) -> impl Iterator<Item = &Arc<PluginDescriptor>> {
        self.plugins.values().filter(|p| p.is_core())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = PluginCatalog::builtin(&Config::default()).unwrap();
        assert!(catalog.has_plugin("DICE"));
        assert_eq!(catalog.core_plugins().map(|p| p.name()).collect::<Vec<_>>(), vec!["core"]);
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["core", "dice"]);
    }

    #[test]
    fn test_register_twice_fails() {
        let mut catalog = PluginCatalog::new();
        catalog.register(PluginDescriptor::builder("echo").build().unwrap()).unwrap();
        let err = catalog
            .register(PluginDescriptor::builder("echo").build().unwrap())
            .unwrap_err();
        assert!(matches!(err, BotError::Lifecycle(_)));
    }
}
