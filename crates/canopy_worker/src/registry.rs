use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Result, WorkerError};
use crate::plugin::Plugin;

/// Plugins available to this process, keyed by `plugin_id`.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Plugin>(&mut self, plugin: P) -> Result<()> {
        self.register_arc(Arc::new(plugin))
    }

    pub fn register_arc(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let plugin_id = plugin.registration().plugin_id;
        if self.plugins.contains_key(&plugin_id) {
            return Err(WorkerError::DuplicatePlugin(plugin_id));
        }
        self.plugins.insert(plugin_id, plugin);
        Ok(())
    }

    pub fn get(&self, plugin_id: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownPlugin(plugin_id.to_string()))
    }

    pub fn plugin_ids(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::EchoPlugin;

    #[test]
    fn test_lookup_by_plugin_id() {
        let mut registry = PluginRegistry::new();
        registry.register(EchoPlugin).unwrap();

        assert!(registry.get("echo").is_ok());
        assert!(matches!(registry.get("ndvi"), Err(WorkerError::UnknownPlugin(_))));
        assert_eq!(registry.plugin_ids().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register(EchoPlugin).unwrap();
        assert!(matches!(
            registry.register(EchoPlugin),
            Err(WorkerError::DuplicatePlugin(id)) if id == "echo"
        ));
    }
}
