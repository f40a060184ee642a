//! Maps configured resource keys to switch factories.

use std::collections::HashMap;
use std::sync::Arc;

use common::ResourceId;

use crate::{InMemoryResourceManager, Resource, Result, XaError, XaSwitch};

type SwitchFactory = Arc<dyn Fn() -> Arc<dyn XaSwitch> + Send + Sync>;

/// Known XA switches, by resource key.
///
/// Each call to [`SwitchRegistry::resource`] gets a switch from the factory,
/// so every resource-manager instance can own its own connection.
#[derive(Clone, Default)]
pub struct SwitchRegistry {
    factories: HashMap<String, SwitchFactory>,
}

impl SwitchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `key`, replacing any previous one.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn XaSwitch> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    /// Registers an in-memory resource manager. Every resource built from
    /// `key` shares the given instance's state.
    pub fn register_in_memory(&mut self, key: impl Into<String>, rm: InMemoryResourceManager) {
        self.register(key, move || Arc::new(rm.clone()) as Arc<dyn XaSwitch>);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Builds a resource for `key`.
    pub fn resource(&self, id: ResourceId, key: &str) -> Result<Resource> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| XaError::UnknownSwitch(key.to_string()))?;
        Ok(Resource::new(id, key, factory()))
    }
}

impl std::fmt::Debug for SwitchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchRegistry")
            .field("keys", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
