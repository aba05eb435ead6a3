//! Module reference resolution.
//!
//! The host never decides what a module reference means. Anything that can
//! turn a string into a fresh [`Unit`] can back an agent; [`ModuleCatalog`] is
//! the in-process implementation used by the binary and the tests.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::ImportError;
use crate::unit::Unit;

#[cfg_attr(test, mockall::automock)]
pub trait ModuleResolver: Send + Sync {
    /// Produces a new, unconfigured instance for `module_ref`.
    fn resolve(&self, module_ref: &str) -> Result<Box<dyn Unit>, ImportError>;
}

pub type UnitFactory = Arc<dyn Fn() -> Box<dyn Unit> + Send + Sync>;

/// Maps module references to unit factories. Clones share the same table, so
/// modules registered after the agent was built are visible to it.
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    factories: Arc<DashMap<String, UnitFactory>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `module_ref`, replacing any previous one.
    pub fn register<F>(&self, module_ref: &str, factory: F) -> &Self
    where
        F: Fn() -> Box<dyn Unit> + Send + Sync + 'static,
    {
        debug!("registering module {}", module_ref);
        self.factories
            .insert(module_ref.to_string(), Arc::new(factory));
        self
    }

    pub fn register_default<U>(&self, module_ref: &str) -> &Self
    where
        U: Unit + Default + 'static,
    {
        self.register(module_ref, || Box::new(U::default()))
    }

    pub fn unregister(&self, module_ref: &str) -> bool {
        self.factories.remove(module_ref).is_some()
    }

    pub fn contains(&self, module_ref: &str) -> bool {
        self.factories.contains_key(module_ref)
    }

    pub fn module_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = self
            .factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        refs.sort();
        refs
    }
}

impl ModuleResolver for ModuleCatalog {
    fn resolve(&self, module_ref: &str) -> Result<Box<dyn Unit>, ImportError> {
        // Clone the factory out so user code never runs under the map lock.
        let factory = self
            .factories
            .get(module_ref)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ImportError::UnknownModule {
                module_ref: module_ref.to_string(),
            })?;
        Ok(factory())
    }
}

impl std::fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("modules", &self.module_refs())
            .finish()
    }
}
