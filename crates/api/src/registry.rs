//! Name-keyed installer lookup, frozen after startup.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use kon_core::{KonError, KonResult};
use tracing::warn;

use crate::Installer;

#[derive(Default)]
pub struct RegistryBuilder {
    entries: BTreeMap<String, Arc<dyn Installer>>,
}

impl RegistryBuilder {
    pub fn new() -> Self { Self::default() }

    /// Add an installer; a second installer with the same name is `DuplicateComponent`.
    pub fn register(mut self, installer: Arc<dyn Installer>) -> KonResult<Self> {
        let name = installer.name().to_string();
        if self.entries.contains_key(&name) {
            return Err(KonError::DuplicateComponent(name));
        }
        self.entries.insert(name, installer);
        Ok(self)
    }

    /// Add or replace; the last registration for a name wins.
    pub fn register_override(mut self, installer: Arc<dyn Installer>) -> Self {
        let name = installer.name().to_string();
        if self.entries.insert(name.clone(), installer).is_some() {
            warn!(component = %name, "installer replaced");
        }
        self
    }

    pub fn build(self) -> Registry { Registry { entries: self.entries } }
}

/// Immutable after [`RegistryBuilder::build`]; share it behind an `Arc`.
pub struct Registry {
    entries: BTreeMap<String, Arc<dyn Installer>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder { RegistryBuilder::new() }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Installer>> { self.entries.get(name).cloned() }

    pub fn resolve(&self, name: &str) -> KonResult<Arc<dyn Installer>> { self.get(name).ok_or_else(|| KonError::UnknownComponent(name.to_string())) }

    /// Registered names, sorted. Not an install order; see [`Catalogue`].
    pub fn names(&self) -> impl Iterator<Item = &str> { self.entries.keys().map(String::as_str) }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// Ordered component names for "install everything". Order is install order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalogue {
    names: Vec<String>,
}

impl Catalogue {
    pub fn new(names: &[&str]) -> Self { Self { names: names.iter().map(|s| s.to_string()).collect() } }

    pub fn names(&self) -> &[String] { &self.names }

    /// Every name registered, none repeated.
    pub fn validate(&self, registry: &Registry) -> KonResult<()> {
        let mut seen = HashSet::new();
        for name in &self.names {
            if !seen.insert(name.as_str()) {
                return Err(KonError::DuplicateComponent(name.clone()));
            }
            registry.resolve(name)?;
        }
        Ok(())
    }
}
