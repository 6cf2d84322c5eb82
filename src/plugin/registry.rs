//! Plugin registry and dependency resolution.
//!
//! The registry owns the canonical plugin set and each plugin's lifecycle
//! state. Registration order is preserved: it breaks ties during resolution,
//! which keeps the resolved order stable across runs.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::types::{Plugin, PluginKind, PluginState};
use crate::error::{Error, Result};

struct Entry {
    plugin: Arc<dyn Plugin>,
    state: PluginState,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Registry of plugins keyed by name.
#[derive(Default)]
pub struct PluginRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin. The registry is left unchanged if the name is taken.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.name().to_string();
        if self.index.contains_key(&name) {
            return Err(Error::DuplicatePlugin { name });
        }
        debug!(plugin = %name, version = %plugin.metadata().version, "registered plugin");
        self.index.insert(name, self.entries.len());
        self.entries.push(Entry {
            plugin,
            state: PluginState::Registered,
        });
        Ok(())
    }

    /// Remove a plugin, keeping the relative order of the remaining ones.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Plugin>> {
        let pos = self.index.remove(name)?;
        let entry = self.entries.remove(pos);
        for idx in self.index.values_mut() {
            if *idx > pos {
                *idx -= 1;
            }
        }
        debug!(plugin = %name, "unregistered plugin");
        Some(entry.plugin)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.index.get(name).map(|&i| &self.entries[i].plugin)
    }

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.index.get(name).map(|&i| self.entries[i].state)
    }

    pub(crate) fn set_state(&mut self, name: &str, state: PluginState) {
        if let Some(&i) = self.index.get(name) {
            self.entries[i].state = state;
        }
    }

    /// Plugin names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.plugin.name()).collect()
    }

    pub fn find_by_kind(&self, kind: PluginKind) -> Vec<&Arc<dyn Plugin>> {
        self.entries
            .iter()
            .filter(|e| e.plugin.metadata().kind == kind)
            .map(|e| &e.plugin)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compute an initialization order in which every plugin follows all of
    /// its dependencies.
    ///
    /// Depth-first over the dependency graph, derived fresh from the current
    /// plugin set on every call. Roots are taken in registration order and
    /// dependencies in declaration order, so the result is deterministic.
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(self.entries.len());
        let mut path: Vec<&str> = Vec::new();
        let mut order: Vec<String> = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            self.visit(entry.plugin.name(), &mut marks, &mut path, &mut order)?;
        }

        debug!(order = ?order, "resolved plugin order");
        Ok(order)
    }

    /// Resolve and return the plugins themselves, in initialization order.
    pub fn resolve_plugins(&self) -> Result<Vec<Arc<dyn Plugin>>> {
        let order = self.resolve_order()?;
        Ok(order
            .iter()
            .map(|name| Arc::clone(&self.entries[self.index[name.as_str()]].plugin))
            .collect())
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                // `path` always contains `name` when it is in progress.
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(name.to_string());
                return Err(Error::CyclicDependency { path: cycle });
            }
            None => {}
        }

        let entry = &self.entries[self.index[name]];
        marks.insert(name, Mark::InProgress);
        path.push(name);

        for dep in &entry.plugin.metadata().dependencies {
            if !self.index.contains_key(dep.as_str()) {
                return Err(Error::MissingDependency {
                    plugin: name.to_string(),
                    dependency: dep.clone(),
                });
            }
            self.visit(dep, marks, path, order)?;
        }

        path.pop();
        marks.insert(name, Mark::Done);
        order.push(name.to_string());
        Ok(())
    }
}
