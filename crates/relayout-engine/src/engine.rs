//! Engine
//!
//! Owns the registry, added-member store, patch rules, dispatch table and
//! coordinator, and wires them to a host runtime.

use crate::added::AddedMemberStore;
use crate::config::{ConfigError, EngineConfig};
use crate::coordinator::{RedefinitionCoordinator, RedefinitionReport};
use crate::dispatch::DispatchTable;
use crate::error::RedefineError;
use crate::listener::ChangeListener;
use crate::reflect::Reflector;
use crate::registry::TypeMetadataRegistry;
use crate::rewrite::{CodeRewriter, LoadedHierarchy, RuleIndex};
use crate::rules::PatchRuleStore;
use crate::vm::{Loader, RedefinitionHost};
use relayout_bytecode::ClassDef;
use std::path::Path;
use std::sync::Arc;

/// Entries dropped by [`Engine::purge`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Metadata maps of collected loaders
    pub metadata: usize,
    /// Added-field maps of collected instances
    pub instances: usize,
}

/// Redefinition engine
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    bootstrap: Arc<Loader>,
    registry: TypeMetadataRegistry,
    store: AddedMemberStore,
    rules: PatchRuleStore,
    dispatch: DispatchTable,
    coordinator: RedefinitionCoordinator,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    /// Create an engine
    pub fn new(config: EngineConfig) -> Self {
        let bootstrap = Loader::bootstrap();
        Self {
            registry: TypeMetadataRegistry::new(
                bootstrap.clone(),
                config.introspectable_prefixes.clone(),
            ),
            store: AddedMemberStore::new(),
            rules: PatchRuleStore::new(bootstrap.clone()),
            dispatch: DispatchTable::new(bootstrap.clone()),
            coordinator: RedefinitionCoordinator::new(),
            bootstrap,
            config,
        }
    }

    /// Create an engine from a TOML configuration file
    pub fn from_config_file(path: &Path) -> Result<Self, ConfigError> {
        let config = EngineConfig::from_file(path)?;
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Configuration in effect
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loader standing in for bootstrap in per-loader maps
    pub fn bootstrap(&self) -> &Arc<Loader> {
        &self.bootstrap
    }

    /// Type metadata registry
    pub fn registry(&self) -> &TypeMetadataRegistry {
        &self.registry
    }

    /// Added-member store
    pub fn store(&self) -> &AddedMemberStore {
        &self.store
    }

    /// Patch rules
    pub fn rules(&self) -> &PatchRuleStore {
        &self.rules
    }

    /// Dispatch table
    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    /// Transaction coordinator
    pub fn coordinator(&self) -> &RedefinitionCoordinator {
        &self.coordinator
    }

    /// Register a change listener
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.coordinator.add_listener(listener);
    }

    /// Redefine a type; see [`RedefinitionCoordinator::redefine`]
    pub fn redefine(
        &self,
        host: &dyn RedefinitionHost,
        loader: Option<&Arc<Loader>>,
        type_name: &str,
        old_bytes: Option<&[u8]>,
        new_bytes: &[u8],
    ) -> Result<RedefinitionReport, RedefineError> {
        self.coordinator
            .redefine(self, host, loader, type_name, old_bytes, new_bytes)
    }

    /// Rules visible to code defined by `loader`
    ///
    /// Rules published for bootstrap types apply in every loader. Keys keep
    /// the owning loader, so a bootstrap rule never matches a same-named type
    /// of `loader`.
    pub fn rule_index(&self, loader: Option<&Arc<Loader>>) -> RuleIndex {
        let mut index = RuleIndex::new();
        for rules in self.rules.get(loader).values() {
            for rule in rules {
                index.insert(rule);
            }
        }
        if loader.is_some() {
            for rules in self.rules.get(None).values() {
                for rule in rules {
                    index.insert(rule);
                }
            }
        }
        index
    }

    /// Apply the rules in effect to a class that is about to be loaded
    ///
    /// Methods whose rewrite fails are kept as they are.
    pub fn prepare_class(
        &self,
        host: &dyn RedefinitionHost,
        loader: Option<&Arc<Loader>>,
        class: &ClassDef,
    ) -> ClassDef {
        let rules = self.rule_index(loader);
        if rules.is_empty() {
            return class.clone();
        }
        let hierarchy = LoadedHierarchy::new(host, loader.cloned()).with_pending(class);
        let rewritten = CodeRewriter::new(&rules, &hierarchy).rewrite_class(class);
        for failure in &rewritten.failures {
            tracing::warn!(%failure, "loading method unrewritten");
        }
        if !rewritten.changed.is_empty() {
            tracing::debug!(
                class = %class.name,
                methods = rewritten.changed.len(),
                "rewrote class at load"
            );
        }
        rewritten.class
    }

    /// Reflection over current layouts
    pub fn reflect<'a>(&'a self, host: &'a dyn RedefinitionHost) -> Reflector<'a> {
        Reflector::new(self, host)
    }

    /// Drop state belonging to collected loaders and instances
    pub fn purge(&self) -> PurgeStats {
        let stats = PurgeStats {
            metadata: self.registry.purge() + self.rules.purge() + self.dispatch.purge(),
            instances: self.store.purge(),
        };
        tracing::debug!(?stats, "purged");
        stats
    }
}
