//! Per-loader type metadata
//!
//! Tracks the baseline and current layout of every type the engine has
//! looked at. Both maps are keyed first on the loader (weakly, with a
//! sentinel standing in for bootstrap) and then on the type name.

use crate::identity::{LoaderId, TypeIdentifier};
use crate::layout::{BaselineDescriptor, CurrentDescriptor, Layout};
use crate::vm::{Loader, RedefinitionHost, RuntimeClass};
use crate::weak::WeakKeyMap;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

type TypeMap<V> = Arc<DashMap<String, Arc<V>>>;

fn loader_id(loader: Option<&Arc<Loader>>) -> LoaderId {
    loader.map_or(LoaderId::BOOTSTRAP, |l| l.id())
}

/// Baseline and current descriptors per (loader, type name)
#[derive(Debug)]
pub struct TypeMetadataRegistry {
    bootstrap: Arc<Loader>,
    introspectable_prefixes: Vec<String>,
    baselines: WeakKeyMap<Loader, TypeMap<BaselineDescriptor>>,
    currents: WeakKeyMap<Loader, TypeMap<CurrentDescriptor>>,
    replaced: DashSet<TypeIdentifier>,
}

impl TypeMetadataRegistry {
    /// Create an empty registry
    pub fn new(bootstrap: Arc<Loader>, introspectable_prefixes: Vec<String>) -> Self {
        Self {
            bootstrap,
            introspectable_prefixes,
            baselines: WeakKeyMap::new(),
            currents: WeakKeyMap::new(),
            replaced: DashSet::new(),
        }
    }

    fn scope<'a>(&'a self, loader: Option<&'a Arc<Loader>>) -> &'a Arc<Loader> {
        loader.unwrap_or(&self.bootstrap)
    }

    fn baselines_for(&self, loader: Option<&Arc<Loader>>) -> TypeMap<BaselineDescriptor> {
        self.baselines
            .get_or_insert_with(self.scope(loader), || Arc::new(DashMap::new()))
    }

    fn currents_for(&self, loader: Option<&Arc<Loader>>) -> TypeMap<CurrentDescriptor> {
        self.currents
            .get_or_insert_with(self.scope(loader), || Arc::new(DashMap::new()))
    }

    /// Whether the live class may be introspected for a baseline
    fn is_introspectable(&self, class: &RuntimeClass) -> bool {
        let by_prefix = self
            .introspectable_prefixes
            .iter()
            .any(|p| class.name().starts_with(p.as_str()));
        by_prefix || !self.is_replaced(class.id())
    }

    /// Baseline layout of a type
    ///
    /// Recorded baselines win. Otherwise the baseline of a recorded current
    /// descriptor is used, and as a last resort the live type is
    /// introspected if that is known to be safe.
    pub fn get_baseline(
        &self,
        host: &dyn RedefinitionHost,
        loader: Option<&Arc<Loader>>,
        name: &str,
    ) -> Option<Arc<BaselineDescriptor>> {
        let baselines = self.baselines_for(loader);
        if let Some(found) = baselines.get(name).map(|b| b.clone()) {
            return Some(found);
        }

        if let Some(current) = self.currents_for(loader).get(name).map(|c| c.clone()) {
            let baseline = current.baseline().clone();
            let found = baselines.entry(name.to_string()).or_insert(baseline).clone();
            return Some(found);
        }

        let class = host.find_class(loader, name)?;
        if class.id().loader() != loader_id(loader) || !self.is_introspectable(&class) {
            tracing::debug!(type_name = name, "type not introspectable, no baseline");
            return None;
        }
        Some(self.record_baseline(loader, name, Layout::of_class(class.original())))
    }

    /// Current descriptor of a type, derived from the baseline on first use
    pub fn get_current(
        &self,
        host: &dyn RedefinitionHost,
        loader: Option<&Arc<Loader>>,
        name: &str,
    ) -> Option<Arc<CurrentDescriptor>> {
        let currents = self.currents_for(loader);
        if let Some(found) = currents.get(name).map(|c| c.clone()) {
            return Some(found);
        }

        let baseline = self.get_baseline(host, loader, name)?;
        let current = Arc::new(CurrentDescriptor::from_baseline(baseline));
        let found = currents.entry(name.to_string()).or_insert(current).clone();
        Some(found)
    }

    /// Record a baseline unless one already exists; returns the one in effect
    pub fn record_baseline(
        &self,
        loader: Option<&Arc<Loader>>,
        name: &str,
        layout: Layout,
    ) -> Arc<BaselineDescriptor> {
        let id = TypeIdentifier::new(name, loader_id(loader));
        self.baselines_for(loader)
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(type_id = %id, "recorded baseline");
                Arc::new(BaselineDescriptor::new(id, layout))
            })
            .clone()
    }

    /// Replace the current descriptor of a type
    pub fn record_current(
        &self,
        loader: Option<&Arc<Loader>>,
        name: &str,
        current: CurrentDescriptor,
    ) -> Arc<CurrentDescriptor> {
        self.baselines_for(loader)
            .entry(name.to_string())
            .or_insert_with(|| current.baseline().clone());
        let current = Arc::new(current);
        self.currents_for(loader)
            .insert(name.to_string(), current.clone());
        current
    }

    /// Remember that a type has been redefined
    pub fn mark_replaced(&self, id: TypeIdentifier) {
        self.replaced.insert(id);
    }

    /// Whether a type has been redefined
    pub fn is_replaced(&self, id: &TypeIdentifier) -> bool {
        self.replaced.contains(id)
    }

    /// Number of live loaders with recorded metadata
    pub fn loader_count(&self) -> usize {
        self.baselines.len()
    }

    /// Drop metadata of collected loaders
    pub fn purge(&self) -> usize {
        self.baselines.purge() + self.currents.purge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{MemberSig, Patch};

    struct NoHost;

    impl RedefinitionHost for NoHost {
        fn is_replaceable(&self, _: &str, _: Option<&Arc<Loader>>) -> bool {
            false
        }
        fn find_class(&self, _: Option<&Arc<Loader>>, _: &str) -> Option<Arc<RuntimeClass>> {
            None
        }
        fn loaded_classes(&self) -> Vec<Arc<RuntimeClass>> {
            Vec::new()
        }
        fn replace_body(
            &self,
            _: &RuntimeClass,
            _: crate::body::MethodBody,
        ) -> Result<(), crate::vm::VmError> {
            Ok(())
        }
    }

    fn layout() -> Layout {
        Layout {
            super_name: None,
            fields: vec![MemberSig::new("x", "I", 0)],
            methods: vec![],
        }
    }

    #[test]
    fn test_record_baseline_never_overwrites() {
        let registry = TypeMetadataRegistry::new(Loader::bootstrap(), Vec::new());
        let first = registry.record_baseline(None, "app/A", layout());
        let second = registry.record_baseline(None, "app/A", Layout::default());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.layout, layout());
    }

    #[test]
    fn test_current_falls_back_to_baseline() {
        let registry = TypeMetadataRegistry::new(Loader::bootstrap(), Vec::new());
        registry.record_baseline(None, "app/A", layout());
        let current = registry.get_current(&NoHost, None, "app/A").unwrap();
        assert_eq!(current.layout(), &layout());
        let again = registry.get_current(&NoHost, None, "app/A").unwrap();
        assert!(Arc::ptr_eq(&current, &again));
    }

    #[test]
    fn test_loaders_are_separate_namespaces() {
        let registry = TypeMetadataRegistry::new(Loader::bootstrap(), Vec::new());
        let app = Loader::new("app");
        registry.record_baseline(Some(&app), "app/A", layout());
        assert!(registry.get_baseline(&NoHost, None, "app/A").is_none());
        assert!(registry.get_baseline(&NoHost, Some(&app), "app/A").is_some());
    }

    #[test]
    fn test_baseline_reconstructed_from_current() {
        let registry = TypeMetadataRegistry::new(Loader::bootstrap(), Vec::new());
        let baseline = Arc::new(BaselineDescriptor::new(
            TypeIdentifier::bootstrap("app/A"),
            layout(),
        ));
        let current = CurrentDescriptor::from_baseline(baseline.clone())
            .with_patches([Patch::RemoveField(MemberSig::new("x", "I", 0))]);
        registry.record_current(None, "app/A", current);
        let found = registry.get_baseline(&NoHost, None, "app/A").unwrap();
        assert_eq!(found.layout, baseline.layout);
    }

    #[test]
    fn test_unknown_type_is_absent() {
        let registry = TypeMetadataRegistry::new(Loader::bootstrap(), Vec::new());
        assert!(registry.get_current(&NoHost, None, "app/Missing").is_none());
    }

    #[test]
    fn test_dropped_loader_is_purged() {
        let registry = TypeMetadataRegistry::new(Loader::bootstrap(), Vec::new());
        let app = Loader::new("app");
        registry.record_baseline(Some(&app), "app/A", layout());
        assert_eq!(registry.loader_count(), 1);
        drop(app);
        assert_eq!(registry.loader_count(), 0);
        assert!(registry.purge() >= 1);
    }

    #[test]
    fn test_replaced_tracking() {
        let registry = TypeMetadataRegistry::new(Loader::bootstrap(), Vec::new());
        let id = TypeIdentifier::bootstrap("app/A");
        assert!(!registry.is_replaced(&id));
        registry.mark_replaced(id.clone());
        assert!(registry.is_replaced(&id));
    }
}
