//! Dispatch table for added methods
//!
//! Methods added by a redefinition have no physical slot in their class.
//! Their rewritten bodies are kept here, per loader and declaring type, and
//! looked up by walking the receiver's class chain so the most-derived entry
//! wins. A declaring type's entries are swapped as one set, so a lookup sees
//! either the set before a redefinition or the one after it.

use crate::body::MethodBody;
use crate::error::EngineError;
use crate::vm::{Loader, RuntimeClass};
use crate::weak::WeakKeyMap;
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    name: String,
    descriptor: String,
    is_static: bool,
}

impl MethodKey {
    fn new(name: &str, descriptor: &str, is_static: bool) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_static,
        }
    }

    fn of(body: &MethodBody) -> Self {
        Self::new(&body.name, &body.descriptor, body.is_static())
    }
}

type ClassEntries = FxHashMap<MethodKey, Arc<MethodBody>>;
type EntryMap = Arc<DashMap<String, Arc<ClassEntries>>>;

/// Resolved dispatch target: declaring class and body
pub type DispatchTarget = (Arc<RuntimeClass>, Arc<MethodBody>);

/// Added method implementations by loader
#[derive(Debug)]
pub struct DispatchTable {
    bootstrap: Arc<Loader>,
    entries: WeakKeyMap<Loader, EntryMap>,
}

impl DispatchTable {
    /// Create an empty table
    pub fn new(bootstrap: Arc<Loader>) -> Self {
        Self {
            bootstrap,
            entries: WeakKeyMap::new(),
        }
    }

    fn entries_for(&self, loader: Option<&Arc<Loader>>) -> EntryMap {
        self.entries
            .get_or_insert_with(loader.unwrap_or(&self.bootstrap), || Arc::new(DashMap::new()))
    }

    fn entries_for_class(&self, class: &RuntimeClass) -> Option<EntryMap> {
        if class.is_bootstrap() {
            return Some(self.entries_for(None));
        }
        class.loader().map(|loader| self.entries_for(Some(&loader)))
    }

    fn insert(&self, loader: Option<&Arc<Loader>>, declaring: &str, body: Arc<MethodBody>) {
        tracing::debug!(declaring, method = %body.name, descriptor = %body.descriptor, is_static = body.is_static(), "installed dispatch entry");
        let entries = self.entries_for(loader);
        let mut class = entries.entry(declaring.to_string()).or_default();
        Arc::make_mut(&mut *class).insert(MethodKey::of(&body), body);
    }

    /// Install an added instance method of `declaring`
    pub fn add(&self, loader: Option<&Arc<Loader>>, declaring: &str, body: Arc<MethodBody>) {
        debug_assert!(!body.is_static());
        self.insert(loader, declaring, body);
    }

    /// Install an added static method of `declaring`
    pub fn add_static(&self, loader: Option<&Arc<Loader>>, declaring: &str, body: Arc<MethodBody>) {
        debug_assert!(body.is_static());
        self.insert(loader, declaring, body);
    }

    /// Swap every entry declared by one type for `bodies` in one step
    pub fn replace(
        &self,
        loader: Option<&Arc<Loader>>,
        declaring: &str,
        bodies: impl IntoIterator<Item = Arc<MethodBody>>,
    ) {
        let set: ClassEntries = bodies
            .into_iter()
            .map(|body| (MethodKey::of(&body), body))
            .collect();
        tracing::debug!(declaring, entries = set.len(), "replaced dispatch entries");
        let entries = self.entries_for(loader);
        if set.is_empty() {
            entries.remove(declaring);
        } else {
            entries.insert(declaring.to_string(), Arc::new(set));
        }
    }

    /// Entry declared by `declaring` itself, without walking supertypes
    pub fn declared(
        &self,
        loader: Option<&Arc<Loader>>,
        declaring: &str,
        name: &str,
        descriptor: &str,
        is_static: bool,
    ) -> Option<Arc<MethodBody>> {
        let class = self.entries_for(loader).get(declaring)?.clone();
        class.get(&MethodKey::new(name, descriptor, is_static)).cloned()
    }

    fn resolve_from(
        &self,
        start: &Arc<RuntimeClass>,
        name: &str,
        descriptor: &str,
        is_static: bool,
    ) -> Option<DispatchTarget> {
        let key = MethodKey::new(name, descriptor, is_static);
        let mut class = Some(start.clone());
        while let Some(c) = class {
            let declared = self
                .entries_for_class(&c)
                .and_then(|entries| entries.get(c.name()).map(|set| set.clone()));
            if let Some(body) = declared.and_then(|set| set.get(&key).cloned()) {
                return Some((c, body));
            }
            class = c.super_class().cloned();
        }
        None
    }

    /// Most-derived added implementation visible from `receiver`
    pub fn resolve(
        &self,
        receiver: &Arc<RuntimeClass>,
        name: &str,
        descriptor: &str,
    ) -> Option<DispatchTarget> {
        self.resolve_from(receiver, name, descriptor, false)
    }

    /// Whether `run` would find an implementation
    pub fn contains(&self, receiver: &Arc<RuntimeClass>, name: &str, descriptor: &str) -> bool {
        self.resolve(receiver, name, descriptor).is_some()
    }

    /// Resolve and call an added instance method
    ///
    /// `invoke` receives the declaring class and the body.
    pub fn run<R, E>(
        &self,
        receiver: &Arc<RuntimeClass>,
        name: &str,
        descriptor: &str,
        invoke: impl FnOnce(Arc<RuntimeClass>, Arc<MethodBody>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<EngineError>,
    {
        match self.resolve(receiver, name, descriptor) {
            Some((class, body)) => invoke(class, body),
            None => Err(missing(receiver, name, descriptor).into()),
        }
    }

    /// Resolve and call an added static method starting at `owner`
    pub fn run_static<R, E>(
        &self,
        owner: &Arc<RuntimeClass>,
        name: &str,
        descriptor: &str,
        invoke: impl FnOnce(Arc<RuntimeClass>, Arc<MethodBody>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<EngineError>,
    {
        match self.resolve_from(owner, name, descriptor, true) {
            Some((class, body)) => invoke(class, body),
            None => Err(missing(owner, name, descriptor).into()),
        }
    }

    /// Remove every entry declared by one type in one loader
    pub fn clear(&self, loader: Option<&Arc<Loader>>, declaring: &str) {
        self.entries_for(loader).remove(declaring);
    }

    /// Number of entries installed in a loader
    pub fn len(&self, loader: Option<&Arc<Loader>>) -> usize {
        self.entries_for(loader)
            .iter()
            .map(|class| class.value().len())
            .sum()
    }

    /// Whether a loader has no entries
    pub fn is_empty(&self, loader: Option<&Arc<Loader>>) -> bool {
        self.len(loader) == 0
    }

    /// Drop the entries of collected loaders
    pub fn purge(&self) -> usize {
        self.entries.purge()
    }
}

fn missing(receiver: &RuntimeClass, name: &str, descriptor: &str) -> EngineError {
    tracing::error!(receiver = %receiver.id(), name, descriptor, "no dispatch target installed");
    EngineError::MissingDispatchTarget {
        receiver: receiver.name().to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    }
}
