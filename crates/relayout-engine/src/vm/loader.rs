//! Class loaders

use super::RuntimeClass;
use crate::identity::LoaderId;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// A namespace of classes
///
/// Loaders are compared by identity. Engine state for a loader is keyed on
/// its `Arc` and goes away when the last strong reference is dropped.
pub struct Loader {
    id: LoaderId,
    name: String,
    classes: RwLock<FxHashMap<String, Arc<RuntimeClass>>>,
}

impl Loader {
    /// Create a loader with a fresh id
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::with_id(
            LoaderId(NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed)),
            name,
        ))
    }

    /// The loader object standing in for the bootstrap loader
    pub(crate) fn bootstrap() -> Arc<Self> {
        Arc::new(Self::with_id(LoaderId::BOOTSTRAP, "bootstrap"))
    }

    fn with_id(id: LoaderId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            classes: RwLock::new(FxHashMap::default()),
        }
    }

    /// Loader id
    pub fn id(&self) -> LoaderId {
        self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Class defined by this loader
    pub fn find_class(&self, name: &str) -> Option<Arc<RuntimeClass>> {
        self.classes.read().get(name).cloned()
    }

    /// All classes defined by this loader
    pub fn classes(&self) -> Vec<Arc<RuntimeClass>> {
        self.classes.read().values().cloned().collect()
    }

    /// Register a class; returns false if the name is taken
    pub(crate) fn define(&self, class: Arc<RuntimeClass>) -> bool {
        let mut classes = self.classes.write();
        if classes.contains_key(class.name()) {
            return false;
        }
        classes.insert(class.name().to_string(), class);
        true
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("classes", &self.classes.read().len())
            .finish()
    }
}
