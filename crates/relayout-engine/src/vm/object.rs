//! Heap objects

use super::{RuntimeClass, Value};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// An instance with its physical field storage
///
/// Fields added after load are not stored here; they live in the engine's
/// added-member store keyed on this object.
pub struct Object {
    class: Arc<RuntimeClass>,
    fields: Mutex<Vec<Value>>,
}

impl Object {
    /// Allocate an instance with every field at its default
    pub fn new(class: Arc<RuntimeClass>) -> Arc<Self> {
        let fields = class.field_defaults();
        Arc::new(Self {
            class,
            fields: Mutex::new(fields),
        })
    }

    /// Runtime class
    pub fn class(&self) -> &Arc<RuntimeClass> {
        &self.class
    }

    /// Read a physical field
    pub fn get_field(&self, index: usize) -> Option<Value> {
        self.fields.lock().get(index).cloned()
    }

    /// Write a physical field
    pub fn set_field(&self, index: usize, value: Value) -> bool {
        match self.fields.lock().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("class", &self.class.id())
            .finish()
    }
}
