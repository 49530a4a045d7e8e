//! Storage for fields added after load
//!
//! Each added member gets a synthetic slot id. Instance values are stored per
//! object in a weakly keyed map so an object's added fields disappear with
//! it; static values are stored per slot.

use crate::error::EngineError;
use crate::identity::TypeIdentifier;
use crate::layout::SlotId;
use crate::vm::{Object, Value};
use crate::weak::WeakKeyMap;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// What a slot was registered for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Owning type
    pub owner: TypeIdentifier,
    /// Member name
    pub name: String,
    /// Declared descriptor
    pub descriptor: String,
}

type InstanceSlots = Arc<DashMap<SlotId, Value>>;

/// Out-of-band values of added fields
#[derive(Debug)]
pub struct AddedMemberStore {
    next_slot: AtomicU32,
    slots: DashMap<SlotId, SlotInfo>,
    instances: WeakKeyMap<Object, InstanceSlots>,
    statics: DashMap<SlotId, Value>,
}

impl Default for AddedMemberStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AddedMemberStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            next_slot: AtomicU32::new(1),
            slots: DashMap::new(),
            instances: WeakKeyMap::new(),
            statics: DashMap::new(),
        }
    }

    /// Allocate a slot for a member of `owner`
    pub fn register_slot(
        &self,
        owner: &TypeIdentifier,
        name: &str,
        descriptor: &str,
    ) -> SlotId {
        let slot = SlotId(self.next_slot.fetch_add(1, Ordering::Relaxed));
        self.slots.insert(
            slot,
            SlotInfo {
                owner: owner.clone(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            },
        );
        tracing::debug!(%slot, %owner, name, descriptor, "registered added member slot");
        slot
    }

    /// What a slot was registered for
    pub fn slot_info(&self, slot: SlotId) -> Option<SlotInfo> {
        self.slots.get(&slot).map(|info| info.clone())
    }

    fn default_value(&self, slot: SlotId) -> Result<Value, EngineError> {
        self.slots
            .get(&slot)
            .map(|info| Value::default_for(&info.descriptor))
            .ok_or(EngineError::UnknownSlot(slot.0))
    }

    /// Value of an added instance field; the descriptor default until written
    pub fn get(&self, instance: &Arc<Object>, slot: SlotId) -> Result<Value, EngineError> {
        if let Some(values) = self.instances.get(instance) {
            if let Some(value) = values.get(&slot) {
                return Ok(value.clone());
            }
        }
        self.default_value(slot)
    }

    /// Write an added instance field
    pub fn set(&self, instance: &Arc<Object>, slot: SlotId, value: Value) -> Result<(), EngineError> {
        if !self.slots.contains_key(&slot) {
            return Err(EngineError::UnknownSlot(slot.0));
        }
        self.instances
            .get_or_insert_with(instance, || Arc::new(DashMap::new()))
            .insert(slot, value);
        Ok(())
    }

    /// Value of an added static field
    pub fn get_static(&self, slot: SlotId) -> Result<Value, EngineError> {
        match self.statics.get(&slot) {
            Some(value) => Ok(value.clone()),
            None => self.default_value(slot),
        }
    }

    /// Write an added static field
    pub fn set_static(&self, slot: SlotId, value: Value) -> Result<(), EngineError> {
        if !self.slots.contains_key(&slot) {
            return Err(EngineError::UnknownSlot(slot.0));
        }
        self.statics.insert(slot, value);
        Ok(())
    }

    /// Number of live instances with stored values
    pub fn live_instances(&self) -> usize {
        self.instances.len()
    }

    /// Drop storage of collected instances
    pub fn purge(&self) -> usize {
        self.instances.purge()
    }
}
