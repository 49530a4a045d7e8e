//! Reflection over logical layouts
//!
//! Answers member queries from current descriptors instead of the loaded
//! classes, so added members are visible and removed ones are not.

use crate::engine::Engine;
use crate::identity::TypeIdentifier;
use crate::layout::{CurrentDescriptor, MemberSig, SlotId};
use crate::vm::{Loader, RedefinitionHost, RuntimeClass};
use relayout_bytecode::access;
use std::sync::Arc;

/// A field as currently declared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name
    pub name: String,
    /// Field descriptor
    pub descriptor: String,
    /// Access flags
    pub access: u16,
    /// Declaring type
    pub declaring: TypeIdentifier,
    /// Store slot for added fields
    pub slot: Option<SlotId>,
}

/// A method as currently declared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Method name
    pub name: String,
    /// Method descriptor
    pub descriptor: String,
    /// Access flags
    pub access: u16,
    /// Declaring type
    pub declaring: TypeIdentifier,
    /// Slot for added methods
    pub slot: Option<SlotId>,
}

impl FieldInfo {
    /// Whether the field is static
    pub fn is_static(&self) -> bool {
        self.access & access::STATIC != 0
    }

    /// Whether the field was added by a redefinition
    pub fn is_added(&self) -> bool {
        self.slot.is_some()
    }
}

impl MethodInfo {
    /// Whether the method is static
    pub fn is_static(&self) -> bool {
        self.access & access::STATIC != 0
    }

    /// Whether the method was added by a redefinition
    pub fn is_added(&self) -> bool {
        self.slot.is_some()
    }
}

/// Member lookup against current descriptors
pub struct Reflector<'a> {
    engine: &'a Engine,
    host: &'a dyn RedefinitionHost,
}

impl<'a> Reflector<'a> {
    /// Reflect over the classes of `host`
    pub fn new(engine: &'a Engine, host: &'a dyn RedefinitionHost) -> Self {
        Self { engine, host }
    }

    fn current(&self, class: &RuntimeClass) -> Option<Arc<CurrentDescriptor>> {
        let loader = class.loader();
        if !class.is_bootstrap() && loader.is_none() {
            return None;
        }
        self.engine
            .registry()
            .get_current(self.host, loader.as_ref(), class.name())
    }

    fn chain(&self, loader: Option<&Arc<Loader>>, class_name: &str) -> Vec<Arc<RuntimeClass>> {
        let mut chain = Vec::new();
        let mut class = self.host.find_class(loader, class_name);
        while let Some(c) = class {
            class = c.super_class().cloned();
            chain.push(c);
        }
        chain
    }

    fn field_info(current: &CurrentDescriptor, sig: &MemberSig) -> FieldInfo {
        FieldInfo {
            name: sig.name.clone(),
            descriptor: sig.descriptor.clone(),
            access: sig.access,
            declaring: current.id().clone(),
            slot: current.added_field(&sig.name, &sig.descriptor).map(|m| m.slot),
        }
    }

    fn method_info(current: &CurrentDescriptor, sig: &MemberSig) -> MethodInfo {
        MethodInfo {
            name: sig.name.clone(),
            descriptor: sig.descriptor.clone(),
            access: sig.access,
            declaring: current.id().clone(),
            slot: current.added_method(&sig.name, &sig.descriptor).map(|m| m.slot),
        }
    }

    /// Fields a type currently declares
    pub fn declared_fields(&self, loader: Option<&Arc<Loader>>, class_name: &str) -> Vec<FieldInfo> {
        let Some(class) = self.host.find_class(loader, class_name) else {
            return Vec::new();
        };
        let Some(current) = self.current(&class) else {
            return Vec::new();
        };
        current
            .layout()
            .fields
            .iter()
            .map(|sig| Self::field_info(&current, sig))
            .collect()
    }

    /// Methods a type currently declares
    pub fn declared_methods(
        &self,
        loader: Option<&Arc<Loader>>,
        class_name: &str,
    ) -> Vec<MethodInfo> {
        let Some(class) = self.host.find_class(loader, class_name) else {
            return Vec::new();
        };
        let Some(current) = self.current(&class) else {
            return Vec::new();
        };
        current
            .layout()
            .methods
            .iter()
            .map(|sig| Self::method_info(&current, sig))
            .collect()
    }

    /// Field by name, searching the type and then its ancestors
    pub fn find_field(
        &self,
        loader: Option<&Arc<Loader>>,
        class_name: &str,
        field_name: &str,
    ) -> Option<FieldInfo> {
        self.chain(loader, class_name).iter().find_map(|class| {
            let current = self.current(class)?;
            let sig = current.layout().fields.iter().find(|f| f.name == field_name)?;
            Some(Self::field_info(&current, sig))
        })
    }

    /// Method by name and descriptor, searching the type and then its
    /// ancestors
    pub fn find_method(
        &self,
        loader: Option<&Arc<Loader>>,
        class_name: &str,
        name: &str,
        descriptor: &str,
    ) -> Option<MethodInfo> {
        self.chain(loader, class_name).iter().find_map(|class| {
            let current = self.current(class)?;
            let sig = current.layout().method(name, descriptor)?;
            Some(Self::method_info(&current, sig))
        })
    }
}
