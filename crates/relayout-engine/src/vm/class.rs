//! Loaded classes

use super::{Loader, Value};
use crate::body::MethodBody;
use crate::identity::{LoaderId, TypeIdentifier};
use parking_lot::{Mutex, RwLock};
use relayout_bytecode::ClassDef;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, Weak};

type MemberKey = (String, String);

fn key(name: &str, descriptor: &str) -> MemberKey {
    (name.to_string(), descriptor.to_string())
}

/// A class as loaded by the runtime
///
/// The physical shape (`original`, field storage, the set of declared
/// methods) is fixed at load. Only the bodies behind existing method keys
/// can change.
pub struct RuntimeClass {
    id: TypeIdentifier,
    loader: Option<Weak<Loader>>,
    super_class: Option<Arc<RuntimeClass>>,
    original: Arc<ClassDef>,
    source: RwLock<Arc<ClassDef>>,
    methods: RwLock<FxHashMap<MemberKey, Arc<MethodBody>>>,
    /// Instance field storage index, inherited fields first
    instance_fields: FxHashMap<MemberKey, usize>,
    instance_descriptors: Vec<String>,
    static_fields: FxHashMap<MemberKey, usize>,
    statics: Mutex<Vec<Value>>,
}

impl RuntimeClass {
    /// Lay out a class
    ///
    /// `original` is the definition as loaded; `bodies` are the installed
    /// (possibly rewritten) bodies for its methods.
    pub(crate) fn new(
        loader: Option<&Arc<Loader>>,
        super_class: Option<Arc<RuntimeClass>>,
        original: Arc<ClassDef>,
        bodies: Vec<MethodBody>,
    ) -> Self {
        let loader_id = loader.map_or(LoaderId::BOOTSTRAP, |l| l.id());
        let id = TypeIdentifier::new(&original.name, loader_id);

        let (mut instance_fields, mut instance_descriptors) = match &super_class {
            Some(parent) => (
                parent.instance_fields.clone(),
                parent.instance_descriptors.clone(),
            ),
            None => (FxHashMap::default(), Vec::new()),
        };
        let mut static_fields = FxHashMap::default();
        let mut statics = Vec::new();

        for field in &original.fields {
            if field.is_static() {
                static_fields.insert(key(&field.name, &field.descriptor), statics.len());
                statics.push(Value::default_for(&field.descriptor));
            } else {
                instance_fields.insert(
                    key(&field.name, &field.descriptor),
                    instance_descriptors.len(),
                );
                instance_descriptors.push(field.descriptor.clone());
            }
        }

        let methods = bodies
            .into_iter()
            .map(|body| (key(&body.name, &body.descriptor), Arc::new(body)))
            .collect();

        Self {
            id,
            loader: loader.map(Arc::downgrade),
            super_class,
            source: RwLock::new(original.clone()),
            original,
            methods: RwLock::new(methods),
            instance_fields,
            instance_descriptors,
            static_fields,
            statics: Mutex::new(statics),
        }
    }

    /// Type identity
    pub fn id(&self) -> &TypeIdentifier {
        &self.id
    }

    /// Qualified name
    pub fn name(&self) -> &str {
        self.id.name()
    }

    /// Whether the bootstrap loader defined this class
    pub fn is_bootstrap(&self) -> bool {
        self.loader.is_none()
    }

    /// Defining loader; `None` for bootstrap classes and for loaders that
    /// have been dropped
    pub fn loader(&self) -> Option<Arc<Loader>> {
        self.loader.as_ref().and_then(Weak::upgrade)
    }

    /// Whether the defining loader is gone
    pub fn is_orphaned(&self) -> bool {
        self.loader.as_ref().is_some_and(|l| l.strong_count() == 0)
    }

    /// Direct super class
    pub fn super_class(&self) -> Option<&Arc<RuntimeClass>> {
        self.super_class.as_ref()
    }

    /// Definition as first loaded; the physical shape
    pub fn original(&self) -> &Arc<ClassDef> {
        &self.original
    }

    /// Latest unrewritten definition
    pub fn source(&self) -> Arc<ClassDef> {
        self.source.read().clone()
    }

    pub(crate) fn set_source(&self, source: Arc<ClassDef>) {
        *self.source.write() = source;
    }

    /// Whether this class or an ancestor is named `name`
    pub fn is_subclass_of(&self, name: &str) -> bool {
        let mut class = Some(self);
        while let Some(c) = class {
            if c.name() == name {
                return true;
            }
            class = c.super_class.as_deref();
        }
        false
    }

    /// Whether the method is physically declared by this class
    pub fn declares_method(&self, name: &str, descriptor: &str) -> bool {
        self.methods.read().contains_key(&key(name, descriptor))
    }

    /// Installed body of a declared method
    pub fn method(&self, name: &str, descriptor: &str) -> Option<Arc<MethodBody>> {
        self.methods.read().get(&key(name, descriptor)).cloned()
    }

    /// Installed bodies of all declared methods
    pub fn methods(&self) -> Vec<Arc<MethodBody>> {
        self.methods.read().values().cloned().collect()
    }

    /// Swap the body of a declared method
    ///
    /// Returns false when no such method is declared.
    pub(crate) fn replace_method(&self, body: MethodBody) -> bool {
        let mut methods = self.methods.write();
        match methods.get_mut(&key(&body.name, &body.descriptor)) {
            Some(slot) => {
                *slot = Arc::new(body);
                true
            }
            None => false,
        }
    }

    /// Resolve a method through the class chain
    ///
    /// Returns the declaring class together with the body.
    pub fn resolve_method(
        self: &Arc<Self>,
        name: &str,
        descriptor: &str,
        is_static: bool,
    ) -> Option<(Arc<RuntimeClass>, Arc<MethodBody>)> {
        let mut class = Some(self.clone());
        while let Some(c) = class {
            if let Some(body) = c.method(name, descriptor) {
                if body.is_static() == is_static {
                    return Some((c, body));
                }
            }
            class = c.super_class.clone();
        }
        None
    }

    /// Storage index of an instance field (declared here or inherited)
    pub fn field_index(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.instance_fields.get(&key(name, descriptor)).copied()
    }

    /// Default values for a new instance's physical fields
    pub(crate) fn field_defaults(&self) -> Vec<Value> {
        self.instance_descriptors
            .iter()
            .map(|d| Value::default_for(d))
            .collect()
    }

    /// Class declaring a static field, with its storage index
    pub fn static_field(
        self: &Arc<Self>,
        name: &str,
        descriptor: &str,
    ) -> Option<(Arc<RuntimeClass>, usize)> {
        let mut class = Some(self.clone());
        while let Some(c) = class {
            if let Some(&index) = c.static_fields.get(&key(name, descriptor)) {
                return Some((c, index));
            }
            class = c.super_class.clone();
        }
        None
    }

    /// Read a static field by storage index
    pub fn get_static(&self, index: usize) -> Value {
        self.statics.lock().get(index).cloned().unwrap_or_default()
    }

    /// Write a static field by storage index
    pub fn set_static(&self, index: usize, value: Value) {
        if let Some(slot) = self.statics.lock().get_mut(index) {
            *slot = value;
        }
    }
}

impl fmt::Debug for RuntimeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeClass")
            .field("id", &self.id)
            .field("super", &self.super_class.as_ref().map(|s| s.name().to_string()))
            .field("methods", &self.methods.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayout_bytecode::{access, FieldDef};

    fn class_def(name: &str, super_name: Option<&str>, fields: &[(&str, &str, u16)]) -> ClassDef {
        let mut def = ClassDef::new(name, super_name);
        for (field, desc, flags) in fields {
            def.fields.push(FieldDef::new(*field, *desc, *flags));
        }
        def
    }

    #[test]
    fn test_inherited_fields_come_first() {
        let base = Arc::new(RuntimeClass::new(
            None,
            None,
            Arc::new(class_def("app/Base", None, &[("a", "I", 0)])),
            Vec::new(),
        ));
        let derived = RuntimeClass::new(
            None,
            Some(base),
            Arc::new(class_def(
                "app/Derived",
                Some("app/Base"),
                &[("b", "J", 0), ("count", "I", access::STATIC)],
            )),
            Vec::new(),
        );
        assert_eq!(derived.field_index("a", "I"), Some(0));
        assert_eq!(derived.field_index("b", "J"), Some(1));
        assert_eq!(derived.field_index("count", "I"), None);
        assert_eq!(derived.field_defaults(), vec![Value::Int(0), Value::Long(0)]);
        assert!(derived.is_subclass_of("app/Base"));
        assert!(!derived.is_subclass_of("app/Other"));
    }

    #[test]
    fn test_bootstrap_and_orphaned() {
        let loader = Loader::new("app");
        let class = RuntimeClass::new(
            Some(&loader),
            None,
            Arc::new(class_def("app/A", None, &[])),
            Vec::new(),
        );
        assert!(!class.is_bootstrap());
        assert!(!class.is_orphaned());
        drop(loader);
        assert!(class.is_orphaned());
        assert!(class.loader().is_none());
    }
}
