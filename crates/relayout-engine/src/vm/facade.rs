//! Runtime front door
//!
//! [`Vm`] defines classes, runs methods and implements
//! [`RedefinitionHost`] so the engine can redefine what it loaded.

use super::{Interpreter, Loader, Object, RedefinitionHost, RuntimeClass, Value, VmError, VmResult};
use crate::body::MethodBody;
use crate::config::EngineConfig;
use crate::coordinator::RedefinitionReport;
use crate::engine::Engine;
use crate::error::RedefineError;
use crate::identity::{LoaderId, TypeIdentifier};
use crate::rewrite::LoadedHierarchy;
use parking_lot::{Mutex, RwLock};
use relayout_bytecode::{verify_method, ClassDef};
use rustc_hash::FxHashSet;
use std::sync::{Arc, Weak};

/// A runtime with a redefinition engine attached
pub struct Vm {
    engine: Arc<Engine>,
    loaders: Mutex<Vec<Weak<Loader>>>,
    protected: RwLock<FxHashSet<String>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(Arc::new(Engine::default()))
    }
}

impl Vm {
    /// Create a runtime around `engine`
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            loaders: Mutex::new(Vec::new()),
            protected: RwLock::new(FxHashSet::default()),
        }
    }

    /// Create a runtime with a fresh engine
    pub fn with_config(config: EngineConfig) -> Self {
        Self::new(Arc::new(Engine::new(config)))
    }

    /// The attached engine
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Create a loader
    pub fn new_loader(&self, name: &str) -> Arc<Loader> {
        let loader = Loader::new(name);
        let mut loaders = self.loaders.lock();
        loaders.retain(|l| l.strong_count() > 0);
        loaders.push(Arc::downgrade(&loader));
        loader
    }

    /// Mark a type as not redefinable
    pub fn protect(&self, type_name: &str) {
        self.protected.write().insert(type_name.to_string());
    }

    fn scope<'a>(&'a self, loader: Option<&'a Arc<Loader>>) -> &'a Arc<Loader> {
        loader.unwrap_or_else(|| self.engine.bootstrap())
    }

    /// Define a class from class-file bytes
    ///
    /// Bodies are verified as written, then rewritten against the rules
    /// already published so the class sees earlier redefinitions.
    pub fn define_class(
        &self,
        loader: Option<&Arc<Loader>>,
        bytes: &[u8],
    ) -> VmResult<Arc<RuntimeClass>> {
        let def = ClassDef::decode(bytes)?;
        for method in def.methods.iter().filter(|m| !m.code.is_empty()) {
            verify_method(method, &def.constants).map_err(|error| VmError::Verify {
                method: format!("{}.{}{}", def.name, method.name, method.descriptor),
                error,
            })?;
        }

        let scope = self.scope(loader);
        if scope.find_class(&def.name).is_some() {
            return Err(VmError::DuplicateClass(def.name));
        }
        let super_class = match &def.super_name {
            Some(name) => Some(
                self.find_class(loader, name)
                    .ok_or_else(|| VmError::ClassNotFound(name.clone()))?,
            ),
            None => None,
        };

        let prepared = self.engine.prepare_class(self, loader, &def);
        let id = TypeIdentifier::new(&def.name, loader.map_or(LoaderId::BOOTSTRAP, |l| l.id()));
        let pool = Arc::new(prepared.constants.clone());
        let bodies: Vec<MethodBody> = prepared
            .methods
            .iter()
            .map(|m| MethodBody::from_def(id.clone(), m, pool.clone()))
            .collect();

        // Overrides of methods an ancestor only has logically are reached
        // through the dispatch table.
        let overrides: Vec<Arc<MethodBody>> = match &def.super_name {
            Some(parent) => {
                let rules = self.engine.rule_index(loader);
                let hierarchy = LoadedHierarchy::new(self, loader.cloned());
                bodies
                    .iter()
                    .filter(|b| !b.is_static())
                    .filter(|b| rules.method(parent, &b.name, &b.descriptor, false, &hierarchy))
                    .map(|b| Arc::new(b.clone()))
                    .collect()
            }
            None => Vec::new(),
        };

        let class = Arc::new(RuntimeClass::new(
            loader,
            super_class,
            Arc::new(def),
            bodies,
        ));
        if !scope.define(class.clone()) {
            return Err(VmError::DuplicateClass(class.name().to_string()));
        }
        for body in overrides {
            self.engine.dispatch().add(loader, class.name(), body);
        }
        tracing::debug!(class = %class.id(), "defined class");
        Ok(class)
    }

    /// Class visible from `loader`, falling back to bootstrap
    pub fn find_class(&self, loader: Option<&Arc<Loader>>, name: &str) -> Option<Arc<RuntimeClass>> {
        loader
            .and_then(|l| l.find_class(name))
            .or_else(|| self.engine.bootstrap().find_class(name))
    }

    /// Class named from code running in `from`
    pub(crate) fn resolve_class(&self, from: &RuntimeClass, name: &str) -> VmResult<Arc<RuntimeClass>> {
        self.find_class(from.loader().as_ref(), name)
            .ok_or_else(|| VmError::ClassNotFound(name.to_string()))
    }

    /// Allocate an instance
    pub fn new_object(&self, class: &Arc<RuntimeClass>) -> Value {
        Value::Ref(Object::new(class.clone()))
    }

    /// Call an instance method on `receiver`
    ///
    /// Methods added by redefinition are found through the dispatch table.
    pub fn invoke_virtual(
        &self,
        receiver: &Value,
        name: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        let object = match receiver {
            Value::Ref(obj) => obj.clone(),
            Value::Null => return Err(VmError::NullPointer),
            other => {
                return Err(VmError::TypeError(format!(
                    "cannot call {} on {}",
                    name,
                    other.kind_name()
                )))
            }
        };
        let mut interpreter = Interpreter::new(self);
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(receiver.clone());
        call_args.extend(args);

        match object.class().resolve_method(name, descriptor, false) {
            Some((declaring, body)) => interpreter.invoke(&declaring, &body, call_args),
            None => self.engine.dispatch().run(
                object.class(),
                name,
                descriptor,
                |declaring, body| interpreter.invoke(&declaring, &body, call_args),
            ),
        }
    }

    /// Call a static method of `class_name`
    pub fn invoke_static(
        &self,
        loader: Option<&Arc<Loader>>,
        class_name: &str,
        name: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        let class = self
            .find_class(loader, class_name)
            .ok_or_else(|| VmError::ClassNotFound(class_name.to_string()))?;
        let mut interpreter = Interpreter::new(self);
        match class.resolve_method(name, descriptor, true) {
            Some((declaring, body)) => interpreter.invoke(&declaring, &body, args),
            None => self.engine.dispatch().run_static(
                &class,
                name,
                descriptor,
                |declaring, body| interpreter.invoke(&declaring, &body, args),
            ),
        }
    }

    /// Redefine a loaded type with new class-file bytes
    pub fn redefine(
        &self,
        loader: Option<&Arc<Loader>>,
        type_name: &str,
        new_bytes: &[u8],
    ) -> Result<RedefinitionReport, RedefineError> {
        self.engine.redefine(self, loader, type_name, None, new_bytes)
    }
}

impl RedefinitionHost for Vm {
    fn is_replaceable(&self, type_name: &str, loader: Option<&Arc<Loader>>) -> bool {
        !self.protected.read().contains(type_name) && self.find_class(loader, type_name).is_some()
    }

    fn find_class(&self, loader: Option<&Arc<Loader>>, type_name: &str) -> Option<Arc<RuntimeClass>> {
        Vm::find_class(self, loader, type_name)
    }

    fn loaded_classes(&self) -> Vec<Arc<RuntimeClass>> {
        let mut classes = self.engine.bootstrap().classes();
        let loaders: Vec<Arc<Loader>> = {
            let mut loaders = self.loaders.lock();
            loaders.retain(|l| l.strong_count() > 0);
            loaders.iter().filter_map(Weak::upgrade).collect()
        };
        for loader in loaders {
            classes.extend(loader.classes());
        }
        classes
    }

    fn replace_body(&self, class: &RuntimeClass, body: MethodBody) -> Result<(), VmError> {
        let member = format!("{}{}", body.name, body.descriptor);
        if class.replace_method(body) {
            tracing::trace!(class = %class.id(), %member, "replaced method body");
            Ok(())
        } else {
            Err(VmError::ShapeChange {
                class: class.name().to_string(),
                member,
            })
        }
    }
}
