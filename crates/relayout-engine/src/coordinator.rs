//! Redefinition transactions
//!
//! A transaction takes a type from its current layout to the layout of a new
//! definition:
//!
//! 1. **Announced**: the new bytes are decoded and checked.
//! 2. **Diffed**: the current descriptor is diffed against the new layout.
//! 3. **RulesInstalled**: patch rules and the redefined type's dispatch
//!    entries are published, before any of its bodies is swapped.
//! 4. **Rewritten**: the redefined type and every other loaded type are
//!    rewritten against the rules in effect and their bodies swapped.
//! 5. **Committed**: the new current descriptor is recorded.
//!
//! Any error moves the transaction to **Failed**. Bodies already swapped are
//! not rolled back.
//!
//! Transactions on the same type are serialized; different types run
//! concurrently. Each class is rewritten under its own code lock, which is
//! never held while taking a transaction lock.

use crate::body::MethodBody;
use crate::diff::diff_layouts;
use crate::engine::Engine;
use crate::error::{MethodFailure, RedefineError, RewriteError};
use crate::identity::{LoaderId, TypeIdentifier};
use crate::layout::{Layout, MemberKind, MemberSig, Patch};
use crate::listener::{ChangeListener, ChangedType};
use crate::rewrite::{removed_method_stub, CodeRewriter, LoadedHierarchy};
use crate::rules::{PatchRule, RewriteKind};
use crate::vm::{Loader, RedefinitionHost, RuntimeClass};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use relayout_bytecode::{verify_method, ClassDef, ConstantPool, MethodDef};
use std::fmt;
use std::sync::Arc;

/// Where a transaction is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// New definition received
    Announced,
    /// Patches computed
    Diffed,
    /// Rules and dispatch entries published
    RulesInstalled,
    /// Bodies rewritten and swapped
    Rewritten,
    /// Current descriptor recorded
    Committed,
    /// Stopped with an error
    Failed(String),
}

/// Outcome of a committed redefinition
#[derive(Debug, Clone)]
pub struct RedefinitionReport {
    /// The redefined type
    pub type_id: TypeIdentifier,
    /// Patches appended to the type's log
    pub patches: Vec<Patch>,
    /// Summary handed to listeners
    pub change: ChangedType,
    /// Classes visited by the rewrite pass
    pub classes_rewritten: usize,
    /// Method bodies swapped in the host
    pub bodies_replaced: usize,
    /// Methods of other types that could not be rewritten
    pub skipped: Vec<MethodFailure>,
}

/// Result of rewriting one class
#[derive(Debug, Default)]
struct Installed {
    replaced: usize,
    failures: Vec<MethodFailure>,
}

/// A rewritten class not yet installed
#[derive(Debug, Default)]
struct Prepared {
    /// Bodies of physical methods to swap
    physical: Vec<MethodBody>,
    /// The class's full set of dispatch entries
    dispatch: Vec<Arc<MethodBody>>,
    failures: Vec<MethodFailure>,
}

/// Runs redefinition transactions
pub struct RedefinitionCoordinator {
    transaction_locks: DashMap<TypeIdentifier, Arc<Mutex<()>>>,
    code_locks: DashMap<TypeIdentifier, Arc<Mutex<()>>>,
    states: DashMap<TypeIdentifier, TransactionState>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
}

impl Default for RedefinitionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RedefinitionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedefinitionCoordinator")
            .field("transactions", &self.states.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

fn loader_id(loader: Option<&Arc<Loader>>) -> LoaderId {
    loader.map_or(LoaderId::BOOTSTRAP, |l| l.id())
}

fn failure(class: &str, name: &str, descriptor: &str, error: RewriteError) -> MethodFailure {
    MethodFailure {
        class: class.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        error,
    }
}

impl RedefinitionCoordinator {
    /// Create a coordinator with no listeners
    pub fn new() -> Self {
        Self {
            transaction_locks: DashMap::new(),
            code_locks: DashMap::new(),
            states: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a change listener
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.listeners.write().push(listener);
    }

    /// State of the latest transaction on a type
    pub fn state(&self, type_id: &TypeIdentifier) -> Option<TransactionState> {
        self.states.get(type_id).map(|s| s.clone())
    }

    fn transition(&self, type_id: &TypeIdentifier, state: TransactionState) {
        tracing::debug!(%type_id, ?state, "redefinition state");
        self.states.insert(type_id.clone(), state);
    }

    fn lock_for(
        locks: &DashMap<TypeIdentifier, Arc<Mutex<()>>>,
        type_id: &TypeIdentifier,
    ) -> Arc<Mutex<()>> {
        locks.entry(type_id.clone()).or_default().clone()
    }

    fn listeners(&self) -> Vec<Arc<dyn ChangeListener>> {
        self.listeners.read().clone()
    }

    /// Redefine `type_name` in `loader` to the class in `new_bytes`
    ///
    /// `old_bytes`, when given, seeds the baseline of a type the engine has
    /// not seen before.
    pub fn redefine(
        &self,
        engine: &Engine,
        host: &dyn RedefinitionHost,
        loader: Option<&Arc<Loader>>,
        type_name: &str,
        old_bytes: Option<&[u8]>,
        new_bytes: &[u8],
    ) -> Result<RedefinitionReport, RedefineError> {
        let type_id = TypeIdentifier::new(type_name, loader_id(loader));
        let lock = Self::lock_for(&self.transaction_locks, &type_id);
        let _transaction = lock.lock();

        self.transition(&type_id, TransactionState::Announced);
        let result = self.run(engine, host, loader, &type_id, old_bytes, new_bytes);
        match &result {
            Ok(report) => tracing::info!(
                %type_id,
                patches = report.patches.len(),
                bodies = report.bodies_replaced,
                "redefinition committed"
            ),
            Err(err) => {
                tracing::warn!(%type_id, error = %err, "redefinition failed");
                self.transition(&type_id, TransactionState::Failed(err.to_string()));
            }
        }
        result
    }

    fn run(
        &self,
        engine: &Engine,
        host: &dyn RedefinitionHost,
        loader: Option<&Arc<Loader>>,
        type_id: &TypeIdentifier,
        old_bytes: Option<&[u8]>,
        new_bytes: &[u8],
    ) -> Result<RedefinitionReport, RedefineError> {
        let type_name = type_id.name();
        let new_def = Arc::new(ClassDef::decode(new_bytes)?);
        if new_def.name != type_name {
            return Err(RedefineError::NameMismatch {
                expected: type_name.to_string(),
                found: new_def.name.clone(),
            });
        }
        let class = host
            .find_class(loader, type_name)
            .filter(|c| c.id() == type_id)
            .ok_or_else(|| RedefineError::UnknownType(type_id.clone()))?;
        if !host.is_replaceable(type_name, loader) {
            return Err(RedefineError::NotReplaceable(type_id.clone()));
        }
        if class.original().super_name != new_def.super_name {
            return Err(RedefineError::SuperChanged {
                type_id: type_id.clone(),
                old: class.original().super_name.clone(),
                new: new_def.super_name.clone(),
            });
        }

        // Diff
        let registry = engine.registry();
        if let Some(old) = old_bytes {
            if registry.get_baseline(host, loader, type_name).is_none() {
                let old_def = ClassDef::decode(old)?;
                registry.record_baseline(loader, type_name, Layout::of_class(&old_def));
            }
        }
        let current = registry
            .get_current(host, loader, type_name)
            .ok_or_else(|| RedefineError::UnknownType(type_id.clone()))?;
        let patches = diff_layouts(&current, &Layout::of_class(&new_def), type_id, engine.store());
        let next = current.with_patches(patches.clone());
        let change = ChangedType::new(
            type_id.clone(),
            &patches,
            changed_bodies(&class.source(), &new_def),
        );
        self.transition(type_id, TransactionState::Diffed);
        for listener in self.listeners() {
            listener.before_change(&change);
        }

        // Publish rules, then the redefined type's dispatch entries
        let mut rules = Vec::new();
        for member in next.added() {
            let sig = &member.sig;
            let (target, kind) = match member.kind {
                MemberKind::Field => (
                    type_id.clone(),
                    RewriteKind::FieldRedirect {
                        slot: member.slot,
                        is_static: member.is_static(),
                    },
                ),
                MemberKind::Method if member.is_static() => {
                    (type_id.clone(), RewriteKind::MethodRedirect { is_static: true })
                }
                // Owned by this type even though the ancestor is rewritten
                MemberKind::Method => match physical_ancestor(&class, sig) {
                    Some(ancestor) => (ancestor.id().clone(), RewriteKind::SubclassDispatch),
                    None => (type_id.clone(), RewriteKind::MethodRedirect { is_static: false }),
                },
            };
            rules.push(PatchRule::new(target, &sig.name, &sig.descriptor, kind));
        }
        engine.rules().replace(type_name, loader, rules);

        let own = self.install_class(engine, host, &class, Some(new_def), || {
            self.transition(type_id, TransactionState::RulesInstalled)
        });
        let mut classes_rewritten = 1;
        let mut bodies_replaced = own.replaced;
        let mut skipped = Vec::new();

        for other in host.loaded_classes() {
            if other.id() == type_id || other.is_orphaned() {
                continue;
            }
            let other_loader = other.loader();
            if !host.is_replaceable(other.name(), other_loader.as_ref()) {
                continue;
            }
            let installed = self.install_class(engine, host, &other, None, || {});
            classes_rewritten += 1;
            bodies_replaced += installed.replaced;
            for failure in installed.failures {
                tracing::warn!(%failure, "left method unrewritten");
                skipped.push(failure);
            }
        }
        self.transition(type_id, TransactionState::Rewritten);

        if !own.failures.is_empty() {
            for failure in &own.failures {
                tracing::warn!(%failure, "left method unrewritten");
            }
            return Err(RedefineError::PartialRedefinition {
                type_id: type_id.clone(),
                failures: own.failures,
            });
        }

        // Commit
        registry.record_current(loader, type_name, next);
        registry.mark_replaced(type_id.clone());
        self.transition(type_id, TransactionState::Committed);
        for listener in self.listeners() {
            listener.after_change(&change);
        }

        Ok(RedefinitionReport {
            type_id: type_id.clone(),
            patches,
            change,
            classes_rewritten,
            bodies_replaced,
            skipped,
        })
    }

    /// Rewrite one class from its source and install the result
    ///
    /// With `new_source` the class's source definition is replaced first.
    /// The class's dispatch entries are swapped as one set and `published`
    /// runs before any physical body is replaced.
    fn install_class(
        &self,
        engine: &Engine,
        host: &dyn RedefinitionHost,
        class: &Arc<RuntimeClass>,
        new_source: Option<Arc<ClassDef>>,
        published: impl FnOnce(),
    ) -> Installed {
        let lock = Self::lock_for(&self.code_locks, class.id());
        let _code = lock.lock();

        let source = match new_source {
            // Kept even if the transaction fails; later sweeps rewrite from it
            Some(source) => {
                class.set_source(source.clone());
                source
            }
            None => class.source(),
        };
        let loader = class.loader();
        if !class.is_bootstrap() && loader.is_none() {
            published();
            return Installed::default();
        }

        let prepared = prepare(engine, host, class, &source, loader.as_ref());
        engine
            .dispatch()
            .replace(loader.as_ref(), class.name(), prepared.dispatch);
        published();

        let mut failures = prepared.failures;
        let mut replaced = 0;
        for body in prepared.physical {
            let unchanged = class
                .method(&body.name, &body.descriptor)
                .is_some_and(|installed| installed.same_code(&body));
            if unchanged {
                continue;
            }
            let (name, descriptor) = (body.name.clone(), body.descriptor.clone());
            match host.replace_body(class, body) {
                Ok(()) => replaced += 1,
                Err(err) => failures.push(failure(
                    class.name(),
                    &name,
                    &descriptor,
                    RewriteError::Rejected(err.to_string()),
                )),
            }
        }

        Installed { replaced, failures }
    }
}

/// Rewrite a class's source against the rules in effect
///
/// Physical methods get their rewritten body; methods that only exist
/// logically go to the dispatch set, as do physical overrides of methods an
/// ancestor only has logically. Physical methods missing from the source
/// get a `NoSuchMethod` stub. A method that fails keeps its previous
/// dispatch entry.
fn prepare(
    engine: &Engine,
    host: &dyn RedefinitionHost,
    class: &Arc<RuntimeClass>,
    source: &ClassDef,
    loader: Option<&Arc<Loader>>,
) -> Prepared {
    let rules = engine.rule_index(loader);
    let hierarchy = LoadedHierarchy::new(host, loader.cloned());
    let mut rewritten = CodeRewriter::new(&rules, &hierarchy).rewrite_class(source);
    let mut failures = std::mem::take(&mut rewritten.failures);

    let original = class.original();
    let mut stubs = Vec::new();
    for method in &original.methods {
        if rewritten.class.find_method(&method.name, &method.descriptor).is_some() {
            continue;
        }
        match removed_method_stub(
            class.name(),
            &method.name,
            &method.descriptor,
            method.access,
            &mut rewritten.class.constants,
        ) {
            Ok(stub) => stubs.push(stub),
            Err(error) => failures.push(failure(
                class.name(),
                &method.name,
                &method.descriptor,
                error,
            )),
        }
    }

    let pool = Arc::new(rewritten.class.constants.clone());
    let mut prepared = Prepared::default();
    let previous = |method: &MethodDef| {
        engine.dispatch().declared(
            loader,
            class.name(),
            &method.name,
            &method.descriptor,
            method.is_static(),
        )
    };
    for method in rewritten.class.methods.iter().chain(stubs.iter()) {
        if method.code.is_empty() {
            continue;
        }
        let mut failed = failures
            .iter()
            .any(|f| f.name == method.name && f.descriptor == method.descriptor);
        if !failed {
            if let Err(error) = check(engine, method, &pool) {
                failures.push(failure(class.name(), &method.name, &method.descriptor, error));
                failed = true;
            }
        }
        if failed {
            prepared.dispatch.extend(previous(method));
            continue;
        }

        let body = MethodBody::from_def(class.id().clone(), method, pool.clone());
        if original.find_method(&method.name, &method.descriptor).is_some() {
            let overrides_added = !body.is_static()
                && source.super_name.as_deref().is_some_and(|parent| {
                    rules.method(parent, &body.name, &body.descriptor, false, &hierarchy)
                });
            if overrides_added {
                prepared.dispatch.push(Arc::new(body.clone()));
            }
            prepared.physical.push(body);
        } else {
            prepared.dispatch.push(Arc::new(body));
        }
    }

    prepared.failures = failures;
    prepared
}

/// Verify a body and enforce the configured stack limit
fn check(engine: &Engine, method: &MethodDef, pool: &ConstantPool) -> Result<(), RewriteError> {
    let limit = engine.config().max_stack;
    if method.max_stack > limit {
        return Err(RewriteError::StackLimit {
            computed: method.max_stack,
            limit,
        });
    }
    if engine.config().verify_rewritten {
        verify_method(method, pool)?;
    }
    Ok(())
}

/// Closest ancestor that physically declares an instance method
fn physical_ancestor(class: &RuntimeClass, sig: &MemberSig) -> Option<Arc<RuntimeClass>> {
    let mut ancestor = class.super_class().cloned();
    while let Some(candidate) = ancestor {
        if candidate
            .method(&sig.name, &sig.descriptor)
            .is_some_and(|m| !m.is_static())
        {
            return Some(candidate);
        }
        ancestor = candidate.super_class().cloned();
    }
    None
}

/// Methods declared by both definitions whose code differs
fn changed_bodies(old: &ClassDef, new: &ClassDef) -> Vec<MemberSig> {
    new.methods
        .iter()
        .filter(|m| {
            old.find_method(&m.name, &m.descriptor)
                .is_some_and(|o| o.code != m.code)
        })
        .map(|m| MemberSig::new(&m.name, &m.descriptor, m.access))
        .collect()
}
