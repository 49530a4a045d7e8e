//! Method body rewriting
//!
//! The rewriter is a pure function of a method, its constant pool and the
//! rules in effect. It re-emits the method instruction by instruction,
//! replacing matched field accesses and calls with runtime sequences and
//! optionally prefixing a subclass-dispatch prologue. Original branches are
//! re-targeted through labels, and the stack limit is recomputed from the
//! result.

mod emit;
mod sequences;

pub use emit::{CodeBuilder, Label};

use crate::error::{MethodFailure, RewriteError};
use crate::identity::{LoaderId, TypeIdentifier};
use crate::layout::SlotId;
use crate::rules::{PatchRule, RewriteKind};
use crate::vm::{Loader, RedefinitionHost, RuntimeClass};
use relayout_bytecode::{
    compute_max_stack, decode_instructions, ClassDef, ConstantPool, FieldType, Instruction,
    MethodDef, MethodDescriptor, Opcode,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// Longest super chain followed when matching rules
const MAX_HIERARCHY_DEPTH: usize = 256;

type MemberKey = (TypeIdentifier, String, String);

fn member_key(owner: &TypeIdentifier, name: &str, descriptor: &str) -> MemberKey {
    (owner.clone(), name.to_string(), descriptor.to_string())
}

/// Type resolution, super-type and declaration queries the rewriter needs
/// to match rules against member references that name a subclass of the
/// rule's owner
pub trait ClassHierarchy {
    /// Type that `class` names in the code being rewritten
    fn resolve(&self, class: &str) -> Option<TypeIdentifier>;

    /// Super type of `class`, if known
    fn super_type(&self, class: &TypeIdentifier) -> Option<TypeIdentifier>;

    /// Whether `class` physically declares the field
    fn declares_field(&self, class: &TypeIdentifier, name: &str, descriptor: &str) -> bool;

    /// Whether `class` physically declares the method
    fn declares_method(&self, class: &TypeIdentifier, name: &str, descriptor: &str) -> bool;
}

/// Field redirect target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRedirect {
    /// Storage slot
    pub slot: SlotId,
    /// Static field
    pub is_static: bool,
}

/// Rules in effect for one rewrite, indexed by member
#[derive(Debug, Clone, Default)]
pub struct RuleIndex {
    fields: FxHashMap<MemberKey, FieldRedirect>,
    methods: FxHashMap<MemberKey, bool>,
    subclass_dispatch: FxHashSet<MemberKey>,
}

impl RuleIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a set of rules
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a PatchRule>) -> Self {
        let mut index = Self::new();
        for rule in rules {
            index.insert(rule);
        }
        index
    }

    /// Add one rule
    pub fn insert(&mut self, rule: &PatchRule) {
        let key = member_key(&rule.owner, &rule.name, &rule.descriptor);
        match rule.kind {
            RewriteKind::SubclassDispatch => {
                self.subclass_dispatch.insert(key);
            }
            RewriteKind::FieldRedirect { slot, is_static } => {
                self.fields.insert(key, FieldRedirect { slot, is_static });
            }
            RewriteKind::MethodRedirect { is_static } => {
                self.methods.insert(key, is_static);
            }
        }
    }

    /// Number of indexed rules
    pub fn len(&self) -> usize {
        self.fields.len() + self.methods.len() + self.subclass_dispatch.len()
    }

    /// Whether no rules are indexed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `class`'s own method gets the subclass-dispatch prologue
    pub fn has_subclass_dispatch(
        &self,
        class: &TypeIdentifier,
        name: &str,
        descriptor: &str,
    ) -> bool {
        self.subclass_dispatch
            .contains(&member_key(class, name, descriptor))
    }

    /// Redirect for a field reference, searching from the referenced owner up
    pub fn field(
        &self,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_static: bool,
        hierarchy: &dyn ClassHierarchy,
    ) -> Option<FieldRedirect> {
        walk(owner, hierarchy, |class| {
            if let Some(redirect) = self.fields.get(&member_key(class, name, descriptor)) {
                return Step::Found((redirect.is_static == is_static).then_some(*redirect));
            }
            if hierarchy.declares_field(class, name, descriptor) {
                return Step::Found(None);
            }
            Step::Continue
        })
    }

    /// Whether a method reference is redirected, searching from the
    /// referenced owner up
    pub fn method(
        &self,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_static: bool,
        hierarchy: &dyn ClassHierarchy,
    ) -> bool {
        walk(owner, hierarchy, |class| {
            if let Some(&rule_static) = self.methods.get(&member_key(class, name, descriptor)) {
                return Step::Found((rule_static == is_static).then_some(()));
            }
            if hierarchy.declares_method(class, name, descriptor) {
                return Step::Found(None);
            }
            Step::Continue
        })
        .is_some()
    }
}

enum Step<T> {
    Found(Option<T>),
    Continue,
}

/// Visit the type `start` names and its ancestors; an unresolved name
/// matches nothing
fn walk<T>(
    start: &str,
    hierarchy: &dyn ClassHierarchy,
    mut visit: impl FnMut(&TypeIdentifier) -> Step<T>,
) -> Option<T> {
    let mut class = hierarchy.resolve(start)?;
    for _ in 0..MAX_HIERARCHY_DEPTH {
        match visit(&class) {
            Step::Found(result) => return result,
            Step::Continue => class = hierarchy.super_type(&class)?,
        }
    }
    None
}

/// Result of rewriting every method of a class
#[derive(Debug, Clone)]
pub struct RewrittenClass {
    /// The class with rewritten bodies and the extended pool
    pub class: ClassDef,
    /// (name, descriptor) of methods whose code changed
    pub changed: Vec<(String, String)>,
    /// Methods left as they were because their rewrite failed
    pub failures: Vec<MethodFailure>,
}

impl RewrittenClass {
    /// Whether the method's rewrite failed
    pub fn failed(&self, name: &str, descriptor: &str) -> bool {
        self.failures
            .iter()
            .any(|f| f.name == name && f.descriptor == descriptor)
    }
}

/// Applies a rule index to method bodies
pub struct CodeRewriter<'a> {
    rules: &'a RuleIndex,
    hierarchy: &'a dyn ClassHierarchy,
}

impl<'a> CodeRewriter<'a> {
    /// Create a rewriter
    pub fn new(rules: &'a RuleIndex, hierarchy: &'a dyn ClassHierarchy) -> Self {
        Self { rules, hierarchy }
    }

    /// Rewrite one method of `class_name`
    ///
    /// Returns `None` when no rule applies. New constants are appended to
    /// `pool`.
    pub fn rewrite_method(
        &self,
        class_name: &str,
        method: &MethodDef,
        pool: &mut ConstantPool,
    ) -> Result<Option<MethodDef>, RewriteError> {
        if method.code.is_empty() {
            return Ok(None);
        }

        let desc = MethodDescriptor::parse(&method.descriptor)?;
        let instructions = decode_instructions(&method.code)?;
        let index_of: FxHashMap<usize, usize> = instructions
            .iter()
            .enumerate()
            .map(|(i, instr)| (instr.offset, i))
            .collect();

        let mut builder = CodeBuilder::new();
        let labels: Vec<Label> = instructions.iter().map(|_| builder.define_label()).collect();
        let mut changed = false;

        let dispatches = !method.is_static()
            && self.hierarchy.resolve(class_name).is_some_and(|class| {
                self.rules
                    .has_subclass_dispatch(&class, &method.name, &method.descriptor)
            });
        if dispatches {
            sequences::subclass_dispatch_prologue(
                &mut builder,
                pool,
                class_name,
                &method.name,
                &method.descriptor,
                &desc,
                labels[0],
            );
            changed = true;
        }

        for (i, instr) in instructions.iter().enumerate() {
            builder.mark_label(labels[i]);

            if let Some(target) = instr.jump_target() {
                let target_index = usize::try_from(target)
                    .ok()
                    .and_then(|t| index_of.get(&t).copied())
                    .ok_or(RewriteError::InvalidBranch {
                        offset: instr.offset,
                        target,
                    })?;
                builder.emit_branch(instr.opcode, labels[target_index]);
                continue;
            }

            if self.rewrite_site(instr, &mut builder, pool)? {
                changed = true;
            } else {
                builder.emit(instr.clone());
            }
        }

        if !changed {
            return Ok(None);
        }

        let code = builder.finish()?;
        let max_stack = compute_max_stack(&decode_instructions(&code)?, pool)?;
        Ok(Some(MethodDef {
            code,
            max_stack,
            ..method.clone()
        }))
    }

    /// Emit the replacement for a matched site; false if nothing matched
    fn rewrite_site(
        &self,
        instr: &Instruction,
        builder: &mut CodeBuilder,
        pool: &mut ConstantPool,
    ) -> Result<bool, RewriteError> {
        let missing = |index| RewriteError::MissingConstant {
            index,
            offset: instr.offset,
        };

        match instr.opcode {
            Opcode::GetField | Opcode::PutField | Opcode::GetStatic | Opcode::PutStatic => {
                let index = instr.pool_index().unwrap_or(u32::MAX);
                let field = pool.get_field(index).ok_or_else(|| missing(index))?.clone();
                let is_static = matches!(instr.opcode, Opcode::GetStatic | Opcode::PutStatic);
                let Some(redirect) = self.rules.field(
                    &field.owner,
                    &field.name,
                    &field.descriptor,
                    is_static,
                    self.hierarchy,
                ) else {
                    return Ok(false);
                };

                if matches!(instr.opcode, Opcode::GetField | Opcode::GetStatic) {
                    let ty = FieldType::parse(&field.descriptor)?;
                    sequences::field_get(builder, pool, redirect.slot, is_static, &ty);
                } else {
                    sequences::field_put(builder, redirect.slot, is_static);
                }
                Ok(true)
            }
            Opcode::InvokeVirtual | Opcode::InvokeStatic => {
                let index = instr.pool_index().unwrap_or(u32::MAX);
                let method = pool.get_method(index).ok_or_else(|| missing(index))?.clone();
                let is_static = instr.opcode == Opcode::InvokeStatic;
                if !self.rules.method(
                    &method.owner,
                    &method.name,
                    &method.descriptor,
                    is_static,
                    self.hierarchy,
                ) {
                    return Ok(false);
                }

                let desc = MethodDescriptor::parse(&method.descriptor)?;
                if is_static {
                    sequences::static_call(
                        builder,
                        pool,
                        &method.owner,
                        &method.name,
                        &method.descriptor,
                        &desc,
                    );
                } else {
                    sequences::virtual_call(builder, pool, &method.name, &method.descriptor, &desc);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Rewrite every method of a class
    ///
    /// Failed methods keep their original code and are reported.
    pub fn rewrite_class(&self, class: &ClassDef) -> RewrittenClass {
        let mut out = class.clone();
        let mut changed = Vec::new();
        let mut failures = Vec::new();

        for (i, method) in class.methods.iter().enumerate() {
            match self.rewrite_method(&class.name, method, &mut out.constants) {
                Ok(Some(rewritten)) => {
                    changed.push((method.name.clone(), method.descriptor.clone()));
                    out.methods[i] = rewritten;
                }
                Ok(None) => {}
                Err(error) => failures.push(MethodFailure {
                    class: class.name.clone(),
                    name: method.name.clone(),
                    descriptor: method.descriptor.clone(),
                    error,
                }),
            }
        }

        RewrittenClass {
            class: out,
            changed,
            failures,
        }
    }
}

/// Replacement body for a method that no longer exists logically
pub fn removed_method_stub(
    class_name: &str,
    name: &str,
    descriptor: &str,
    access: u16,
    pool: &mut ConstantPool,
) -> Result<MethodDef, RewriteError> {
    MethodDescriptor::parse(descriptor)?;
    let mut builder = CodeBuilder::new();
    sequences::no_such_method(
        &mut builder,
        pool,
        &format!("{}.{}{}", class_name, name, descriptor),
    );
    let code = builder.finish()?;
    Ok(MethodDef::assemble(name, descriptor, access, code, pool)?)
}

/// Hierarchy of the classes loaded in a host, as seen from one loader
///
/// Names resolve the way the loader resolves them: its own classes first,
/// then bootstrap. A class that is being defined and not registered yet can
/// be supplied as `pending`; its own definition answers queries about it.
pub struct LoadedHierarchy<'a> {
    host: &'a dyn RedefinitionHost,
    loader: Option<Arc<Loader>>,
    pending: Option<&'a ClassDef>,
}

impl<'a> LoadedHierarchy<'a> {
    /// Hierarchy visible from `loader`
    pub fn new(host: &'a dyn RedefinitionHost, loader: Option<Arc<Loader>>) -> Self {
        Self {
            host,
            loader,
            pending: None,
        }
    }

    /// Also answer for a class that is not loaded yet
    pub fn with_pending(mut self, class: &'a ClassDef) -> Self {
        self.pending = Some(class);
        self
    }

    fn loader_id(&self) -> LoaderId {
        self.loader.as_ref().map_or(LoaderId::BOOTSTRAP, |l| l.id())
    }

    fn pending(&self, class: &TypeIdentifier) -> Option<&'a ClassDef> {
        self.pending
            .filter(|def| def.name == class.name() && class.loader() == self.loader_id())
    }

    /// Loaded class with exactly this identity
    fn class(&self, id: &TypeIdentifier) -> Option<Arc<RuntimeClass>> {
        let scope = if id.loader().is_bootstrap() {
            None
        } else {
            Some(self.loader.as_ref().filter(|l| l.id() == id.loader())?)
        };
        self.host
            .find_class(scope, id.name())
            .filter(|c| c.id() == id)
    }
}

impl ClassHierarchy for LoadedHierarchy<'_> {
    fn resolve(&self, class: &str) -> Option<TypeIdentifier> {
        if self.pending.is_some_and(|def| def.name == class) {
            return Some(TypeIdentifier::new(class, self.loader_id()));
        }
        self.host
            .find_class(self.loader.as_ref(), class)
            .map(|c| c.id().clone())
    }

    fn super_type(&self, class: &TypeIdentifier) -> Option<TypeIdentifier> {
        if let Some(def) = self.pending(class) {
            return self.resolve(def.super_name.as_deref()?);
        }
        self.class(class)?.super_class().map(|s| s.id().clone())
    }

    fn declares_field(&self, class: &TypeIdentifier, name: &str, descriptor: &str) -> bool {
        let has = |def: &ClassDef| {
            def.fields
                .iter()
                .any(|f| f.name == name && f.descriptor == descriptor)
        };
        if let Some(def) = self.pending(class) {
            return has(def);
        }
        self.class(class).is_some_and(|c| has(c.original()))
    }

    fn declares_method(&self, class: &TypeIdentifier, name: &str, descriptor: &str) -> bool {
        if let Some(def) = self.pending(class) {
            return def.find_method(name, descriptor).is_some();
        }
        self.class(class)
            .is_some_and(|c| c.declares_method(name, descriptor))
    }
}
