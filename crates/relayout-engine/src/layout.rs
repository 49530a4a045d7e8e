//! Member layouts and their history
//!
//! A [`BaselineDescriptor`] is the layout a type had when the engine first
//! saw it; the host can never change that physical shape. Every
//! redefinition appends [`Patch`]es to a log, and the [`CurrentDescriptor`]
//! is the baseline folded with that log. Current descriptors are rebuilt
//! from scratch and swapped in whole, never edited.

use crate::identity::TypeIdentifier;
use relayout_bytecode::{access, ClassDef};
use std::fmt;
use std::sync::Arc;

/// Synthetic slot id of a member added after load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Field or method signature as declared
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberSig {
    /// Member name
    pub name: String,
    /// Field or method descriptor
    pub descriptor: String,
    /// Access flags
    pub access: u16,
}

impl MemberSig {
    /// Create a signature
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>, access: u16) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            access,
        }
    }

    /// Whether the member is static
    pub fn is_static(&self) -> bool {
        self.access & access::STATIC != 0
    }

    /// Whether `other` names the same member: name, descriptor and staticness
    pub fn same_member(&self, other: &MemberSig) -> bool {
        self.name == other.name
            && self.descriptor == other.descriptor
            && self.is_static() == other.is_static()
    }
}

/// Fields and methods of a type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    /// Super type name
    pub super_name: Option<String>,
    /// Declared fields in declaration order
    pub fields: Vec<MemberSig>,
    /// Declared methods in declaration order
    pub methods: Vec<MemberSig>,
}

impl Layout {
    /// Layout declared by a class definition
    pub fn of_class(class: &ClassDef) -> Self {
        Self {
            super_name: class.super_name.clone(),
            fields: class
                .fields
                .iter()
                .map(|f| MemberSig::new(&f.name, &f.descriptor, f.access))
                .collect(),
            methods: class
                .methods
                .iter()
                .map(|m| MemberSig::new(&m.name, &m.descriptor, m.access))
                .collect(),
        }
    }

    /// Find a field by name and descriptor
    pub fn field(&self, name: &str, descriptor: &str) -> Option<&MemberSig> {
        self.fields
            .iter()
            .find(|f| f.name == name && f.descriptor == descriptor)
    }

    /// Find a method by name and descriptor
    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MemberSig> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    fn has_member(members: &[MemberSig], sig: &MemberSig) -> bool {
        members.iter().any(|m| m.same_member(sig))
    }

    /// Whether an identical field is declared
    pub fn has_field(&self, sig: &MemberSig) -> bool {
        Self::has_member(&self.fields, sig)
    }

    /// Whether an identical method is declared
    pub fn has_method(&self, sig: &MemberSig) -> bool {
        Self::has_member(&self.methods, sig)
    }
}

/// Kind of an added member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    /// Field, stored in the added-member store
    Field,
    /// Method, served by the dispatch table
    Method,
}

/// A member that exists only logically
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddedMember {
    /// Field or method
    pub kind: MemberKind,
    /// Synthetic slot id
    pub slot: SlotId,
    /// Declared signature
    pub sig: MemberSig,
    /// Owning type
    pub owner: TypeIdentifier,
}

impl AddedMember {
    /// Whether the member is static
    pub fn is_static(&self) -> bool {
        self.sig.is_static()
    }
}

/// One entry of the patch log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    /// A field that is not physically present was added
    AddField(AddedMember),
    /// A method that is not physically present was added
    AddMethod(AddedMember),
    /// A physical field that had been removed is declared again
    RestoreField(MemberSig),
    /// A physical method that had been removed is declared again
    RestoreMethod(MemberSig),
    /// A field was removed
    RemoveField(MemberSig),
    /// A method was removed
    RemoveMethod(MemberSig),
}

/// Layout of a type when first observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineDescriptor {
    /// The type
    pub id: TypeIdentifier,
    /// Physical layout
    pub layout: Layout,
}

impl BaselineDescriptor {
    /// Create a baseline
    pub fn new(id: TypeIdentifier, layout: Layout) -> Self {
        Self { id, layout }
    }
}

/// Baseline plus the patches applied to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentDescriptor {
    baseline: Arc<BaselineDescriptor>,
    log: Vec<Patch>,
    layout: Layout,
    added: Vec<AddedMember>,
}

impl CurrentDescriptor {
    /// Current descriptor of a type that was never patched
    pub fn from_baseline(baseline: Arc<BaselineDescriptor>) -> Self {
        Self::derive(baseline, Vec::new())
    }

    /// Fold the patch log over the baseline
    pub fn derive(baseline: Arc<BaselineDescriptor>, log: Vec<Patch>) -> Self {
        let mut layout = baseline.layout.clone();
        let mut added: Vec<AddedMember> = Vec::new();

        for patch in &log {
            match patch {
                Patch::AddField(member) => {
                    layout.fields.push(member.sig.clone());
                    added.push(member.clone());
                }
                Patch::AddMethod(member) => {
                    layout.methods.push(member.sig.clone());
                    added.push(member.clone());
                }
                Patch::RestoreField(sig) => layout.fields.push(sig.clone()),
                Patch::RestoreMethod(sig) => layout.methods.push(sig.clone()),
                Patch::RemoveField(sig) => {
                    layout.fields.retain(|f| !f.same_member(sig));
                    added.retain(|a| !(a.kind == MemberKind::Field && a.sig.same_member(sig)));
                }
                Patch::RemoveMethod(sig) => {
                    layout.methods.retain(|m| !m.same_member(sig));
                    added.retain(|a| !(a.kind == MemberKind::Method && a.sig.same_member(sig)));
                }
            }
        }

        Self {
            baseline,
            log,
            layout,
            added,
        }
    }

    /// A new descriptor with `patches` appended to this one's log
    pub fn with_patches(&self, patches: impl IntoIterator<Item = Patch>) -> Self {
        let mut log = self.log.clone();
        log.extend(patches);
        Self::derive(self.baseline.clone(), log)
    }

    /// The baseline this descriptor was derived from
    pub fn baseline(&self) -> &Arc<BaselineDescriptor> {
        &self.baseline
    }

    /// The type
    pub fn id(&self) -> &TypeIdentifier {
        &self.baseline.id
    }

    /// Applied patches, oldest first
    pub fn log(&self) -> &[Patch] {
        &self.log
    }

    /// Logical layout
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Members that exist only logically
    pub fn added(&self) -> &[AddedMember] {
        &self.added
    }

    /// Added field by name and descriptor
    pub fn added_field(&self, name: &str, descriptor: &str) -> Option<&AddedMember> {
        self.added.iter().find(|a| {
            a.kind == MemberKind::Field && a.sig.name == name && a.sig.descriptor == descriptor
        })
    }

    /// Added method by name and descriptor
    pub fn added_method(&self, name: &str, descriptor: &str) -> Option<&AddedMember> {
        self.added.iter().find(|a| {
            a.kind == MemberKind::Method && a.sig.name == name && a.sig.descriptor == descriptor
        })
    }

    /// Whether a physical method is no longer part of the logical layout
    pub fn is_removed_method(&self, sig: &MemberSig) -> bool {
        self.baseline.layout.has_method(sig) && !self.layout.has_method(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> Arc<BaselineDescriptor> {
        Arc::new(BaselineDescriptor::new(
            TypeIdentifier::bootstrap("app/Point"),
            Layout {
                super_name: None,
                fields: vec![MemberSig::new("x", "I", 0)],
                methods: vec![MemberSig::new("getX", "()I", 0)],
            },
        ))
    }

    fn added_field(name: &str, slot: u32) -> AddedMember {
        AddedMember {
            kind: MemberKind::Field,
            slot: SlotId(slot),
            sig: MemberSig::new(name, "J", 0),
            owner: TypeIdentifier::bootstrap("app/Point"),
        }
    }

    #[test]
    fn test_unpatched_current_equals_baseline() {
        let base = baseline();
        let current = CurrentDescriptor::from_baseline(base.clone());
        assert_eq!(current.layout(), &base.layout);
        assert!(current.log().is_empty());
        assert!(current.added().is_empty());
    }

    #[test]
    fn test_derivation_is_idempotent() {
        let base = baseline();
        let log = vec![
            Patch::AddField(added_field("y", 1)),
            Patch::RemoveMethod(MemberSig::new("getX", "()I", 0)),
        ];
        let first = CurrentDescriptor::derive(base.clone(), log.clone());
        let second = CurrentDescriptor::derive(base.clone(), first.log().to_vec());
        assert_eq!(first, second);
        assert_eq!(first.layout().fields.len(), 2);
        assert!(first.layout().methods.is_empty());
        assert!(first.is_removed_method(&MemberSig::new("getX", "()I", 0)));
    }

    #[test]
    fn test_remove_then_restore_physical_method() {
        let current = CurrentDescriptor::from_baseline(baseline())
            .with_patches([Patch::RemoveMethod(MemberSig::new("getX", "()I", 0))])
            .with_patches([Patch::RestoreMethod(MemberSig::new("getX", "()I", 0))]);
        assert!(current.layout().method("getX", "()I").is_some());
        assert!(!current.is_removed_method(&MemberSig::new("getX", "()I", 0)));
        assert_eq!(current.log().len(), 2);
    }

    #[test]
    fn test_removing_added_field_drops_it() {
        let current = CurrentDescriptor::from_baseline(baseline())
            .with_patches([Patch::AddField(added_field("y", 4))]);
        assert_eq!(current.added_field("y", "J").map(|a| a.slot), Some(SlotId(4)));

        let current = current.with_patches([Patch::RemoveField(MemberSig::new("y", "J", 0))]);
        assert!(current.added_field("y", "J").is_none());
        assert!(current.layout().field("y", "J").is_none());
    }

    #[test]
    fn test_static_and_instance_are_distinct_members() {
        let a = MemberSig::new("count", "I", 0);
        let b = MemberSig::new("count", "I", access::STATIC);
        assert!(!a.same_member(&b));
    }
}
