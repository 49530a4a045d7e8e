//! Change notifications
//!
//! Framework adapters register a [`ChangeListener`] to hear about
//! redefinitions. `before_change` runs once the diff is known and before
//! anything is installed; `after_change` runs after the transaction commits.

use crate::identity::TypeIdentifier;
use crate::layout::{MemberSig, Patch};

/// Members touched by one redefinition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedType {
    /// The redefined type
    pub type_id: TypeIdentifier,
    /// Fields added or restored
    pub added_fields: Vec<MemberSig>,
    /// Fields removed
    pub removed_fields: Vec<MemberSig>,
    /// Methods added or restored
    pub added_methods: Vec<MemberSig>,
    /// Methods removed
    pub removed_methods: Vec<MemberSig>,
    /// Methods kept with a different body
    pub changed_methods: Vec<MemberSig>,
}

impl ChangedType {
    /// Summarize patches and body changes
    pub fn new(type_id: TypeIdentifier, patches: &[Patch], changed_methods: Vec<MemberSig>) -> Self {
        let mut change = Self {
            type_id,
            added_fields: Vec::new(),
            removed_fields: Vec::new(),
            added_methods: Vec::new(),
            removed_methods: Vec::new(),
            changed_methods,
        };
        for patch in patches {
            match patch {
                Patch::AddField(member) => change.added_fields.push(member.sig.clone()),
                Patch::RestoreField(sig) => change.added_fields.push(sig.clone()),
                Patch::AddMethod(member) => change.added_methods.push(member.sig.clone()),
                Patch::RestoreMethod(sig) => change.added_methods.push(sig.clone()),
                Patch::RemoveField(sig) => change.removed_fields.push(sig.clone()),
                Patch::RemoveMethod(sig) => change.removed_methods.push(sig.clone()),
            }
        }
        change
    }

    /// Whether nothing about the type changed
    pub fn is_empty(&self) -> bool {
        self.added_fields.is_empty()
            && self.removed_fields.is_empty()
            && self.added_methods.is_empty()
            && self.removed_methods.is_empty()
            && self.changed_methods.is_empty()
    }
}

/// Receives redefinition notifications
pub trait ChangeListener: Send + Sync {
    /// Called after diffing, before rules are installed
    fn before_change(&self, _change: &ChangedType) {}

    /// Called after the redefinition committed
    fn after_change(&self, change: &ChangedType);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{AddedMember, MemberKind, SlotId};

    #[test]
    fn test_summary() {
        let id = TypeIdentifier::bootstrap("app/A");
        let patches = vec![
            Patch::AddField(AddedMember {
                kind: MemberKind::Field,
                slot: SlotId(1),
                sig: MemberSig::new("y", "I", 0),
                owner: id.clone(),
            }),
            Patch::RemoveMethod(MemberSig::new("old", "()V", 0)),
            Patch::RestoreMethod(MemberSig::new("back", "()V", 0)),
        ];
        let change = ChangedType::new(id, &patches, vec![MemberSig::new("run", "()V", 0)]);
        assert_eq!(change.added_fields.len(), 1);
        assert_eq!(change.removed_methods[0].name, "old");
        assert_eq!(change.added_methods[0].name, "back");
        assert_eq!(change.changed_methods.len(), 1);
        assert!(!change.is_empty());
    }
}
