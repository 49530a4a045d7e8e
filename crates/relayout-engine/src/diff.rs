//! Layout diffing
//!
//! Compares the current logical layout of a type with the layout of its
//! incoming definition and produces the patches that take one to the other.

use crate::added::AddedMemberStore;
use crate::identity::TypeIdentifier;
use crate::layout::{AddedMember, CurrentDescriptor, Layout, MemberKind, MemberSig, Patch};

/// Patches turning `current` into `incoming`
///
/// Members that exist in both keep their identity, so an added member that
/// survives a redefinition keeps its slot. A member whose descriptor or
/// staticness changed is a removal plus an addition. Declaring a physical
/// member again after it was removed restores it instead of adding a new
/// slot.
pub fn diff_layouts(
    current: &CurrentDescriptor,
    incoming: &Layout,
    owner: &TypeIdentifier,
    store: &AddedMemberStore,
) -> Vec<Patch> {
    let physical = &current.baseline().layout;
    let logical = current.layout();
    let mut patches = Vec::new();

    for field in &logical.fields {
        if !incoming.has_field(field) {
            patches.push(Patch::RemoveField(field.clone()));
        }
    }
    for method in &logical.methods {
        if !incoming.has_method(method) {
            patches.push(Patch::RemoveMethod(method.clone()));
        }
    }

    for field in &incoming.fields {
        if logical.has_field(field) {
            continue;
        }
        if physical.has_field(field) {
            patches.push(Patch::RestoreField(field.clone()));
        } else {
            patches.push(Patch::AddField(added(MemberKind::Field, field, owner, store)));
        }
    }
    for method in &incoming.methods {
        if logical.has_method(method) {
            continue;
        }
        if physical.has_method(method) {
            patches.push(Patch::RestoreMethod(method.clone()));
        } else {
            patches.push(Patch::AddMethod(added(MemberKind::Method, method, owner, store)));
        }
    }

    patches
}

fn added(
    kind: MemberKind,
    sig: &MemberSig,
    owner: &TypeIdentifier,
    store: &AddedMemberStore,
) -> AddedMember {
    AddedMember {
        kind,
        slot: store.register_slot(owner, &sig.name, &sig.descriptor),
        sig: sig.clone(),
        owner: owner.clone(),
    }
}
