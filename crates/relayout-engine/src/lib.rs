//! Relayout Engine
//!
//! Live type redefinition on top of a runtime that can only swap method
//! bodies. Structural changes (added or removed fields and methods) are
//! tracked as logical layouts and realized by rewriting code:
//!
//! - **Registry**: baseline and current layout per loader and type (`registry`)
//! - **Diff**: patches between a current layout and a new definition (`diff`)
//! - **Store**: out-of-band storage for added fields (`added`)
//! - **Rules**: which call sites and field accesses to redirect (`rules`)
//! - **Rewriter**: bytecode rewriting against the rules (`rewrite`)
//! - **Dispatch**: implementations of added methods (`dispatch`)
//! - **Coordinator**: the redefinition transaction (`coordinator`)
//! - **VM**: a small host runtime with a body-swap facility (`vm`)
//!
//! # Example
//!
//! ```rust,ignore
//! use relayout_engine::vm::{Value, Vm};
//!
//! let vm = Vm::default();
//! let point = vm.define_class(None, &point_v1)?;
//! let p = vm.new_object(&point);
//!
//! // v2 adds a field and a method using it
//! vm.redefine(None, "app/Point", &point_v2)?;
//! let z = vm.invoke_virtual(&p, "getZ", "()I", vec![])?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod added;
pub mod body;
pub mod config;
pub mod coordinator;
pub mod diff;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod identity;
pub mod layout;
pub mod listener;
pub mod reflect;
pub mod registry;
pub mod rewrite;
pub mod rules;
pub mod vm;
pub mod weak;

pub use added::{AddedMemberStore, SlotInfo};
pub use body::MethodBody;
pub use config::{ConfigError, EngineConfig};
pub use coordinator::{RedefinitionCoordinator, RedefinitionReport, TransactionState};
pub use diff::diff_layouts;
pub use dispatch::{DispatchTable, DispatchTarget};
pub use engine::{Engine, PurgeStats};
pub use error::{EngineError, MethodFailure, RedefineError, RewriteError};
pub use identity::{LoaderId, TypeIdentifier};
pub use layout::{
    AddedMember, BaselineDescriptor, CurrentDescriptor, Layout, MemberKind, MemberSig, Patch,
    SlotId,
};
pub use listener::{ChangeListener, ChangedType};
pub use reflect::{FieldInfo, MethodInfo, Reflector};
pub use registry::TypeMetadataRegistry;
pub use rewrite::{CodeRewriter, RuleIndex};
pub use rules::{PatchRule, PatchRuleStore, RewriteKind};
pub use vm::{Loader, RedefinitionHost, RuntimeClass, Value, Vm, VmError};
