//! Boundary between the engine and the runtime hosting it

use super::{Loader, RuntimeClass, VmError};
use crate::body::MethodBody;
use std::sync::Arc;

/// What the engine needs from the runtime
///
/// The runtime's own redefinition facility is `replace_body`: it swaps the
/// body of a method that is already declared with the same name and
/// descriptor. Everything else the engine does is layered on top of that.
pub trait RedefinitionHost {
    /// Whether the type may be redefined
    fn is_replaceable(&self, type_name: &str, loader: Option<&Arc<Loader>>) -> bool;

    /// Class visible from `loader` (falling back to bootstrap)
    fn find_class(&self, loader: Option<&Arc<Loader>>, type_name: &str) -> Option<Arc<RuntimeClass>>;

    /// Every class currently loaded, across loaders
    fn loaded_classes(&self) -> Vec<Arc<RuntimeClass>>;

    /// Swap a method body
    ///
    /// Fails with [`VmError::ShapeChange`] unless `class` already declares a
    /// method with the body's name and descriptor.
    fn replace_body(&self, class: &RuntimeClass, body: MethodBody) -> Result<(), VmError>;
}
