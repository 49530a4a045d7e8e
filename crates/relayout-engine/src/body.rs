//! Installed method bodies

use crate::identity::TypeIdentifier;
use crate::layout::MemberSig;
use relayout_bytecode::{access, ConstantPool, MethodDef};
use std::sync::Arc;

/// Executable method body together with the constant pool it indexes
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    /// Declaring type
    pub owner: TypeIdentifier,
    /// Method name
    pub name: String,
    /// Method descriptor
    pub descriptor: String,
    /// Access flags
    pub access: u16,
    /// Maximum operand stack depth
    pub max_stack: u16,
    /// Local slots
    pub max_locals: u16,
    /// Bytecode
    pub code: Vec<u8>,
    /// Pool the code's operands index into
    pub constants: Arc<ConstantPool>,
}

impl MethodBody {
    /// Body of a method definition
    pub fn from_def(owner: TypeIdentifier, def: &MethodDef, constants: Arc<ConstantPool>) -> Self {
        Self {
            owner,
            name: def.name.clone(),
            descriptor: def.descriptor.clone(),
            access: def.access,
            max_stack: def.max_stack,
            max_locals: def.max_locals,
            code: def.code.clone(),
            constants,
        }
    }

    /// Whether the method is static
    pub fn is_static(&self) -> bool {
        self.access & access::STATIC != 0
    }

    /// Declared signature
    pub fn sig(&self) -> MemberSig {
        MemberSig::new(&self.name, &self.descriptor, self.access)
    }

    /// `Owner.name(desc)` for messages
    pub fn qualified_name(&self) -> String {
        format!("{}.{}{}", self.owner.name(), self.name, self.descriptor)
    }

    /// Whether the body would execute the same code as `other`
    pub fn same_code(&self, other: &MethodBody) -> bool {
        self.code == other.code
            && (Arc::ptr_eq(&self.constants, &other.constants) || self.constants == other.constants)
    }
}
