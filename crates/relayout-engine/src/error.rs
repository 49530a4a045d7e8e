//! Engine error types

use crate::identity::TypeIdentifier;
use relayout_bytecode::{ClassFileError, DecodeError, DescriptorError, VerifyError};
use std::fmt;

/// Errors raised by engine components at run time
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// `run` found no implementation for the receiver
    #[error("No dispatch target for {receiver}.{name}{descriptor}")]
    MissingDispatchTarget {
        /// Receiver runtime type
        receiver: String,
        /// Method name
        name: String,
        /// Method descriptor
        descriptor: String,
    },

    /// Slot id that was never registered
    #[error("Unknown added-member slot {0}")]
    UnknownSlot(u32),
}

/// A method body could not be rewritten
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RewriteError {
    /// Code could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Descriptor could not be parsed
    #[error("Bad descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Rewritten code failed stack analysis or verification
    #[error("Verification failed: {0}")]
    Verify(#[from] VerifyError),

    /// Original branch points between instructions or outside the method
    #[error("Branch at offset {offset} targets {target}, not an instruction boundary")]
    InvalidBranch {
        /// Offset of the branch
        offset: usize,
        /// Absolute target
        target: isize,
    },

    /// A constant pool entry the instruction refers to is missing
    #[error("Missing constant #{index} at offset {offset}")]
    MissingConstant {
        /// Pool index
        index: u32,
        /// Offset of the instruction
        offset: usize,
    },

    /// Code builder label was never placed
    #[error("Unplaced label {0}")]
    UnplacedLabel(usize),

    /// Rewritten code needs more stack than allowed
    #[error("Rewritten code needs {computed} stack slots, limit is {limit}")]
    StackLimit {
        /// Computed maximum depth
        computed: u16,
        /// Configured limit
        limit: u16,
    },

    /// The host refused to install the rewritten body
    #[error("Host rejected body: {0}")]
    Rejected(String),
}

/// A method that was left unrewritten
#[derive(Debug, Clone, PartialEq)]
pub struct MethodFailure {
    /// Declaring class
    pub class: String,
    /// Method name
    pub name: String,
    /// Method descriptor
    pub descriptor: String,
    /// Why the rewrite failed
    pub error: RewriteError,
}

impl fmt::Display for MethodFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Malformed rewrite of {}.{}{}: {}",
            self.class, self.name, self.descriptor, self.error
        )
    }
}

/// Errors from a redefinition transaction
#[derive(Debug, thiserror::Error)]
pub enum RedefineError {
    /// New class bytes could not be read
    #[error("Invalid class file: {0}")]
    ClassFile(#[from] ClassFileError),

    /// The host does not allow this type to be replaced
    #[error("Type {0} is not replaceable")]
    NotReplaceable(TypeIdentifier),

    /// The class bytes define another type
    #[error("Class bytes define {found}, expected {expected}")]
    NameMismatch {
        /// Requested type name
        expected: String,
        /// Name in the class bytes
        found: String,
    },

    /// The super type cannot change
    #[error("Super type of {type_id} cannot change from {old:?} to {new:?}")]
    SuperChanged {
        /// The type
        type_id: TypeIdentifier,
        /// Loaded super type
        old: Option<String>,
        /// Requested super type
        new: Option<String>,
    },

    /// No loaded type and no layout to start from
    #[error("Unknown type {0}")]
    UnknownType(TypeIdentifier),

    /// Some methods of the redefined type could not be rewritten
    ///
    /// Types rewritten before the failure stay rewritten; the current
    /// descriptor is not updated.
    #[error("Partial redefinition of {type_id}: {} method(s) left unrewritten", failures.len())]
    PartialRedefinition {
        /// The type
        type_id: TypeIdentifier,
        /// Methods left unrewritten
        failures: Vec<MethodFailure>,
    },
}

impl RedefineError {
    /// Failed methods, for `PartialRedefinition`
    pub fn failures(&self) -> &[MethodFailure] {
        match self {
            RedefineError::PartialRedefinition { failures, .. } => failures,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_redefinition_lists_failures() {
        let err = RedefineError::PartialRedefinition {
            type_id: TypeIdentifier::bootstrap("app/A"),
            failures: vec![MethodFailure {
                class: "app/A".to_string(),
                name: "run".to_string(),
                descriptor: "()V".to_string(),
                error: RewriteError::Decode(DecodeError::UnexpectedEnd(3)),
            }],
        };
        assert_eq!(err.failures().len(), 1);
        assert!(err.to_string().contains("1 method(s)"));
        assert!(err.failures()[0].to_string().starts_with("Malformed rewrite of app/A.run()V"));
    }
}
