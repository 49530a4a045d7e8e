//! Host runtime
//!
//! A small managed runtime that loads class files, runs method bodies and
//! exposes exactly the hot-replace facility the redefinition engine is built
//! around: a method body may be swapped for another with the same name and
//! descriptor, and nothing else about a loaded class can change.
//!
//! The runtime also implements the `INVOKE_RUNTIME` intrinsics that
//! rewritten code uses to reach the engine's added-member store and dispatch
//! table.

mod class;
mod facade;
mod host;
mod interpreter;
mod loader;
mod object;
mod value;

pub use class::RuntimeClass;
pub use facade::Vm;
pub use host::RedefinitionHost;
pub use interpreter::Interpreter;
pub use loader::Loader;
pub use object::Object;
pub use value::Value;

use crate::error::EngineError;
use relayout_bytecode::{ClassFileError, DecodeError, VerifyError};

/// VM execution errors
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Call depth limit reached
    #[error("Stack overflow")]
    StackOverflow,

    /// Operand stack underflow
    #[error("Stack underflow")]
    StackUnderflow,

    /// Null pointer exception
    #[error("Null pointer exception")]
    NullPointer,

    /// Type error
    #[error("Type error: {0}")]
    TypeError(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Class not visible from the requesting loader
    #[error("Class not found: {0}")]
    ClassNotFound(String),

    /// Class already defined by the loader
    #[error("Duplicate class definition: {0}")]
    DuplicateClass(String),

    /// No method with the requested name and descriptor
    #[error("No such method: {0}")]
    NoSuchMethod(String),

    /// No field with the requested name and descriptor
    #[error("No such field: {0}")]
    NoSuchField(String),

    /// Failed reference cast
    #[error("Class cast: {value} is not a {target}")]
    ClassCast {
        /// Runtime class of the value
        value: String,
        /// Requested class
        target: String,
    },

    /// Array index out of range
    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// Requested index
        index: i32,
        /// Array length
        len: usize,
    },

    /// The host refused a body replacement
    #[error("Cannot change the shape of {class}: {member} is not a declared method")]
    ShapeChange {
        /// Class being modified
        class: String,
        /// Offending member
        member: String,
    },

    /// Value thrown by `THROW`
    #[error("Uncaught exception: {0}")]
    Thrown(String),

    /// Engine error raised by an intrinsic
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Class file could not be read
    #[error("Class file error: {0}")]
    ClassFile(#[from] ClassFileError),

    /// Method code could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Method failed verification at load time
    #[error("Verification failed for {method}: {error}")]
    Verify {
        /// `Class.name(desc)`
        method: String,
        /// Verifier error
        error: VerifyError,
    },
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
