//! Relayout Bytecode Definitions
//!
//! This crate provides the typed stack-machine instruction set, member
//! descriptors, constant pool and class-file format that the redefinition
//! engine reads, rewrites and hands back to the host runtime.

#![warn(rust_2018_idioms)]

pub mod constants;
pub mod decode;
pub mod descriptor;
pub mod encoder;
pub mod module;
pub mod opcode;
pub mod runtime_id;
pub mod verify;

pub use constants::{Constant, ConstantPool, MemberRef};
pub use decode::{decode_instructions, encode_instructions, Instruction, Operand};
pub use descriptor::{DescriptorError, FieldType, MethodDescriptor, PrimitiveKind, ReturnType};
pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use module::{access, ClassDef, ClassFileError, FieldDef, MethodDef, MAGIC, VERSION};
pub use opcode::Opcode;
pub use verify::{compute_max_locals, compute_max_stack, stack_effect, verify_method, VerifyError};
