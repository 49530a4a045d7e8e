//! Little-endian writer and reader for instruction streams and class files.

use crate::descriptor::PrimitiveKind;
use crate::opcode::Opcode;
use thiserror::Error;

/// Failure while reading an encoded stream. Offsets are byte positions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("stream ends early at offset {0}")]
    UnexpectedEnd(usize),

    #[error("string at offset {0} is not UTF-8")]
    InvalidUtf8(usize),

    #[error("unknown opcode {0:#04x} at offset {1}")]
    InvalidOpcode(u8, usize),

    /// A tagged section (constant, value kind, ...) carried an unknown tag
    #[error("unknown {kind} tag {tag} at offset {offset}")]
    InvalidTag {
        kind: &'static str,
        tag: u8,
        offset: usize,
    },
}

/// Append-only byte sink with opcode helpers.
#[derive(Debug, Default)]
pub struct BytecodeWriter {
    pub(crate) buffer: Vec<u8>,
}

macro_rules! le_emitters {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&mut self, value: $ty) {
                self.buffer.extend_from_slice(&value.to_le_bytes());
            }
        )*
    };
}

macro_rules! le_readers {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&mut self) -> Result<$ty, DecodeError> {
                self.take().map(<$ty>::from_le_bytes)
            }
        )*
    };
}

impl BytecodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Offset the next byte will land at
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    le_emitters! {
        emit_u16: u16,
        emit_u32: u32,
        emit_i32: i32,
        emit_i64: i64,
        emit_f32: f32,
        emit_f64: f64,
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// u32 byte length, then the UTF-8 bytes
    pub fn emit_string(&mut self, value: &str) {
        self.emit_u32(value.len() as u32);
        self.emit_bytes(value.as_bytes());
    }

    pub fn emit_opcode(&mut self, opcode: Opcode) {
        self.emit_u8(opcode.to_u8());
    }

    fn emit_with_u16(&mut self, opcode: Opcode, operand: u16) {
        self.emit_opcode(opcode);
        self.emit_u16(operand);
    }

    fn emit_with_u32(&mut self, opcode: Opcode, operand: u32) {
        self.emit_opcode(opcode);
        self.emit_u32(operand);
    }

    pub fn emit_const_i32(&mut self, value: i32) {
        self.emit_opcode(Opcode::ConstI32);
        self.emit_i32(value);
    }

    pub fn emit_const_i64(&mut self, value: i64) {
        self.emit_opcode(Opcode::ConstI64);
        self.emit_i64(value);
    }

    /// `index` points at a UTF-8 entry of the constant pool
    pub fn emit_const_str(&mut self, index: u32) {
        self.emit_with_u32(Opcode::ConstStr, index);
    }

    pub fn emit_load(&mut self, opcode: Opcode, slot: u16) {
        debug_assert!(opcode.is_load(), "{:?} is not a local load", opcode);
        self.emit_with_u16(opcode, slot);
    }

    pub fn emit_store(&mut self, opcode: Opcode, slot: u16) {
        debug_assert!(opcode.is_store(), "{:?} is not a local store", opcode);
        self.emit_with_u16(opcode, slot);
    }

    /// `offset` is relative to the first byte of the jump itself
    pub fn emit_jump(&mut self, opcode: Opcode, offset: i32) {
        debug_assert!(opcode.is_jump());
        self.emit_opcode(opcode);
        self.emit_i32(offset);
    }

    pub fn emit_invoke_virtual(&mut self, method_ref: u32) {
        self.emit_with_u32(Opcode::InvokeVirtual, method_ref);
    }

    pub fn emit_invoke_static(&mut self, method_ref: u32) {
        self.emit_with_u32(Opcode::InvokeStatic, method_ref);
    }

    pub fn emit_invoke_runtime(&mut self, runtime_id: u16) {
        self.emit_with_u16(Opcode::InvokeRuntime, runtime_id);
    }

    pub fn emit_new(&mut self, class_ref: u32) {
        self.emit_with_u32(Opcode::New, class_ref);
    }

    pub fn emit_field(&mut self, opcode: Opcode, field_ref: u32) {
        debug_assert!(opcode.is_field_access());
        self.emit_with_u32(opcode, field_ref);
    }

    /// Collapse the top `count` stack values into an argument array
    pub fn emit_pack_args(&mut self, count: u16) {
        self.emit_with_u16(Opcode::PackArgs, count);
    }

    pub fn emit_unbox(&mut self, kind: PrimitiveKind) {
        self.emit_opcode(Opcode::Unbox);
        self.emit_u8(kind.to_u8());
    }

    /// Overwrite four bytes at `at`, typically a forward jump offset.
    ///
    /// Panics if `at + 4` is past the end of what has been written.
    pub fn patch_i32(&mut self, at: usize, value: i32) {
        self.buffer[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn patch_u32(&mut self, at: usize, value: u32) {
        self.buffer[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Cursor over an encoded byte slice.
pub struct BytecodeReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn has_more(&self) -> bool {
        self.remaining() > 0
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEnd(self.pos));
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.slice(1).map(|b| b[0])
    }

    le_readers! {
        read_u16: u16,
        read_u32: u32,
        read_i32: i32,
        read_i64: i64,
        read_f32: f32,
        read_f64: f64,
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, DecodeError> {
        self.slice(count).map(<[u8]>::to_vec)
    }

    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let at = self.pos;
        let raw = self.slice(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8(at))
    }

    pub fn read_opcode(&mut self) -> Result<Opcode, DecodeError> {
        let at = self.pos;
        let byte = self.read_u8()?;
        Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, at))
    }
}
