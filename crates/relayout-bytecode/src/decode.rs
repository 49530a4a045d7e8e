//! Instruction stream decoding
//!
//! Method code is stored as raw bytes. Analysis and rewriting work on a
//! decoded `Vec<Instruction>` where each instruction remembers the byte
//! offset it was read from, so branch operands (relative to the branch
//! instruction's own start) can be resolved to instruction indices.

use crate::descriptor::PrimitiveKind;
use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use crate::opcode::Opcode;

/// Decoded operand of an instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// 32-bit integer literal
    I32(i32),
    /// 64-bit integer literal
    I64(i64),
    /// 32-bit float literal
    F32(f32),
    /// 64-bit float literal
    F64(f64),
    /// Local variable slot
    Slot(u16),
    /// Constant pool index
    Pool(u32),
    /// Branch offset relative to the start of the branch instruction
    Jump(i32),
    /// Runtime intrinsic id
    Runtime(u16),
    /// Value count (PACK_ARGS)
    Count(u16),
    /// Primitive kind (UNBOX)
    Kind(PrimitiveKind),
}

/// A decoded instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Byte offset in the code this instruction was decoded from
    pub offset: usize,
    /// Opcode
    pub opcode: Opcode,
    /// Operand
    pub operand: Operand,
}

impl Instruction {
    /// Create an instruction that has not been placed yet
    pub fn new(opcode: Opcode, operand: Operand) -> Self {
        Self {
            offset: 0,
            opcode,
            operand,
        }
    }

    /// Create an instruction without operand
    pub fn simple(opcode: Opcode) -> Self {
        Self::new(opcode, Operand::None)
    }

    /// Encoded size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.opcode.instruction_size()
    }

    /// Absolute byte offset this branch jumps to
    pub fn jump_target(&self) -> Option<isize> {
        match self.operand {
            Operand::Jump(rel) if self.opcode.is_jump() => Some(self.offset as isize + rel as isize),
            _ => None,
        }
    }

    /// Constant pool index carried by the instruction, if any
    pub fn pool_index(&self) -> Option<u32> {
        match self.operand {
            Operand::Pool(index) => Some(index),
            _ => None,
        }
    }

    /// Append the encoded instruction to a writer
    pub fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_opcode(self.opcode);
        match self.operand {
            Operand::None => {}
            Operand::I32(v) | Operand::Jump(v) => writer.emit_i32(v),
            Operand::I64(v) => writer.emit_i64(v),
            Operand::F32(v) => writer.emit_f32(v),
            Operand::F64(v) => writer.emit_f64(v),
            Operand::Slot(v) | Operand::Runtime(v) | Operand::Count(v) => writer.emit_u16(v),
            Operand::Pool(v) => writer.emit_u32(v),
            Operand::Kind(kind) => writer.emit_u8(kind.to_u8()),
        }
    }
}

fn read_operand(opcode: Opcode, reader: &mut BytecodeReader<'_>) -> Result<Operand, DecodeError> {
    use Opcode::*;

    let operand = match opcode {
        ConstI32 => Operand::I32(reader.read_i32()?),
        ConstI64 => Operand::I64(reader.read_i64()?),
        ConstF32 => Operand::F32(reader.read_f32()?),
        ConstF64 => Operand::F64(reader.read_f64()?),
        ConstStr | InvokeVirtual | InvokeStatic | New | GetField | PutField | GetStatic
        | PutStatic | CheckCast => Operand::Pool(reader.read_u32()?),
        LoadI | LoadL | LoadF | LoadD | LoadRef | StoreI | StoreL | StoreF | StoreD | StoreRef => {
            Operand::Slot(reader.read_u16()?)
        }
        Jmp | JmpIfFalse | JmpIfTrue | JmpIfNull | JmpIfNotNull => {
            Operand::Jump(reader.read_i32()?)
        }
        InvokeRuntime => Operand::Runtime(reader.read_u16()?),
        PackArgs => Operand::Count(reader.read_u16()?),
        Unbox => {
            let offset = reader.position();
            let tag = reader.read_u8()?;
            Operand::Kind(PrimitiveKind::from_u8(tag).ok_or(DecodeError::InvalidTag {
                kind: "primitive kind",
                tag,
                offset,
            })?)
        }
        _ => Operand::None,
    };
    Ok(operand)
}

/// Decode a method's code into instructions
pub fn decode_instructions(code: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    let mut reader = BytecodeReader::new(code);
    let mut instructions = Vec::new();

    while reader.has_more() {
        let offset = reader.position();
        let opcode = reader.read_opcode()?;
        let operand = read_operand(opcode, &mut reader)?;
        instructions.push(Instruction {
            offset,
            opcode,
            operand,
        });
    }

    Ok(instructions)
}

/// Encode instructions back to bytes
///
/// The stored `offset` of each instruction is ignored; branch operands are
/// written as they are, so callers that moved instructions must re-target
/// branches first.
pub fn encode_instructions(instructions: &[Instruction]) -> Vec<u8> {
    let size = instructions.iter().map(Instruction::size).sum();
    let mut writer = BytecodeWriter::with_capacity(size);
    for instr in instructions {
        instr.encode(&mut writer);
    }
    writer.into_bytes()
}
