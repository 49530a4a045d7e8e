//! Code emission with forward and backward labels
//!
//! Instructions are written as they are produced; branches to labels that
//! are not placed yet record their operand position and are patched once
//! every label has an offset. All branch encodings are the same size, so a
//! label's offset never moves after it is placed.

use crate::error::RewriteError;
use relayout_bytecode::{BytecodeWriter, Instruction, Opcode, Operand};
use rustc_hash::FxHashMap;

/// A branch target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    /// Unique label ID within the builder
    pub id: usize,
}

/// Branch waiting for its label
#[derive(Debug, Clone)]
struct UnresolvedJump {
    /// Offset of the branch instruction
    instr_offset: usize,
    /// Position of the i32 operand
    operand_position: usize,
    /// Target label
    target_label: Label,
}

/// Builder for rewritten method code
#[derive(Debug, Default)]
pub struct CodeBuilder {
    writer: BytecodeWriter,
    next_label_id: usize,
    label_positions: FxHashMap<usize, usize>,
    unresolved_jumps: Vec<UnresolvedJump>,
}

impl CodeBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Current code offset
    pub fn offset(&self) -> usize {
        self.writer.offset()
    }

    /// Define a new label
    pub fn define_label(&mut self) -> Label {
        let label = Label {
            id: self.next_label_id,
        };
        self.next_label_id += 1;
        label
    }

    /// Place a label at the current offset
    pub fn mark_label(&mut self, label: Label) {
        self.label_positions.insert(label.id, self.offset());
    }

    /// Emit a non-branch instruction
    pub fn emit(&mut self, instr: Instruction) {
        instr.encode(&mut self.writer);
    }

    /// Emit an instruction without operand
    pub fn emit_op(&mut self, opcode: Opcode) {
        self.emit(Instruction::simple(opcode));
    }

    /// Emit an instruction with an operand
    pub fn emit_with(&mut self, opcode: Opcode, operand: Operand) {
        self.emit(Instruction::new(opcode, operand));
    }

    /// Emit a branch to `label`
    pub fn emit_branch(&mut self, opcode: Opcode, label: Label) {
        let instr_offset = self.offset();
        self.writer.emit_opcode(opcode);
        let operand_position = self.offset();
        self.writer.emit_i32(0);
        self.unresolved_jumps.push(UnresolvedJump {
            instr_offset,
            operand_position,
            target_label: label,
        });
    }

    /// Resolve every branch and return the code
    pub fn finish(mut self) -> Result<Vec<u8>, RewriteError> {
        for jump in std::mem::take(&mut self.unresolved_jumps) {
            let target = *self
                .label_positions
                .get(&jump.target_label.id)
                .ok_or(RewriteError::UnplacedLabel(jump.target_label.id))?;
            let relative = target as i64 - jump.instr_offset as i64;
            self.writer.patch_i32(jump.operand_position, relative as i32);
        }
        Ok(self.writer.into_bytes())
    }
}
