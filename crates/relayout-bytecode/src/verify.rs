//! Bytecode verification and stack analysis
//!
//! `compute_max_stack` runs a worklist dataflow over the decoded
//! instructions: every reachable instruction gets exactly one entry depth,
//! branch targets must land on instruction boundaries, and control may not
//! fall off the end of the code. Depths count values, so a `long` on the
//! stack is one entry even though it takes two local slots.

use crate::constants::ConstantPool;
use crate::decode::{decode_instructions, Instruction, Operand};
use crate::descriptor::{DescriptorError, MethodDescriptor};
use crate::encoder::DecodeError;
use crate::module::MethodDef;
use crate::opcode::Opcode;
use crate::runtime_id;
use rustc_hash::FxHashMap;

/// Why a method body was rejected. Offsets point at the offending instruction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("undecodable code: {0}")]
    Decode(#[from] DecodeError),

    #[error("bad descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("operand stack underflows at {0}")]
    StackUnderflow(usize),

    /// Two paths reach an instruction with different stack depths
    #[error("paths meet at {offset} with stack depths {expected} and {found}")]
    InconsistentStack {
        /// Offset of the merge point
        offset: usize,
        /// Depth recorded first
        expected: u32,
        /// Depth arriving later
        found: u32,
    },

    /// The target is out of range or inside another instruction
    #[error("branch at {offset} targets {target}")]
    InvalidJumpTarget {
        /// Absolute target the branch computes
        target: isize,
        /// Offset of the branch
        offset: usize,
    },

    /// Index missing or of the wrong kind
    #[error("bad constant #{index} at {offset}")]
    InvalidConstantRef {
        /// Pool index
        index: u32,
        /// Offset of the instruction
        offset: usize,
    },

    #[error("local slot {index} at {offset} is outside the {max} declared")]
    InvalidLocalRef {
        /// Slot accessed
        index: u16,
        /// Declared local count
        max: u16,
        /// Offset of the instruction
        offset: usize,
    },

    #[error("no runtime intrinsic {id:#06x} (called at {offset})")]
    UnknownRuntime {
        /// Intrinsic id
        id: u16,
        /// Offset of the instruction
        offset: usize,
    },

    #[error("control runs past the last instruction at {0}")]
    FallOffEnd(usize),

    /// Declared max stack is lower than the computed depth
    #[error("max_stack {declared} is below the computed depth {computed}")]
    StackLimitExceeded {
        /// Declared limit
        declared: u16,
        /// Computed depth
        computed: u16,
    },
}

/// Stack effect `(pops, pushes)` of a single instruction
pub fn stack_effect(instr: &Instruction, pool: &ConstantPool) -> Result<(u32, u32), VerifyError> {
    use Opcode::*;

    let effect = match instr.opcode {
        Nop | Jmp | ReturnVoid => (0, 0),
        Pop => (1, 0),
        Dup => (1, 2),
        Swap => (2, 2),
        ConstNull | ConstI32 | ConstI64 | ConstF32 | ConstF64 | ConstStr => (0, 1),
        LoadI | LoadL | LoadF | LoadD | LoadRef => (0, 1),
        StoreI | StoreL | StoreF | StoreD | StoreRef => (1, 0),
        Iadd | Isub | Imul | Idiv | Irem | Ladd | Lsub | Lmul | Fadd | Fmul | Dadd | Dmul => (2, 1),
        Ineg | I2L | L2I | I2F | I2D => (1, 1),
        Ieq | Ine | Ilt | Ile | Igt | Ige | Lcmp => (2, 1),
        JmpIfFalse | JmpIfTrue | JmpIfNull | JmpIfNotNull => (1, 0),
        ReturnI | ReturnL | ReturnF | ReturnD | ReturnRef => (1, 0),
        New | GetStatic => (0, 1),
        GetField | CheckCast | ArrayLen | Unbox => (1, 1),
        PutField => (2, 0),
        PutStatic | Throw => (1, 0),
        ArrayLoad => (2, 1),
        PackArgs => match instr.operand {
            Operand::Count(n) => (n as u32, 1),
            _ => (0, 1),
        },
        InvokeRuntime => {
            let id = match instr.operand {
                Operand::Runtime(id) => id,
                _ => 0,
            };
            let (pops, pushes) =
                runtime_id::stack_effect(id).ok_or(VerifyError::UnknownRuntime {
                    id,
                    offset: instr.offset,
                })?;
            (pops as u32, pushes as u32)
        }
        InvokeVirtual | InvokeStatic => {
            let index = instr.pool_index().unwrap_or(u32::MAX);
            let method = pool.get_method(index).ok_or(VerifyError::InvalidConstantRef {
                index,
                offset: instr.offset,
            })?;
            let desc = MethodDescriptor::parse(&method.descriptor)?;
            let receiver = u32::from(instr.opcode == InvokeVirtual);
            (
                receiver + desc.param_count() as u32,
                u32::from(desc.returns_value()),
            )
        }
    };
    Ok(effect)
}

/// Compute the maximum operand stack depth of a method body
pub fn compute_max_stack(
    instructions: &[Instruction],
    pool: &ConstantPool,
) -> Result<u16, VerifyError> {
    if instructions.is_empty() {
        return Ok(0);
    }

    let index_of: FxHashMap<usize, usize> = instructions
        .iter()
        .enumerate()
        .map(|(i, instr)| (instr.offset, i))
        .collect();

    let mut depths: Vec<Option<u32>> = vec![None; instructions.len()];
    let mut worklist = vec![0usize];
    depths[0] = Some(0);
    let mut max_depth = 0u32;

    while let Some(idx) = worklist.pop() {
        let instr = &instructions[idx];
        let depth = depths[idx].unwrap_or(0);
        let (pops, pushes) = stack_effect(instr, pool)?;
        if depth < pops {
            return Err(VerifyError::StackUnderflow(instr.offset));
        }
        let out = depth - pops + pushes;
        max_depth = max_depth.max(out);

        let mut successors = Vec::with_capacity(2);
        if let Some(target) = instr.jump_target() {
            let target_idx = usize::try_from(target)
                .ok()
                .and_then(|t| index_of.get(&t).copied())
                .ok_or(VerifyError::InvalidJumpTarget {
                    target,
                    offset: instr.offset,
                })?;
            successors.push(target_idx);
        }
        if !instr.opcode.is_terminator() {
            if idx + 1 >= instructions.len() {
                return Err(VerifyError::FallOffEnd(instr.offset));
            }
            successors.push(idx + 1);
        }

        for succ in successors {
            match depths[succ] {
                None => {
                    depths[succ] = Some(out);
                    worklist.push(succ);
                }
                Some(existing) if existing != out => {
                    return Err(VerifyError::InconsistentStack {
                        offset: instructions[succ].offset,
                        expected: existing,
                        found: out,
                    });
                }
                Some(_) => {}
            }
        }
    }

    Ok(max_depth.min(u16::MAX as u32) as u16)
}

fn local_access(instr: &Instruction) -> Option<(u16, u16)> {
    use Opcode::*;

    let slot = match instr.operand {
        Operand::Slot(slot) => slot,
        _ => return None,
    };
    match instr.opcode {
        LoadL | LoadD | StoreL | StoreD => Some((slot, 2)),
        LoadI | LoadF | LoadRef | StoreI | StoreF | StoreRef => Some((slot, 1)),
        _ => None,
    }
}

/// Compute the number of local slots a method body needs
pub fn compute_max_locals(
    instructions: &[Instruction],
    descriptor: &MethodDescriptor,
    is_static: bool,
) -> u16 {
    let base = u16::from(!is_static) + descriptor.param_slots();
    instructions
        .iter()
        .filter_map(local_access)
        .map(|(slot, width)| slot.saturating_add(width))
        .fold(base, u16::max)
}

fn check_pool_ref(instr: &Instruction, pool: &ConstantPool) -> Result<(), VerifyError> {
    use Opcode::*;

    let Some(index) = instr.pool_index() else {
        return Ok(());
    };
    let valid = match instr.opcode {
        ConstStr => pool.get_str(index).is_some(),
        New | CheckCast => pool.get_class(index).is_some(),
        GetField | PutField | GetStatic | PutStatic => pool.get_field(index).is_some(),
        InvokeVirtual | InvokeStatic => pool.get_method(index).is_some(),
        _ => true,
    };
    if valid {
        Ok(())
    } else {
        Err(VerifyError::InvalidConstantRef {
            index,
            offset: instr.offset,
        })
    }
}

/// Verify a method against its constant pool
///
/// Returns the computed maximum stack depth.
pub fn verify_method(method: &MethodDef, pool: &ConstantPool) -> Result<u16, VerifyError> {
    if method.code.is_empty() && method.is_abstract() {
        return Ok(0);
    }

    let descriptor = MethodDescriptor::parse(&method.descriptor)?;
    let instructions = decode_instructions(&method.code)?;
    if instructions.is_empty() {
        return Err(VerifyError::FallOffEnd(0));
    }

    let param_locals = u16::from(!method.is_static()) + descriptor.param_slots();
    if param_locals > method.max_locals {
        return Err(VerifyError::InvalidLocalRef {
            index: param_locals.saturating_sub(1),
            max: method.max_locals,
            offset: 0,
        });
    }

    for instr in &instructions {
        check_pool_ref(instr, pool)?;
        if let Some((slot, width)) = local_access(instr) {
            if slot.saturating_add(width) > method.max_locals {
                return Err(VerifyError::InvalidLocalRef {
                    index: slot,
                    max: method.max_locals,
                    offset: instr.offset,
                });
            }
        }
    }

    let computed = compute_max_stack(&instructions, pool)?;
    if computed > method.max_stack {
        return Err(VerifyError::StackLimitExceeded {
            declared: method.max_stack,
            computed,
        });
    }

    Ok(computed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::BytecodeWriter;
    use crate::module::access;

    fn method(descriptor: &str, access: u16, code: Vec<u8>, max_stack: u16, max_locals: u16) -> MethodDef {
        MethodDef {
            name: "m".to_string(),
            descriptor: descriptor.to_string(),
            access,
            max_stack,
            max_locals,
            code,
        }
    }

    #[test]
    fn test_straight_line_depth() {
        let mut w = BytecodeWriter::new();
        w.emit_const_i32(1);
        w.emit_const_i32(2);
        w.emit_const_i32(3);
        w.emit_opcode(Opcode::Iadd);
        w.emit_opcode(Opcode::Iadd);
        w.emit_opcode(Opcode::ReturnI);
        let instrs = decode_instructions(w.buffer()).unwrap();
        assert_eq!(compute_max_stack(&instrs, &ConstantPool::new()).unwrap(), 3);
    }

    #[test]
    fn test_branch_merge_depth() {
        // if (local0) push 1 else push 2; return
        let mut w = BytecodeWriter::new();
        w.emit_load(Opcode::LoadI, 0); // 0
        w.emit_jump(Opcode::JmpIfFalse, 15); // 3 -> 18
        w.emit_const_i32(1); // 8
        w.emit_jump(Opcode::Jmp, 10); // 13 -> 23
        w.emit_const_i32(2); // 18
        w.emit_opcode(Opcode::ReturnI); // 23
        let instrs = decode_instructions(w.buffer()).unwrap();
        assert_eq!(compute_max_stack(&instrs, &ConstantPool::new()).unwrap(), 1);
    }

    #[test]
    fn test_inconsistent_merge_is_rejected() {
        let mut w = BytecodeWriter::new();
        w.emit_load(Opcode::LoadI, 0); // 0
        w.emit_jump(Opcode::JmpIfFalse, 10); // 3 -> 13
        w.emit_const_i32(1); // 8
        w.emit_opcode(Opcode::ReturnVoid); // 13
        let instrs = decode_instructions(w.buffer()).unwrap();
        assert!(matches!(
            compute_max_stack(&instrs, &ConstantPool::new()),
            Err(VerifyError::InconsistentStack { offset: 13, .. })
        ));
    }

    #[test]
    fn test_jump_into_operand_is_rejected() {
        let mut w = BytecodeWriter::new();
        w.emit_jump(Opcode::Jmp, 2);
        w.emit_opcode(Opcode::ReturnVoid);
        let instrs = decode_instructions(w.buffer()).unwrap();
        assert!(matches!(
            compute_max_stack(&instrs, &ConstantPool::new()),
            Err(VerifyError::InvalidJumpTarget { target: 2, offset: 0 })
        ));
    }

    #[test]
    fn test_underflow_and_fall_off() {
        let mut w = BytecodeWriter::new();
        w.emit_opcode(Opcode::Pop);
        w.emit_opcode(Opcode::ReturnVoid);
        let instrs = decode_instructions(w.buffer()).unwrap();
        assert_eq!(
            compute_max_stack(&instrs, &ConstantPool::new()),
            Err(VerifyError::StackUnderflow(0))
        );

        let mut w = BytecodeWriter::new();
        w.emit_const_i32(1);
        let instrs = decode_instructions(w.buffer()).unwrap();
        assert_eq!(
            compute_max_stack(&instrs, &ConstantPool::new()),
            Err(VerifyError::FallOffEnd(0))
        );
    }

    #[test]
    fn test_invoke_uses_descriptor() {
        let mut pool = ConstantPool::new();
        let m = pool.intern_method("app/A", "sum", "(IJD)J");
        let mut w = BytecodeWriter::new();
        w.emit_load(Opcode::LoadRef, 0);
        w.emit_load(Opcode::LoadI, 1);
        w.emit_load(Opcode::LoadL, 2);
        w.emit_load(Opcode::LoadD, 4);
        w.emit_invoke_virtual(m);
        w.emit_opcode(Opcode::ReturnL);
        let instrs = decode_instructions(w.buffer()).unwrap();
        assert_eq!(compute_max_stack(&instrs, &pool).unwrap(), 4);

        let desc = MethodDescriptor::parse("(IJD)J").unwrap();
        assert_eq!(compute_max_locals(&instrs, &desc, false), 6);
    }

    #[test]
    fn test_runtime_effects() {
        let mut w = BytecodeWriter::new();
        w.emit_load(Opcode::LoadRef, 0);
        w.emit_invoke_runtime(runtime_id::TYPE_NAME);
        w.emit_opcode(Opcode::ReturnRef);
        let instrs = decode_instructions(w.buffer()).unwrap();
        assert_eq!(compute_max_stack(&instrs, &ConstantPool::new()).unwrap(), 1);

        let mut w = BytecodeWriter::new();
        w.emit_invoke_runtime(0x7777);
        w.emit_opcode(Opcode::ReturnVoid);
        let instrs = decode_instructions(w.buffer()).unwrap();
        assert!(matches!(
            compute_max_stack(&instrs, &ConstantPool::new()),
            Err(VerifyError::UnknownRuntime { id: 0x7777, .. })
        ));
    }

    #[test]
    fn test_verify_method_checks_pool_and_locals() {
        let mut pool = ConstantPool::new();
        let s = pool.intern_str("hi");

        let mut w = BytecodeWriter::new();
        w.emit_field(Opcode::GetStatic, s);
        w.emit_opcode(Opcode::ReturnRef);
        let bad_ref = method("()Ljava/Object;", access::STATIC, w.into_bytes(), 1, 0);
        assert!(matches!(
            verify_method(&bad_ref, &pool),
            Err(VerifyError::InvalidConstantRef { .. })
        ));

        let mut w = BytecodeWriter::new();
        w.emit_load(Opcode::LoadD, 1);
        w.emit_opcode(Opcode::ReturnD);
        let bad_local = method("(D)D", access::STATIC, w.into_bytes(), 1, 2);
        assert!(matches!(
            verify_method(&bad_local, &pool),
            Err(VerifyError::InvalidLocalRef { index: 1, max: 2, .. })
        ));
    }

    #[test]
    fn test_verify_method_checks_declared_stack() {
        let mut w = BytecodeWriter::new();
        w.emit_const_i32(1);
        w.emit_const_i32(2);
        w.emit_opcode(Opcode::Iadd);
        w.emit_opcode(Opcode::ReturnI);
        let code = w.into_bytes();

        let ok = method("()I", access::STATIC, code.clone(), 2, 0);
        assert_eq!(verify_method(&ok, &ConstantPool::new()).unwrap(), 2);

        let low = method("()I", access::STATIC, code, 1, 0);
        assert_eq!(
            verify_method(&low, &ConstantPool::new()),
            Err(VerifyError::StackLimitExceeded {
                declared: 1,
                computed: 2
            })
        );
    }
}
