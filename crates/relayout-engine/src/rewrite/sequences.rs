//! Replacement instruction sequences

use super::emit::{CodeBuilder, Label};
use crate::layout::SlotId;
use relayout_bytecode::{
    runtime_id, ConstantPool, FieldType, MethodDescriptor, Opcode, Operand, ReturnType,
};

fn const_str(builder: &mut CodeBuilder, pool: &mut ConstantPool, value: &str) {
    let index = pool.intern_str(value);
    builder.emit_with(Opcode::ConstStr, Operand::Pool(index));
}

fn runtime(builder: &mut CodeBuilder, id: u16) {
    builder.emit_with(Opcode::InvokeRuntime, Operand::Runtime(id));
}

/// Convert a generic value on the stack to `ty`
pub fn convert_value(builder: &mut CodeBuilder, pool: &mut ConstantPool, ty: &FieldType) {
    match (ty.primitive(), ty.cast_target()) {
        (Some(kind), _) => builder.emit_with(Opcode::Unbox, Operand::Kind(kind)),
        (None, Some(target)) => {
            let index = pool.intern_class(&target);
            builder.emit_with(Opcode::CheckCast, Operand::Pool(index));
        }
        (None, None) => {}
    }
}

/// Convert a dispatch result to the declared return type; void drops it
pub fn convert_result(builder: &mut CodeBuilder, pool: &mut ConstantPool, ret: &ReturnType) {
    match ret {
        ReturnType::Void => builder.emit_op(Opcode::Pop),
        ReturnType::Value(ty) => convert_value(builder, pool, ty),
    }
}

/// Push every parameter with the load opcode of its type
fn load_params(builder: &mut CodeBuilder, desc: &MethodDescriptor, first_slot: u16) {
    let mut slot = first_slot;
    for param in &desc.params {
        builder.emit_with(param.load_opcode(), Operand::Slot(slot));
        slot += param.category();
    }
}

/// Subclass-dispatch prologue for an instance method of `class_name`
///
/// ```text
///   LOAD_REF 0; TYPE_NAME; CONST_STR class; STR_EQ; JMP_IF_TRUE body
///   LOAD_REF 0; CONST_STR name; CONST_STR desc; DISPATCH_CONTAINS; JMP_IF_FALSE body
///   LOAD_REF 0; <params>; PACK_ARGS n; CONST_STR name; CONST_STR desc;
///   DISPATCH_RUN; <convert>; <return>
/// body:
/// ```
pub fn subclass_dispatch_prologue(
    builder: &mut CodeBuilder,
    pool: &mut ConstantPool,
    class_name: &str,
    name: &str,
    descriptor: &str,
    desc: &MethodDescriptor,
    body: Label,
) {
    builder.emit_with(Opcode::LoadRef, Operand::Slot(0));
    runtime(builder, runtime_id::TYPE_NAME);
    const_str(builder, pool, class_name);
    runtime(builder, runtime_id::STR_EQ);
    builder.emit_branch(Opcode::JmpIfTrue, body);

    builder.emit_with(Opcode::LoadRef, Operand::Slot(0));
    const_str(builder, pool, name);
    const_str(builder, pool, descriptor);
    runtime(builder, runtime_id::DISPATCH_CONTAINS);
    builder.emit_branch(Opcode::JmpIfFalse, body);

    builder.emit_with(Opcode::LoadRef, Operand::Slot(0));
    load_params(builder, desc, 1);
    builder.emit_with(Opcode::PackArgs, Operand::Count(desc.param_count()));
    const_str(builder, pool, name);
    const_str(builder, pool, descriptor);
    runtime(builder, runtime_id::DISPATCH_RUN);
    convert_result(builder, pool, &desc.ret);
    builder.emit_op(desc.ret.return_opcode());
}

/// Read of an added field: `[obj] -> [value]`, or `[] -> [value]` for statics
pub fn field_get(
    builder: &mut CodeBuilder,
    pool: &mut ConstantPool,
    slot: SlotId,
    is_static: bool,
    ty: &FieldType,
) {
    builder.emit_with(Opcode::ConstI32, Operand::I32(slot.0 as i32));
    let id = if is_static {
        runtime_id::STATIC_FIELD_GET
    } else {
        runtime_id::FIELD_GET
    };
    runtime(builder, id);
    convert_value(builder, pool, ty);
}

/// Write of an added field: `[obj, value] -> []`, or `[value] -> []` for statics
pub fn field_put(builder: &mut CodeBuilder, slot: SlotId, is_static: bool) {
    builder.emit_with(Opcode::ConstI32, Operand::I32(slot.0 as i32));
    let id = if is_static {
        runtime_id::STATIC_FIELD_SET
    } else {
        runtime_id::FIELD_SET
    };
    runtime(builder, id);
}

/// Call of an added instance method: `[recv, args..] -> [result]`
pub fn virtual_call(
    builder: &mut CodeBuilder,
    pool: &mut ConstantPool,
    name: &str,
    descriptor: &str,
    desc: &MethodDescriptor,
) {
    builder.emit_with(Opcode::PackArgs, Operand::Count(desc.param_count()));
    const_str(builder, pool, name);
    const_str(builder, pool, descriptor);
    runtime(builder, runtime_id::DISPATCH_RUN);
    convert_result(builder, pool, &desc.ret);
}

/// Call of an added static method: `[args..] -> [result]`
pub fn static_call(
    builder: &mut CodeBuilder,
    pool: &mut ConstantPool,
    owner: &str,
    name: &str,
    descriptor: &str,
    desc: &MethodDescriptor,
) {
    builder.emit_with(Opcode::PackArgs, Operand::Count(desc.param_count()));
    const_str(builder, pool, owner);
    const_str(builder, pool, name);
    const_str(builder, pool, descriptor);
    runtime(builder, runtime_id::DISPATCH_RUN_STATIC);
    convert_result(builder, pool, &desc.ret);
}

/// Body of a removed method: raise `NoSuchMethod`
pub fn no_such_method(builder: &mut CodeBuilder, pool: &mut ConstantPool, message: &str) {
    const_str(builder, pool, message);
    runtime(builder, runtime_id::NO_SUCH_METHOD);
    builder.emit_op(Opcode::Throw);
}
