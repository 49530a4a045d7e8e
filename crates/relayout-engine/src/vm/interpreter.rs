//! Bytecode interpreter
//!
//! Executes one method body per call frame. Code is decoded on entry and
//! branches are resolved through the decoded offsets, so a body swapped by
//! a redefinition takes effect on the next call.

use super::{Object, RuntimeClass, Value, Vm, VmError, VmResult};
use crate::body::MethodBody;
use crate::layout::SlotId;
use relayout_bytecode::{
    decode_instructions, runtime_id, Instruction, MethodDescriptor, Opcode, Operand,
};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Maximum nesting of method calls
pub const MAX_CALL_DEPTH: usize = 512;

/// Class name strings cast to
const STRING_CLASS: &str = "lang/String";

/// Interpreter bound to a VM
pub struct Interpreter<'a> {
    vm: &'a Vm,
    depth: usize,
}

fn pop(stack: &mut Vec<Value>) -> VmResult<Value> {
    stack.pop().ok_or(VmError::StackUnderflow)
}

fn pop_int(stack: &mut Vec<Value>) -> VmResult<i32> {
    match pop(stack)? {
        Value::Int(v) => Ok(v),
        other => Err(VmError::TypeError(format!("expected int, got {}", other.kind_name()))),
    }
}

fn pop_long(stack: &mut Vec<Value>) -> VmResult<i64> {
    match pop(stack)? {
        Value::Long(v) => Ok(v),
        other => Err(VmError::TypeError(format!("expected long, got {}", other.kind_name()))),
    }
}

fn pop_float(stack: &mut Vec<Value>) -> VmResult<f32> {
    match pop(stack)? {
        Value::Float(v) => Ok(v),
        other => Err(VmError::TypeError(format!("expected float, got {}", other.kind_name()))),
    }
}

fn pop_double(stack: &mut Vec<Value>) -> VmResult<f64> {
    match pop(stack)? {
        Value::Double(v) => Ok(v),
        other => Err(VmError::TypeError(format!(
            "expected double, got {}",
            other.kind_name()
        ))),
    }
}

fn pop_str(stack: &mut Vec<Value>) -> VmResult<Arc<str>> {
    match pop(stack)? {
        Value::Str(s) => Ok(s),
        Value::Null => Err(VmError::NullPointer),
        other => Err(VmError::TypeError(format!(
            "expected string, got {}",
            other.kind_name()
        ))),
    }
}

fn pop_object(stack: &mut Vec<Value>) -> VmResult<Arc<Object>> {
    match pop(stack)? {
        Value::Ref(obj) => Ok(obj),
        Value::Null => Err(VmError::NullPointer),
        other => Err(VmError::TypeError(format!(
            "expected object, got {}",
            other.kind_name()
        ))),
    }
}

fn pop_array(stack: &mut Vec<Value>) -> VmResult<Arc<[Value]>> {
    match pop(stack)? {
        Value::Array(values) => Ok(values),
        Value::Null => Err(VmError::NullPointer),
        other => Err(VmError::TypeError(format!(
            "expected array, got {}",
            other.kind_name()
        ))),
    }
}

fn pop_slot(stack: &mut Vec<Value>) -> VmResult<SlotId> {
    let raw = pop_int(stack)?;
    u32::try_from(raw)
        .map(SlotId)
        .map_err(|_| VmError::RuntimeError(format!("invalid member slot {}", raw)))
}

fn pop_n(stack: &mut Vec<Value>, n: usize) -> VmResult<Vec<Value>> {
    if stack.len() < n {
        return Err(VmError::StackUnderflow);
    }
    Ok(stack.split_off(stack.len() - n))
}

fn bool_value(b: bool) -> Value {
    Value::Int(i32::from(b))
}

fn descriptor(body: &MethodBody, descriptor: &str) -> VmResult<MethodDescriptor> {
    MethodDescriptor::parse(descriptor).map_err(|e| {
        VmError::TypeError(format!("{} in {}", e, body.qualified_name()))
    })
}

impl<'a> Interpreter<'a> {
    /// Create an interpreter for `vm`
    pub fn new(vm: &'a Vm) -> Self {
        Self { vm, depth: 0 }
    }

    /// Run `body` of `class`
    ///
    /// For instance methods `args` starts with the receiver.
    pub fn invoke(
        &mut self,
        class: &Arc<RuntimeClass>,
        body: &MethodBody,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(VmError::StackOverflow);
        }
        self.depth += 1;
        let result = self.execute(class, body, args);
        self.depth -= 1;
        result
    }

    fn execute(
        &mut self,
        class: &Arc<RuntimeClass>,
        body: &MethodBody,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        let desc = descriptor(body, &body.descriptor)?;
        let expected = desc.params.len() + usize::from(!body.is_static());
        if args.len() != expected {
            return Err(VmError::TypeError(format!(
                "{} takes {} arguments, got {}",
                body.qualified_name(),
                expected,
                args.len()
            )));
        }

        let needed = desc.param_slots() + u16::from(!body.is_static());
        let mut locals = vec![Value::Null; usize::from(body.max_locals.max(needed))];
        let mut args = args.into_iter();
        let mut slot = 0usize;
        if !body.is_static() {
            locals[0] = args.next().unwrap_or_default();
            slot = 1;
        }
        for (param, arg) in desc.params.iter().zip(args) {
            locals[slot] = arg;
            slot += usize::from(param.category());
        }

        let instructions = decode_instructions(&body.code)?;
        let index_of: FxHashMap<usize, usize> = instructions
            .iter()
            .enumerate()
            .map(|(i, instr)| (instr.offset, i))
            .collect();
        let jump = |instr: &Instruction| -> VmResult<usize> {
            instr
                .jump_target()
                .and_then(|t| usize::try_from(t).ok())
                .and_then(|t| index_of.get(&t).copied())
                .ok_or_else(|| {
                    VmError::RuntimeError(format!(
                        "bad branch at {} in {}",
                        instr.offset,
                        body.qualified_name()
                    ))
                })
        };

        let pool = &body.constants;
        let mut stack: Vec<Value> = Vec::with_capacity(usize::from(body.max_stack));
        let mut pc = 0usize;

        loop {
            let instr = instructions.get(pc).ok_or_else(|| {
                VmError::RuntimeError(format!("fell off the end of {}", body.qualified_name()))
            })?;
            pc += 1;

            match instr.opcode {
                Opcode::Nop => {}
                Opcode::Pop => {
                    pop(&mut stack)?;
                }
                Opcode::Dup => {
                    let top = stack.last().cloned().ok_or(VmError::StackUnderflow)?;
                    stack.push(top);
                }
                Opcode::Swap => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(b);
                    stack.push(a);
                }

                Opcode::ConstNull => stack.push(Value::Null),
                Opcode::ConstI32 | Opcode::ConstI64 | Opcode::ConstF32 | Opcode::ConstF64 => {
                    stack.push(match instr.operand {
                        Operand::I32(v) => Value::Int(v),
                        Operand::I64(v) => Value::Long(v),
                        Operand::F32(v) => Value::Float(v),
                        Operand::F64(v) => Value::Double(v),
                        _ => return Err(self.bad_operand(body, instr)),
                    });
                }
                Opcode::ConstStr => {
                    let index = self.pool_index(body, instr)?;
                    let s = pool
                        .get_str(index)
                        .ok_or_else(|| self.bad_operand(body, instr))?;
                    stack.push(Value::str(s));
                }

                Opcode::LoadI | Opcode::LoadL | Opcode::LoadF | Opcode::LoadD | Opcode::LoadRef => {
                    let slot = self.slot(body, instr)?;
                    let value = locals
                        .get(slot)
                        .cloned()
                        .ok_or_else(|| self.bad_operand(body, instr))?;
                    stack.push(value);
                }
                Opcode::StoreI
                | Opcode::StoreL
                | Opcode::StoreF
                | Opcode::StoreD
                | Opcode::StoreRef => {
                    let slot = self.slot(body, instr)?;
                    let value = pop(&mut stack)?;
                    let local = locals
                        .get_mut(slot)
                        .ok_or_else(|| self.bad_operand(body, instr))?;
                    *local = value;
                }

                Opcode::Iadd | Opcode::Isub | Opcode::Imul | Opcode::Idiv | Opcode::Irem => {
                    let b = pop_int(&mut stack)?;
                    let a = pop_int(&mut stack)?;
                    let v = match instr.opcode {
                        Opcode::Iadd => a.wrapping_add(b),
                        Opcode::Isub => a.wrapping_sub(b),
                        Opcode::Imul => a.wrapping_mul(b),
                        _ if b == 0 => {
                            return Err(VmError::RuntimeError("Division by zero".to_string()))
                        }
                        Opcode::Idiv => a.wrapping_div(b),
                        _ => a.wrapping_rem(b),
                    };
                    stack.push(Value::Int(v));
                }
                Opcode::Ineg => {
                    let a = pop_int(&mut stack)?;
                    stack.push(Value::Int(a.wrapping_neg()));
                }
                Opcode::Ladd | Opcode::Lsub | Opcode::Lmul => {
                    let b = pop_long(&mut stack)?;
                    let a = pop_long(&mut stack)?;
                    stack.push(Value::Long(match instr.opcode {
                        Opcode::Ladd => a.wrapping_add(b),
                        Opcode::Lsub => a.wrapping_sub(b),
                        _ => a.wrapping_mul(b),
                    }));
                }
                Opcode::Fadd | Opcode::Fmul => {
                    let b = pop_float(&mut stack)?;
                    let a = pop_float(&mut stack)?;
                    stack.push(Value::Float(if instr.opcode == Opcode::Fadd {
                        a + b
                    } else {
                        a * b
                    }));
                }
                Opcode::Dadd | Opcode::Dmul => {
                    let b = pop_double(&mut stack)?;
                    let a = pop_double(&mut stack)?;
                    stack.push(Value::Double(if instr.opcode == Opcode::Dadd {
                        a + b
                    } else {
                        a * b
                    }));
                }
                Opcode::I2L => {
                    let a = pop_int(&mut stack)?;
                    stack.push(Value::Long(i64::from(a)));
                }
                Opcode::L2I => {
                    let a = pop_long(&mut stack)?;
                    stack.push(Value::Int(a as i32));
                }
                Opcode::I2F => {
                    let a = pop_int(&mut stack)?;
                    stack.push(Value::Float(a as f32));
                }
                Opcode::I2D => {
                    let a = pop_int(&mut stack)?;
                    stack.push(Value::Double(f64::from(a)));
                }

                Opcode::Ieq | Opcode::Ine | Opcode::Ilt | Opcode::Ile | Opcode::Igt | Opcode::Ige => {
                    let b = pop_int(&mut stack)?;
                    let a = pop_int(&mut stack)?;
                    stack.push(bool_value(match instr.opcode {
                        Opcode::Ieq => a == b,
                        Opcode::Ine => a != b,
                        Opcode::Ilt => a < b,
                        Opcode::Ile => a <= b,
                        Opcode::Igt => a > b,
                        _ => a >= b,
                    }));
                }
                Opcode::Lcmp => {
                    let b = pop_long(&mut stack)?;
                    let a = pop_long(&mut stack)?;
                    stack.push(Value::Int(a.cmp(&b) as i32));
                }

                Opcode::Jmp => pc = jump(instr)?,
                Opcode::JmpIfFalse | Opcode::JmpIfTrue => {
                    let cond = pop_int(&mut stack)? != 0;
                    if cond == (instr.opcode == Opcode::JmpIfTrue) {
                        pc = jump(instr)?;
                    }
                }
                Opcode::JmpIfNull | Opcode::JmpIfNotNull => {
                    let is_null = pop(&mut stack)?.is_null();
                    if is_null == (instr.opcode == Opcode::JmpIfNull) {
                        pc = jump(instr)?;
                    }
                }

                Opcode::InvokeVirtual => {
                    let index = self.pool_index(body, instr)?;
                    let method = pool
                        .get_method(index)
                        .ok_or_else(|| self.bad_operand(body, instr))?;
                    let desc = descriptor(body, &method.descriptor)?;
                    let mut args = pop_n(&mut stack, desc.params.len())?;
                    let receiver = pop_object(&mut stack)?;
                    let (declaring, target) = receiver
                        .class()
                        .resolve_method(&method.name, &method.descriptor, false)
                        .ok_or_else(|| {
                            VmError::NoSuchMethod(format!(
                                "{}.{}{}",
                                receiver.class().name(),
                                method.name,
                                method.descriptor
                            ))
                        })?;
                    args.insert(0, Value::Ref(receiver));
                    let result = self.invoke(&declaring, &target, args)?;
                    if desc.returns_value() {
                        stack.push(result);
                    }
                }
                Opcode::InvokeStatic => {
                    let index = self.pool_index(body, instr)?;
                    let method = pool
                        .get_method(index)
                        .ok_or_else(|| self.bad_operand(body, instr))?;
                    let desc = descriptor(body, &method.descriptor)?;
                    let args = pop_n(&mut stack, desc.params.len())?;
                    let owner = self.vm.resolve_class(class, &method.owner)?;
                    let (declaring, target) = owner
                        .resolve_method(&method.name, &method.descriptor, true)
                        .ok_or_else(|| {
                            VmError::NoSuchMethod(format!(
                                "{}.{}{}",
                                method.owner, method.name, method.descriptor
                            ))
                        })?;
                    let result = self.invoke(&declaring, &target, args)?;
                    if desc.returns_value() {
                        stack.push(result);
                    }
                }
                Opcode::InvokeRuntime => {
                    let Operand::Runtime(id) = instr.operand else {
                        return Err(self.bad_operand(body, instr));
                    };
                    self.intrinsic(class, id, &mut stack)?;
                }

                Opcode::ReturnI
                | Opcode::ReturnL
                | Opcode::ReturnF
                | Opcode::ReturnD
                | Opcode::ReturnRef => return pop(&mut stack),
                Opcode::ReturnVoid => return Ok(Value::Null),

                Opcode::New => {
                    let index = self.pool_index(body, instr)?;
                    let name = pool
                        .get_class(index)
                        .ok_or_else(|| self.bad_operand(body, instr))?;
                    let target = self.vm.resolve_class(class, name)?;
                    stack.push(Value::Ref(Object::new(target)));
                }
                Opcode::GetField | Opcode::PutField => {
                    let index = self.pool_index(body, instr)?;
                    let field = pool
                        .get_field(index)
                        .ok_or_else(|| self.bad_operand(body, instr))?;
                    let value = if instr.opcode == Opcode::PutField {
                        Some(pop(&mut stack)?)
                    } else {
                        None
                    };
                    let obj = pop_object(&mut stack)?;
                    let slot = obj
                        .class()
                        .field_index(&field.name, &field.descriptor)
                        .ok_or_else(|| {
                            VmError::NoSuchField(format!(
                                "{}.{}:{}",
                                obj.class().name(),
                                field.name,
                                field.descriptor
                            ))
                        })?;
                    match value {
                        Some(value) => {
                            obj.set_field(slot, value);
                        }
                        None => stack.push(obj.get_field(slot).unwrap_or_default()),
                    }
                }
                Opcode::GetStatic | Opcode::PutStatic => {
                    let index = self.pool_index(body, instr)?;
                    let field = pool
                        .get_field(index)
                        .ok_or_else(|| self.bad_operand(body, instr))?;
                    let owner = self.vm.resolve_class(class, &field.owner)?;
                    let (declaring, slot) = owner
                        .static_field(&field.name, &field.descriptor)
                        .ok_or_else(|| {
                            VmError::NoSuchField(format!(
                                "{}.{}:{}",
                                field.owner, field.name, field.descriptor
                            ))
                        })?;
                    if instr.opcode == Opcode::PutStatic {
                        declaring.set_static(slot, pop(&mut stack)?);
                    } else {
                        stack.push(declaring.get_static(slot));
                    }
                }
                Opcode::CheckCast => {
                    let index = self.pool_index(body, instr)?;
                    let target = pool
                        .get_class(index)
                        .ok_or_else(|| self.bad_operand(body, instr))?;
                    let top = stack.last().ok_or(VmError::StackUnderflow)?;
                    let ok = match top {
                        Value::Null => true,
                        Value::Ref(obj) => obj.class().is_subclass_of(target),
                        Value::Str(_) => target == STRING_CLASS,
                        Value::Array(_) => target.starts_with('['),
                        _ => false,
                    };
                    if !ok {
                        let value = match top {
                            Value::Ref(obj) => obj.class().name().to_string(),
                            other => other.kind_name().to_string(),
                        };
                        return Err(VmError::ClassCast {
                            value,
                            target: target.to_string(),
                        });
                    }
                }

                Opcode::PackArgs => {
                    let Operand::Count(n) = instr.operand else {
                        return Err(self.bad_operand(body, instr));
                    };
                    let values = pop_n(&mut stack, usize::from(n))?;
                    stack.push(Value::Array(values.into()));
                }
                Opcode::ArrayLoad => {
                    let index = pop_int(&mut stack)?;
                    let array = pop_array(&mut stack)?;
                    let value = usize::try_from(index)
                        .ok()
                        .and_then(|i| array.get(i).cloned())
                        .ok_or(VmError::IndexOutOfBounds {
                            index,
                            len: array.len(),
                        })?;
                    stack.push(value);
                }
                Opcode::ArrayLen => {
                    let array = pop_array(&mut stack)?;
                    stack.push(Value::Int(array.len() as i32));
                }
                Opcode::Unbox => {
                    let Operand::Kind(kind) = instr.operand else {
                        return Err(self.bad_operand(body, instr));
                    };
                    let value = pop(&mut stack)?;
                    stack.push(value.unbox(kind)?);
                }

                Opcode::Throw => {
                    let value = pop(&mut stack)?;
                    return Err(VmError::Thrown(value.to_string()));
                }
            }
        }
    }

    /// Run an `INVOKE_RUNTIME` intrinsic
    fn intrinsic(
        &mut self,
        class: &Arc<RuntimeClass>,
        id: u16,
        stack: &mut Vec<Value>,
    ) -> VmResult<()> {
        let vm = self.vm;
        let engine = vm.engine();
        match id {
            runtime_id::TYPE_NAME => {
                let obj = pop_object(stack)?;
                stack.push(Value::str(obj.class().name()));
            }
            runtime_id::STR_EQ => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                let eq = matches!((a.as_str(), b.as_str()), (Some(a), Some(b)) if a == b);
                stack.push(bool_value(eq));
            }
            runtime_id::DISPATCH_CONTAINS => {
                let descriptor = pop_str(stack)?;
                let name = pop_str(stack)?;
                let receiver = pop_object(stack)?;
                let found = engine.dispatch().contains(receiver.class(), &name, &descriptor);
                stack.push(bool_value(found));
            }
            runtime_id::DISPATCH_RUN => {
                let descriptor = pop_str(stack)?;
                let name = pop_str(stack)?;
                let args = pop_array(stack)?;
                let receiver = pop_object(stack)?;
                let dispatch_class = receiver.class().clone();
                let result = engine.dispatch().run(
                    &dispatch_class,
                    &name,
                    &descriptor,
                    |declaring, target| {
                        let mut call_args = Vec::with_capacity(args.len() + 1);
                        call_args.push(Value::Ref(receiver));
                        call_args.extend(args.iter().cloned());
                        self.invoke(&declaring, &target, call_args)
                    },
                )?;
                stack.push(result);
            }
            runtime_id::DISPATCH_RUN_STATIC => {
                let descriptor = pop_str(stack)?;
                let name = pop_str(stack)?;
                let owner = pop_str(stack)?;
                let args = pop_array(stack)?;
                let owner = vm.resolve_class(class, &owner)?;
                let result = engine.dispatch().run_static(
                    &owner,
                    &name,
                    &descriptor,
                    |declaring, target| self.invoke(&declaring, &target, args.to_vec()),
                )?;
                stack.push(result);
            }
            runtime_id::FIELD_GET => {
                let slot = pop_slot(stack)?;
                let obj = pop_object(stack)?;
                stack.push(engine.store().get(&obj, slot)?);
            }
            runtime_id::FIELD_SET => {
                let slot = pop_slot(stack)?;
                let value = pop(stack)?;
                let obj = pop_object(stack)?;
                engine.store().set(&obj, slot, value)?;
            }
            runtime_id::STATIC_FIELD_GET => {
                let slot = pop_slot(stack)?;
                stack.push(engine.store().get_static(slot)?);
            }
            runtime_id::STATIC_FIELD_SET => {
                let slot = pop_slot(stack)?;
                let value = pop(stack)?;
                engine.store().set_static(slot, value)?;
            }
            runtime_id::NO_SUCH_METHOD => {
                let message = pop(stack)?;
                return Err(VmError::NoSuchMethod(message.to_string()));
            }
            other => {
                return Err(VmError::RuntimeError(format!(
                    "unknown runtime intrinsic {:#06x}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn bad_operand(&self, body: &MethodBody, instr: &Instruction) -> VmError {
        VmError::RuntimeError(format!(
            "bad operand for {} at {} in {}",
            instr.opcode.name(),
            instr.offset,
            body.qualified_name()
        ))
    }

    fn pool_index(&self, body: &MethodBody, instr: &Instruction) -> VmResult<u32> {
        instr
            .pool_index()
            .ok_or_else(|| self.bad_operand(body, instr))
    }

    fn slot(&self, body: &MethodBody, instr: &Instruction) -> VmResult<usize> {
        match instr.operand {
            Operand::Slot(slot) => Ok(usize::from(slot)),
            _ => Err(self.bad_operand(body, instr)),
        }
    }
}
