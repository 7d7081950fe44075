use anyhow::{Context, Result};
use stackil_bytecode::core::metadata::{MethodKind, MethodRef, TypeRef};
use stackil_bytecode::core::opcodes::Opcode;
use stackil_bytecode::core::types::VerificationType;
use stackil_emit::{FinalizedStream, Operand, ResolvedInstruction, ResolvedTarget};
use std::cmp::Ordering;

use crate::error::ExecError;
use crate::heap::Object;
use crate::host::{Host, Invocation};
use crate::value::{Place, Value};
use crate::vm::{Frame, VM};

pub enum StepResult {
    Next,
    Jump(usize),
    Return(Option<Value>),
    Throw(Value),
    Leave(usize),
    EndFinally,
}

fn pop(frame: &mut Frame, opcode: &'static str) -> Result<Value, ExecError> {
    frame.stack.pop().ok_or(ExecError::StackEmpty { opcode })
}

fn pop_n(frame: &mut Frame, count: usize, opcode: &'static str) -> Result<Vec<Value>, ExecError> {
    if frame.stack.len() < count {
        return Err(ExecError::StackEmpty { opcode });
    }
    Ok(frame.stack.split_off(frame.stack.len() - count))
}

fn bad(opcode: &'static str, found: &Value) -> ExecError {
    ExecError::BadValue {
        opcode,
        found: found.to_string(),
    }
}

fn param(opcode: &'static str, operand: &Operand) -> ExecError {
    ExecError::OpcodeParamError {
        opcode,
        message: format!("unexpected operand {operand:?}"),
    }
}

fn target(opcode: &'static str, operand: &Operand) -> Result<usize, ExecError> {
    match operand {
        Operand::Branch(ResolvedTarget { index, .. }) => Ok(*index),
        other => Err(param(opcode, other)),
    }
}

fn index_of(opcode: &'static str, value: &Value) -> Result<i64, ExecError> {
    match value {
        Value::Int32(_) | Value::NativeInt(_) => value.as_int().ok_or_else(|| bad(opcode, value)),
        other => Err(bad(opcode, other)),
    }
}

macro_rules! int_arith {
    ($opcode:expr, $name:expr, $a:expr, $b:expr) => {
        match $opcode {
            Opcode::ADD => Ok($a.wrapping_add($b)),
            Opcode::SUB => Ok($a.wrapping_sub($b)),
            Opcode::MUL => Ok($a.wrapping_mul($b)),
            Opcode::DIV if $b == 0 => Err(ExecError::DivideByZero { opcode: $name }),
            Opcode::DIV => Ok($a.wrapping_div($b)),
            Opcode::REM if $b == 0 => Err(ExecError::DivideByZero { opcode: $name }),
            Opcode::REM => Ok($a.wrapping_rem($b)),
            Opcode::AND => Ok($a & $b),
            Opcode::OR => Ok($a | $b),
            Opcode::XOR => Ok($a ^ $b),
            _ => Err(ExecError::OpcodeParamError {
                opcode: $name,
                message: "not an arithmetic opcode".to_string(),
            }),
        }
    };
}

fn float_arith(opcode: Opcode, a: f64, b: f64) -> Option<f64> {
    Some(match opcode {
        Opcode::ADD => a + b,
        Opcode::SUB => a - b,
        Opcode::MUL => a * b,
        Opcode::DIV => a / b,
        Opcode::REM => a % b,
        _ => return None,
    })
}

fn binary(opcode: Opcode, a: Value, b: Value) -> Result<Value, ExecError> {
    let name = opcode.mnemonic();
    match (a, b) {
        (Value::Int32(a), Value::Int32(b)) => int_arith!(opcode, name, a, b).map(Value::Int32),
        (Value::Int64(a), Value::Int64(b)) => int_arith!(opcode, name, a, b).map(Value::Int64),
        (a @ (Value::NativeInt(_) | Value::Int32(_)), b @ (Value::NativeInt(_) | Value::Int32(_))) => {
            let (x, y) = (a.as_int().unwrap_or_default(), b.as_int().unwrap_or_default());
            int_arith!(opcode, name, x, y).map(Value::NativeInt)
        }
        (Value::Float32(a), Value::Float32(b)) => float_arith(opcode, f64::from(a), f64::from(b))
            .map(|x| Value::Float32(x as f32))
            .ok_or_else(|| bad(name, &Value::Float32(a))),
        (Value::Float64(a), Value::Float64(b)) => float_arith(opcode, a, b)
            .map(Value::Float64)
            .ok_or_else(|| bad(name, &Value::Float64(a))),
        (a, _) => Err(bad(name, &a)),
    }
}

fn shift(opcode: Opcode, value: Value, amount: Value) -> Result<Value, ExecError> {
    let name = opcode.mnemonic();
    let n = index_of(name, &amount)? as u32;
    Ok(match (opcode, value) {
        (Opcode::SHL, Value::Int32(v)) => Value::Int32(v.wrapping_shl(n)),
        (Opcode::SHR, Value::Int32(v)) => Value::Int32(v.wrapping_shr(n)),
        (Opcode::SHR_UN, Value::Int32(v)) => Value::Int32((v as u32).wrapping_shr(n) as i32),
        (Opcode::SHL, Value::Int64(v)) => Value::Int64(v.wrapping_shl(n)),
        (Opcode::SHR, Value::Int64(v)) => Value::Int64(v.wrapping_shr(n)),
        (Opcode::SHR_UN, Value::Int64(v)) => Value::Int64((v as u64).wrapping_shr(n) as i64),
        (Opcode::SHL, Value::NativeInt(v)) => Value::NativeInt(v.wrapping_shl(n)),
        (Opcode::SHR, Value::NativeInt(v)) => Value::NativeInt(v.wrapping_shr(n)),
        (Opcode::SHR_UN, Value::NativeInt(v)) => {
            Value::NativeInt((v as u64).wrapping_shr(n) as i64)
        }
        (_, other) => return Err(bad(name, &other)),
    })
}

/// Identity for references, value equality for everything else
fn equal(a: &Value, b: &Value) -> bool {
    match (a.as_int(), b.as_int()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn ordering(opcode: &'static str, a: &Value, b: &Value) -> Result<Option<Ordering>, ExecError> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Ok(Some(x.cmp(&y)));
    }
    match (a.as_float(), b.as_float()) {
        (Some(x), Some(y)) => Ok(x.partial_cmp(&y)),
        _ => Err(bad(opcode, a)),
    }
}

fn convert(opcode: Opcode, value: Value) -> Result<Value, ExecError> {
    let name = opcode.mnemonic();
    if let Some(n) = value.as_int() {
        return Ok(match opcode {
            Opcode::CONV_I4 => Value::Int32(n as i32),
            Opcode::CONV_I8 => Value::Int64(n),
            Opcode::CONV_I => Value::NativeInt(n),
            Opcode::CONV_R4 => Value::Float32(n as f32),
            Opcode::CONV_R8 => Value::Float64(n as f64),
            _ => return Err(bad(name, &value)),
        });
    }
    let Some(x) = value.as_float() else {
        return Err(bad(name, &value));
    };
    Ok(match opcode {
        Opcode::CONV_I4 => Value::Int32(x as i32),
        Opcode::CONV_I8 => Value::Int64(x as i64),
        Opcode::CONV_I => Value::NativeInt(x as i64),
        Opcode::CONV_R4 => Value::Float32(x as f32),
        Opcode::CONV_R8 => Value::Float64(x),
        _ => return Err(bad(name, &value)),
    })
}

fn branch_taken(opcode: Opcode, frame: &mut Frame) -> Result<bool, ExecError> {
    let name = opcode.mnemonic();
    Ok(match opcode {
        Opcode::BR | Opcode::BR_S => true,
        Opcode::BRTRUE | Opcode::BRTRUE_S => pop(frame, name)?.is_true(),
        Opcode::BRFALSE | Opcode::BRFALSE_S => !pop(frame, name)?.is_true(),
        _ => {
            let b = pop(frame, name)?;
            let a = pop(frame, name)?;
            match opcode {
                Opcode::BEQ | Opcode::BEQ_S => equal(&a, &b),
                Opcode::BNE_UN | Opcode::BNE_UN_S => !equal(&a, &b),
                Opcode::BLT | Opcode::BLT_S => ordering(name, &a, &b)? == Some(Ordering::Less),
                Opcode::BLE | Opcode::BLE_S => {
                    matches!(ordering(name, &a, &b)?, Some(Ordering::Less | Ordering::Equal))
                }
                Opcode::BGT | Opcode::BGT_S => ordering(name, &a, &b)? == Some(Ordering::Greater),
                Opcode::BGE | Opcode::BGE_S => {
                    matches!(ordering(name, &a, &b)?, Some(Ordering::Greater | Ordering::Equal))
                }
                _ => return Err(bad(name, &a)),
            }
        }
    })
}

fn read_struct_field(
    opcode: &'static str,
    value: &Value,
    field: &str,
    ty: &VerificationType,
) -> Result<Value, ExecError> {
    match value {
        Value::Struct(s) => Ok(s
            .fields
            .get(field)
            .cloned()
            .unwrap_or_else(|| Value::default_for(ty))),
        other => Err(bad(opcode, other)),
    }
}

impl<H: Host> VM<H> {
    pub(crate) fn step(
        &mut self,
        frame: &mut Frame,
        stream: &FinalizedStream,
        instruction: &ResolvedInstruction,
    ) -> Result<StepResult> {
        let opcode = instruction.opcode;
        let name = opcode.mnemonic();
        let operand = &instruction.operand;

        match opcode {
            Opcode::NOP => {}
            Opcode::LDNULL => frame.stack.push(Value::Null),
            Opcode::LDC_I4 | Opcode::LDC_I8 | Opcode::LDC_R4 | Opcode::LDC_R8 | Opcode::LDSTR => {
                let value = match operand {
                    Operand::Int32(v) => Value::Int32(*v),
                    Operand::Int64(v) => Value::Int64(*v),
                    Operand::Float32(v) => Value::Float32(*v),
                    Operand::Float64(v) => Value::Float64(*v),
                    Operand::String(text) => Value::Str(text.clone()),
                    other => return Err(param(name, other).into()),
                };
                frame.stack.push(value);
            }
            Opcode::DUP => {
                let top = frame.stack.last().cloned().ok_or(ExecError::StackEmpty { opcode: name })?;
                frame.stack.push(top);
            }
            Opcode::POP => {
                pop(frame, name)?;
            }

            Opcode::ADD
            | Opcode::SUB
            | Opcode::MUL
            | Opcode::DIV
            | Opcode::REM
            | Opcode::AND
            | Opcode::OR
            | Opcode::XOR => {
                let b = pop(frame, name)?;
                let a = pop(frame, name)?;
                frame.stack.push(binary(opcode, a, b)?);
            }
            Opcode::SHL | Opcode::SHR | Opcode::SHR_UN => {
                let amount = pop(frame, name)?;
                let value = pop(frame, name)?;
                frame.stack.push(shift(opcode, value, amount)?);
            }
            Opcode::NEG => {
                let value = match pop(frame, name)? {
                    Value::Int32(v) => Value::Int32(v.wrapping_neg()),
                    Value::Int64(v) => Value::Int64(v.wrapping_neg()),
                    Value::NativeInt(v) => Value::NativeInt(v.wrapping_neg()),
                    Value::Float32(x) => Value::Float32(-x),
                    Value::Float64(x) => Value::Float64(-x),
                    other => return Err(bad(name, &other).into()),
                };
                frame.stack.push(value);
            }
            Opcode::NOT => {
                let value = match pop(frame, name)? {
                    Value::Int32(v) => Value::Int32(!v),
                    Value::Int64(v) => Value::Int64(!v),
                    Value::NativeInt(v) => Value::NativeInt(!v),
                    other => return Err(bad(name, &other).into()),
                };
                frame.stack.push(value);
            }
            Opcode::CEQ | Opcode::CGT | Opcode::CLT => {
                let b = pop(frame, name)?;
                let a = pop(frame, name)?;
                let result = match opcode {
                    Opcode::CEQ => equal(&a, &b),
                    Opcode::CGT => ordering(name, &a, &b)? == Some(Ordering::Greater),
                    _ => ordering(name, &a, &b)? == Some(Ordering::Less),
                };
                frame.stack.push(Value::Int32(i32::from(result)));
            }
            Opcode::CONV_I4 | Opcode::CONV_I8 | Opcode::CONV_I | Opcode::CONV_R4 | Opcode::CONV_R8 => {
                let value = pop(frame, name)?;
                frame.stack.push(convert(opcode, value)?);
            }

            Opcode::BR
            | Opcode::BR_S
            | Opcode::BRTRUE
            | Opcode::BRTRUE_S
            | Opcode::BRFALSE
            | Opcode::BRFALSE_S
            | Opcode::BEQ
            | Opcode::BEQ_S
            | Opcode::BNE_UN
            | Opcode::BNE_UN_S
            | Opcode::BLT
            | Opcode::BLT_S
            | Opcode::BLE
            | Opcode::BLE_S
            | Opcode::BGT
            | Opcode::BGT_S
            | Opcode::BGE
            | Opcode::BGE_S => {
                let to = target(name, operand)?;
                if branch_taken(opcode, frame)? {
                    return Ok(StepResult::Jump(to));
                }
            }
            Opcode::SWITCH => {
                let Operand::Switch(targets) = operand else {
                    return Err(param(name, operand).into());
                };
                let selector = pop(frame, name)?;
                let index = index_of(name, &selector)?;
                if let Some(to) = usize::try_from(index).ok().and_then(|i| targets.get(i)) {
                    return Ok(StepResult::Jump(to.index));
                }
            }
            Opcode::LEAVE | Opcode::LEAVE_S => {
                return Ok(StepResult::Leave(target(name, operand)?));
            }
            Opcode::ENDFINALLY => return Ok(StepResult::EndFinally),
            Opcode::RET => {
                let value = match stream.signature.ret {
                    Some(_) => Some(pop(frame, name)?),
                    None => None,
                };
                return Ok(StepResult::Return(value));
            }
            Opcode::THROW => {
                let exception = pop(frame, name)?;
                if exception == Value::Null {
                    return Err(ExecError::NullReference { opcode: name }.into());
                }
                return Ok(StepResult::Throw(exception));
            }
            Opcode::RETHROW => {
                let pc = frame.pc;
                let exception = frame
                    .caught
                    .iter()
                    .rev()
                    .find(|(handler, _)| {
                        let h = &stream.handlers[*handler];
                        h.handler_start <= pc && pc < h.handler_end
                    })
                    .map(|(_, exception)| exception.clone())
                    .ok_or(ExecError::NoActiveException)?;
                return Ok(StepResult::Throw(exception));
            }

            Opcode::LDLOC | Opcode::LDLOC_S | Opcode::LDARG | Opcode::LDARG_S => {
                let place = place(name, operand)?;
                let value = frame.place(place).cloned().ok_or_else(|| param(name, operand))?;
                frame.stack.push(value);
            }
            Opcode::STLOC | Opcode::STLOC_S | Opcode::STARG | Opcode::STARG_S => {
                let place = place(name, operand)?;
                let value = pop(frame, name)?;
                *frame.place_mut(place).ok_or_else(|| param(name, operand))? = value;
            }
            Opcode::LDLOCA | Opcode::LDLOCA_S | Opcode::LDARGA | Opcode::LDARGA_S => {
                frame.stack.push(Value::Ref(place(name, operand)?));
            }
            Opcode::LDOBJ => {
                let Value::Ref(at) = pop(frame, name)? else {
                    return Err(param(name, operand).into());
                };
                let value = frame.place(at).cloned().ok_or_else(|| param(name, operand))?;
                frame.stack.push(value);
            }
            Opcode::STOBJ => {
                let value = pop(frame, name)?;
                let Value::Ref(at) = pop(frame, name)? else {
                    return Err(param(name, operand).into());
                };
                *frame.place_mut(at).ok_or_else(|| param(name, operand))? = value;
            }
            Opcode::INITOBJ => {
                let Operand::Class(ty) = operand else {
                    return Err(param(name, operand).into());
                };
                let Value::Ref(at) = pop(frame, name)? else {
                    return Err(param(name, operand).into());
                };
                *frame.place_mut(at).ok_or_else(|| param(name, operand))? =
                    Value::default_for(&VerificationType::of_type(ty));
            }

            Opcode::LDFLD => {
                let Operand::Field(field) = operand else {
                    return Err(param(name, operand).into());
                };
                let value = match pop(frame, name)? {
                    Value::Null => return Err(ExecError::NullReference { opcode: name }.into()),
                    Value::Object(id) => self
                        .heap
                        .field(id, field.name())
                        .cloned()
                        .unwrap_or_else(|| Value::default_for(field.field_type())),
                    Value::Ref(at) => {
                        let target = frame.place(at).ok_or_else(|| param(name, operand))?;
                        read_struct_field(name, target, field.name(), field.field_type())?
                    }
                    other => read_struct_field(name, &other, field.name(), field.field_type())?,
                };
                frame.stack.push(value);
            }
            Opcode::STFLD => {
                let Operand::Field(field) = operand else {
                    return Err(param(name, operand).into());
                };
                let value = pop(frame, name)?;
                match pop(frame, name)? {
                    Value::Null => return Err(ExecError::NullReference { opcode: name }.into()),
                    Value::Object(id) => {
                        if !self.heap.set_field(id, field.name(), value) {
                            return Err(bad(name, &Value::Object(id)).into());
                        }
                    }
                    Value::Ref(at) => match frame.place_mut(at) {
                        Some(Value::Struct(s)) => {
                            s.fields.insert(field.name().to_string(), value);
                        }
                        _ => return Err(param(name, operand).into()),
                    },
                    other => return Err(bad(name, &other).into()),
                }
            }
            Opcode::LDSFLD | Opcode::STSFLD => {
                let Operand::Field(field) = operand else {
                    return Err(param(name, operand).into());
                };
                let key = (
                    field.declaring_type().name().to_string(),
                    field.name().to_string(),
                );
                if opcode == Opcode::LDSFLD {
                    let value = self
                        .statics
                        .get(&key)
                        .cloned()
                        .unwrap_or_else(|| Value::default_for(field.field_type()));
                    frame.stack.push(value);
                } else {
                    let value = pop(frame, name)?;
                    self.statics.insert(key, value);
                }
            }

            Opcode::NEWARR => {
                let Operand::Type(element) = operand else {
                    return Err(param(name, operand).into());
                };
                let len = pop(frame, name)?;
                let len = usize::try_from(index_of(name, &len)?)
                    .map_err(|_| bad(name, &len))?;
                let id = self.heap.alloc(Object::Array {
                    element: element.clone(),
                    items: vec![Value::default_for(element); len],
                });
                frame.stack.push(Value::Object(id));
            }
            Opcode::LDLEN => {
                let array = pop(frame, name)?;
                let len = match &array {
                    Value::Object(id) => match self.heap.get(*id) {
                        Some(Object::Array { items, .. }) => items.len(),
                        _ => return Err(bad(name, &array).into()),
                    },
                    Value::Null => return Err(ExecError::NullReference { opcode: name }.into()),
                    other => return Err(bad(name, other).into()),
                };
                frame.stack.push(Value::NativeInt(len as i64));
            }
            Opcode::LDELEM | Opcode::STELEM => {
                let value = if opcode == Opcode::STELEM {
                    Some(pop(frame, name)?)
                } else {
                    None
                };
                let index = index_of(name, &pop(frame, name)?)?;
                let array = pop(frame, name)?;
                let id = match array {
                    Value::Object(id) => id,
                    Value::Null => return Err(ExecError::NullReference { opcode: name }.into()),
                    other => return Err(bad(name, &other).into()),
                };
                let Some(Object::Array { items, .. }) = self.heap.get_mut(id) else {
                    return Err(bad(name, &Value::Object(id)).into());
                };
                let len = items.len();
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or(ExecError::IndexOutOfRange {
                        opcode: name,
                        index,
                        len,
                    })?;
                match value {
                    Some(value) => *slot = value,
                    None => {
                        let item = slot.clone();
                        frame.stack.push(item);
                    }
                }
            }

            Opcode::NEWOBJ => {
                let Operand::Method(ctor) = operand else {
                    return Err(param(name, operand).into());
                };
                let params = pop_n(frame, ctor.params().len(), name)?;
                let declaring = ctor.declaring_type();
                let this = if declaring.is_value_type() {
                    Value::default_for(&VerificationType::Value(declaring.clone()))
                } else {
                    Value::Object(self.heap.instance(declaring.clone()))
                };
                let args = std::iter::once(this.clone()).chain(params).collect();
                let result = self.call(ctor, None, args, false)?;
                // A value-type constructor hands back the initialised value.
                frame.stack.push(match result {
                    Some(value) if declaring.is_value_type() => value,
                    _ => this,
                });
            }
            Opcode::CALL | Opcode::CALLVIRT => {
                let Operand::Method(method) = operand else {
                    return Err(param(name, operand).into());
                };
                let args = pop_n(frame, method.argument_types().len(), name)?;
                let receiver_class = if opcode == Opcode::CALLVIRT {
                    match args.first() {
                        Some(Value::Null) | None => {
                            return Err(ExecError::NullReference { opcode: name }.into())
                        }
                        Some(receiver) => self.heap.class_of(receiver),
                    }
                } else {
                    None
                };
                let result = self.call(method, receiver_class, args, instruction.is_tail_call())?;
                frame.stack.extend(result);
            }
            Opcode::CALLI => {
                let Operand::Signature(sig) = operand else {
                    return Err(param(name, operand).into());
                };
                let Value::Method(method) = pop(frame, name)? else {
                    return Err(param(name, operand).into());
                };
                let args = pop_n(frame, sig.params.len(), name)?;
                let result = self.call(&method, None, args, instruction.is_tail_call())?;
                frame.stack.extend(result);
            }
            Opcode::LDFTN => {
                let Operand::Method(method) = operand else {
                    return Err(param(name, operand).into());
                };
                frame.stack.push(Value::Method(method.clone()));
            }

            Opcode::CASTCLASS | Opcode::ISINST => {
                let Operand::Class(ty) = operand else {
                    return Err(param(name, operand).into());
                };
                let value = pop(frame, name)?;
                if value == Value::Null || self.is_instance(&value, ty) {
                    frame.stack.push(value);
                } else if opcode == Opcode::ISINST {
                    frame.stack.push(Value::Null);
                } else {
                    return Err(self.invalid_cast(&value, ty).into());
                }
            }
            Opcode::BOX => {
                let Operand::Class(ty) = operand else {
                    return Err(param(name, operand).into());
                };
                let value = pop(frame, name)?;
                let boxed = match value {
                    reference @ (Value::Null | Value::Object(_) | Value::Str(_)) => reference,
                    value => Value::Object(self.heap.alloc(Object::Boxed {
                        ty: ty.clone(),
                        value,
                    })),
                };
                frame.stack.push(boxed);
            }
            Opcode::UNBOX_ANY => {
                let Operand::Class(ty) = operand else {
                    return Err(param(name, operand).into());
                };
                let value = pop(frame, name)?;
                if !ty.is_value_type() {
                    if value != Value::Null && !self.is_instance(&value, ty) {
                        return Err(self.invalid_cast(&value, ty).into());
                    }
                    frame.stack.push(value);
                } else {
                    let unboxed = match &value {
                        Value::Object(id) => match self.heap.get(*id) {
                            Some(Object::Boxed { ty: boxed, value }) if boxed == ty => {
                                Some(value.clone())
                            }
                            _ => None,
                        },
                        Value::Null => return Err(ExecError::NullReference { opcode: name }.into()),
                        _ => None,
                    };
                    let unboxed = unboxed.ok_or_else(|| self.invalid_cast(&value, ty))?;
                    frame.stack.push(unboxed);
                }
            }

            Opcode::TAIL => {
                return Err(ExecError::OpcodeParamError {
                    opcode: name,
                    message: "prefix cannot appear as an instruction".to_string(),
                }
                .into())
            }
        }
        Ok(StepResult::Next)
    }

    fn call(
        &mut self,
        method: &MethodRef,
        receiver_class: Option<TypeRef>,
        args: Vec<Value>,
        tail: bool,
    ) -> Result<Option<Value>> {
        let invocation = Invocation {
            method,
            receiver_class,
            args,
            tail,
        };
        let result = self
            .host
            .invoke(&mut self.heap, invocation)
            .with_context(|| format!("call to {method}"))?;
        if method.kind() == MethodKind::Constructor {
            return Ok(result);
        }
        match (method.return_type(), result) {
            (Some(_), None) => Err(ExecError::MissingReturn {
                method: method.to_string(),
            }
            .into()),
            (Some(_), value) => Ok(value),
            (None, _) => Ok(None),
        }
    }

    fn is_instance(&self, value: &Value, ty: &TypeRef) -> bool {
        self.heap
            .class_of(value)
            .is_some_and(|class| self.host.types().is_subtype(&class, ty))
    }

    fn invalid_cast(&self, value: &Value, ty: &TypeRef) -> ExecError {
        let from = self
            .heap
            .class_of(value)
            .map(|class| class.name().to_string())
            .unwrap_or_else(|| value.to_string());
        ExecError::InvalidCast {
            from,
            to: ty.name().to_string(),
        }
    }
}

fn place(opcode: &'static str, operand: &Operand) -> Result<Place, ExecError> {
    match operand {
        Operand::Local(slot) => Ok(Place::Local(*slot)),
        Operand::Argument(index) => Ok(Place::Argument(*index)),
        other => Err(param(opcode, other)),
    }
}
