//! Interpreter for compiled bodies.
//!
//! Exception dispatch walks the flattened exception table innermost-first. Catch and filter
//! clauses transfer control into their handler; finally and fault handlers run in place and the
//! search continues outward. Runtime faults (division by zero, null dereference, failed casts)
//! surface as managed exception objects so the program's own handlers can catch them.

use std::cmp::Ordering;
use std::sync::Arc;

use super::emit::{CompiledBody, CompiledInstr, CompiledOperand};
use super::ops::HostOp;
use super::value::{Object, Value, VmError};
use super::{corelib, MethodHandle, Runtime};
use crate::model::HandlerKind;

/// How a run of instructions finished.
enum Flow {
    Return(Value),
    EndFinally,
    EndFilter(bool),
}

enum Step {
    Next,
    Jump(usize),
    Leave(usize),
    Exit(Flow),
}

struct Frame<'a> {
    rt: &'a Runtime,
    body: &'a CompiledBody,
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
    exception: Option<Value>,
}

/// Run `body` with `args` and return its result (`Null` for void bodies).
pub(crate) fn execute(rt: &Runtime, body: &CompiledBody, args: Vec<Value>) -> Result<Value, VmError> {
    let locals = body.locals.iter().map(|ty| Value::default_for(ty.full_name())).collect();
    let mut frame = Frame { rt, body, args, locals, stack: Vec::new(), exception: None };
    match frame.run(0)? {
        Flow::Return(value) => Ok(value),
        Flow::EndFinally | Flow::EndFilter(_) => Err(frame.invalid("handler exit outside a handler")),
    }
}

impl<'a> Frame<'a> {
    fn run(&mut self, start: usize) -> Result<Flow, VmError> {
        let mut pc = start;
        loop {
            let body = self.body;
            let instr = body
                .code
                .get(pc)
                .ok_or_else(|| self.invalid("execution ran past the end of the body"))?;
            match self.step(instr) {
                Ok(Step::Next) => pc += 1,
                Ok(Step::Jump(target)) => pc = target,
                Ok(Step::Leave(target)) => {
                    self.run_finally_blocks(pc, target)?;
                    self.stack.clear();
                    pc = target;
                }
                Ok(Step::Exit(flow)) => return Ok(flow),
                Err(VmError::Exception(ex)) => pc = self.handle(pc, ex)?,
                Err(other) => return Err(other),
            }
        }
    }

    /// Find the handler for an exception thrown at `pc`, running finally and fault handlers
    /// on the way out. Returns the position to resume at.
    fn handle(&mut self, pc: usize, ex: Value) -> Result<usize, VmError> {
        let body = self.body;
        for region in body.regions.iter().filter(|r| r.try_contains(pc)) {
            match region.kind {
                HandlerKind::Catch => {
                    let caught = region.catch_type.as_ref().map_or(true, |ty| ty.catches(&ex));
                    if caught {
                        self.enter_handler(ex);
                        return Ok(region.handler_start);
                    }
                }
                HandlerKind::Filter => {
                    let Some(filter_start) = region.filter_start else {
                        return Err(self.invalid("filter clause without a filter block"));
                    };
                    self.stack.clear();
                    self.stack.push(ex.clone());
                    let accepted = match self.run(filter_start) {
                        Ok(Flow::EndFilter(accepted)) => accepted,
                        Ok(_) => return Err(self.invalid("filter block did not end with endfilter")),
                        // An exception inside a filter counts as a rejection.
                        Err(VmError::Exception(_)) => false,
                        Err(other) => return Err(other),
                    };
                    if accepted {
                        self.enter_handler(ex);
                        return Ok(region.handler_start);
                    }
                }
                HandlerKind::Finally | HandlerKind::Fault => {
                    self.stack.clear();
                    self.run_handler_block(region.handler_start)?;
                }
            }
        }
        Err(VmError::Exception(ex))
    }

    fn enter_handler(&mut self, ex: Value) {
        self.stack.clear();
        self.stack.push(ex.clone());
        self.exception = Some(ex);
    }

    /// Run finally handlers of every try block that `leave` at `pc` exits on its way to `target`.
    fn run_finally_blocks(&mut self, pc: usize, target: usize) -> Result<(), VmError> {
        let body = self.body;
        for region in body
            .regions
            .iter()
            .filter(|r| r.kind == HandlerKind::Finally && r.try_contains(pc) && !r.try_contains(target))
        {
            self.run_handler_block(region.handler_start)?;
        }
        Ok(())
    }

    fn run_handler_block(&mut self, start: usize) -> Result<(), VmError> {
        match self.run(start)? {
            Flow::EndFinally => Ok(()),
            _ => Err(self.invalid("finally block did not end with endfinally")),
        }
    }

    fn step(&mut self, instr: &CompiledInstr) -> Result<Step, VmError> {
        use CompiledOperand as O;

        match (instr.op, &instr.operand) {
            (HostOp::Nop, _) | (HostOp::Box, _) | (HostOp::UnboxAny, _) => {}
            (HostOp::LdNull, _) => self.stack.push(Value::Null),
            (HostOp::LdcI4, O::Int(v)) => self.stack.push(Value::Int(i64::from(*v as i32))),
            (HostOp::LdcI8, O::Int(v)) => self.stack.push(Value::Int(*v)),
            (HostOp::LdcR8, O::Float(v)) => self.stack.push(Value::Float(*v)),
            (HostOp::LdStr, O::Str(s)) => self.stack.push(Value::Str(s.clone())),
            (HostOp::Dup, _) => {
                let top = self.pop()?;
                self.stack.push(top.clone());
                self.stack.push(top);
            }
            (HostOp::Pop, _) => {
                self.pop()?;
            }

            (HostOp::LdArg, O::Arg(index)) => {
                let value = self.args.get(usize::from(*index)).cloned();
                let value = value.ok_or_else(|| self.invalid("argument index out of range"))?;
                self.stack.push(value);
            }
            (HostOp::StArg, O::Arg(index)) => {
                let value = self.pop()?;
                let slot = self.args.get_mut(usize::from(*index));
                match slot {
                    Some(slot) => *slot = value,
                    None => return Err(self.invalid("argument index out of range")),
                }
            }
            (HostOp::LdLoc, O::Local(index)) => {
                let value = self.locals.get(usize::from(*index)).cloned();
                let value = value.ok_or_else(|| self.invalid("local index out of range"))?;
                self.stack.push(value);
            }
            (HostOp::StLoc, O::Local(index)) => {
                let value = self.pop()?;
                match self.locals.get_mut(usize::from(*index)) {
                    Some(slot) => *slot = value,
                    None => return Err(self.invalid("local index out of range")),
                }
            }

            (HostOp::Br, O::Target(target)) => return Ok(Step::Jump(*target)),
            (HostOp::Leave, O::Target(target)) => return Ok(Step::Leave(*target)),
            (HostOp::BrTrue, O::Target(target)) => {
                if self.pop()?.is_truthy() {
                    return Ok(Step::Jump(*target));
                }
            }
            (HostOp::BrFalse, O::Target(target)) => {
                if !self.pop()?.is_truthy() {
                    return Ok(Step::Jump(*target));
                }
            }
            (op @ (HostOp::Beq
            | HostOp::BneUn
            | HostOp::Bge
            | HostOp::Bgt
            | HostOp::Ble
            | HostOp::Blt), O::Target(target)) => {
                let b = self.pop()?;
                let a = self.pop()?;
                let taken = match op {
                    HostOp::Beq => a == b,
                    HostOp::BneUn => a != b,
                    HostOp::Bge => matches!(compare(&a, &b), Some(Ordering::Greater | Ordering::Equal)),
                    HostOp::Bgt => compare(&a, &b) == Some(Ordering::Greater),
                    HostOp::Ble => matches!(compare(&a, &b), Some(Ordering::Less | Ordering::Equal)),
                    _ => compare(&a, &b) == Some(Ordering::Less),
                };
                if taken {
                    return Ok(Step::Jump(*target));
                }
            }
            (HostOp::Switch, O::Targets(targets)) => {
                let index = self.pop()?.as_int().unwrap_or(-1);
                if let Some(target) = usize::try_from(index).ok().and_then(|i| targets.get(i)) {
                    return Ok(Step::Jump(*target));
                }
            }

            (HostOp::Ceq | HostOp::Cgt | HostOp::Clt, _) => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = match instr.op {
                    HostOp::Ceq => a == b,
                    HostOp::Cgt => compare(&a, &b) == Some(Ordering::Greater),
                    _ => compare(&a, &b) == Some(Ordering::Less),
                };
                self.stack.push(Value::Int(i64::from(result)));
            }
            (HostOp::Add | HostOp::Sub | HostOp::Mul | HostOp::Div | HostOp::Rem, _) => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = self.arithmetic(instr.op, a, b)?;
                self.stack.push(result);
            }
            (HostOp::And | HostOp::Or | HostOp::Xor, _) => {
                let b = self.pop()?;
                let a = self.pop()?;
                let (Some(x), Some(y)) = (int_only(&a), int_only(&b)) else {
                    return Err(self.invalid("bitwise operation on non-integers"));
                };
                let result = match instr.op {
                    HostOp::And => x & y,
                    HostOp::Or => x | y,
                    _ => x ^ y,
                };
                self.stack.push(Value::Int(result));
            }
            (HostOp::Neg, _) => {
                let value = match self.pop()? {
                    Value::Int(v) => Value::Int(v.wrapping_neg()),
                    Value::Float(v) => Value::Float(-v),
                    _ => return Err(self.invalid("neg on a non-number")),
                };
                self.stack.push(value);
            }
            (HostOp::Not, _) => {
                let value = self.pop()?;
                let v = int_only(&value).ok_or_else(|| self.invalid("not on a non-integer"))?;
                self.stack.push(Value::Int(!v));
            }
            (HostOp::ConvI4 | HostOp::ConvI8 | HostOp::ConvR8, _) => {
                let value = self.pop()?;
                let converted = match (instr.op, value.as_int(), value.as_float()) {
                    (HostOp::ConvI4, Some(v), _) => Value::Int(i64::from(v as i32)),
                    (HostOp::ConvI8, Some(v), _) => Value::Int(v),
                    (HostOp::ConvR8, _, Some(v)) => Value::Float(v),
                    _ => return Err(self.rt.raise(corelib::INVALID_CAST, "conversion of a non-number")),
                };
                self.stack.push(converted);
            }

            (HostOp::Call, O::Method(method)) => self.call(method, false)?,
            (HostOp::CallVirt, O::Method(method)) => self.call(method, true)?,
            (HostOp::NewObj, O::Method(ctor)) => {
                let owner = ctor
                    .declaring_type()
                    .ok_or_else(|| self.invalid("constructor without a declaring type"))?;
                let mut args = self.pop_n(ctor.def().params.len())?;
                let obj = Value::Object(Arc::new(Object::new(owner)));
                args.insert(0, obj.clone());
                self.rt.invoke(ctor, args)?;
                self.stack.push(obj);
            }
            (HostOp::Ret, _) => {
                let value = self.stack.pop().unwrap_or_default();
                return Ok(Step::Exit(Flow::Return(value)));
            }

            (HostOp::LdFld, O::Field(field)) => {
                let target = self.pop()?;
                let obj = self.receiver(&target)?;
                self.stack.push(obj.get(&field.name));
            }
            (HostOp::StFld, O::Field(field)) => {
                let value = self.pop()?;
                let target = self.pop()?;
                self.receiver(&target)?.set(&field.name, value);
            }
            (HostOp::LdsFld, O::Field(field)) => self.stack.push(field.owner.get_static(&field.name)),
            (HostOp::StsFld, O::Field(field)) => {
                let value = self.pop()?;
                field.owner.set_static(&field.name, value);
            }

            (HostOp::CastClass, O::Type(ty)) => {
                let value = self.pop()?;
                if !matches!(value, Value::Null) && !ty.accepts(&value) {
                    let message = format!(
                        "Unable to cast object of type '{}' to type '{}'.",
                        value.type_name(),
                        ty.display_name()
                    );
                    return Err(self.rt.raise(corelib::INVALID_CAST, &message));
                }
                self.stack.push(value);
            }
            (HostOp::IsInst, O::Type(ty)) => {
                let value = self.pop()?;
                self.stack.push(if ty.accepts(&value) { value } else { Value::Null });
            }
            (HostOp::LdToken, O::Token(symbol)) => self.stack.push(Value::str(&symbol.qualified_name())),

            (HostOp::Throw, _) => {
                let ex = self.pop()?;
                if matches!(ex, Value::Null) {
                    return Err(self.null_reference());
                }
                return Err(VmError::Exception(ex));
            }
            (HostOp::Rethrow, _) => {
                let ex = self
                    .exception
                    .clone()
                    .ok_or_else(|| self.invalid("rethrow outside a catch handler"))?;
                return Err(VmError::Exception(ex));
            }
            (HostOp::EndFinally, _) => return Ok(Step::Exit(Flow::EndFinally)),
            (HostOp::EndFilter, _) => {
                let accepted = self.pop()?.is_truthy();
                return Ok(Step::Exit(Flow::EndFilter(accepted)));
            }

            (op, _) => return Err(self.invalid(&format!("operand does not fit {op}"))),
        }
        Ok(Step::Next)
    }

    fn call(&mut self, method: &MethodHandle, virtual_call: bool) -> Result<(), VmError> {
        let params = method.def().params.len();
        let mut args = self.pop_n(params)?;
        let mut target = method.clone();
        if !method.is_static() {
            let this = self.pop()?;
            if virtual_call {
                let obj = self.receiver(&this)?;
                if let Some(overridden) = obj.ty.find_method(method.name(), method.param_types()) {
                    target = overridden;
                }
            }
            args.insert(0, this);
        }
        let result = self.rt.invoke(&target, args)?;
        if target.returns_value() {
            self.stack.push(result);
        }
        Ok(())
    }

    fn arithmetic(&self, op: HostOp, a: Value, b: Value) -> Result<Value, VmError> {
        if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
            let (x, y) = (*x, *y);
            if matches!(op, HostOp::Div | HostOp::Rem) && y == 0 {
                return Err(self.rt.raise(corelib::DIVIDE_BY_ZERO, "Attempted to divide by zero."));
            }
            let result = match op {
                HostOp::Add => x.wrapping_add(y),
                HostOp::Sub => x.wrapping_sub(y),
                HostOp::Mul => x.wrapping_mul(y),
                HostOp::Div => x.wrapping_div(y),
                _ => x.wrapping_rem(y),
            };
            return Ok(Value::Int(result));
        }
        let (Some(x), Some(y)) = (a.as_float(), b.as_float()) else {
            return Err(self.invalid(&format!("{op} on {} and {}", a.type_name(), b.type_name())));
        };
        let result = match op {
            HostOp::Add => x + y,
            HostOp::Sub => x - y,
            HostOp::Mul => x * y,
            HostOp::Div => x / y,
            _ => x % y,
        };
        Ok(Value::Float(result))
    }

    fn receiver<'v>(&self, value: &'v Value) -> Result<&'v Arc<Object>, VmError> {
        value.as_object().ok_or_else(|| self.null_reference())
    }

    fn null_reference(&self) -> VmError {
        self.rt.raise(corelib::NULL_REFERENCE, "Object reference not set to an instance of an object.")
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or_else(|| VmError::StackUnderflow(self.body.name.clone()))
    }

    /// Pop `n` values, returned in push order.
    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, VmError> {
        if self.stack.len() < n {
            return Err(VmError::StackUnderflow(self.body.name.clone()));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn invalid(&self, reason: &str) -> VmError {
        VmError::InvalidProgram { method: self.body.name.clone(), reason: reason.to_string() }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => a.as_float()?.partial_cmp(&b.as_float()?),
    }
}

fn int_only(value: &Value) -> Option<i64> {
    match value {
        Value::Int(v) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::emit::{assemble, Emitter, ExceptionBlock, ExecInstruction, ExecOperand};
    use crate::runtime::TypeHandle;

    fn runtime() -> Runtime {
        Runtime::with_console(Arc::new(crate::runtime::CapturedConsole::new())).unwrap()
    }

    fn exec(rt: &Runtime, emitter: Emitter, code: Vec<ExecInstruction>) -> Result<Value, VmError> {
        let body = assemble("test", emitter, code).unwrap();
        execute(rt, &body, Vec::new())
    }

    fn i(op: HostOp, operand: ExecOperand) -> ExecInstruction {
        ExecInstruction::new(op, operand)
    }

    #[test]
    fn arithmetic_and_branches() {
        let rt = runtime();
        let mut emitter = Emitter::new();
        let big = emitter.define_label();
        let mut code = vec![
            i(HostOp::LdcI4, ExecOperand::Int(6)),
            i(HostOp::LdcI4, ExecOperand::Int(7)),
            i(HostOp::Mul, ExecOperand::None),
            i(HostOp::Dup, ExecOperand::None),
            i(HostOp::LdcI4, ExecOperand::Int(40)),
            i(HostOp::Bgt, ExecOperand::Label(big)),
            i(HostOp::Ret, ExecOperand::None),
            i(HostOp::LdcI4, ExecOperand::Int(1)),
            i(HostOp::Add, ExecOperand::None),
            i(HostOp::Ret, ExecOperand::None),
        ];
        code[7].labels.push(big);
        assert_eq!(exec(&rt, emitter, code).unwrap(), Value::Int(43));
    }

    #[test]
    fn divide_by_zero_is_catchable() {
        let rt = runtime();
        let exception = rt.find_live_type(corelib::DIVIDE_BY_ZERO).unwrap();
        let mut emitter = Emitter::new();
        let done = emitter.define_label();
        let mut code = vec![
            i(HostOp::LdcI4, ExecOperand::Int(1)),
            i(HostOp::LdcI4, ExecOperand::Int(0)),
            i(HostOp::Div, ExecOperand::None),
            i(HostOp::Leave, ExecOperand::Label(done)),
            i(HostOp::Pop, ExecOperand::None),
            i(HostOp::LdcI4, ExecOperand::Int(-1)),
            i(HostOp::Pop, ExecOperand::None),
            i(HostOp::Leave, ExecOperand::Label(done)),
            i(HostOp::LdcI4, ExecOperand::Int(99)),
            i(HostOp::Ret, ExecOperand::None),
        ];
        code[0].blocks.push(ExceptionBlock::BeginException);
        code[4].blocks.push(ExceptionBlock::BeginHandler {
            kind: HandlerKind::Catch,
            catch_type: Some(TypeHandle::new(exception)),
        });
        code[8].blocks.push(ExceptionBlock::EndException);
        code[8].labels.push(done);
        assert_eq!(exec(&rt, emitter, code).unwrap(), Value::Int(99));
    }

    #[test]
    fn finally_runs_when_exception_escapes() {
        let rt = runtime();
        let mut emitter = Emitter::new();
        let counter = emitter.declare_local(
            TypeHandle::new(rt.find_live_type("System.Int32").unwrap()),
            false,
        );
        let mut code = vec![
            i(HostOp::LdNull, ExecOperand::None),
            i(HostOp::Throw, ExecOperand::None),
            i(HostOp::LdcI4, ExecOperand::Int(5)),
            i(HostOp::StLoc, ExecOperand::Local(counter)),
            i(HostOp::EndFinally, ExecOperand::None),
        ];
        code[0].blocks.push(ExceptionBlock::BeginException);
        code[2].blocks.push(ExceptionBlock::BeginHandler {
            kind: HandlerKind::Finally,
            catch_type: None,
        });
        let err = exec(&rt, emitter, code).unwrap_err();
        let ex = err.exception().unwrap();
        assert_eq!(ex.type_name(), corelib::NULL_REFERENCE);
    }

    #[test]
    fn stack_underflow_is_reported() {
        let rt = runtime();
        let code = vec![i(HostOp::Pop, ExecOperand::None)];
        assert!(matches!(exec(&rt, Emitter::new(), code), Err(VmError::StackUnderflow(_))));
    }
}
