//! Restartable units: suspendable execution of compiled task bodies.
//!
//! A unit owns all of its execution state (op pointer, value stack, call
//! frames, exception handlers, pending resume value), so `step()` can return
//! to the scheduler at any suspension point and pick up exactly where it
//! left off. Runtime faults are converted to string exception values and are
//! catchable by the body's `try`/`catch`; an uncaught value fails the unit.

use std::sync::Arc;

use crate::task::TaskHandle;
use crate::transform::op::{
    BinaryOp, BuiltinFn, KernelQuery, MethodId, Op, UnaryOp, UnitProgram, YieldKind,
};
use crate::value::Value;

/// Maximum call-frame depth inside a unit. Exceeding it raises a catchable
/// exception rather than growing without bound.
const MAX_CALL_DEPTH: usize = 256;

/// What a suspension point produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Suspension {
    /// A delay marker: block for this many ticks (0 means plain yield).
    Delay(u32),

    /// A plain yield carrying a payload the scheduler does not interpret.
    Yield(Value),
}

/// Result of advancing a unit by one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The unit reached a suspension point.
    Yield(Suspension),

    /// The unit ran to completion.
    Done,
}

/// Failure of a unit's step.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UnitError {
    /// The body raised a value (or a runtime fault) that no handler caught.
    #[error("uncaught exception: {0}")]
    Uncaught(String),

    /// Internal interpreter invariant violation. Points at a lowering bug,
    /// not at the task body.
    #[error("interpreter fault: {0}")]
    Fault(String),
}

/// Destination for `print(…)` output from task bodies.
///
/// The default sink routes lines to the `log` facade; embedders (such as a
/// UI's capture layer) install their own.
pub trait PrintSink: Send + Sync {
    fn print(&self, task: TaskHandle, line: &str);
}

/// Default sink: lines go to `log::info!`.
#[derive(Debug, Default)]
pub struct LogSink;

impl PrintSink for LogSink {
    fn print(&self, task: TaskHandle, line: &str) {
        log::info!(target: "tickos::task", "[{}] {}", task, line);
    }
}

/// Everything a unit can observe about the kernel during one step.
pub struct UnitContext<'a> {
    /// Current tick counter value
    pub tick_count: u64,

    /// Scheduler tick rate in Hz (for `delayMs` conversion)
    pub tick_rate: u32,

    /// Handle of the task being advanced
    pub handle: TaskHandle,

    /// The task's params value
    pub params: &'a Value,

    /// Print destination
    pub sink: &'a dyn PrintSink,
}

/// One call frame: function index, op pointer, and local slots.
#[derive(Debug)]
struct Frame {
    func: u16,
    pc: usize,
    locals: Vec<Value>,
}

/// Installed exception handler, recording enough to unwind.
#[derive(Debug, Clone, Copy)]
struct Handler {
    catch_pc: usize,
    frame_depth: usize,
    stack_len: usize,
}

/// A restartable unit: the advance-one-step execution of a compiled body.
#[derive(Debug)]
pub struct TaskUnit {
    program: Arc<UnitProgram>,
    frames: Vec<Frame>,
    stack: Vec<Value>,
    handlers: Vec<Handler>,
    /// Value pushed at the start of the next step (resumed suspension
    /// expressions evaluate to this).
    resume: Option<Value>,
    finished: bool,
}

/// Outcome of executing a single op.
enum Flow {
    Continue,
    Yield(Suspension),
    Done,
}

impl TaskUnit {
    /// Create a fresh unit positioned at the body's first op.
    pub fn new(program: Arc<UnitProgram>, params: &Value) -> Self {
        let entry = program.entry();
        let mut locals = vec![Value::Null; entry.local_count as usize];
        if let Some(slot) = program.params_slot {
            if let Some(cell) = locals.get_mut(slot as usize) {
                *cell = params.clone();
            }
        }
        Self {
            frames: vec![Frame {
                func: 0,
                pc: 0,
                locals,
            }],
            stack: Vec::new(),
            handlers: Vec::new(),
            resume: None,
            finished: false,
            program,
        }
    }

    /// Whether the unit has run to completion (or failed).
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Advance to the next suspension point or to completion.
    ///
    /// Calling `step` on a finished unit reports `Done` again.
    pub fn step(&mut self, ctx: &UnitContext<'_>) -> Result<Step, UnitError> {
        if self.finished {
            return Ok(Step::Done);
        }

        if let Some(value) = self.resume.take() {
            self.stack.push(value);
        }

        loop {
            let op = self.fetch()?;
            match self.exec(op, ctx) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Yield(suspension)) => return Ok(Step::Yield(suspension)),
                Ok(Flow::Done) => {
                    self.finished = true;
                    return Ok(Step::Done);
                }
                Err(raised) => {
                    // Runtime faults and thrown values unwind to the nearest
                    // handler; without one, the unit fails.
                    if let Some(error) = self.raise(raised) {
                        self.finished = true;
                        return Err(error);
                    }
                }
            }
        }
    }

    fn fetch(&self) -> Result<Op, UnitError> {
        let frame = self
            .frames
            .last()
            .ok_or_else(|| UnitError::Fault("no active frame".to_string()))?;
        let func = self
            .program
            .funcs
            .get(frame.func as usize)
            .ok_or_else(|| UnitError::Fault(format!("bad function index {}", frame.func)))?;
        func.ops
            .get(frame.pc)
            .cloned()
            .ok_or_else(|| UnitError::Fault(format!("op pointer {} out of range", frame.pc)))
    }

    /// Execute one op. `Err` carries a raised value (candidate for catch).
    fn exec(&mut self, op: Op, ctx: &UnitContext<'_>) -> Result<Flow, Value> {
        // The op pointer advances first; jumps and yields overwrite it.
        self.frame_mut().pc += 1;

        match op {
            Op::Const(value) => {
                self.stack.push(value);
            }

            Op::LoadLocal(slot) => {
                let value = self
                    .frame()
                    .locals
                    .get(slot as usize)
                    .cloned()
                    .unwrap_or(Value::Null);
                self.stack.push(value);
            }

            Op::StoreLocal(slot) => {
                let value = self.pop()?;
                let frame = self.frame_mut();
                if let Some(cell) = frame.locals.get_mut(slot as usize) {
                    *cell = value;
                }
            }

            Op::Pop => {
                self.pop()?;
            }

            Op::Dup => {
                let top = self.peek()?.clone();
                self.stack.push(top);
            }

            Op::Unary(op) => {
                let operand = self.pop()?;
                let result = self.unary(op, operand)?;
                self.stack.push(result);
            }

            Op::Binary(op) => {
                let right = self.pop()?;
                let left = self.pop()?;
                let result = self.binary(op, left, right)?;
                self.stack.push(result);
            }

            Op::MakeArray(count) => {
                let start = self
                    .stack
                    .len()
                    .checked_sub(count as usize)
                    .ok_or_else(|| fault_value("array literal underflow"))?;
                let elements = self.stack.split_off(start);
                self.stack.push(Value::array(elements));
            }

            Op::IndexGet => {
                let index = self.pop()?;
                let object = self.pop()?;
                let result = index_get(&object, &index)?;
                self.stack.push(result);
            }

            Op::IndexSet => {
                let value = self.pop()?;
                let index = self.pop()?;
                let object = self.pop()?;
                index_set(&object, &index, value.clone())?;
                self.stack.push(value);
            }

            Op::GetLength => {
                let object = self.pop()?;
                let length = match &object {
                    Value::Str(s) => s.chars().count() as i64,
                    Value::Array(items) => items.lock().len() as i64,
                    other => {
                        return Err(type_error(format!(
                            "{} has no length",
                            other.type_name()
                        )));
                    }
                };
                self.stack.push(Value::Int(length));
            }

            Op::CallMethod { method, argc } => {
                let args = self.pop_args(argc)?;
                let receiver = self.pop()?;
                match method {
                    MethodId::Push => {
                        let Value::Array(items) = &receiver else {
                            return Err(type_error(format!(
                                "push is not available on {}",
                                receiver.type_name()
                            )));
                        };
                        let mut items = items.lock();
                        items.extend(args);
                        let len = items.len() as i64;
                        drop(items);
                        self.stack.push(Value::Int(len));
                    }
                }
            }

            Op::CallBuiltin { builtin, argc } => {
                let args = self.pop_args(argc)?;
                match builtin {
                    BuiltinFn::Print => {
                        let line = args
                            .iter()
                            .map(|v| v.to_string())
                            .collect::<Vec<_>>()
                            .join(" ");
                        ctx.sink.print(ctx.handle, &line);
                    }
                    // Bare delay()/delayMs() are inert: the receiver-qualified
                    // forms are the suspension points.
                    BuiltinFn::Delay | BuiltinFn::DelayMs => {}
                }
                self.stack.push(Value::Null);
            }

            Op::KernelQuery(query) => {
                let value = match query {
                    KernelQuery::TickCount => Value::Int(ctx.tick_count as i64),
                    KernelQuery::Params => ctx.params.clone(),
                };
                self.stack.push(value);
            }

            Op::Call { func, argc } => {
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(Value::Str("call stack overflow".to_string()));
                }
                let args = self.pop_args(argc)?;
                let callee = self
                    .program
                    .funcs
                    .get(func as usize)
                    .ok_or_else(|| fault_value("bad function index"))?;
                let mut locals = vec![Value::Null; callee.local_count as usize];
                // Surplus arguments are dropped, missing ones stay null.
                for (slot, arg) in args
                    .into_iter()
                    .take(callee.param_count as usize)
                    .enumerate()
                {
                    locals[slot] = arg;
                }
                self.frames.push(Frame {
                    func,
                    pc: 0,
                    locals,
                });
            }

            Op::Jump(target) => {
                self.frame_mut().pc = target;
            }

            Op::JumpIfFalse(target) => {
                let condition = self.pop()?;
                if !condition.is_truthy() {
                    self.frame_mut().pc = target;
                }
            }

            Op::JumpIfTrue(target) => {
                let condition = self.pop()?;
                if condition.is_truthy() {
                    self.frame_mut().pc = target;
                }
            }

            Op::Yield(kind) => {
                return Ok(Flow::Yield(self.suspend(kind, ctx)?));
            }

            Op::PushHandler { catch_pc } => {
                self.handlers.push(Handler {
                    catch_pc,
                    frame_depth: self.frames.len(),
                    stack_len: self.stack.len(),
                });
            }

            Op::PopHandler => {
                self.handlers.pop();
            }

            Op::Throw => {
                let value = self.pop()?;
                return Err(value);
            }

            Op::Return => {
                let value = self.pop()?;
                self.frames.pop();
                // Handlers installed by the finished frame die with it.
                let depth = self.frames.len();
                self.handlers.retain(|h| h.frame_depth <= depth);
                if self.frames.is_empty() {
                    return Ok(Flow::Done);
                }
                self.stack.push(value);
            }
        }

        Ok(Flow::Continue)
    }

    /// Build the suspension for a yield op.
    fn suspend(&mut self, kind: YieldKind, ctx: &UnitContext<'_>) -> Result<Suspension, Value> {
        match kind {
            YieldKind::Delay => {
                let ticks = self.pop_tick_count("delay")?;
                self.resume = Some(Value::Null);
                Ok(Suspension::Delay(ticks))
            }
            YieldKind::DelayMs => {
                let ms = self.pop_tick_count("delayMs")? as u64;
                let rate = ctx.tick_rate as u64;
                let ticks = (ms * rate).div_ceil(1000);
                self.resume = Some(Value::Null);
                Ok(Suspension::Delay(ticks.min(u32::MAX as u64) as u32))
            }
            YieldKind::Now => {
                self.resume = Some(Value::Null);
                Ok(Suspension::Yield(Value::Null))
            }
            YieldKind::Stmt => {
                let payload = self.pop()?;
                Ok(Suspension::Yield(payload))
            }
        }
    }

    /// Pop a delay argument and clamp it to a non-negative tick count.
    fn pop_tick_count(&mut self, what: &str) -> Result<u32, Value> {
        let value = self.pop()?;
        match value {
            Value::Null => Ok(0),
            Value::Int(n) => Ok(n.max(0).min(u32::MAX as i64) as u32),
            Value::Float(f) if f.is_finite() => Ok(f.max(0.0).min(u32::MAX as f64) as u32),
            other => Err(type_error(format!(
                "{} expects a number, got {}",
                what,
                other.type_name()
            ))),
        }
    }

    /// Unwind to the innermost handler with the raised value, or fail the
    /// unit when none is installed.
    fn raise(&mut self, value: Value) -> Option<UnitError> {
        match self.handlers.pop() {
            Some(handler) => {
                self.frames.truncate(handler.frame_depth);
                self.stack.truncate(handler.stack_len);
                if let Some(frame) = self.frames.last_mut() {
                    frame.pc = handler.catch_pc;
                } else {
                    return Some(UnitError::Fault("handler without a frame".to_string()));
                }
                self.stack.push(value);
                None
            }
            None => Some(UnitError::Uncaught(value.to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn unary(&self, op: UnaryOp, operand: Value) -> Result<Value, Value> {
        match op {
            UnaryOp::Not => Ok(Value::Bool(!operand.is_truthy())),
            UnaryOp::Neg => match operand {
                Value::Int(n) => n
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| type_error("integer overflow".to_string())),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(type_error(format!("cannot negate {}", other.type_name()))),
            },
        }
    }

    fn binary(&self, op: BinaryOp, left: Value, right: Value) -> Result<Value, Value> {
        use BinaryOp::*;

        match op {
            Eq => return Ok(Value::Bool(left.loose_eq(&right))),
            Ne => return Ok(Value::Bool(!left.loose_eq(&right))),
            StrictEq => return Ok(Value::Bool(left.strict_eq(&right))),
            StrictNe => return Ok(Value::Bool(!left.strict_eq(&right))),
            _ => {}
        }

        // String concatenation and comparison
        if let (Value::Str(a), Value::Str(b)) = (&left, &right) {
            return match op {
                Add => Ok(Value::Str(format!("{}{}", a, b))),
                Lt => Ok(Value::Bool(a < b)),
                Le => Ok(Value::Bool(a <= b)),
                Gt => Ok(Value::Bool(a > b)),
                Ge => Ok(Value::Bool(a >= b)),
                _ => Err(type_error("invalid operands for arithmetic".to_string())),
            };
        }
        if op == Add && matches!(left, Value::Str(_)) {
            return Ok(Value::Str(format!("{}{}", left, right)));
        }
        if op == Add && matches!(right, Value::Str(_)) {
            return Ok(Value::Str(format!("{}{}", left, right)));
        }

        // Numeric paths
        match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => self.int_binary(op, *a, *b),
            _ => {
                let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
                    return Err(type_error(format!(
                        "invalid operands: {} and {}",
                        left.type_name(),
                        right.type_name()
                    )));
                };
                self.float_binary(op, a, b)
            }
        }
    }

    fn int_binary(&self, op: BinaryOp, a: i64, b: i64) -> Result<Value, Value> {
        use BinaryOp::*;
        let overflow = || type_error("integer overflow".to_string());
        match op {
            Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
            Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
            Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
            Div => {
                if b == 0 {
                    return Err(type_error("division by zero".to_string()));
                }
                if a % b == 0 {
                    Ok(Value::Int(a / b))
                } else {
                    Ok(Value::Float(a as f64 / b as f64))
                }
            }
            Rem => {
                if b == 0 {
                    return Err(type_error("division by zero".to_string()));
                }
                Ok(Value::Int(a % b))
            }
            Pow => {
                if b >= 0 && b <= u32::MAX as i64 {
                    a.checked_pow(b as u32).map(Value::Int).ok_or_else(overflow)
                } else {
                    Ok(Value::Float((a as f64).powf(b as f64)))
                }
            }
            Lt => Ok(Value::Bool(a < b)),
            Le => Ok(Value::Bool(a <= b)),
            Gt => Ok(Value::Bool(a > b)),
            Ge => Ok(Value::Bool(a >= b)),
            Eq | Ne | StrictEq | StrictNe => unreachable!("handled above"),
        }
    }

    fn float_binary(&self, op: BinaryOp, a: f64, b: f64) -> Result<Value, Value> {
        use BinaryOp::*;
        match op {
            Add => Ok(Value::Float(a + b)),
            Sub => Ok(Value::Float(a - b)),
            Mul => Ok(Value::Float(a * b)),
            Div => Ok(Value::Float(a / b)),
            Rem => Ok(Value::Float(a % b)),
            Pow => Ok(Value::Float(a.powf(b))),
            Lt => Ok(Value::Bool(a < b)),
            Le => Ok(Value::Bool(a <= b)),
            Gt => Ok(Value::Bool(a > b)),
            Ge => Ok(Value::Bool(a >= b)),
            Eq | Ne | StrictEq | StrictNe => unreachable!("handled above"),
        }
    }

    // ------------------------------------------------------------------
    // Stack and frame helpers
    // ------------------------------------------------------------------

    fn frame(&self) -> &Frame {
        self.frames.last().expect("frame checked in fetch")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame checked in fetch")
    }

    fn pop(&mut self) -> Result<Value, Value> {
        self.stack
            .pop()
            .ok_or_else(|| fault_value("stack underflow"))
    }

    fn peek(&self) -> Result<&Value, Value> {
        self.stack
            .last()
            .ok_or_else(|| fault_value("stack underflow"))
    }

    fn pop_args(&mut self, argc: u8) -> Result<Vec<Value>, Value> {
        let start = self
            .stack
            .len()
            .checked_sub(argc as usize)
            .ok_or_else(|| fault_value("argument underflow"))?;
        Ok(self.stack.split_off(start))
    }
}

/// Runtime type errors surface as catchable string exceptions.
fn type_error(message: String) -> Value {
    Value::Str(message)
}

fn fault_value(message: &str) -> Value {
    Value::Str(format!("internal: {}", message))
}

fn index_get(object: &Value, index: &Value) -> Result<Value, Value> {
    let Value::Array(items) = object else {
        return Err(type_error(format!(
            "cannot index {}",
            object.type_name()
        )));
    };
    let Value::Int(i) = index else {
        return Err(type_error("array index must be an integer".to_string()));
    };
    if *i < 0 {
        return Ok(Value::Null);
    }
    Ok(items
        .lock()
        .get(*i as usize)
        .cloned()
        .unwrap_or(Value::Null))
}

fn index_set(object: &Value, index: &Value, value: Value) -> Result<(), Value> {
    let Value::Array(items) = object else {
        return Err(type_error(format!(
            "cannot index {}",
            object.type_name()
        )));
    };
    let Value::Int(i) = index else {
        return Err(type_error("array index must be an integer".to_string()));
    };
    if *i < 0 {
        return Err(type_error("array index must not be negative".to_string()));
    }
    let i = *i as usize;
    let mut items = items.lock();
    if i >= items.len() {
        items.resize(i + 1, Value::Null);
    }
    items[i] = value;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{TransformMode, Transformer};
    use parking_lot::Mutex;

    /// Test sink capturing printed lines.
    #[derive(Default)]
    struct CaptureSink {
        lines: Mutex<Vec<String>>,
    }

    impl PrintSink for CaptureSink {
        fn print(&self, _task: TaskHandle, line: &str) {
            self.lines.lock().push(line.to_string());
        }
    }

    fn unit_for(source: &str, mode: TransformMode) -> TaskUnit {
        let output = Transformer::new(mode).transform(source).unwrap();
        output.factory.instantiate(&Value::Null)
    }

    fn ctx<'a>(sink: &'a CaptureSink, params: &'a Value) -> UnitContext<'a> {
        UnitContext {
            tick_count: 7,
            tick_rate: 10,
            handle: TaskHandle::from_u64(1),
            params,
            sink,
        }
    }

    #[test]
    fn test_straight_line_body_completes_in_one_step() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for("let x = 1; x = x + 1; print(x);", TransformMode::DelayOnly);

        let step = unit.step(&ctx(&sink, &params)).unwrap();
        assert_eq!(step, Step::Done);
        assert!(unit.is_finished());
        assert_eq!(sink.lines.lock().as_slice(), ["2"]);
    }

    #[test]
    fn test_step_after_done_reports_done() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for("let x = 1;", TransformMode::DelayOnly);
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
    }

    #[test]
    fn test_delay_yields_marker_and_preserves_locals() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for(
            "(k) => { let i = 41; k.delay(5); i = i + 1; print(i); }",
            TransformMode::DelayOnly,
        );

        let step = unit.step(&ctx(&sink, &params)).unwrap();
        assert_eq!(step, Step::Yield(Suspension::Delay(5)));
        assert!(sink.lines.lock().is_empty());

        let step = unit.step(&ctx(&sink, &params)).unwrap();
        assert_eq!(step, Step::Done);
        assert_eq!(sink.lines.lock().as_slice(), ["42"]);
    }

    #[test]
    fn test_delay_clamps_negative_to_zero() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for("(k) => { k.delay(-3); }", TransformMode::DelayOnly);
        assert_eq!(
            unit.step(&ctx(&sink, &params)).unwrap(),
            Step::Yield(Suspension::Delay(0))
        );
    }

    #[test]
    fn test_delay_ms_converts_with_ceiling() {
        // tick_rate = 10: 250 ms -> ceil(2.5) = 3 ticks
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for("(k) => { k.delayMs(250); }", TransformMode::DelayOnly);
        assert_eq!(
            unit.step(&ctx(&sink, &params)).unwrap(),
            Step::Yield(Suspension::Delay(3))
        );
    }

    #[test]
    fn test_loop_state_preserved_across_steps() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for(
            "(k) => { for (let i = 0; i < 3; i++) { print(i); k.delay(1); } }",
            TransformMode::DelayOnly,
        );

        for _ in 0..3 {
            assert_eq!(
                unit.step(&ctx(&sink, &params)).unwrap(),
                Step::Yield(Suspension::Delay(1))
            );
        }
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
        assert_eq!(sink.lines.lock().as_slice(), ["0", "1", "2"]);
    }

    #[test]
    fn test_statement_mode_step_counts() {
        // Three plain statements plus one delay: four yields, done on the
        // fifth step.
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for(
            "(k) => { let x = 1; x = x + 1; k.delay(2); x = x + 1; }",
            TransformMode::StatementLevel,
        );

        let mut yields = 0;
        loop {
            match unit.step(&ctx(&sink, &params)).unwrap() {
                Step::Yield(_) => yields += 1,
                Step::Done => break,
            }
        }
        assert_eq!(yields, 4);
    }

    #[test]
    fn test_statement_mode_yields_statement_values() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for("1 + 1; 5;", TransformMode::StatementLevel);

        assert_eq!(
            unit.step(&ctx(&sink, &params)).unwrap(),
            Step::Yield(Suspension::Yield(Value::Int(2)))
        );
        assert_eq!(
            unit.step(&ctx(&sink, &params)).unwrap(),
            Step::Yield(Suspension::Yield(Value::Int(5)))
        );
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
    }

    #[test]
    fn test_yield_now_is_plain_yield() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for("(k) => { k.yield(); }", TransformMode::DelayOnly);
        assert_eq!(
            unit.step(&ctx(&sink, &params)).unwrap(),
            Step::Yield(Suspension::Yield(Value::Null))
        );
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
    }

    #[test]
    fn test_try_catch_catches_thrown_value() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for(
            r#"try { throw "boom"; } catch (e) { print("caught", e); }"#,
            TransformMode::DelayOnly,
        );
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
        assert_eq!(sink.lines.lock().as_slice(), ["caught boom"]);
    }

    #[test]
    fn test_try_catch_catches_runtime_fault() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for(
            r#"let x = 0; try { x = 1 / 0; } catch { x = -1; } print(x);"#,
            TransformMode::DelayOnly,
        );
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
        assert_eq!(sink.lines.lock().as_slice(), ["-1"]);
    }

    #[test]
    fn test_uncaught_throw_fails_unit() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for(r#"throw "fatal";"#, TransformMode::DelayOnly);
        let err = unit.step(&ctx(&sink, &params)).unwrap_err();
        assert!(matches!(err, UnitError::Uncaught(msg) if msg == "fatal"));
        assert!(unit.is_finished());
    }

    #[test]
    fn test_delay_inside_nested_function() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for(
            "(k) => { function pause(n) { k.delay(n); return 9; } let r = pause(4); print(r); }",
            TransformMode::DelayOnly,
        );

        // Suspended inside the nested call; the frame survives the yield...
        assert_eq!(
            unit.step(&ctx(&sink, &params)).unwrap(),
            Step::Yield(Suspension::Delay(4))
        );
        // ...and the call returns normally afterwards.
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
        assert_eq!(sink.lines.lock().as_slice(), ["9"]);
    }

    #[test]
    fn test_get_tick_count_query() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for("(k) => { print(k.getTickCount()); }", TransformMode::DelayOnly);
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
        assert_eq!(sink.lines.lock().as_slice(), ["7"]);
    }

    #[test]
    fn test_params_binding_and_query() {
        let sink = CaptureSink::default();
        let params = Value::Int(99);
        let mut unit_source = Transformer::new(TransformMode::DelayOnly)
            .transform("(k, arg) => { print(arg, k.getParams()); }")
            .unwrap()
            .factory
            .instantiate(&params);
        assert_eq!(unit_source.step(&ctx(&sink, &params)).unwrap(), Step::Done);
        assert_eq!(sink.lines.lock().as_slice(), ["99 99"]);
    }

    #[test]
    fn test_arrays_and_methods() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for(
            "let a = [1, 2]; a.push(3); a[0] = a[1] + a[2]; print(a, a.length);",
            TransformMode::DelayOnly,
        );
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
        assert_eq!(sink.lines.lock().as_slice(), ["[5, 2, 3] 3"]);
    }

    #[test]
    fn test_while_with_break_and_continue() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for(
            r#"
            let i = 0;
            let sum = 0;
            while (true) {
                i = i + 1;
                if (i > 10) { break; }
                if (i % 2 == 0) { continue; }
                sum = sum + i;
            }
            print(sum);
            "#,
            TransformMode::DelayOnly,
        );
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
        // 1 + 3 + 5 + 7 + 9
        assert_eq!(sink.lines.lock().as_slice(), ["25"]);
    }

    #[test]
    fn test_recursion_with_call_frames() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for(
            r#"
            function fib(n) {
                if (n < 2) { return n; }
                return fib(n - 1) + fib(n - 2);
            }
            print(fib(10));
            "#,
            TransformMode::DelayOnly,
        );
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
        assert_eq!(sink.lines.lock().as_slice(), ["55"]);
    }

    #[test]
    fn test_unbounded_recursion_is_catchable() {
        let sink = CaptureSink::default();
        let params = Value::Null;
        let mut unit = unit_for(
            r#"
            function spin(n) { return spin(n + 1); }
            try { spin(0); } catch (e) { print(e); }
            "#,
            TransformMode::DelayOnly,
        );
        assert_eq!(unit.step(&ctx(&sink, &params)).unwrap(), Step::Done);
        assert_eq!(sink.lines.lock().as_slice(), ["call stack overflow"]);
    }
}
