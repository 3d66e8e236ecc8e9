//! Flat op sequences produced by the transformer.
//!
//! Task bodies lower to a compact instruction set executed by the
//! restartable-unit interpreter. Suspension points are explicit `Yield` ops;
//! everything between two yields runs within a single `step()`.

use crate::value::Value;
pub use tickos_parser::ast::{BinaryOp, UnaryOp};

/// What kind of suspension point a `Yield` op is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldKind {
    /// Receiver-qualified `delay(n)`: pops the tick count, yields a delay
    /// marker. The resumed expression evaluates to null.
    Delay,

    /// Receiver-qualified `delayMs(ms)`: pops the millisecond count and
    /// converts it to ticks at the kernel's tick rate.
    DelayMs,

    /// Receiver-qualified `yield()`: a plain yield with a null payload.
    Now,

    /// Statement-level suspension point: pops the statement's value and
    /// yields it as the payload. Nothing is pushed on resume.
    Stmt,
}

/// Kernel state queries available to bodies through the receiver binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelQuery {
    /// `getTickCount()`
    TickCount,
    /// `getParams()`
    Params,
}

/// Free builtin functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinFn {
    /// `print(args…)`: space-joined line to the kernel's print sink.
    Print,
    /// Bare `delay(n)`: inert, returns null (the receiver-qualified form is
    /// the suspension point).
    Delay,
    /// Bare `delayMs(ms)`: inert, returns null.
    DelayMs,
}

/// Value methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodId {
    /// `array.push(v…)`: appends, evaluates to the new length.
    Push,
}

/// A single instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Push a constant
    Const(Value),

    /// Load a local slot onto the stack
    LoadLocal(u16),
    /// Pop the stack into a local slot
    StoreLocal(u16),

    /// Discard the top of stack
    Pop,
    /// Duplicate the top of stack
    Dup,

    /// Apply a unary operator to the top of stack
    Unary(UnaryOp),
    /// Pop two operands, push the result
    Binary(BinaryOp),

    /// Pop N elements (last on top), push an array
    MakeArray(u16),
    /// Pop index and object, push the element (null when out of range)
    IndexGet,
    /// Pop value, index, and object; store; push the value back
    IndexSet,
    /// Pop a string or array, push its length
    GetLength,

    /// Pop argc arguments and a receiver value, invoke a value method
    CallMethod { method: MethodId, argc: u8 },
    /// Pop argc arguments, invoke a free builtin, push its result
    CallBuiltin { builtin: BuiltinFn, argc: u8 },
    /// Push the result of a kernel state query
    KernelQuery(KernelQuery),
    /// Pop argc arguments, push a frame for the given function
    Call { func: u16, argc: u8 },

    /// Unconditional jump to an op index
    Jump(usize),
    /// Pop the condition; jump when falsy
    JumpIfFalse(usize),
    /// Pop the condition; jump when truthy
    JumpIfTrue(usize),

    /// Suspension point
    Yield(YieldKind),

    /// Install an exception handler with the given catch target
    PushHandler { catch_pc: usize },
    /// Remove the innermost exception handler
    PopHandler,
    /// Pop a value and raise it
    Throw,

    /// Pop the return value and the current frame; completing the outermost
    /// frame completes the unit
    Return,
}

/// One compiled function: the body itself (index 0) or a nested declaration.
#[derive(Debug, Clone)]
pub struct CompiledFn {
    /// Function name ("<body>" for the entry function)
    pub name: String,

    /// Number of leading local slots bound from call arguments
    pub param_count: u8,

    /// Total local slots, parameters included
    pub local_count: u16,

    /// Instruction sequence
    pub ops: Vec<Op>,
}

/// A compiled task body: the entry function plus nested declarations.
#[derive(Debug, Clone)]
pub struct UnitProgram {
    /// Compiled functions; index 0 is the body
    pub funcs: Vec<CompiledFn>,

    /// Local slot in the body bound to the task's params value, when the
    /// body declared a second parameter
    pub params_slot: Option<u16>,
}

impl UnitProgram {
    /// The entry function.
    pub fn entry(&self) -> &CompiledFn {
        &self.funcs[0]
    }

    /// Whether the program contains any suspension point.
    pub fn has_suspension_points(&self) -> bool {
        self.funcs
            .iter()
            .any(|f| f.ops.iter().any(|op| matches!(op, Op::Yield(_))))
    }
}
