use crate::bytecode::{op::DecodeError, verify::VerifyError};
use crate::lang::value::VarType;

/// Why execution stopped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeErrorKind {
    #[error("stack underflow: {0} needs more operands")]
    StackUnderflow(&'static str),

    #[error("malformed {0} instruction")]
    MalformedInstruction(&'static str),

    #[error("division by zero")]
    DivisionByZero,

    #[error("modulo by zero")]
    ModuloByZero,

    #[error("context {context} is past the root activation")]
    ContextOutOfRange { context: u16 },

    #[error("slot {slot} out of range ({len} slots)")]
    SlotOutOfRange { slot: u16, len: usize },

    #[error("type error: {op} expected {expected}, got {found}")]
    TypeMismatch {
        op: &'static str,
        expected: VarType,
        found: VarType,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("branch target {0} is outside the function")]
    BranchOutOfRange(i64),

    #[error("unknown function {0}")]
    UnknownFunction(u16),

    #[error("unknown string constant {0}")]
    UnknownConstant(u16),

    #[error("unknown native {0}")]
    UnknownNative(u16),

    #[error("native symbol '{0}' is not available")]
    UnresolvedNative(String),

    #[error("native '{name}' failed: {message}")]
    NativeFailed { name: String, message: String },

    #[error("call depth limit exceeded ({0}) - possible infinite recursion")]
    CallDepthExceeded(usize),

    #[error("stack size limit exceeded ({0})")]
    StackLimitExceeded(usize),

    #[error("execution step limit exceeded ({0})")]
    StepLimitExceeded(usize),

    #[error("execution fell off the end of the function")]
    FellOffEnd,

    #[error("RETURN without a value from function returning {0}")]
    MissingReturnValue(VarType),

    #[error("no top-level variable named '{0}'")]
    UnknownGlobal(String),

    #[error("top-level variable '{name}' has type {expected}, binding has {found}")]
    GlobalTypeMismatch {
        name: String,
        expected: VarType,
        found: VarType,
    },

    #[error("invalid program: {0}")]
    InvalidProgram(#[from] VerifyError),

    #[error("output error: {0}")]
    Output(String),
}

/// A fatal runtime fault at a bytecode position.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    /// Function id of the failing instruction.
    pub function: u16,
    /// Byte offset of the failing instruction within its function.
    pub offset: usize,
    /// Function names, outermost first.
    pub call_stack: Vec<String>,
}

impl RuntimeError {
    pub fn new(kind: impl Into<RuntimeErrorKind>, function: u16, offset: usize) -> Self {
        Self {
            kind: kind.into(),
            function,
            offset,
            call_stack: Vec::new(),
        }
    }

    pub fn with_call_stack(mut self, call_stack: Vec<String>) -> Self {
        self.call_stack = call_stack;
        self
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "runtime error in function {} at offset {}: {}",
            self.function, self.offset, self.kind
        )?;

        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, frame) in self.call_stack.iter().rev().enumerate() {
                write!(f, "\n    {}: {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
