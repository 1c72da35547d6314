//! # mathvm
//!
//! Bytecode compiler and stack virtual machine for a small statically typed
//! imperative language (`int`, `double`, `string`, nested functions with
//! lexical scoping, host-provided native functions).
//!
//! ```text
//! AstFunction ──compile──► CompiledProgram ──execute──► output + final vars
//! ```
//!
//! The AST comes from an external parser. [`compile`] turns it into a
//! [`CompiledProgram`], which can be serialized with
//! [`CompiledProgram::to_bytes`] and run with [`execute`] or an
//! [`Interpreter`] configured by hand.

pub mod bytecode;
pub mod lang;
pub mod runtime;

pub use bytecode::compile_error::CompileError;
pub use bytecode::ir::CompiledProgram;
pub use lang::node::AstFunction;
pub use lang::value::{Value, Var, VarType};
pub use runtime::native::NativeRegistry;
pub use runtime::runtime_error::RuntimeError;
pub use runtime::vm::{Interpreter, VmConfig};

use bytecode::compile::Compiler;

/// Compile a program against the platform native symbols.
pub fn compile(top: &AstFunction) -> Result<CompiledProgram, CompileError> {
    compile_with_natives(top, &NativeRegistry::platform())
}

pub fn compile_with_natives(
    top: &AstFunction,
    natives: &NativeRegistry,
) -> Result<CompiledProgram, CompileError> {
    Compiler::new(natives).compile_program(top)
}

/// Run `program` printing to stdout. Returns the final value of every
/// top-level variable.
pub fn execute(program: &CompiledProgram, bindings: &[Var]) -> Result<Vec<Var>, RuntimeError> {
    Interpreter::stdout().run(program, bindings)
}
