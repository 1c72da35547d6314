pub mod code;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod resolve;
pub mod verify;

pub use ir::{CompiledFunction, CompiledProgram};
pub use op::Op;
