pub mod native;
pub mod runtime_error;
pub mod vm;

pub use vm::{Interpreter, VmConfig};
