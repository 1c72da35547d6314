use crate::bytecode::verify::{VerifyError, verify_program};
use crate::lang::value::VarType;
use serde::{Deserialize, Serialize};

/// One function's bytecode plus the metadata the VM needs to call it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub id: u16,
    pub name: String,
    pub params: Vec<VarType>,
    pub return_type: VarType,
    /// Lexical nesting depth; the top-level function is 0.
    pub depth: u16,
    /// Type of every activation slot. Parameters come first.
    pub locals: Vec<VarType>,
    pub code: Vec<u8>,
}

impl CompiledFunction {
    pub fn local_slot_count(&self) -> usize {
        self.locals.len()
    }

    pub fn signature(&self) -> String {
        let params: Vec<&str> = self.params.iter().map(|t| t.name()).collect();
        format!("({}) -> {}", params.join(", "), self.return_type)
    }
}

/// A host function referenced by `CALLNATIVE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeDescriptor {
    pub name: String,
    pub params: Vec<VarType>,
    pub return_type: VarType,
}

/// Slot of a variable declared in the top-level block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopLevelVar {
    pub name: String,
    pub ty: VarType,
    pub slot: u16,
}

/// A compiled program.
///
/// Function ids are indices into `functions`; `functions[0]` is always the
/// top-level function. Constant ids index `constants`, native ids index
/// `natives`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub functions: Vec<CompiledFunction>,
    pub constants: Vec<String>,
    pub natives: Vec<NativeDescriptor>,
    pub globals: Vec<TopLevelVar>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot encode program: {0}")]
    Encode(postcard::Error),

    #[error("cannot decode program: {0}")]
    Decode(postcard::Error),

    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl CompiledProgram {
    pub fn main(&self) -> Option<&CompiledFunction> {
        self.functions.first()
    }

    pub fn function(&self, id: u16) -> Option<&CompiledFunction> {
        self.functions.get(id as usize)
    }

    pub fn function_by_name(&self, name: &str) -> Option<&CompiledFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn constant(&self, id: u16) -> Option<&str> {
        self.constants.get(id as usize).map(String::as_str)
    }

    pub fn native(&self, id: u16) -> Option<&NativeDescriptor> {
        self.natives.get(id as usize)
    }

    pub fn global(&self, name: &str) -> Option<&TopLevelVar> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LoadError> {
        postcard::to_allocvec(self).map_err(LoadError::Encode)
    }

    /// Decode a persisted program and verify it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        let program: CompiledProgram = postcard::from_bytes(bytes).map_err(LoadError::Decode)?;
        verify_program(&program)?;
        Ok(program)
    }
}
