//! Static name resolution.
//!
//! Every variable gets a `(context, slot)` address: `slot` indexes the
//! activation of the function that declares it, `context` is the number of
//! function boundaries between the use site and that function. Every function
//! gets a numeric id in declaration order.

use crate::lang::value::VarType;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableAddress {
    pub context: u16,
    pub slot: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedVar {
    pub address: VariableAddress,
    pub ty: VarType,
}

/// What a call site needs to know about its callee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    pub id: u16,
    pub params: Vec<VarType>,
    pub return_type: VarType,
    pub depth: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("too many variables in function (limit {})", u16::MAX)]
    TooManyVariables,

    #[error("too many functions (limit {})", u16::MAX)]
    TooManyFunctions,

    #[error("function '{0}' is already declared in this scope")]
    DuplicateFunction(String),
}

#[derive(Debug, Default)]
struct BlockScope {
    vars: HashMap<String, (u16, VarType)>,
    functions: HashMap<String, FunctionRef>,
}

#[derive(Debug, Default)]
struct FunctionScope {
    blocks: Vec<BlockScope>,
    locals: Vec<VarType>,
}

#[derive(Debug, Default)]
pub struct Resolver {
    functions: Vec<FunctionScope>,
    function_count: usize,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nesting depth of the function currently being resolved.
    pub fn depth(&self) -> u16 {
        self.functions.len().saturating_sub(1) as u16
    }

    pub fn allocate_function_id(&mut self) -> Result<u16, ResolveError> {
        let id = u16::try_from(self.function_count).map_err(|_| ResolveError::TooManyFunctions)?;
        self.function_count += 1;
        Ok(id)
    }

    /// Open a fresh slot space; parameters take the first slots.
    pub fn enter_function<'a>(
        &mut self,
        params: impl IntoIterator<Item = (&'a str, VarType)>,
    ) -> Result<(), ResolveError> {
        self.functions.push(FunctionScope::default());
        self.enter_block();
        for (name, ty) in params {
            self.declare_var(name, ty)?;
        }
        Ok(())
    }

    /// Close the current function, returning its slot types.
    pub fn exit_function(&mut self) -> Vec<VarType> {
        self.functions.pop().map(|f| f.locals).unwrap_or_default()
    }

    pub fn enter_block(&mut self) {
        if let Some(function) = self.functions.last_mut() {
            function.blocks.push(BlockScope::default());
        }
    }

    pub fn exit_block(&mut self) {
        if let Some(function) = self.functions.last_mut() {
            function.blocks.pop();
        }
    }

    /// Register a variable in the innermost block, assigning the next slot.
    pub fn declare_var(&mut self, name: &str, ty: VarType) -> Result<u16, ResolveError> {
        let Some(function) = self.functions.last_mut() else {
            return Err(ResolveError::TooManyVariables);
        };
        let slot = u16::try_from(function.locals.len())
            .ok()
            .filter(|s| *s < u16::MAX)
            .ok_or(ResolveError::TooManyVariables)?;
        function.locals.push(ty);
        if let Some(block) = function.blocks.last_mut() {
            block.vars.insert(name.to_string(), (slot, ty));
        }
        Ok(slot)
    }

    /// Register a nested function in the innermost block.
    pub fn declare_function(
        &mut self,
        name: &str,
        params: Vec<VarType>,
        return_type: VarType,
    ) -> Result<FunctionRef, ResolveError> {
        let id = self.allocate_function_id()?;
        let function = FunctionRef {
            id,
            params,
            return_type,
            depth: self.functions.len() as u16,
        };
        let block = self
            .functions
            .last_mut()
            .and_then(|f| f.blocks.last_mut())
            .ok_or(ResolveError::TooManyFunctions)?;
        if block.functions.contains_key(name) {
            return Err(ResolveError::DuplicateFunction(name.to_string()));
        }
        block.functions.insert(name.to_string(), function.clone());
        Ok(function)
    }

    pub fn lookup_var(&self, name: &str) -> Option<ResolvedVar> {
        for (hops, function) in self.functions.iter().rev().enumerate() {
            for block in function.blocks.iter().rev() {
                if let Some(&(slot, ty)) = block.vars.get(name) {
                    return Some(ResolvedVar {
                        address: VariableAddress {
                            context: hops as u16,
                            slot,
                        },
                        ty,
                    });
                }
            }
        }
        None
    }

    pub fn lookup_function(&self, name: &str) -> Option<&FunctionRef> {
        self.functions
            .iter()
            .rev()
            .flat_map(|f| f.blocks.iter().rev())
            .find_map(|b| b.functions.get(name))
    }
}
