//! # mathvm abstract syntax tree and values
//!
//! The AST is produced by an external parser and consumed by the bytecode
//! compiler. Every block carries the `Scope` of variables and nested
//! functions declared directly in it.
//!
//! ## Conventions
//!
//! - The program is a single top-level function returning `void`.
//! - Positions are byte offsets into the parsed source.
//! - Variables are referenced by name; the compiler resolves names against
//!   the enclosing scopes.

pub mod node;
pub mod value;
