use crate::bytecode::{code::LabelError, resolve::ResolveError};
use crate::lang::node::{NodeKind, Position};
use crate::lang::value::VarType;

/// What went wrong during translation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileErrorKind {
    #[error("undeclared variable '{0}'")]
    UndeclaredVariable(String),

    #[error("undeclared function '{0}'")]
    UndeclaredFunction(String),

    #[error("function '{name}' expects {expected} argument(s), got {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("operator '{op}' cannot be applied to {left} and {right}")]
    IncompatibleOperands {
        op: &'static str,
        left: VarType,
        right: VarType,
    },

    #[error("operator '{op}' cannot be applied to {operand}")]
    InvalidOperand { op: &'static str, operand: VarType },

    #[error("cannot assign {found} to variable '{var}' of type {expected}")]
    AssignMismatch {
        var: String,
        expected: VarType,
        found: VarType,
    },

    #[error("argument {index} of '{name}' expects {expected}, got {found}")]
    ArgumentTypeMismatch {
        name: String,
        index: usize,
        expected: VarType,
        found: VarType,
    },

    #[error("cannot return {found} from function returning {expected}")]
    ReturnTypeMismatch { expected: VarType, found: VarType },

    #[error("missing return value in function returning {0}")]
    MissingReturnValue(VarType),

    #[error("void function cannot return a value")]
    UnexpectedReturnValue,

    #[error("function '{0}' may finish without returning a value")]
    MissingReturn(String),

    #[error("top-level function must have signature () -> void, got {0}")]
    InvalidTopLevel(String),

    #[error("native symbol '{0}' not found")]
    MissingNativeSymbol(String),

    #[error("native symbol '{symbol}' has signature {actual}, declared {declared}")]
    NativeSignatureMismatch {
        symbol: String,
        declared: String,
        actual: String,
    },

    #[error("{0} can only appear in its own position")]
    Misplaced(&'static str),

    #[error("{0} has type {1} where a value is required")]
    NotAValue(&'static str, VarType),

    #[error("condition must be numeric, got {0}")]
    InvalidCondition(VarType),

    #[error("for-loop {what} must be int, got {found}")]
    InvalidForRange { what: &'static str, found: VarType },

    #[error("for-loop expects a range 'a..b', got {0}")]
    ExpectedRange(&'static str),

    #[error("variable '{name}' cannot have type {ty}")]
    InvalidVariableType { name: String, ty: VarType },

    #[error("function '{0}' is already declared in this scope")]
    DuplicateFunction(String),

    #[error("too many {what} (limit {})", u16::MAX)]
    TooMany { what: &'static str },

    #[error("function body too large: {0}")]
    BranchOutOfRange(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ResolveError> for CompileErrorKind {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::TooManyVariables => CompileErrorKind::TooMany { what: "variables" },
            ResolveError::TooManyFunctions => CompileErrorKind::TooMany { what: "functions" },
            ResolveError::DuplicateFunction(name) => CompileErrorKind::DuplicateFunction(name),
        }
    }
}

impl From<LabelError> for CompileErrorKind {
    fn from(err: LabelError) -> Self {
        match err {
            LabelError::OutOfRange { .. } => CompileErrorKind::BranchOutOfRange(err.to_string()),
            other => CompileErrorKind::Internal(other.to_string()),
        }
    }
}

/// A compile error at an AST position.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub position: Position,
}

impl CompileError {
    pub fn new(kind: impl Into<CompileErrorKind>, position: Position) -> Self {
        Self {
            kind: kind.into(),
            position,
        }
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }

    pub fn hint(&self) -> Option<&'static str> {
        match &self.kind {
            CompileErrorKind::UndeclaredVariable(_) => {
                Some("variables must be declared in an enclosing block before use")
            }
            CompileErrorKind::UndeclaredFunction(_) => {
                Some("functions are visible in the block that declares them and its children")
            }
            CompileErrorKind::IncompatibleOperands { .. } => {
                Some("only int and double mix; %, |, & and ^ need two ints")
            }
            CompileErrorKind::MissingReturn(_) => {
                Some("end every path of a non-void function with 'return'")
            }
            CompileErrorKind::InvalidForRange { .. } | CompileErrorKind::ExpectedRange(_) => {
                Some("write the loop as 'for (i in a..b)' with int bounds")
            }
            CompileErrorKind::Internal(_) => Some("this is a compiler bug"),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compile error at {}: {}", self.position, self.kind)?;
        if let Some(h) = self.hint() {
            write!(f, "\n  hint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Human-readable name for a node kind.
pub fn node_kind_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::IntLiteral(_) => "int literal",
        NodeKind::DoubleLiteral(_) => "double literal",
        NodeKind::StringLiteral(_) => "string literal",
        NodeKind::Load { .. } => "variable",
        NodeKind::Store { .. } => "assignment",
        NodeKind::Binary { .. } => "binary expression",
        NodeKind::Unary { .. } => "unary expression",
        NodeKind::If { .. } => "if",
        NodeKind::While { .. } => "while",
        NodeKind::For { .. } => "for",
        NodeKind::Block(_) => "block",
        NodeKind::Call { .. } => "call",
        NodeKind::Return(_) => "return",
        NodeKind::NativeCall { .. } => "native call",
        NodeKind::Print(_) => "print",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_position_and_hint() {
        let err = CompileError::new(CompileErrorKind::UndeclaredFunction("foo".into()), 17);

        let msg = err.to_string();
        assert!(msg.contains("at 17"));
        assert!(msg.contains("undeclared function 'foo'"));
        assert!(msg.contains("hint"));
    }

    #[test]
    fn test_no_hint_for_plain_errors() {
        let err = CompileError::new(CompileErrorKind::UnexpectedReturnValue, 3);
        assert_eq!(
            err.to_string(),
            "compile error at 3: void function cannot return a value"
        );
    }

    #[test]
    fn test_operand_error_names_types() {
        let err = CompileError::new(
            CompileErrorKind::IncompatibleOperands {
                op: "+",
                left: VarType::String,
                right: VarType::Int,
            },
            0,
        );
        assert!(err.message().contains("string and int"));
    }

    #[test]
    fn test_resolve_errors_convert() {
        let err = CompileError::new(ResolveError::TooManyVariables, 5);
        assert_eq!(err.kind, CompileErrorKind::TooMany { what: "variables" });
        assert!(err.message().contains("65535"));
    }

    #[test]
    fn test_label_errors_convert() {
        let kind = CompileErrorKind::from(LabelError::Unbound(2));
        assert!(matches!(kind, CompileErrorKind::Internal(_)));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = CompileError::new(CompileErrorKind::Internal("x".into()), 0);
        let _: &dyn std::error::Error = &err;
    }

    #[test]
    fn test_node_kind_names() {
        assert_eq!(node_kind_name(&NodeKind::IntLiteral(1)), "int literal");
        assert_eq!(
            node_kind_name(&NodeKind::NativeCall {
                symbol: "sqrt".into()
            }),
            "native call"
        );
    }

    #[test]
    fn test_condition_error_mentions_numeric() {
        let err = CompileError::new(CompileErrorKind::InvalidCondition(VarType::String), 4);
        assert_eq!(err.message(), "condition must be numeric, got string");
    }
}
