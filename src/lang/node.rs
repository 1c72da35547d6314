use super::value::VarType;
use serde::{Deserialize, Serialize};

/// Source position of a node (byte index into the parsed text).
pub type Position = u32;

/// A function declaration: the top-level program or a nested function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AstFunction {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    pub return_type: VarType,
    pub body: Block,
    #[serde(default)]
    pub position: Position,
}

impl AstFunction {
    /// Name given to the implicit top-level function.
    pub const TOP_NAME: &'static str = "<top>";

    pub fn new(
        name: impl Into<String>,
        params: Vec<Param>,
        return_type: VarType,
        body: Block,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            return_type,
            body,
            position: 0,
        }
    }

    /// The implicit top-level function wrapping a whole program.
    pub fn top(body: Block) -> Self {
        Self::new(Self::TOP_NAME, Vec::new(), VarType::Void, body)
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    /// Symbol name when the body is a single `native 'symbol'` node.
    pub fn native_symbol(&self) -> Option<&str> {
        match self.body.nodes.first().map(|n| &n.kind) {
            Some(NodeKind::NativeCall { symbol }) => Some(symbol),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: VarType,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: VarType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Declarations made directly in one block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub vars: Vec<VarDecl>,
    #[serde(default)]
    pub functions: Vec<AstFunction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub ty: VarType,
}

/// A `{ ... }` block with its own scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub position: Position,
}

impl Block {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            scope: Scope::default(),
            nodes,
            position: 0,
        }
    }

    pub fn var(mut self, name: impl Into<String>, ty: VarType) -> Self {
        self.scope.vars.push(VarDecl {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn function(mut self, function: AstFunction) -> Self {
        self.scope.functions.push(function);
        self
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = position;
        self
    }
}

/// A single AST node with its source position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    #[serde(default)]
    pub position: Position,
}

/// Node payloads.
///
/// Expression nodes leave exactly one value on the operand stack; statement
/// nodes leave none. A call can be either, depending on the callee's return
/// type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    // ───────────────────────────── Literals ─────────────────────────────
    IntLiteral(i64),
    DoubleLiteral(f64),
    StringLiteral(String),

    // ───────────────────────────── Variables ────────────────────────────
    /// Read a variable.
    Load { var: String },

    /// Assign (`=`, `+=`, `-=`) to a variable.
    Store {
        var: String,
        op: StoreOp,
        value: Box<Node>,
    },

    // ──────────────────────────── Operators ─────────────────────────────
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },

    Unary { op: UnaryOp, operand: Box<Node> },

    // ──────────────────────────── Control flow ──────────────────────────
    If {
        cond: Box<Node>,
        then_block: Block,
        else_block: Option<Block>,
    },

    While { cond: Box<Node>, body: Block },

    /// `for (var in range) body`, where `range` must be a `..` binary node.
    For {
        var: String,
        range: Box<Node>,
        body: Block,
    },

    Block(Block),

    // ───────────────────────────── Functions ────────────────────────────
    Call { name: String, args: Vec<Node> },

    Return(Option<Box<Node>>),

    /// Body of a function implemented by the host.
    NativeCall { symbol: String },

    // ─────────────────────────────── I/O ────────────────────────────────
    Print(Vec<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    Assign,
    AddAssign,
    SubAssign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Or,
    And,
    BitOr,
    BitAnd,
    BitXor,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Range,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Range => "..",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
        }
    }
}

// Constructors used by hosts that build trees directly (and by tests).
impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self { kind, position: 0 }
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn int(n: i64) -> Self {
        Self::new(NodeKind::IntLiteral(n))
    }

    pub fn double(n: f64) -> Self {
        Self::new(NodeKind::DoubleLiteral(n))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::new(NodeKind::StringLiteral(s.into()))
    }

    pub fn load(var: impl Into<String>) -> Self {
        Self::new(NodeKind::Load { var: var.into() })
    }

    pub fn assign(var: impl Into<String>, value: Node) -> Self {
        Self::store(var, StoreOp::Assign, value)
    }

    pub fn store(var: impl Into<String>, op: StoreOp, value: Node) -> Self {
        Self::new(NodeKind::Store {
            var: var.into(),
            op,
            value: Box::new(value),
        })
    }

    pub fn binary(op: BinaryOp, left: Node, right: Node) -> Self {
        Self::new(NodeKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn unary(op: UnaryOp, operand: Node) -> Self {
        Self::new(NodeKind::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    pub fn if_then(cond: Node, then_block: Block, else_block: Option<Block>) -> Self {
        Self::new(NodeKind::If {
            cond: Box::new(cond),
            then_block,
            else_block,
        })
    }

    pub fn while_loop(cond: Node, body: Block) -> Self {
        Self::new(NodeKind::While {
            cond: Box::new(cond),
            body,
        })
    }

    pub fn for_range(var: impl Into<String>, from: Node, to: Node, body: Block) -> Self {
        Self::new(NodeKind::For {
            var: var.into(),
            range: Box::new(Self::binary(BinaryOp::Range, from, to)),
            body,
        })
    }

    pub fn block(block: Block) -> Self {
        Self::new(NodeKind::Block(block))
    }

    pub fn call(name: impl Into<String>, args: Vec<Node>) -> Self {
        Self::new(NodeKind::Call {
            name: name.into(),
            args,
        })
    }

    pub fn ret(value: Option<Node>) -> Self {
        Self::new(NodeKind::Return(value.map(Box::new)))
    }

    pub fn native(symbol: impl Into<String>) -> Self {
        Self::new(NodeKind::NativeCall {
            symbol: symbol.into(),
        })
    }

    pub fn print(args: Vec<Node>) -> Self {
        Self::new(NodeKind::Print(args))
    }
}
