use std::collections::HashMap;

use crate::{
    bytecode::{
        code::{Bytecode, Label},
        compile_error::{CompileError, CompileErrorKind, node_kind_name},
        ir::{CompiledFunction, CompiledProgram, NativeDescriptor, TopLevelVar},
        op::{Access, Op, Operand},
        resolve::{ResolvedVar, Resolver, VariableAddress},
    },
    lang::{
        node::{AstFunction, BinaryOp, Block, Node, NodeKind, Position, StoreOp, UnaryOp},
        value::VarType,
    },
    runtime::native::{NativeRegistry, signature},
};

type CompileResult<T> = Result<T, CompileError>;

/// Per-function emission state.
#[derive(Debug)]
struct FunctionState {
    return_type: VarType,
    code: Bytecode,
}

impl FunctionState {
    fn new(return_type: VarType) -> Self {
        Self {
            return_type,
            code: Bytecode::new(),
        }
    }
}

pub struct Compiler<'n> {
    natives: &'n NativeRegistry,
    resolver: Resolver,

    /// Indexed by function id; filled as each function finishes.
    functions: Vec<Option<CompiledFunction>>,

    /// String constant pool and its reverse index.
    constants: Vec<String>,
    constant_ids: HashMap<String, u16>,

    /// Native descriptors, deduplicated by symbol.
    native_descriptors: Vec<NativeDescriptor>,
    native_ids: HashMap<String, u16>,

    globals: Vec<TopLevelVar>,

    /// Function currently being emitted. Enclosing functions are parked on
    /// the Rust call stack while a nested one compiles.
    current: FunctionState,
}

impl<'n> Compiler<'n> {
    pub fn new(natives: &'n NativeRegistry) -> Self {
        Self {
            natives,
            resolver: Resolver::new(),
            functions: Vec::new(),
            constants: Vec::new(),
            constant_ids: HashMap::new(),
            native_descriptors: Vec::new(),
            native_ids: HashMap::new(),
            globals: Vec::new(),
            current: FunctionState::new(VarType::Void),
        }
    }

    /// Compile a whole program rooted at its top-level function.
    pub fn compile_program(mut self, top: &AstFunction) -> CompileResult<CompiledProgram> {
        if top.return_type != VarType::Void || !top.params.is_empty() {
            let params: Vec<VarType> = top.params.iter().map(|p| p.ty).collect();
            return Err(CompileError::new(
                CompileErrorKind::InvalidTopLevel(signature(&params, top.return_type)),
                top.position,
            ));
        }

        let id = self
            .resolver
            .allocate_function_id()
            .map_err(|e| CompileError::new(e, top.position))?;
        self.compile_function(top, id)?;

        let functions = self
            .functions
            .into_iter()
            .enumerate()
            .map(|(id, f)| {
                f.ok_or_else(|| {
                    CompileError::new(
                        CompileErrorKind::Internal(format!("function {} was never compiled", id)),
                        top.position,
                    )
                })
            })
            .collect::<CompileResult<Vec<_>>>()?;

        Ok(CompiledProgram {
            functions,
            constants: self.constants,
            natives: self.native_descriptors,
            globals: self.globals,
        })
    }

    // =========================================================================
    // Functions and blocks
    // =========================================================================

    fn compile_function(&mut self, function: &AstFunction, id: u16) -> CompileResult<()> {
        let at = function.position;

        for param in &function.params {
            if !param.ty.is_storable() {
                return Err(CompileError::new(
                    CompileErrorKind::InvalidVariableType {
                        name: param.name.clone(),
                        ty: param.ty,
                    },
                    at,
                ));
            }
        }
        if !(function.return_type.is_storable() || function.return_type == VarType::Void) {
            return Err(CompileError::new(
                CompileErrorKind::InvalidVariableType {
                    name: function.name.clone(),
                    ty: function.return_type,
                },
                at,
            ));
        }

        self.resolver
            .enter_function(function.params.iter().map(|p| (p.name.as_str(), p.ty)))
            .map_err(|e| CompileError::new(e, at))?;
        let depth = self.resolver.depth();

        let saved = std::mem::replace(&mut self.current, FunctionState::new(function.return_type));

        // Arguments were pushed left to right.
        for (slot, param) in function.params.iter().enumerate().rev() {
            self.emit_var(
                Access::Store,
                ResolvedVar {
                    address: VariableAddress {
                        context: 0,
                        slot: slot as u16,
                    },
                    ty: param.ty,
                },
                at,
            )?;
        }

        if let Some(symbol) = function.native_symbol() {
            self.compile_native_body(function, symbol)?;
        } else {
            self.compile_block(&function.body, id == 0)?;

            if function.return_type == VarType::Void {
                self.code().add_op(if id == 0 { Op::Stop } else { Op::Return });
            } else if !block_returns(&function.body) {
                return Err(CompileError::new(
                    CompileErrorKind::MissingReturn(function.name.clone()),
                    at,
                ));
            }
        }

        let state = std::mem::replace(&mut self.current, saved);
        let code = state
            .code
            .finish()
            .map_err(|e| CompileError::new(e, at))?;
        let locals = self.resolver.exit_function();

        tracing::debug!(
            function = %function.name,
            id,
            depth,
            locals = locals.len(),
            code_size = code.len(),
            "compiled function"
        );

        let idx = id as usize;
        if self.functions.len() <= idx {
            self.functions.resize(idx + 1, None);
        }
        self.functions[idx] = Some(CompiledFunction {
            id,
            name: function.name.clone(),
            params: function.params.iter().map(|p| p.ty).collect(),
            return_type: function.return_type,
            depth,
            locals,
            code,
        });
        Ok(())
    }

    /// Body of `native 'symbol'`: reload the parameters, call the host, return.
    fn compile_native_body(&mut self, function: &AstFunction, symbol: &str) -> CompileResult<()> {
        let at = function
            .body
            .nodes
            .first()
            .map(|n| n.position)
            .unwrap_or(function.position);

        if function.body.nodes.len() != 1 {
            return Err(CompileError::new(
                CompileErrorKind::Misplaced("native call"),
                at,
            ));
        }

        let natives = self.natives;
        let host = natives.lookup(symbol).ok_or_else(|| {
            CompileError::new(CompileErrorKind::MissingNativeSymbol(symbol.to_string()), at)
        })?;

        let params: Vec<VarType> = function.params.iter().map(|p| p.ty).collect();
        if host.params != params || host.return_type != function.return_type {
            return Err(CompileError::new(
                CompileErrorKind::NativeSignatureMismatch {
                    symbol: symbol.to_string(),
                    declared: signature(&params, function.return_type),
                    actual: host.signature(),
                },
                at,
            ));
        }

        let id = self.native_id(symbol, params.clone(), function.return_type, at)?;

        for (slot, ty) in params.iter().enumerate() {
            self.emit_var(
                Access::Load,
                ResolvedVar {
                    address: VariableAddress {
                        context: 0,
                        slot: slot as u16,
                    },
                    ty: *ty,
                },
                at,
            )?;
        }
        self.code().add(Op::CallNative, Operand::Id(id));
        self.code().add_op(Op::Return);
        Ok(())
    }

    fn compile_block(&mut self, block: &Block, top_level: bool) -> CompileResult<()> {
        self.resolver.enter_block();

        for var in &block.scope.vars {
            if !var.ty.is_storable() {
                return Err(CompileError::new(
                    CompileErrorKind::InvalidVariableType {
                        name: var.name.clone(),
                        ty: var.ty,
                    },
                    block.position,
                ));
            }
            let slot = self
                .resolver
                .declare_var(&var.name, var.ty)
                .map_err(|e| CompileError::new(e, block.position))?;
            if top_level {
                self.globals.push(TopLevelVar {
                    name: var.name.clone(),
                    ty: var.ty,
                    slot,
                });
            }
        }

        // Declare every function first so siblings can call each other.
        let mut ids = Vec::with_capacity(block.scope.functions.len());
        for function in &block.scope.functions {
            let declared = self
                .resolver
                .declare_function(
                    &function.name,
                    function.params.iter().map(|p| p.ty).collect(),
                    function.return_type,
                )
                .map_err(|e| CompileError::new(e, function.position))?;
            ids.push(declared.id);
        }
        for (function, id) in block.scope.functions.iter().zip(ids) {
            self.compile_function(function, id)?;
        }

        for node in &block.nodes {
            self.compile_statement(node)?;
        }

        self.resolver.exit_block();
        Ok(())
    }

    fn compile_statement(&mut self, node: &Node) -> CompileResult<()> {
        if self.compile_node(node)? != VarType::Void {
            self.code().add_op(Op::Pop);
        }
        Ok(())
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Compile an expression that must produce a value.
    fn compile_value(&mut self, node: &Node) -> CompileResult<VarType> {
        let ty = self.compile_node(node)?;
        if ty == VarType::Void {
            return Err(CompileError::new(
                CompileErrorKind::NotAValue(node_kind_name(&node.kind), ty),
                node.position,
            ));
        }
        Ok(ty)
    }

    /// Emit code for `node`; returns the type it leaves on the stack, `Void`
    /// for statements.
    fn compile_node(&mut self, node: &Node) -> CompileResult<VarType> {
        let at = node.position;
        match &node.kind {
            // ───────────────────────────── Literals ─────────────────────────────
            NodeKind::IntLiteral(n) => {
                match *n {
                    0 => self.code().add_op(Op::ILoad0),
                    1 => self.code().add_op(Op::ILoad1),
                    -1 => self.code().add_op(Op::ILoadM1),
                    n => self.code().add(Op::ILoad, Operand::Int(n)),
                }
                Ok(VarType::Int)
            }
            NodeKind::DoubleLiteral(n) => {
                let bits = n.to_bits();
                if bits == 0.0f64.to_bits() {
                    self.code().add_op(Op::DLoad0);
                } else if bits == 1.0f64.to_bits() {
                    self.code().add_op(Op::DLoad1);
                } else if bits == (-1.0f64).to_bits() {
                    self.code().add_op(Op::DLoadM1);
                } else {
                    self.code().add(Op::DLoad, Operand::Double(*n));
                }
                Ok(VarType::Double)
            }
            NodeKind::StringLiteral(s) => {
                if s.is_empty() {
                    self.code().add_op(Op::SLoad0);
                } else {
                    let id = self.intern(s, at)?;
                    self.code().add(Op::SLoad, Operand::Id(id));
                }
                Ok(VarType::String)
            }

            // ───────────────────────────── Variables ────────────────────────────
            NodeKind::Load { var } => {
                let resolved = self.lookup_var(var, at)?;
                self.emit_var(Access::Load, resolved, at)?;
                Ok(resolved.ty)
            }
            NodeKind::Store { var, op, value } => {
                self.compile_store(var, *op, value, at)?;
                Ok(VarType::Void)
            }

            // ──────────────────────────── Operators ─────────────────────────────
            NodeKind::Binary { op, left, right } => self.compile_binary(*op, left, right, at),
            NodeKind::Unary { op, operand } => self.compile_unary(*op, operand, at),

            // ──────────────────────────── Control flow ──────────────────────────
            NodeKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let l_else = self.code().new_label();
                self.compile_condition(cond, l_else)?;
                self.compile_block(then_block, false)?;
                match else_block {
                    Some(else_block) => {
                        let l_end = self.code().new_label();
                        if !block_returns(then_block) {
                            self.code().add_branch(Op::Ja, l_end);
                        }
                        self.code().bind(l_else);
                        self.compile_block(else_block, false)?;
                        self.code().bind(l_end);
                    }
                    None => self.code().bind(l_else),
                }
                Ok(VarType::Void)
            }
            NodeKind::While { cond, body } => {
                let l_start = self.code().new_label();
                let l_end = self.code().new_label();
                self.code().bind(l_start);
                self.compile_condition(cond, l_end)?;
                self.compile_block(body, false)?;
                self.code().add_branch(Op::Ja, l_start);
                self.code().bind(l_end);
                Ok(VarType::Void)
            }
            NodeKind::For { var, range, body } => {
                self.compile_for(var, range, body, at)?;
                Ok(VarType::Void)
            }
            NodeKind::Block(block) => {
                self.compile_block(block, false)?;
                Ok(VarType::Void)
            }

            // ───────────────────────────── Functions ────────────────────────────
            NodeKind::Call { name, args } => self.compile_call(name, args, at),
            NodeKind::Return(value) => {
                self.compile_return(value.as_deref(), at)?;
                Ok(VarType::Void)
            }
            NodeKind::NativeCall { .. } => Err(CompileError::new(
                CompileErrorKind::Misplaced("native call"),
                at,
            )),

            // ─────────────────────────────── I/O ────────────────────────────────
            NodeKind::Print(args) => {
                for arg in args {
                    let op = match self.compile_value(arg)? {
                        VarType::Int => Op::IPrint,
                        VarType::Double => Op::DPrint,
                        VarType::String => Op::SPrint,
                        other => {
                            return Err(CompileError::new(
                                CompileErrorKind::NotAValue(node_kind_name(&arg.kind), other),
                                arg.position,
                            ));
                        }
                    };
                    self.code().add_op(op);
                }
                Ok(VarType::Void)
            }
        }
    }

    fn compile_store(
        &mut self,
        var: &str,
        op: StoreOp,
        value: &Node,
        at: Position,
    ) -> CompileResult<()> {
        let target = self.lookup_var(var, at)?;

        let arith = match op {
            StoreOp::Assign => None,
            StoreOp::AddAssign => Some(("+=", BinaryOp::Add)),
            StoreOp::SubAssign => Some(("-=", BinaryOp::Sub)),
        };
        if let Some((symbol, _)) = arith {
            if !target.ty.is_numeric() {
                return Err(CompileError::new(
                    CompileErrorKind::InvalidOperand {
                        op: symbol,
                        operand: target.ty,
                    },
                    at,
                ));
            }
            self.emit_var(Access::Load, target, at)?;
        }

        let found = self.compile_value(value)?;
        if !self.coerce(found, target.ty) {
            return Err(CompileError::new(
                CompileErrorKind::AssignMismatch {
                    var: var.to_string(),
                    expected: target.ty,
                    found,
                },
                value.position,
            ));
        }

        if let Some((_, op)) = arith {
            let arith_op = arithmetic_op(op, target.ty).ok_or_else(|| {
                CompileError::new(CompileErrorKind::Internal("bad compound op".into()), at)
            })?;
            self.code().add_op(arith_op);
        }

        self.emit_var(Access::Store, target, at)
    }

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        left: &Node,
        right: &Node,
        at: Position,
    ) -> CompileResult<VarType> {
        match op {
            BinaryOp::Range => {
                return Err(CompileError::new(CompileErrorKind::Misplaced("range"), at));
            }
            BinaryOp::And | BinaryOp::Or => return self.compile_logical(op, left, right, at),
            _ => {}
        }

        let lt = self.compile_value(left)?;
        let rt = self.compile_value(right)?;
        let incompatible = || {
            CompileError::new(
                CompileErrorKind::IncompatibleOperands {
                    op: op.symbol(),
                    left: lt,
                    right: rt,
                },
                at,
            )
        };

        if !(lt.is_numeric() && rt.is_numeric()) {
            return Err(incompatible());
        }

        match op {
            BinaryOp::Mod | BinaryOp::BitOr | BinaryOp::BitAnd | BinaryOp::BitXor => {
                if lt != VarType::Int || rt != VarType::Int {
                    return Err(incompatible());
                }
                self.code().add_op(match op {
                    BinaryOp::Mod => Op::IMod,
                    BinaryOp::BitOr => Op::IAOr,
                    BinaryOp::BitAnd => Op::IAAnd,
                    _ => Op::IAXor,
                });
                Ok(VarType::Int)
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                let ty = self.promote(lt, rt);
                let arith_op = arithmetic_op(op, ty).ok_or_else(incompatible)?;
                self.code().add_op(arith_op);
                Ok(ty)
            }
            _ => {
                let ty = self.promote(lt, rt);
                if ty == VarType::Double {
                    self.code().add_op(Op::DCmp);
                    self.code().add_op(Op::ILoad0);
                }
                let branch = comparison_branch(op).ok_or_else(incompatible)?;
                self.emit_bool(branch);
                Ok(VarType::Int)
            }
        }
    }

    /// Convert the narrower of the two top stack values to double.
    fn promote(&mut self, lt: VarType, rt: VarType) -> VarType {
        if lt == VarType::Double || rt == VarType::Double {
            if rt == VarType::Int {
                self.code().add_op(Op::I2D);
            }
            if lt == VarType::Int {
                self.code().add_op(Op::Swap);
                self.code().add_op(Op::I2D);
                self.code().add_op(Op::Swap);
            }
            VarType::Double
        } else {
            VarType::Int
        }
    }

    /// `branch` pops two ints; push 1 when it is taken, 0 otherwise.
    fn emit_bool(&mut self, branch: Op) {
        let l_true = self.code().new_label();
        let l_end = self.code().new_label();
        self.code().add_branch(branch, l_true);
        self.code().add_op(Op::ILoad0);
        self.code().add_branch(Op::Ja, l_end);
        self.code().bind(l_true);
        self.code().add_op(Op::ILoad1);
        self.code().bind(l_end);
    }

    fn compile_logical(
        &mut self,
        op: BinaryOp,
        left: &Node,
        right: &Node,
        at: Position,
    ) -> CompileResult<VarType> {
        // || jumps to "true" on the first nonzero operand, && to "false" on
        // the first zero one.
        let (branch, decided, fallthrough) = match op {
            BinaryOp::Or => (Op::IfICmpNe, Op::ILoad1, Op::ILoad0),
            _ => (Op::IfICmpE, Op::ILoad0, Op::ILoad1),
        };

        let l_decided = self.code().new_label();
        let l_end = self.code().new_label();

        for operand in [left, right] {
            let ty = self.compile_value(operand)?;
            self.emit_truth(ty, op.symbol(), at)?;
            self.code().add_op(Op::ILoad0);
            self.code().add_branch(branch, l_decided);
        }
        self.code().add_op(fallthrough);
        self.code().add_branch(Op::Ja, l_end);
        self.code().bind(l_decided);
        self.code().add_op(decided);
        self.code().bind(l_end);
        Ok(VarType::Int)
    }

    /// Turn the value on top of the stack into an int that is nonzero iff the
    /// value is true.
    fn emit_truth(&mut self, ty: VarType, op: &'static str, at: Position) -> CompileResult<()> {
        match ty {
            VarType::Int => Ok(()),
            VarType::Double => {
                self.code().add_op(Op::DLoad0);
                self.code().add_op(Op::DCmp);
                Ok(())
            }
            other => Err(CompileError::new(
                CompileErrorKind::InvalidOperand { op, operand: other },
                at,
            )),
        }
    }

    fn compile_unary(&mut self, op: UnaryOp, operand: &Node, at: Position) -> CompileResult<VarType> {
        let ty = self.compile_value(operand)?;
        let invalid = CompileError::new(
            CompileErrorKind::InvalidOperand {
                op: op.symbol(),
                operand: ty,
            },
            at,
        );
        match (op, ty) {
            (UnaryOp::Neg, VarType::Int) => self.code().add_op(Op::INeg),
            (UnaryOp::Neg, VarType::Double) => self.code().add_op(Op::DNeg),
            (UnaryOp::Not, VarType::Int) => {
                self.code().add_op(Op::ILoad0);
                self.emit_bool(Op::IfICmpE);
            }
            _ => return Err(invalid),
        }
        Ok(ty)
    }

    /// Evaluate `cond` and jump to `on_false` when it is zero.
    fn compile_condition(&mut self, cond: &Node, on_false: Label) -> CompileResult<()> {
        let ty = self.compile_value(cond)?;
        if !ty.is_numeric() {
            return Err(CompileError::new(
                CompileErrorKind::InvalidCondition(ty),
                cond.position,
            ));
        }
        self.emit_truth(ty, "if", cond.position)?;
        self.code().add_op(Op::ILoad0);
        self.code().add_branch(Op::IfICmpE, on_false);
        Ok(())
    }

    // for (i in a..b) body
    //
    //         <a>  STORE i
    // start:  <b>  LOAD i  IFICMPL end
    //         <body>
    //         LOAD i  ILOAD i64::MAX  IFICMPE end
    //         LOAD i  ILOAD1  IADD  STORE i  JA start
    // end:
    //
    // The counter ends at b + 1, or stays at i64::MAX when the range reaches it.
    fn compile_for(&mut self, var: &str, range: &Node, body: &Block, at: Position) -> CompileResult<()> {
        let counter = self.lookup_var(var, at)?;
        if counter.ty != VarType::Int {
            return Err(CompileError::new(
                CompileErrorKind::InvalidForRange {
                    what: "variable",
                    found: counter.ty,
                },
                at,
            ));
        }

        let NodeKind::Binary {
            op: BinaryOp::Range,
            left: lower,
            right: upper,
        } = &range.kind
        else {
            return Err(CompileError::new(
                CompileErrorKind::ExpectedRange(node_kind_name(&range.kind)),
                range.position,
            ));
        };

        let int_bound = |what: &'static str, found: VarType, position: Position| {
            if found == VarType::Int {
                Ok(())
            } else {
                Err(CompileError::new(
                    CompileErrorKind::InvalidForRange { what, found },
                    position,
                ))
            }
        };

        let lt = self.compile_value(lower)?;
        int_bound("lower bound", lt, lower.position)?;
        self.emit_var(Access::Store, counter, at)?;

        let l_start = self.code().new_label();
        let l_end = self.code().new_label();
        self.code().bind(l_start);

        let ut = self.compile_value(upper)?;
        int_bound("upper bound", ut, upper.position)?;
        self.emit_var(Access::Load, counter, at)?;
        self.code().add_branch(Op::IfICmpL, l_end);

        self.compile_block(body, false)?;

        self.emit_var(Access::Load, counter, at)?;
        self.code().add(Op::ILoad, Operand::Int(i64::MAX));
        self.code().add_branch(Op::IfICmpE, l_end);

        self.emit_var(Access::Load, counter, at)?;
        self.code().add_op(Op::ILoad1);
        self.code().add_op(Op::IAdd);
        self.emit_var(Access::Store, counter, at)?;
        self.code().add_branch(Op::Ja, l_start);
        self.code().bind(l_end);
        Ok(())
    }

    fn compile_call(&mut self, name: &str, args: &[Node], at: Position) -> CompileResult<VarType> {
        let callee = self
            .resolver
            .lookup_function(name)
            .cloned()
            .ok_or_else(|| {
                CompileError::new(CompileErrorKind::UndeclaredFunction(name.to_string()), at)
            })?;

        if callee.params.len() != args.len() {
            return Err(CompileError::new(
                CompileErrorKind::ArityMismatch {
                    name: name.to_string(),
                    expected: callee.params.len(),
                    found: args.len(),
                },
                at,
            ));
        }

        for (index, (arg, &expected)) in args.iter().zip(&callee.params).enumerate() {
            let found = self.compile_value(arg)?;
            if !self.coerce(found, expected) {
                return Err(CompileError::new(
                    CompileErrorKind::ArgumentTypeMismatch {
                        name: name.to_string(),
                        index,
                        expected,
                        found,
                    },
                    arg.position,
                ));
            }
        }

        self.code().add(Op::Call, Operand::Id(callee.id));
        Ok(callee.return_type)
    }

    fn compile_return(&mut self, value: Option<&Node>, at: Position) -> CompileResult<()> {
        let expected = self.current.return_type;
        match value {
            Some(_) if expected == VarType::Void => {
                return Err(CompileError::new(
                    CompileErrorKind::UnexpectedReturnValue,
                    at,
                ));
            }
            Some(value) => {
                let found = self.compile_value(value)?;
                if !self.coerce(found, expected) {
                    return Err(CompileError::new(
                        CompileErrorKind::ReturnTypeMismatch { expected, found },
                        value.position,
                    ));
                }
            }
            None if expected != VarType::Void => {
                return Err(CompileError::new(
                    CompileErrorKind::MissingReturnValue(expected),
                    at,
                ));
            }
            None => {}
        }
        self.code().add_op(Op::Return);
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn code(&mut self) -> &mut Bytecode {
        &mut self.current.code
    }

    /// Convert the top of the stack from `from` to `to`. False when the types
    /// do not convert.
    fn coerce(&mut self, from: VarType, to: VarType) -> bool {
        match (from, to) {
            (a, b) if a == b => true,
            (VarType::Int, VarType::Double) => {
                self.code().add_op(Op::I2D);
                true
            }
            (VarType::Double, VarType::Int) => {
                self.code().add_op(Op::D2I);
                true
            }
            _ => false,
        }
    }

    fn lookup_var(&self, name: &str, at: Position) -> CompileResult<ResolvedVar> {
        self.resolver.lookup_var(name).ok_or_else(|| {
            CompileError::new(CompileErrorKind::UndeclaredVariable(name.to_string()), at)
        })
    }

    fn emit_var(&mut self, access: Access, var: ResolvedVar, at: Position) -> CompileResult<()> {
        let (op, operand) = Op::var(access, var.ty, var.address.context, var.address.slot)
            .ok_or_else(|| {
                CompileError::new(
                    CompileErrorKind::Internal(format!("no {:?} instruction for {}", access, var.ty)),
                    at,
                )
            })?;
        self.code().add(op, operand);
        Ok(())
    }

    fn intern(&mut self, s: &str, at: Position) -> CompileResult<u16> {
        if let Some(&id) = self.constant_ids.get(s) {
            return Ok(id);
        }
        let id = u16::try_from(self.constants.len()).map_err(|_| {
            CompileError::new(
                CompileErrorKind::TooMany {
                    what: "string constants",
                },
                at,
            )
        })?;
        tracing::trace!(id, constant = %s, "interned string constant");
        self.constants.push(s.to_string());
        self.constant_ids.insert(s.to_string(), id);
        Ok(id)
    }

    fn native_id(
        &mut self,
        symbol: &str,
        params: Vec<VarType>,
        return_type: VarType,
        at: Position,
    ) -> CompileResult<u16> {
        if let Some(&id) = self.native_ids.get(symbol) {
            return Ok(id);
        }
        let id = u16::try_from(self.native_descriptors.len())
            .map_err(|_| CompileError::new(CompileErrorKind::TooMany { what: "natives" }, at))?;
        self.native_descriptors.push(NativeDescriptor {
            name: symbol.to_string(),
            params,
            return_type,
        });
        self.native_ids.insert(symbol.to_string(), id);
        Ok(id)
    }
}

fn arithmetic_op(op: BinaryOp, ty: VarType) -> Option<Op> {
    let double = match ty {
        VarType::Double => true,
        VarType::Int => false,
        _ => return None,
    };
    Some(match (op, double) {
        (BinaryOp::Add, true) => Op::DAdd,
        (BinaryOp::Add, false) => Op::IAdd,
        (BinaryOp::Sub, true) => Op::DSub,
        (BinaryOp::Sub, false) => Op::ISub,
        (BinaryOp::Mul, true) => Op::DMul,
        (BinaryOp::Mul, false) => Op::IMul,
        (BinaryOp::Div, true) => Op::DDiv,
        (BinaryOp::Div, false) => Op::IDiv,
        _ => return None,
    })
}

fn comparison_branch(op: BinaryOp) -> Option<Op> {
    Some(match op {
        BinaryOp::Eq => Op::IfICmpE,
        BinaryOp::Ne => Op::IfICmpNe,
        BinaryOp::Gt => Op::IfICmpG,
        BinaryOp::Ge => Op::IfICmpGe,
        BinaryOp::Lt => Op::IfICmpL,
        BinaryOp::Le => Op::IfICmpLe,
        _ => return None,
    })
}

/// True when every path through `block` ends in a `return`.
fn block_returns(block: &Block) -> bool {
    block.nodes.iter().any(node_returns)
}

fn node_returns(node: &Node) -> bool {
    match &node.kind {
        NodeKind::Return(_) => true,
        NodeKind::Block(block) => block_returns(block),
        NodeKind::If {
            then_block,
            else_block: Some(else_block),
            ..
        } => block_returns(then_block) && block_returns(else_block),
        _ => false,
    }
}

// =============================================================================
// TESTS
// =============================================================================
