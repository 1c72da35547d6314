use crate::bytecode::{
    ir::CompiledProgram,
    op::{Access, Addressing, Instruction, Op, Operand},
    verify::verify_program,
};
use crate::lang::value::{StrRef, Value, Var, VarType, format_double};
use crate::runtime::native::{NativeFn, NativeRegistry};
use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};
use std::cmp::Ordering;
use std::io::{self, Write};

type StepResult<T> = Result<T, RuntimeErrorKind>;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    pub max_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_steps: None,
            max_stack_size: 10_000,
        }
    }
}

/// Storage for one live function invocation.
#[derive(Debug)]
struct Activation {
    function: u16,
    depth: u16,
    slots: Vec<Value>,
    /// Index of the activation one lexical level up.
    static_link: Option<usize>,
}

#[derive(Debug)]
struct CallFrame {
    return_function: u16,
    return_offset: usize,
    caller_activation: usize,
    /// Operand-stack depth before the arguments were pushed.
    stack_base: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pc {
    function: u16,
    offset: usize,
}

enum Flow {
    Continue,
    Halt,
}

/// Stack VM executing a [`CompiledProgram`].
pub struct Interpreter<W: Write> {
    out: W,
    config: VmConfig,
    natives: NativeRegistry,

    stack: Vec<Value>,
    activations: Vec<Activation>,
    frames: Vec<CallFrame>,
    pc: Pc,
    steps: usize,
}

impl Interpreter<io::Stdout> {
    /// Interpreter printing to stdout with the platform natives.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> Interpreter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            config: VmConfig::default(),
            natives: NativeRegistry::platform(),
            stack: Vec::new(),
            activations: Vec::new(),
            frames: Vec::new(),
            pc: Pc {
                function: 0,
                offset: 0,
            },
            steps: 0,
        }
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_natives(mut self, natives: NativeRegistry) -> Self {
        self.natives = natives;
        self
    }

    /// Operand stack as left by the last run.
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn reset_execution_state(&mut self) {
        self.stack.clear();
        self.activations.clear();
        self.frames.clear();
        self.pc = Pc {
            function: 0,
            offset: 0,
        };
        self.steps = 0;
    }

    /// Run `program` from function 0. `bindings` initialize top-level
    /// variables by name; the final value of every top-level variable is
    /// returned.
    pub fn run(
        &mut self,
        program: &CompiledProgram,
        bindings: &[Var],
    ) -> Result<Vec<Var>, RuntimeError> {
        self.reset_execution_state();

        verify_program(program).map_err(|e| RuntimeError::new(e, 0, 0))?;
        let natives = self
            .resolve_natives(program)
            .map_err(|k| RuntimeError::new(k, 0, 0))?;

        let main = program
            .main()
            .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::UnknownFunction(0), 0, 0))?;
        self.activations.push(Activation {
            function: 0,
            depth: 0,
            slots: default_slots(&main.locals),
            static_link: None,
        });
        self.bind_globals(program, bindings)
            .map_err(|k| RuntimeError::new(k, 0, 0))?;

        tracing::debug!(
            functions = program.functions.len(),
            constants = program.constants.len(),
            "starting execution"
        );

        let result = self.execute(program, &natives);
        let flushed = self.out.flush();
        result?;
        flushed.map_err(|e| {
            RuntimeError::new(RuntimeErrorKind::Output(e.to_string()), self.pc.function, self.pc.offset)
        })?;

        tracing::debug!(steps = self.steps, "halted");

        self.final_values(program)
            .map_err(|k| RuntimeError::new(k, self.pc.function, self.pc.offset))
    }

    fn resolve_natives(&self, program: &CompiledProgram) -> StepResult<Vec<NativeFn>> {
        program
            .natives
            .iter()
            .map(|descriptor| {
                self.natives
                    .lookup(&descriptor.name)
                    .filter(|s| s.params == descriptor.params && s.return_type == descriptor.return_type)
                    .map(|s| s.func)
                    .ok_or_else(|| RuntimeErrorKind::UnresolvedNative(descriptor.name.clone()))
            })
            .collect()
    }

    fn bind_globals(&mut self, program: &CompiledProgram, bindings: &[Var]) -> StepResult<()> {
        for binding in bindings {
            let global = program
                .global(&binding.name)
                .ok_or_else(|| RuntimeErrorKind::UnknownGlobal(binding.name.clone()))?;
            if global.ty != binding.var_type() {
                return Err(RuntimeErrorKind::GlobalTypeMismatch {
                    name: binding.name.clone(),
                    expected: global.ty,
                    found: binding.var_type(),
                });
            }
            let root = &mut self.activations[0];
            let len = root.slots.len();
            let slot = root
                .slots
                .get_mut(global.slot as usize)
                .ok_or(RuntimeErrorKind::SlotOutOfRange {
                    slot: global.slot,
                    len,
                })?;
            *slot = binding.value.clone();
        }
        Ok(())
    }

    fn final_values(&self, program: &CompiledProgram) -> StepResult<Vec<Var>> {
        let root = &self.activations[0];
        program
            .globals
            .iter()
            .map(|global| -> StepResult<Var> {
                let value = root.slots.get(global.slot as usize).ok_or(
                    RuntimeErrorKind::SlotOutOfRange {
                        slot: global.slot,
                        len: root.slots.len(),
                    },
                )?;
                Ok(Var::new(global.name.clone(), materialize(program, value)?))
            })
            .collect()
    }

    /// Names of the live activations, outermost first.
    fn call_stack_names(&self, program: &CompiledProgram) -> Vec<String> {
        self.activations
            .iter()
            .map(|a| {
                program
                    .function(a.function)
                    .map(|f| f.name.clone())
                    .unwrap_or_else(|| format!("#{}", a.function))
            })
            .collect()
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn execute(&mut self, program: &CompiledProgram, natives: &[NativeFn]) -> Result<(), RuntimeError> {
        loop {
            let at = self.pc;
            match self.step(program, natives) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => return Ok(()),
                Err(kind) => {
                    tracing::debug!(function = at.function, offset = at.offset, error = %kind, "fault");
                    return Err(RuntimeError::new(kind, at.function, at.offset)
                        .with_call_stack(self.call_stack_names(program)));
                }
            }
        }
    }

    fn check_limits(&mut self) -> StepResult<()> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps
            && self.steps > max
        {
            return Err(RuntimeErrorKind::StepLimitExceeded(max));
        }
        Ok(())
    }

    fn step(&mut self, program: &CompiledProgram, natives: &[NativeFn]) -> StepResult<Flow> {
        let function = program
            .function(self.pc.function)
            .ok_or(RuntimeErrorKind::UnknownFunction(self.pc.function))?;
        let code = &function.code;

        if self.pc.offset == code.len() {
            return if self.pc.function == 0 {
                Ok(Flow::Halt)
            } else {
                Err(RuntimeErrorKind::FellOffEnd)
            };
        }

        self.check_limits()?;
        let instr = Instruction::decode(code, self.pc.offset)?;
        self.pc.offset = instr.next();
        let name = instr.op.mnemonic();

        match instr.op {
            // ───────────────────────────── Literals ─────────────────────────────
            Op::DLoad | Op::ILoad => match instr.operand {
                Operand::Double(n) => self.push(Value::Double(n))?,
                Operand::Int(n) => self.push(Value::Int(n))?,
                _ => return Err(RuntimeErrorKind::MalformedInstruction(name)),
            },
            Op::SLoad => {
                let id = operand_id(&instr);
                program
                    .constant(id)
                    .ok_or(RuntimeErrorKind::UnknownConstant(id))?;
                self.push(Value::Str(StrRef::Const(id)))?;
            }
            Op::DLoad0 => self.push(Value::Double(0.0))?,
            Op::ILoad0 => self.push(Value::Int(0))?,
            Op::SLoad0 => self.push(Value::string(""))?,
            Op::DLoad1 => self.push(Value::Double(1.0))?,
            Op::ILoad1 => self.push(Value::Int(1))?,
            Op::DLoadM1 => self.push(Value::Double(-1.0))?,
            Op::ILoadM1 => self.push(Value::Int(-1))?,

            // ──────────────────────────── Arithmetic ────────────────────────────
            Op::DAdd | Op::DSub | Op::DMul | Op::DDiv => {
                let upper = self.pop_double(name)?;
                let lower = self.pop_double(name)?;
                let result = match instr.op {
                    Op::DAdd => lower + upper,
                    Op::DSub => lower - upper,
                    Op::DMul => lower * upper,
                    _ => lower / upper,
                };
                self.push(Value::Double(result))?;
            }
            Op::IAdd | Op::ISub | Op::IMul | Op::IDiv | Op::IMod | Op::IAOr | Op::IAAnd
            | Op::IAXor => {
                let upper = self.pop_int(name)?;
                let lower = self.pop_int(name)?;
                let result = match instr.op {
                    Op::IAdd => lower.wrapping_add(upper),
                    Op::ISub => lower.wrapping_sub(upper),
                    Op::IMul => lower.wrapping_mul(upper),
                    Op::IDiv if upper == 0 => return Err(RuntimeErrorKind::DivisionByZero),
                    Op::IDiv => lower.wrapping_div(upper),
                    Op::IMod if upper == 0 => return Err(RuntimeErrorKind::ModuloByZero),
                    Op::IMod => lower.wrapping_rem(upper),
                    Op::IAOr => lower | upper,
                    Op::IAAnd => lower & upper,
                    _ => lower ^ upper,
                };
                self.push(Value::Int(result))?;
            }
            Op::DNeg => {
                let n = self.pop_double(name)?;
                self.push(Value::Double(-n))?;
            }
            Op::INeg => {
                let n = self.pop_int(name)?;
                self.push(Value::Int(n.wrapping_neg()))?;
            }

            // ─────────────────────────────── I/O ────────────────────────────────
            Op::IPrint => {
                let n = self.pop_int(name)?;
                write!(self.out, "{}", n).map_err(output_error)?;
            }
            Op::DPrint => {
                let n = self.pop_double(name)?;
                write!(self.out, "{}", format_double(n)).map_err(output_error)?;
            }
            Op::SPrint => {
                let value = self.pop_typed(name, VarType::String)?;
                let text = materialize(program, &value)?;
                if let Some(s) = text.as_host_str() {
                    self.out.write_all(s.as_bytes()).map_err(output_error)?;
                }
            }

            // ──────────────────────────── Conversion ────────────────────────────
            Op::I2D => {
                let n = self.pop_int(name)?;
                self.push(Value::Double(n as f64))?;
            }
            Op::D2I => {
                let n = self.pop_double(name)?;
                self.push(Value::Int(n as i64))?;
            }

            // ─────────────────────────────── Stack ──────────────────────────────
            Op::Swap => {
                let upper = self.pop(name)?;
                let lower = self.pop(name)?;
                self.push(upper)?;
                self.push(lower)?;
            }
            Op::Pop => {
                self.pop(name)?;
            }

            // ──────────────────────────── Comparison ────────────────────────────
            Op::DCmp => {
                let upper = self.pop_double(name)?;
                let lower = self.pop_double(name)?;
                // Unordered (NaN) compares as "greater": never equal.
                let result = match lower.partial_cmp(&upper) {
                    Some(Ordering::Less) => -1,
                    Some(Ordering::Equal) => 0,
                    Some(Ordering::Greater) | None => 1,
                };
                self.push(Value::Int(result))?;
            }
            Op::ICmp => {
                let upper = self.pop_int(name)?;
                let lower = self.pop_int(name)?;
                self.push(Value::Int(lower.cmp(&upper) as i64))?;
            }

            // ───────────────────────────── Branches ─────────────────────────────
            Op::Ja => self.jump(&instr, code.len())?,
            Op::IfICmpNe | Op::IfICmpE | Op::IfICmpG | Op::IfICmpGe | Op::IfICmpL
            | Op::IfICmpLe => {
                let upper = self.pop_int(name)?;
                let lower = self.pop_int(name)?;
                let taken = match instr.op {
                    Op::IfICmpNe => lower != upper,
                    Op::IfICmpE => lower == upper,
                    Op::IfICmpG => lower > upper,
                    Op::IfICmpGe => lower >= upper,
                    Op::IfICmpL => lower < upper,
                    _ => lower <= upper,
                };
                if taken {
                    self.jump(&instr, code.len())?;
                }
            }

            // ───────────────────────────── Functions ────────────────────────────
            Op::Stop => return Ok(Flow::Halt),
            Op::Call => self.call(program, operand_id(&instr))?,
            Op::CallNative => self.call_native(program, natives, operand_id(&instr))?,
            Op::Return => return self.ret(program),

            // ───────────────────────────── Variables ────────────────────────────
            op => {
                let access = op
                    .var_access()
                    .ok_or(RuntimeErrorKind::MalformedInstruction(name))?;
                let (context, slot) = match (access.addressing, instr.operand) {
                    (Addressing::Fixed(slot), _) => (0, slot),
                    (_, Operand::Slot(slot)) => (0, slot),
                    (_, Operand::Context { context, slot }) => (context, slot),
                    _ => return Err(RuntimeErrorKind::MalformedInstruction(name)),
                };
                match access.access {
                    Access::Load => {
                        let value = self.slot(context, slot)?.clone();
                        if value.var_type() != access.ty {
                            return Err(RuntimeErrorKind::TypeMismatch {
                                op: name,
                                expected: access.ty,
                                found: value.var_type(),
                            });
                        }
                        self.push(value)?;
                    }
                    Access::Store => {
                        let value = self.pop_typed(name, access.ty)?;
                        *self.slot(context, slot)? = value;
                    }
                }
            }
        }

        Ok(Flow::Continue)
    }

    fn jump(&mut self, instr: &Instruction, code_len: usize) -> StepResult<()> {
        let target = instr
            .branch_target()
            .ok_or(RuntimeErrorKind::BranchOutOfRange(-1))?;
        match usize::try_from(target) {
            Ok(t) if t <= code_len => {
                self.pc.offset = t;
                Ok(())
            }
            _ => Err(RuntimeErrorKind::BranchOutOfRange(target)),
        }
    }

    fn call(&mut self, program: &CompiledProgram, id: u16) -> StepResult<()> {
        let callee = program
            .function(id)
            .ok_or(RuntimeErrorKind::UnknownFunction(id))?;

        if self.frames.len() >= self.config.max_call_depth {
            return Err(RuntimeErrorKind::CallDepthExceeded(self.config.max_call_depth));
        }
        let stack_base = self
            .stack
            .len()
            .checked_sub(callee.params.len())
            .ok_or(RuntimeErrorKind::StackUnderflow("CALL"))?;

        // The callee's lexical parent is the nearest activation one level
        // above it on the caller's static chain.
        let current = self.activations.len() - 1;
        let static_link = if callee.depth == 0 {
            None
        } else {
            let mut link = Some(current);
            while let Some(idx) = link {
                if self.activations[idx].depth + 1 == callee.depth {
                    break;
                }
                link = self.activations[idx].static_link;
            }
            Some(link.ok_or(RuntimeErrorKind::ContextOutOfRange {
                context: callee.depth,
            })?)
        };

        tracing::trace!(function = %callee.name, id, depth = callee.depth, "call");

        self.frames.push(CallFrame {
            return_function: self.pc.function,
            return_offset: self.pc.offset,
            caller_activation: current,
            stack_base,
        });
        self.activations.push(Activation {
            function: id,
            depth: callee.depth,
            slots: default_slots(&callee.locals),
            static_link,
        });
        self.pc = Pc {
            function: id,
            offset: 0,
        };
        Ok(())
    }

    fn ret(&mut self, program: &CompiledProgram) -> StepResult<Flow> {
        let Some(frame) = self.frames.pop() else {
            return Ok(Flow::Halt);
        };
        let callee = program
            .function(self.pc.function)
            .ok_or(RuntimeErrorKind::UnknownFunction(self.pc.function))?;

        let result = if callee.return_type == VarType::Void {
            None
        } else {
            if self.stack.len() <= frame.stack_base {
                return Err(RuntimeErrorKind::MissingReturnValue(callee.return_type));
            }
            Some(self.pop_typed("RETURN", callee.return_type)?)
        };

        tracing::trace!(function = %callee.name, "return");

        self.stack.truncate(frame.stack_base);
        if let Some(value) = result {
            self.push(value)?;
        }
        self.activations.truncate(frame.caller_activation + 1);
        self.pc = Pc {
            function: frame.return_function,
            offset: frame.return_offset,
        };
        Ok(Flow::Continue)
    }

    fn call_native(
        &mut self,
        program: &CompiledProgram,
        natives: &[NativeFn],
        id: u16,
    ) -> StepResult<()> {
        let descriptor = program.native(id).ok_or(RuntimeErrorKind::UnknownNative(id))?;
        let func = natives
            .get(id as usize)
            .ok_or(RuntimeErrorKind::UnknownNative(id))?;

        let mut args = Vec::with_capacity(descriptor.params.len());
        for &ty in descriptor.params.iter().rev() {
            let value = self.pop_typed("CALLNATIVE", ty)?;
            args.push(materialize(program, &value)?);
        }
        args.reverse();

        let failed = |message: String| RuntimeErrorKind::NativeFailed {
            name: descriptor.name.clone(),
            message,
        };
        let result = func(&args).map_err(failed)?;

        match (result, descriptor.return_type) {
            (None, VarType::Void) => Ok(()),
            (Some(value), ty) if value.var_type() == ty => self.push(value),
            (Some(value), ty) => Err(RuntimeErrorKind::TypeMismatch {
                op: "CALLNATIVE",
                expected: ty,
                found: value.var_type(),
            }),
            (None, ty) => Err(failed(format!("returned no value, expected {}", ty))),
        }
    }

    // =========================================================================
    // Stack and slots
    // =========================================================================

    fn push(&mut self, value: Value) -> StepResult<()> {
        if self.stack.len() >= self.config.max_stack_size {
            return Err(RuntimeErrorKind::StackLimitExceeded(self.config.max_stack_size));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self, op: &'static str) -> StepResult<Value> {
        self.stack.pop().ok_or(RuntimeErrorKind::StackUnderflow(op))
    }

    fn pop_typed(&mut self, op: &'static str, expected: VarType) -> StepResult<Value> {
        let value = self.pop(op)?;
        if value.var_type() != expected {
            return Err(RuntimeErrorKind::TypeMismatch {
                op,
                expected,
                found: value.var_type(),
            });
        }
        Ok(value)
    }

    fn pop_int(&mut self, op: &'static str) -> StepResult<i64> {
        match self.pop(op)? {
            Value::Int(n) => Ok(n),
            other => Err(RuntimeErrorKind::TypeMismatch {
                op,
                expected: VarType::Int,
                found: other.var_type(),
            }),
        }
    }

    fn pop_double(&mut self, op: &'static str) -> StepResult<f64> {
        match self.pop(op)? {
            Value::Double(n) => Ok(n),
            other => Err(RuntimeErrorKind::TypeMismatch {
                op,
                expected: VarType::Double,
                found: other.var_type(),
            }),
        }
    }

    /// Slot `slot` of the activation `context` static links up.
    fn slot(&mut self, context: u16, slot: u16) -> StepResult<&mut Value> {
        let mut idx = self.activations.len() - 1;
        for _ in 0..context {
            idx = self.activations[idx]
                .static_link
                .ok_or(RuntimeErrorKind::ContextOutOfRange { context })?;
        }
        let slots = &mut self.activations[idx].slots;
        let len = slots.len();
        slots
            .get_mut(slot as usize)
            .ok_or(RuntimeErrorKind::SlotOutOfRange { slot, len })
    }
}

fn default_slots(locals: &[VarType]) -> Vec<Value> {
    locals
        .iter()
        .map(|ty| ty.default_value().unwrap_or(Value::Int(0)))
        .collect()
}

fn operand_id(instr: &Instruction) -> u16 {
    match instr.operand {
        Operand::Id(id) => id,
        _ => u16::MAX,
    }
}

/// Replace a constant-pool reference by the string it names.
fn materialize(program: &CompiledProgram, value: &Value) -> StepResult<Value> {
    match value {
        Value::Str(StrRef::Const(id)) => program
            .constant(*id)
            .map(Value::string)
            .ok_or(RuntimeErrorKind::UnknownConstant(*id)),
        other => Ok(other.clone()),
    }
}

fn output_error(err: io::Error) -> RuntimeErrorKind {
    RuntimeErrorKind::Output(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::code::Bytecode;
    use crate::bytecode::compile::Compiler;
    use crate::bytecode::ir::{CompiledFunction, TopLevelVar};
    use crate::lang::node::{AstFunction, BinaryOp, Block, Node, Param, StoreOp};
    use pretty_assertions::assert_eq;

    // =========================================================================
    // Helpers
    // =========================================================================

    fn compile(block: Block) -> CompiledProgram {
        let natives = NativeRegistry::platform();
        Compiler::new(&natives)
            .compile_program(&AstFunction::top(block))
            .expect("program compiles")
    }

    fn run_with_config(
        program: &CompiledProgram,
        bindings: &[Var],
        config: VmConfig,
    ) -> (String, Result<Vec<Var>, RuntimeError>) {
        let mut vm = Interpreter::new(Vec::new()).with_config(config);
        let result = vm.run(program, bindings);
        let out = String::from_utf8(vm.into_output()).expect("utf-8 output");
        (out, result)
    }

    fn run(block: Block) -> (String, Result<Vec<Var>, RuntimeError>) {
        run_with_config(&compile(block), &[], VmConfig::default())
    }

    /// Assert a program prints `expected` and succeeds
    fn assert_output(block: Block, expected: &str) {
        let (out, result) = run(block);
        if let Err(e) = result {
            panic!("execution should succeed, got: {}", e);
        }
        assert_eq!(out, expected);
    }

    /// Assert execution fails with an error containing the given substring
    fn assert_error(block: Block, error_contains: &str) -> RuntimeError {
        match run(block) {
            (out, Ok(_)) => panic!(
                "expected error containing '{}', got output: {:?}",
                error_contains, out
            ),
            (_, Err(e)) => {
                assert!(
                    e.message().contains(error_contains),
                    "expected error containing '{}', got: {}",
                    error_contains,
                    e
                );
                e
            }
        }
    }

    fn hand_built(code: Vec<u8>, locals: Vec<VarType>) -> CompiledProgram {
        CompiledProgram {
            functions: vec![CompiledFunction {
                id: 0,
                name: "<top>".to_string(),
                params: vec![],
                return_type: VarType::Void,
                depth: 0,
                locals,
                code,
            }],
            constants: vec![],
            natives: vec![],
            globals: vec![],
        }
    }

    fn print(nodes: Vec<Node>) -> Block {
        Block::new(vec![Node::print(nodes)])
    }

    // =========================================================================
    // Values and arithmetic
    // =========================================================================

    #[test]
    fn test_print_literals() {
        assert_output(
            print(vec![
                Node::int(42),
                Node::string(" "),
                Node::double(2.5),
                Node::string(" "),
                Node::double(3.0),
                Node::string(""),
            ]),
            "42 2.5 3.0",
        );
    }

    #[test]
    fn test_mixed_arithmetic_promotes() {
        assert_output(
            print(vec![Node::binary(BinaryOp::Add, Node::int(1), Node::double(2.0))]),
            "3.0",
        );
        assert_output(
            print(vec![Node::binary(BinaryOp::Div, Node::double(7.0), Node::int(2))]),
            "3.5",
        );
    }

    #[test]
    fn test_int_arithmetic() {
        assert_output(
            print(vec![
                Node::binary(BinaryOp::Sub, Node::int(10), Node::int(3)),
                Node::binary(BinaryOp::Div, Node::int(-7), Node::int(2)),
                Node::binary(BinaryOp::Mod, Node::int(7), Node::int(3)),
                Node::binary(BinaryOp::BitXor, Node::int(6), Node::int(3)),
            ]),
            "7-315",
        );
    }

    #[test]
    fn test_int_overflow_wraps() {
        assert_output(
            print(vec![Node::binary(
                BinaryOp::Add,
                Node::int(i64::MAX),
                Node::int(1),
            )]),
            &i64::MIN.to_string(),
        );
    }

    #[test]
    fn test_comparisons() {
        assert_output(
            print(vec![
                Node::binary(BinaryOp::Eq, Node::double(2.0), Node::int(2)),
                Node::binary(BinaryOp::Lt, Node::int(3), Node::int(2)),
                Node::binary(BinaryOp::Ge, Node::double(2.5), Node::double(2.5)),
                Node::binary(BinaryOp::Ne, Node::int(1), Node::int(1)),
            ]),
            "1010",
        );
    }

    #[test]
    fn test_logical_and_unary() {
        assert_output(
            print(vec![
                Node::binary(BinaryOp::And, Node::int(2), Node::int(3)),
                Node::binary(BinaryOp::Or, Node::int(0), Node::double(0.0)),
                Node::unary(crate::lang::node::UnaryOp::Not, Node::int(5)),
                Node::unary(crate::lang::node::UnaryOp::Neg, Node::int(5)),
            ]),
            "100-5",
        );
    }

    #[test]
    fn test_division_by_zero_faults() {
        let block = Block::new(vec![
            Node::print(vec![Node::string("before")]),
            Node::print(vec![Node::binary(BinaryOp::Div, Node::int(1), Node::int(0))]),
            Node::print(vec![Node::string("after")]),
        ]);
        let (out, result) = run(block);
        assert_eq!(out, "before");
        let err = result.unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
        assert_eq!(err.function, 0);
        // SLOAD, SPRINT, ILOAD1, ILOAD0 precede the IDIV.
        assert_eq!(err.offset, 6);
    }

    #[test]
    fn test_modulo_by_zero_faults() {
        assert_error(
            print(vec![Node::binary(BinaryOp::Mod, Node::int(1), Node::int(0))]),
            "modulo by zero",
        );
    }

    // =========================================================================
    // Variables and control flow
    // =========================================================================

    #[test]
    fn test_while_loop() {
        let block = Block::new(vec![
            Node::assign("i", Node::int(3)),
            Node::while_loop(
                Node::binary(BinaryOp::Gt, Node::load("i"), Node::int(0)),
                Block::new(vec![
                    Node::print(vec![Node::load("i")]),
                    Node::store("i", StoreOp::SubAssign, Node::int(1)),
                ]),
            ),
        ])
        .var("i", VarType::Int);
        assert_output(block, "321");
    }

    #[test]
    fn test_for_loop_final_value() {
        let block = Block::new(vec![Node::for_range(
            "i",
            Node::int(1),
            Node::int(3),
            Block::new(vec![Node::print(vec![Node::load("i")])]),
        )])
        .var("i", VarType::Int);
        let (out, result) = run(block);
        assert_eq!(out, "123");
        assert_eq!(result.unwrap(), vec![Var::new("i", Value::Int(4))]);
    }

    #[test]
    fn test_for_loop_empty_range() {
        let block = Block::new(vec![Node::for_range(
            "i",
            Node::int(5),
            Node::int(1),
            Block::new(vec![Node::print(vec![Node::load("i")])]),
        )])
        .var("i", VarType::Int);
        let (out, result) = run(block);
        assert_eq!(out, "");
        assert_eq!(result.unwrap(), vec![Var::new("i", Value::Int(5))]);
    }

    #[test]
    fn test_for_loop_ending_at_int_max() {
        let block = Block::new(vec![Node::for_range(
            "i",
            Node::int(i64::MAX - 1),
            Node::int(i64::MAX),
            Block::new(vec![Node::print(vec![Node::string("x")])]),
        )])
        .var("i", VarType::Int);
        let (out, result) = run_with_config(
            &compile(block),
            &[],
            VmConfig {
                max_steps: Some(200),
                ..Default::default()
            },
        );
        assert_eq!(out, "xx");
        assert_eq!(result.unwrap(), vec![Var::new("i", Value::Int(i64::MAX))]);
    }

    #[test]
    fn test_single_iteration_at_int_max() {
        let block = Block::new(vec![Node::for_range(
            "i",
            Node::int(i64::MAX),
            Node::int(i64::MAX),
            Block::new(vec![Node::print(vec![Node::string("x")])]),
        )])
        .var("i", VarType::Int);
        let (out, result) = run_with_config(
            &compile(block),
            &[],
            VmConfig {
                max_steps: Some(200),
                ..Default::default()
            },
        );
        assert_eq!(out, "x");
        assert!(result.is_ok());
    }

    #[test]
    fn test_if_else() {
        let block = Block::new(vec![Node::if_then(
            Node::binary(BinaryOp::Lt, Node::load("x"), Node::int(10)),
            Block::new(vec![Node::print(vec![Node::string("small")])]),
            Some(Block::new(vec![Node::print(vec![Node::string("big")])])),
        )])
        .var("x", VarType::Int);

        let program = compile(block);
        let (out, _) = run_with_config(
            &program,
            &[Var::new("x", Value::Int(3))],
            VmConfig::default(),
        );
        assert_eq!(out, "small");
        let (out, _) = run_with_config(
            &program,
            &[Var::new("x", Value::Int(30))],
            VmConfig::default(),
        );
        assert_eq!(out, "big");
    }

    #[test]
    fn test_shadowing_keeps_outer_storage() {
        let inner = Block::new(vec![
            Node::assign("x", Node::int(2)),
            Node::print(vec![Node::load("x")]),
        ])
        .var("x", VarType::Int);
        let block = Block::new(vec![
            Node::assign("x", Node::int(1)),
            Node::block(inner),
            Node::print(vec![Node::load("x")]),
        ])
        .var("x", VarType::Int);

        let (out, result) = run(block);
        assert_eq!(out, "21");
        assert_eq!(result.unwrap(), vec![Var::new("x", Value::Int(1))]);
    }

    // =========================================================================
    // Functions
    // =========================================================================

    fn factorial() -> AstFunction {
        AstFunction::new(
            "fact",
            vec![Param::new("n", VarType::Int)],
            VarType::Int,
            Block::new(vec![
                Node::if_then(
                    Node::binary(BinaryOp::Le, Node::load("n"), Node::int(1)),
                    Block::new(vec![Node::ret(Some(Node::int(1)))]),
                    None,
                ),
                Node::ret(Some(Node::binary(
                    BinaryOp::Mul,
                    Node::load("n"),
                    Node::call(
                        "fact",
                        vec![Node::binary(BinaryOp::Sub, Node::load("n"), Node::int(1))],
                    ),
                ))),
            ]),
        )
    }

    #[test]
    fn test_recursion() {
        let block = print(vec![Node::call("fact", vec![Node::int(10)])]).function(factorial());
        assert_output(block, "3628800");
    }

    #[test]
    fn test_nested_function_mutates_outer() {
        let bump = AstFunction::new(
            "bump",
            vec![Param::new("by", VarType::Int)],
            VarType::Void,
            Block::new(vec![Node::store("count", StoreOp::AddAssign, Node::load("by"))]),
        );
        let block = Block::new(vec![
            Node::assign("count", Node::int(1)),
            Node::call("bump", vec![Node::int(5)]),
            Node::call("bump", vec![Node::int(10)]),
            Node::print(vec![Node::load("count")]),
        ])
        .var("count", VarType::Int)
        .function(bump);

        let (out, result) = run(block);
        assert_eq!(out, "16");
        assert_eq!(result.unwrap(), vec![Var::new("count", Value::Int(16))]);
    }

    #[test]
    fn test_inner_function_sees_live_activation() {
        // fun walk(n) { fun show() { print(n) } if (n > 0) { show(); walk(n - 1) } }
        let show = AstFunction::new(
            "show",
            vec![],
            VarType::Void,
            Block::new(vec![Node::print(vec![Node::load("n")])]),
        );
        let walk = AstFunction::new(
            "walk",
            vec![Param::new("n", VarType::Int)],
            VarType::Void,
            Block::new(vec![Node::if_then(
                Node::binary(BinaryOp::Gt, Node::load("n"), Node::int(0)),
                Block::new(vec![
                    Node::call("show", vec![]),
                    Node::call(
                        "walk",
                        vec![Node::binary(BinaryOp::Sub, Node::load("n"), Node::int(1))],
                    ),
                ]),
                None,
            )])
            .function(show),
        );
        let block = Block::new(vec![Node::call("walk", vec![Node::int(3)])]).function(walk);
        assert_output(block, "321");
    }

    #[test]
    fn test_nested_call_to_outer_sibling() {
        // A depth-2 function calling a depth-1 sibling of its parent.
        let greet = AstFunction::new(
            "greet",
            vec![],
            VarType::Void,
            Block::new(vec![Node::print(vec![Node::load("name")])]),
        );
        let inner = AstFunction::new(
            "inner",
            vec![],
            VarType::Void,
            Block::new(vec![Node::call("greet", vec![])]),
        );
        let outer = AstFunction::new(
            "outer",
            vec![],
            VarType::Void,
            Block::new(vec![Node::call("inner", vec![])]).function(inner),
        );
        let block = Block::new(vec![
            Node::assign("name", Node::string("hi")),
            Node::call("outer", vec![]),
        ])
        .var("name", VarType::String)
        .function(greet)
        .function(outer);
        assert_output(block, "hi");
    }

    #[test]
    fn test_argument_coercion_and_return_value() {
        let half = AstFunction::new(
            "half",
            vec![Param::new("x", VarType::Double)],
            VarType::Double,
            Block::new(vec![Node::ret(Some(Node::binary(
                BinaryOp::Div,
                Node::load("x"),
                Node::int(2),
            )))]),
        );
        let block = print(vec![Node::call("half", vec![Node::int(5)])]).function(half);
        assert_output(block, "2.5");
    }

    #[test]
    fn test_native_call() {
        let sqrt = AstFunction::new(
            "sqrt",
            vec![Param::new("x", VarType::Double)],
            VarType::Double,
            Block::new(vec![Node::native("sqrt")]),
        );
        let strlen = AstFunction::new(
            "strlen",
            vec![Param::new("s", VarType::String)],
            VarType::Int,
            Block::new(vec![Node::native("strlen")]),
        );
        let block = print(vec![
            Node::call("sqrt", vec![Node::int(16)]),
            Node::call("strlen", vec![Node::string("hello")]),
        ])
        .function(sqrt)
        .function(strlen);
        assert_output(block, "4.05");
    }

    #[test]
    fn test_missing_native_at_runtime() {
        let sqrt = AstFunction::new(
            "sqrt",
            vec![Param::new("x", VarType::Double)],
            VarType::Double,
            Block::new(vec![Node::native("sqrt")]),
        );
        let program = compile(print(vec![Node::call("sqrt", vec![Node::int(4)])]).function(sqrt));

        let mut vm = Interpreter::new(Vec::new()).with_natives(NativeRegistry::new());
        let err = vm.run(&program, &[]).unwrap_err();
        assert_eq!(
            err.kind,
            RuntimeErrorKind::UnresolvedNative("sqrt".to_string())
        );
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    #[test]
    fn test_bindings_in_and_out() {
        let block = Block::new(vec![
            Node::store("x", StoreOp::AddAssign, Node::int(1)),
            Node::assign("s", Node::string("done")),
        ])
        .var("x", VarType::Int)
        .var("s", VarType::String);
        let program = compile(block);

        let (_, result) = run_with_config(
            &program,
            &[Var::new("x", Value::Int(41))],
            VmConfig::default(),
        );
        assert_eq!(
            result.unwrap(),
            vec![
                Var::new("x", Value::Int(42)),
                Var::new("s", Value::string("done")),
            ]
        );
    }

    #[test]
    fn test_bad_bindings() {
        let program = compile(Block::default().var("x", VarType::Int));

        let (_, result) = run_with_config(
            &program,
            &[Var::new("y", Value::Int(1))],
            VmConfig::default(),
        );
        assert_eq!(
            result.unwrap_err().kind,
            RuntimeErrorKind::UnknownGlobal("y".to_string())
        );

        let (_, result) = run_with_config(
            &program,
            &[Var::new("x", Value::Double(1.0))],
            VmConfig::default(),
        );
        assert!(matches!(
            result.unwrap_err().kind,
            RuntimeErrorKind::GlobalTypeMismatch { .. }
        ));
    }

    // =========================================================================
    // Limits
    // =========================================================================

    #[test]
    fn test_call_depth_limit() {
        let forever = AstFunction::new(
            "forever",
            vec![],
            VarType::Void,
            Block::new(vec![Node::call("forever", vec![])]),
        );
        let program = compile(Block::new(vec![Node::call("forever", vec![])]).function(forever));
        let (_, result) = run_with_config(
            &program,
            &[],
            VmConfig {
                max_call_depth: 10,
                ..Default::default()
            },
        );
        let err = result.unwrap_err();
        assert!(err.message().contains("call depth limit"));
        assert_eq!(err.call_stack.len(), 11);
        assert_eq!(err.call_stack[0], "<top>");
    }

    #[test]
    fn test_step_limit() {
        let program = compile(Block::new(vec![Node::while_loop(
            Node::int(1),
            Block::default(),
        )]));
        let (_, result) = run_with_config(
            &program,
            &[],
            VmConfig {
                max_steps: Some(100),
                ..Default::default()
            },
        );
        assert!(result.unwrap_err().message().contains("step limit"));
    }

    #[test]
    fn test_stack_size_limit() {
        let mut code = Bytecode::new();
        for _ in 0..200 {
            code.add_op(Op::ILoad1);
        }
        code.add_op(Op::Stop);
        let program = hand_built(code.finish().unwrap(), vec![]);

        let (_, result) = run_with_config(
            &program,
            &[],
            VmConfig {
                max_stack_size: 100,
                ..Default::default()
            },
        );
        assert!(result.unwrap_err().message().contains("stack size limit"));
    }

    // =========================================================================
    // Hand-built bytecode
    // =========================================================================

    #[test]
    fn test_type_mismatch_on_stack() {
        let program = hand_built(
            vec![Op::ILoad1 as u8, Op::DPrint as u8, Op::Stop as u8],
            vec![],
        );
        let (_, result) = run_with_config(&program, &[], VmConfig::default());
        let err = result.unwrap_err();
        assert_eq!(
            err.kind,
            RuntimeErrorKind::TypeMismatch {
                op: "DPRINT",
                expected: VarType::Double,
                found: VarType::Int,
            }
        );
        assert_eq!(err.offset, 1);
    }

    #[test]
    fn test_int_op_on_string_is_type_mismatch() {
        let program = hand_built(
            vec![
                Op::SLoad0 as u8,
                Op::ILoad1 as u8,
                Op::IAdd as u8,
                Op::Pop as u8,
                Op::Stop as u8,
            ],
            vec![],
        );
        let (_, result) = run_with_config(&program, &[], VmConfig::default());
        assert_eq!(
            result.unwrap_err().kind,
            RuntimeErrorKind::TypeMismatch {
                op: "IADD",
                expected: VarType::Int,
                found: VarType::String,
            }
        );
    }

    #[test]
    fn test_unverifiable_program_rejected() {
        let program = hand_built(vec![Op::Pop as u8], vec![]);
        let (_, result) = run_with_config(&program, &[], VmConfig::default());
        assert!(matches!(
            result.unwrap_err().kind,
            RuntimeErrorKind::InvalidProgram(_)
        ));
    }

    #[test]
    fn test_falling_off_main_halts() {
        let mut program = hand_built(vec![Op::ILoad1 as u8, Op::StoreIVar0 as u8], vec![VarType::Int]);
        program.globals.push(TopLevelVar {
            name: "x".to_string(),
            ty: VarType::Int,
            slot: 0,
        });
        let (_, result) = run_with_config(&program, &[], VmConfig::default());
        assert_eq!(result.unwrap(), vec![Var::new("x", Value::Int(1))]);
    }
}
