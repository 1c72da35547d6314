use crate::bytecode::{
    ir::{CompiledFunction, CompiledProgram},
    op::{Access, Addressing, Instruction, Op, Operand},
};
use crate::lang::value::VarType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("verify error in function {function} at offset {offset}: {message}")]
pub struct VerifyError {
    pub function: u16,
    pub offset: usize,
    pub message: String,
}

impl VerifyError {
    fn new(function: u16, offset: usize, message: impl Into<String>) -> Self {
        Self {
            function,
            offset,
            message: message.into(),
        }
    }
}

/// Returns (pops, pushes) for an instruction. Calls take their arity from the
/// program's function and native tables.
fn effect(program: &CompiledProgram, instr: &Instruction) -> Option<(usize, usize)> {
    use Op::*;
    let returns = |ty: VarType| usize::from(ty != VarType::Void);
    Some(match instr.op {
        DLoad | ILoad | SLoad | DLoad0 | ILoad0 | SLoad0 | DLoad1 | ILoad1 | DLoadM1 | ILoadM1 => {
            (0, 1)
        }

        DAdd | IAdd | DSub | ISub | DMul | IMul | DDiv | IDiv | IMod | IAOr | IAAnd | IAXor => {
            (2, 1)
        }
        DNeg | INeg | I2D | D2I => (1, 1),

        IPrint | DPrint | SPrint => (1, 0),

        Swap => (2, 2),
        Pop => (1, 0),

        DCmp | ICmp => (2, 1),

        Ja => (0, 0),
        IfICmpNe | IfICmpE | IfICmpG | IfICmpGe | IfICmpL | IfICmpLe => (2, 0),

        Stop | Return => (0, 0),

        Call => {
            let Operand::Id(id) = instr.operand else {
                return None;
            };
            let callee = program.function(id)?;
            (callee.params.len(), returns(callee.return_type))
        }
        CallNative => {
            let Operand::Id(id) = instr.operand else {
                return None;
            };
            let native = program.native(id)?;
            (native.params.len(), returns(native.return_type))
        }

        op => match op.var_access()?.access {
            Access::Load => (0, 1),
            Access::Store => (1, 0),
        },
    })
}

/// Verify every function of `program`.
pub fn verify_program(program: &CompiledProgram) -> Result<(), VerifyError> {
    let Some(main) = program.main() else {
        return Err(VerifyError::new(0, 0, "program has no functions"));
    };
    if !main.params.is_empty() || main.return_type != VarType::Void || main.depth != 0 {
        return Err(VerifyError::new(
            0,
            0,
            "top-level function must be void, take no parameters and have depth 0",
        ));
    }

    for (idx, function) in program.functions.iter().enumerate() {
        if function.id as usize != idx {
            return Err(VerifyError::new(
                function.id,
                0,
                format!("function stored at index {} has id {}", idx, function.id),
            ));
        }
        verify_function(program, function)?;
    }
    Ok(())
}

/// Decode, check operands, then walk the control flow graph tracking the
/// operand-stack height relative to the frame base.
pub fn verify_function(
    program: &CompiledProgram,
    function: &CompiledFunction,
) -> Result<(), VerifyError> {
    let id = function.id;
    let code = &function.code;
    let err = |offset: usize, message: String| VerifyError::new(id, offset, message);

    if function.locals.len() < function.params.len()
        || function.locals[..function.params.len()] != function.params[..]
    {
        return Err(err(0, "parameter slots do not match parameter types".into()));
    }

    // Linear decode.
    let mut instrs: Vec<Option<Instruction>> = vec![None; code.len()];
    let mut offset = 0;
    while offset < code.len() {
        let instr = Instruction::decode(code, offset).map_err(|e| err(offset, e.to_string()))?;
        check_operand(program, function, &instr).map_err(|m| err(offset, m))?;
        instrs[offset] = Some(instr);
        offset = instr.next();
    }

    for instr in instrs.iter().flatten() {
        if let Some(target) = instr.branch_target() {
            let lands = usize::try_from(target)
                .ok()
                .is_some_and(|t| t == code.len() || instrs.get(t).is_some_and(Option::is_some));
            if !lands {
                return Err(err(
                    instr.offset,
                    format!("branch target {} is not an instruction boundary", target),
                ));
            }
        }
    }

    // Stack heights. `code.len()` stands for falling off the end.
    let entry = function.params.len();
    let result = usize::from(function.return_type != VarType::Void);
    let mut heights: Vec<Option<usize>> = vec![None; code.len() + 1];
    let mut worklist = vec![(0usize, entry)];

    while let Some((at, height)) = worklist.pop() {
        match heights[at] {
            Some(h) if h == height => continue,
            Some(h) => {
                return Err(err(
                    at,
                    format!("stack height {} here, {} on another path", height, h),
                ));
            }
            None => heights[at] = Some(height),
        }

        if at == code.len() {
            if id != 0 {
                return Err(err(at, "execution can fall off the end of the function".into()));
            }
            continue;
        }

        let Some(instr) = instrs[at] else {
            return Err(err(at, "not an instruction boundary".into()));
        };
        let (pops, pushes) = effect(program, &instr)
            .ok_or_else(|| err(at, format!("unknown stack effect for {}", instr.op.mnemonic())))?;
        if height < pops {
            return Err(err(
                at,
                format!(
                    "stack underflow: {} needs {} value(s), {} available",
                    instr.op.mnemonic(),
                    pops,
                    height
                ),
            ));
        }
        let after = height - pops + pushes;

        match instr.op {
            Op::Stop => {}
            Op::Return => {
                if id != 0 && height != result {
                    return Err(err(
                        at,
                        format!("RETURN with {} value(s) on the stack, expected {}", height, result),
                    ));
                }
            }
            Op::Ja => {
                if let Some(t) = instr.branch_target() {
                    worklist.push((t as usize, after));
                }
            }
            op if op.is_branch() => {
                if let Some(t) = instr.branch_target() {
                    worklist.push((t as usize, after));
                }
                worklist.push((instr.next(), after));
            }
            _ => worklist.push((instr.next(), after)),
        }
    }

    Ok(())
}

fn check_operand(
    program: &CompiledProgram,
    function: &CompiledFunction,
    instr: &Instruction,
) -> Result<(), String> {
    let op = instr.op;
    match (op, instr.operand) {
        (Op::SLoad, Operand::Id(id)) if program.constant(id).is_none() => {
            return Err(format!("unknown string constant {}", id));
        }
        (Op::Call, Operand::Id(id)) if program.function(id).is_none() => {
            return Err(format!("unknown function {}", id));
        }
        (Op::Call, Operand::Id(id)) => {
            if let Some(callee) = program.function(id)
                && callee.depth > function.depth + 1
            {
                return Err(format!(
                    "function {} at depth {} cannot call function {} at depth {}",
                    function.id, function.depth, id, callee.depth
                ));
            }
        }
        (Op::CallNative, Operand::Id(id)) if program.native(id).is_none() => {
            return Err(format!("unknown native {}", id));
        }
        _ => {}
    }

    let Some(access) = op.var_access() else {
        return Ok(());
    };
    let slot = match (access.addressing, instr.operand) {
        (Addressing::Fixed(slot), _) => slot,
        (Addressing::Local, Operand::Slot(slot)) => slot,
        (Addressing::Context, Operand::Context { context, slot }) => {
            if context > function.depth {
                return Err(format!(
                    "context {} is past the root (function depth {})",
                    context, function.depth
                ));
            }
            if context > 0 {
                // Slot types of outer activations are checked at run time.
                return Ok(());
            }
            slot
        }
        _ => return Err(format!("malformed operand for {}", op.mnemonic())),
    };

    match function.locals.get(slot as usize) {
        None => Err(format!(
            "slot {} out of range ({} locals)",
            slot,
            function.locals.len()
        )),
        Some(&ty) if ty != access.ty => Err(format!(
            "{} on slot {} of type {}",
            op.mnemonic(),
            slot,
            ty
        )),
        Some(_) => Ok(()),
    }
}
