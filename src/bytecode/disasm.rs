use crate::bytecode::{
    ir::{CompiledFunction, CompiledProgram},
    op::{Instruction, Op, Operand},
};
use std::collections::{BTreeSet, HashMap};

/// Print disassembly of a compiled program
pub fn print_bc(program: &CompiledProgram) {
    print!("{}", disassemble(program));
}

/// Return disassembly of every function as a String
pub fn disassemble(program: &CompiledProgram) -> String {
    let mut output = String::from("=== BYTECODE PROGRAM ===\n\n");

    if !program.constants.is_empty() {
        output.push_str("constants:\n");
        for (id, s) in program.constants.iter().enumerate() {
            output.push_str(&format!("  #{:<4} {:?}\n", id, s));
        }
        output.push('\n');
    }

    if !program.natives.is_empty() {
        output.push_str("natives:\n");
        for (id, native) in program.natives.iter().enumerate() {
            let params: Vec<&str> = native.params.iter().map(|t| t.name()).collect();
            output.push_str(&format!(
                "  #{:<4} {}({}) -> {}\n",
                id,
                native.name,
                params.join(", "),
                native.return_type
            ));
        }
        output.push('\n');
    }

    for function in &program.functions {
        output.push_str(&disassemble_function(program, function));
        output.push('\n');
    }
    output
}

/// Header box plus one line per instruction
pub fn disassemble_function(program: &CompiledProgram, function: &CompiledFunction) -> String {
    let mut output = String::new();
    let locals: Vec<&str> = function.locals.iter().map(|t| t.name()).collect();

    output.push_str("════════════════════════════════════════\n");
    output.push_str(&format!(
        " #{} {} {}\n",
        function.id,
        function.name,
        function.signature()
    ));
    output.push_str(&format!(
        " depth {}, locals [{}], {} bytes\n",
        function.depth,
        locals.join(", "),
        function.code.len()
    ));
    output.push_str("════════════════════════════════════════\n");

    let (instrs, bad) = decode_all(&function.code);
    let jump_targets: BTreeSet<usize> = instrs
        .iter()
        .filter_map(|i| i.branch_target())
        .filter_map(|t| usize::try_from(t).ok())
        .collect();

    for instr in &instrs {
        if jump_targets.contains(&instr.offset) {
            output.push_str("      ┌──────────────────────────────────\n");
        }

        output.push_str(&format!("{:04} ", instr.offset));
        output.push_str(if jump_targets.contains(&instr.offset) {
            "► "
        } else {
            "  "
        });
        output.push_str(&format_instruction(program, instr));
        output.push('\n');
    }

    if let Some(offset) = bad {
        output.push_str(&format!(
            "{:04}   ??? {:#04x}\n",
            offset, function.code[offset]
        ));
    } else if jump_targets.contains(&function.code.len()) {
        output.push_str("      ┌──────────────────────────────────\n");
        output.push_str(&format!("{:04} ► <end>\n", function.code.len()));
    }

    output
}

/// Decode until the end or the first undecodable byte.
fn decode_all(code: &[u8]) -> (Vec<Instruction>, Option<usize>) {
    let mut instrs = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        match Instruction::decode(code, offset) {
            Ok(instr) => {
                offset = instr.next();
                instrs.push(instr);
            }
            Err(_) => return (instrs, Some(offset)),
        }
    }
    (instrs, None)
}

fn format_instruction(program: &CompiledProgram, instr: &Instruction) -> String {
    let name = instr.op.mnemonic();
    match (instr.op, instr.operand) {
        (_, Operand::None) => name.to_string(),
        (_, Operand::Int(n)) => format!("{:<12}{}", name, n),
        (_, Operand::Double(n)) => format!("{:<12}{:?}", name, n),
        (Op::SLoad, Operand::Id(id)) => match program.constant(id) {
            Some(s) => format!("{:<12}#{} {:?}", name, id, s),
            None => format!("{:<12}#{} <unknown>", name, id),
        },
        (Op::Call, Operand::Id(id)) => match program.function(id) {
            Some(f) => format!("{:<12}#{} {}", name, id, f.name),
            None => format!("{:<12}#{} <unknown>", name, id),
        },
        (Op::CallNative, Operand::Id(id)) => match program.native(id) {
            Some(n) => format!("{:<12}#{} {}", name, id, n.name),
            None => format!("{:<12}#{} <unknown>", name, id),
        },
        (_, Operand::Id(id)) => format!("{:<12}#{}", name, id),
        (_, Operand::Slot(slot)) => format!("{:<12}@{}", name, slot),
        (_, Operand::Context { context, slot }) => {
            format!("{:<12}ctx {} @{}", name, context, slot)
        }
        (_, Operand::Branch(offset)) => {
            let target = instr.branch_target().unwrap_or_default();
            let arrow = if offset < 0 { "↑" } else { "↓" };
            format!("{:<12}{:+} {} (→ {:04})", name, offset, arrow, target)
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Opcode frequency table over all functions
pub fn bc_stats(program: &CompiledProgram) -> String {
    let mut output = String::from("=== BYTECODE STATISTICS ===\n\n");

    let total_bytes: usize = program.functions.iter().map(|f| f.code.len()).sum();
    let mut op_counts: HashMap<&'static str, usize> = HashMap::new();
    let mut total_ops = 0usize;
    for function in &program.functions {
        let (instrs, _) = decode_all(&function.code);
        total_ops += instrs.len();
        for instr in instrs {
            *op_counts.entry(instr.op.mnemonic()).or_insert(0) += 1;
        }
    }

    output.push_str(&format!("Functions:    {}\n", program.functions.len()));
    output.push_str(&format!("Constants:    {}\n", program.constants.len()));
    output.push_str(&format!("Natives:      {}\n", program.natives.len()));
    output.push_str(&format!("Instructions: {}\n", total_ops));
    output.push_str(&format!("Code bytes:   {}\n\n", total_bytes));

    output.push_str("Op frequency:\n");
    let mut counts: Vec<_> = op_counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    for (op, count) in counts.iter().take(10) {
        let pct = (*count as f64 / total_ops.max(1) as f64) * 100.0;
        output.push_str(&format!("  {:<14} {:>4} ({:>5.1}%)\n", op, count, pct));
    }
    output
}
