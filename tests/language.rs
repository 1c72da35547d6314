use mathvm::lang::node::{AstFunction, BinaryOp, Block, Node, Param, StoreOp};
use mathvm::runtime::runtime_error::RuntimeErrorKind;
use mathvm::{CompiledProgram, Interpreter, Value, Var, VarType};
use pretty_assertions::assert_eq;

// =============================================================================
// Helpers
// =============================================================================

fn compile(block: Block) -> CompiledProgram {
    match mathvm::compile(&AstFunction::top(block)) {
        Ok(program) => program,
        Err(e) => panic!("compilation should succeed, got: {}", e),
    }
}

fn run_program(program: &CompiledProgram, bindings: &[Var]) -> (String, Result<Vec<Var>, mathvm::RuntimeError>) {
    let mut vm = Interpreter::new(Vec::new());
    let result = vm.run(program, bindings);
    (String::from_utf8(vm.into_output()).unwrap(), result)
}

fn output_of(block: Block) -> String {
    let (out, result) = run_program(&compile(block), &[]);
    if let Err(e) = result {
        panic!("execution should succeed, got: {}", e);
    }
    out
}

fn print(nodes: Vec<Node>) -> Node {
    Node::print(nodes)
}

// =============================================================================
// Programs
// =============================================================================

#[test]
fn test_print_each_literal_kind() {
    let block = Block::new(vec![print(vec![
        Node::int(7),
        Node::string(","),
        Node::double(0.5),
        Node::string(","),
        Node::string("text"),
    ])]);
    assert_eq!(output_of(block), "7,0.5,text");
}

#[test]
fn test_int_plus_double_prints_double() {
    let block = Block::new(vec![print(vec![Node::binary(
        BinaryOp::Add,
        Node::int(1),
        Node::double(2.0),
    )])]);
    assert_eq!(output_of(block), "3.0");
}

#[test]
fn test_mixed_equality_is_true() {
    let block = Block::new(vec![print(vec![Node::binary(
        BinaryOp::Eq,
        Node::double(2.0),
        Node::int(2),
    )])]);
    assert_eq!(output_of(block), "1");
}

#[test]
fn test_for_loop_leaves_counter_past_end() {
    let block = Block::new(vec![Node::for_range(
        "i",
        Node::int(1),
        Node::int(3),
        Block::new(vec![print(vec![Node::load("i")])]),
    )])
    .var("i", VarType::Int);

    let (out, result) = run_program(&compile(block), &[]);
    assert_eq!(out, "123");
    assert_eq!(result.unwrap(), vec![Var::new("i", Value::Int(4))]);
}

#[test]
fn test_short_circuit_skips_right_operand() {
    let g = AstFunction::new(
        "g",
        vec![],
        VarType::Int,
        Block::new(vec![
            print(vec![Node::string("g")]),
            Node::ret(Some(Node::int(1))),
        ]),
    );
    let block = Block::new(vec![
        print(vec![Node::binary(BinaryOp::And, Node::int(0), Node::call("g", vec![]))]),
        print(vec![Node::binary(BinaryOp::Or, Node::int(1), Node::call("g", vec![]))]),
        print(vec![Node::binary(BinaryOp::And, Node::int(1), Node::call("g", vec![]))]),
    ])
    .function(g);
    assert_eq!(output_of(block), "01g1");
}

#[test]
fn test_nested_function_updates_enclosing_variable() {
    let add = AstFunction::new(
        "add",
        vec![Param::new("n", VarType::Int)],
        VarType::Void,
        Block::new(vec![Node::store("total", StoreOp::AddAssign, Node::load("n"))]),
    );
    let block = Block::new(vec![
        Node::for_range(
            "i",
            Node::int(1),
            Node::int(4),
            Block::new(vec![Node::call("add", vec![Node::load("i")])]),
        ),
        print(vec![Node::load("total")]),
    ])
    .var("total", VarType::Int)
    .var("i", VarType::Int)
    .function(add);
    assert_eq!(output_of(block), "10");
}

#[test]
fn test_recursive_fibonacci_with_helper() {
    // fun fib(n) { fun small() -> int { return n < 2 } if small() { return n } return fib(n-1) + fib(n-2) }
    let small = AstFunction::new(
        "small",
        vec![],
        VarType::Int,
        Block::new(vec![Node::ret(Some(Node::binary(
            BinaryOp::Lt,
            Node::load("n"),
            Node::int(2),
        )))]),
    );
    let fib = AstFunction::new(
        "fib",
        vec![Param::new("n", VarType::Int)],
        VarType::Int,
        Block::new(vec![
            Node::if_then(
                Node::call("small", vec![]),
                Block::new(vec![Node::ret(Some(Node::load("n")))]),
                None,
            ),
            Node::ret(Some(Node::binary(
                BinaryOp::Add,
                Node::call(
                    "fib",
                    vec![Node::binary(BinaryOp::Sub, Node::load("n"), Node::int(1))],
                ),
                Node::call(
                    "fib",
                    vec![Node::binary(BinaryOp::Sub, Node::load("n"), Node::int(2))],
                ),
            ))),
        ])
        .function(small),
    );
    let block = Block::new(vec![print(vec![Node::call("fib", vec![Node::int(15)])])]).function(fib);
    assert_eq!(output_of(block), "610");
}

#[test]
fn test_division_by_zero_stops_output() {
    let block = Block::new(vec![
        print(vec![Node::string("a")]),
        print(vec![Node::binary(BinaryOp::Div, Node::int(1), Node::int(0))]),
        print(vec![Node::string("b")]),
    ]);
    let (out, result) = run_program(&compile(block), &[]);
    assert_eq!(out, "a");
    assert_eq!(result.unwrap_err().kind, RuntimeErrorKind::DivisionByZero);
}

#[test]
fn test_undeclared_function_reports_call_site() {
    let top = AstFunction::top(Block::new(vec![Node::call("missing", vec![]).at(17)]));
    let err = mathvm::compile(&top).unwrap_err();
    assert_eq!(err.position, 17);
    assert!(err.to_string().contains("undeclared function 'missing'"));
}

#[test]
fn test_type_error_is_rejected() {
    let top = AstFunction::top(Block::new(vec![print(vec![Node::binary(
        BinaryOp::Add,
        Node::string("a"),
        Node::int(1),
    )])]));
    assert!(mathvm::compile(&top).is_err());
}

// =============================================================================
// Natives and bindings
// =============================================================================

#[test]
fn test_platform_natives() {
    let pow = AstFunction::new(
        "pow",
        vec![Param::new("x", VarType::Double), Param::new("y", VarType::Double)],
        VarType::Double,
        Block::new(vec![Node::native("pow")]),
    );
    let block = Block::new(vec![print(vec![Node::call(
        "pow",
        vec![Node::int(2), Node::int(10)],
    )])])
    .function(pow);
    assert_eq!(output_of(block), "1024.0");
}

#[test]
fn test_bindings_flow_through_execution() {
    let block = Block::new(vec![
        Node::assign(
            "area",
            Node::binary(BinaryOp::Mul, Node::load("w"), Node::load("h")),
        ),
        print(vec![Node::load("label"), Node::string("="), Node::load("area")]),
    ])
    .var("w", VarType::Double)
    .var("h", VarType::Double)
    .var("area", VarType::Double)
    .var("label", VarType::String);

    let (out, result) = run_program(
        &compile(block),
        &[
            Var::new("w", Value::Double(1.5)),
            Var::new("h", Value::Double(4.0)),
            Var::new("label", Value::string("rect")),
        ],
    );
    assert_eq!(out, "rect=6.0");
    assert_eq!(
        result.unwrap(),
        vec![
            Var::new("w", Value::Double(1.5)),
            Var::new("h", Value::Double(4.0)),
            Var::new("area", Value::Double(6.0)),
            Var::new("label", Value::string("rect")),
        ]
    );
}

// =============================================================================
// Serialization
// =============================================================================

#[test]
fn test_serialized_program_runs_identically() {
    let block = Block::new(vec![Node::while_loop(
        Node::binary(BinaryOp::Lt, Node::load("n"), Node::int(3)),
        Block::new(vec![
            print(vec![Node::load("n"), Node::string(" ")]),
            Node::store("n", StoreOp::AddAssign, Node::int(1)),
        ]),
    )])
    .var("n", VarType::Int);
    let program = compile(block);

    let bytes = program.to_bytes().unwrap();
    let loaded = CompiledProgram::from_bytes(&bytes).unwrap();
    assert_eq!(loaded, program);

    let (original, _) = run_program(&program, &[]);
    let (reloaded, _) = run_program(&loaded, &[]);
    assert_eq!(original, "0 1 2 ");
    assert_eq!(reloaded, original);
}

#[test]
fn test_corrupted_program_is_rejected() {
    let mut program = compile(Block::new(vec![print(vec![Node::int(1)])]));
    program.functions[0].code.insert(0, 0xee);
    let bytes = program.to_bytes().unwrap();
    assert!(CompiledProgram::from_bytes(&bytes).is_err());
}

#[test]
fn test_ast_json_is_accepted() {
    let top = AstFunction::top(Block::new(vec![print(vec![Node::string("json")])]));
    let text = serde_json::to_string(&top).unwrap();
    let parsed: AstFunction = serde_json::from_str(&text).unwrap();
    assert_eq!(output_of(parsed.body), "json");
}
