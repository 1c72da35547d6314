use std::{env, fs, path::Path, sync::Once};

use mathvm::bytecode::disasm::{bc_stats, print_bc};
use mathvm::{AstFunction, CompiledProgram, Value, Var};

static TRACING_INIT: Once = Once::new();

/// Enable with `RUST_LOG=mathvm=debug` or `RUST_LOG=mathvm=trace`.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        // Only initialize if RUST_LOG is set
        if env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_level(true),
                )
                .with(filter)
                .init();
        }
    });
}

struct Options {
    filename: String,
    bytecode: bool,
    stats: bool,
    no_run: bool,
    emit: Option<String>,
    bindings: Vec<Var>,
}

fn main() {
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("Error: {}", message);
            print_usage();
            std::process::exit(1);
        }
    };

    let program = load_program(&options.filename);

    if options.bytecode {
        print_bc(&program);
    }
    if options.stats {
        print!("{}", bc_stats(&program));
    }

    if let Some(path) = &options.emit {
        let bytes = match program.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => fail("Encode error", e),
        };
        if let Err(e) = fs::write(path, bytes) {
            fail(&format!("Failed to write '{}'", path), e);
        }
    }

    if options.no_run {
        return;
    }

    match mathvm::execute(&program, &options.bindings) {
        Ok(finals) => {
            if !options.bindings.is_empty() {
                for var in finals {
                    eprintln!("{} = {}", var.name, display_value(&var.value));
                }
            }
        }
        Err(e) => fail("Runtime error", e),
    }
}

fn print_usage() {
    println!("MATHVM - bytecode compiler and stack VM");
    println!();
    println!("Usage:");
    println!("  mathvm <program.json>             Compile an AST and run it");
    println!("  mathvm <program.mvmc>             Run a compiled program");
    println!("  mathvm --bc <file>                Print the disassembly before running");
    println!("  mathvm --stats <file>             Print opcode statistics before running");
    println!("  mathvm --emit <out.mvmc> <file>   Write the compiled program");
    println!("  mathvm --no-run <file>            Stop after compiling");
    println!("  mathvm --set name=value <file>    Bind a top-level variable");
    println!("  mathvm --help, -h                 Show this help");
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut filename = None;
    let mut options = Options {
        filename: String::new(),
        bytecode: false,
        stats: false,
        no_run: false,
        emit: None,
        bindings: Vec::new(),
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--bc" | "--bytecode" => options.bytecode = true,
            "--stats" => options.stats = true,
            "--no-run" => options.no_run = true,
            "--emit" => {
                let path = iter.next().ok_or("--emit needs an output path")?;
                options.emit = Some(path.clone());
            }
            "--set" => {
                let binding = iter.next().ok_or("--set needs name=value")?;
                options.bindings.push(parse_binding(binding)?);
            }
            flag if flag.starts_with('-') => return Err(format!("unknown flag '{}'", flag)),
            // first non-flag argument is the filename
            file if filename.is_none() => filename = Some(file.to_string()),
            extra => return Err(format!("unexpected argument '{}'", extra)),
        }
    }

    options.filename = filename.ok_or("missing program file")?;
    Ok(options)
}

/// `name=42` binds an int, `name=4.2` a double, anything else a string.
fn parse_binding(text: &str) -> Result<Var, String> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| format!("binding '{}' is not name=value", text))?;
    let value = if let Ok(n) = value.parse::<i64>() {
        Value::Int(n)
    } else if let Ok(n) = value.parse::<f64>() {
        Value::Double(n)
    } else {
        Value::string(value)
    };
    Ok(Var::new(name, value))
}

fn load_program(filename: &str) -> CompiledProgram {
    let extension = Path::new(filename).extension().and_then(|e| e.to_str());

    match extension {
        Some("json") => {
            let source = match fs::read_to_string(filename) {
                Ok(source) => source,
                Err(e) => fail(&format!("Failed to read '{}'", filename), e),
            };
            let top: AstFunction = match serde_json::from_str(&source) {
                Ok(top) => top,
                Err(e) => fail("AST error", e),
            };
            match mathvm::compile(&top) {
                Ok(program) => program,
                Err(e) => fail("Compile failed", e),
            }
        }
        Some("mvmc") => {
            let bytes = match fs::read(filename) {
                Ok(bytes) => bytes,
                Err(e) => fail(&format!("Failed to read '{}'", filename), e),
            };
            match CompiledProgram::from_bytes(&bytes) {
                Ok(program) => program,
                Err(e) => fail("Load error", e),
            }
        }
        _ => {
            eprintln!("Error: expected a .json or .mvmc file, got {}", filename);
            std::process::exit(1);
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Int(n) => n.to_string(),
        Value::Double(n) => mathvm::lang::value::format_double(*n),
        Value::Str(_) => format!("{:?}", value.as_host_str().unwrap_or_default()),
    }
}

fn fail(context: &str, error: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", context, error);
    std::process::exit(1);
}
