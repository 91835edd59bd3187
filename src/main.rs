use std::{env, fs, path::Path, process};

use tracing_subscriber::EnvFilter;

use cinder::bytecode::disasm::print_program;
use cinder::frontend::{Module, TokenDumper, Tokenizer};
use cinder::{EnvironmentState, Error, ExternalTable, Machine, MachineConfig, compile_source};

/// Host frame rate the CLI simulates while driving a script.
const FRAME_RATE: f64 = 60.0;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let tokens_only = args.contains(&"--tokens".to_string());
    let no_color = args.contains(&"--no-color".to_string());
    let pretty = args.contains(&"--pretty".to_string());
    let bytecode = args.contains(&"--bc".to_string()) || args.contains(&"--bytecode".to_string());

    // first non-flag argument is the filename
    let Some(filename) = args.iter().skip(1).find(|a| !a.starts_with('-')) else {
        print_usage();
        process::exit(if args.len() == 1 { 0 } else { 1 });
    };

    ensure_extension(filename);
    let source = match fs::read_to_string(filename) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", filename, e);
            process::exit(1);
        }
    };

    if tokens_only {
        dump_tokens(filename, &source, no_color, pretty);
    } else if let Err(e) = run_program(filename, &source, bytecode) {
        eprintln!("{}", e.render(&source));
        process::exit(1);
    }
}

fn ensure_extension(filename: &str) {
    let path = Path::new(filename);
    if path.extension().and_then(|e| e.to_str()) != Some("cn") {
        eprintln!("Error: expected a .cn file, got {}", filename);
        process::exit(1);
    }
}

fn print_usage() {
    println!("CINDER - embeddable scripting language");
    println!();
    println!("Usage:");
    println!("  cinder <file.cn>            Run a script to completion");
    println!("  cinder --tokens <file.cn>   Show tokens only (--pretty hides layout tokens)");
    println!("  cinder --bc <file.cn>       Print the disassembly, then run");
    println!("  cinder --no-color           Plain token dump");
    println!("  cinder --help, -h           Show this help");
    println!();
    println!("Scripts may declare these externals:");
    println!("  external function Print(String text)");
    println!("  external function PrintInt(Int value)");
    println!("  external function PrintFloat(Float value)");
    println!("  external function PrintBool(Bool value)");
    println!();
    println!("Logging is controlled with RUST_LOG (default: warn).");
}

fn dump_tokens(filename: &str, source: &str, no_color: bool, pretty: bool) {
    let mut module = Module::new(filename, source);
    if let Err(e) = Tokenizer::tokenize_module(&mut module) {
        eprintln!("tokenizer error: {}", e.render(source));
        process::exit(1);
    }

    let mut dumper = TokenDumper::new();
    if no_color {
        dumper = dumper.no_color();
    }
    if pretty {
        dumper = dumper.pretty();
    }
    dumper.dump(&module.tokens);
}

fn run_program(filename: &str, source: &str, bytecode: bool) -> Result<(), Error> {
    let program = compile_source(filename, source)?;
    if bytecode {
        print_program(&program);
    }

    let mut machine = Machine::with_config(MachineConfig::default());
    machine.boot(program)?;
    machine.bind_externals(&console_externals())?;

    let delta_time = 1.0 / FRAME_RATE;
    let mut env = EnvironmentState {
        time: 0.0,
        delta_time,
    };
    while !machine.run(env)? {
        env.time += delta_time;
    }
    machine.dispose();
    Ok(())
}

/// Console output for scripts; only the names a script declares are bound.
fn console_externals() -> ExternalTable {
    let mut table = ExternalTable::new();
    table
        .register("Print", |machine: &mut Machine| {
            let address = machine.pop_word()?;
            println!("{}", machine.read_string(address)?);
            Ok(())
        })
        .register("PrintInt", |machine: &mut Machine| {
            println!("{}", machine.pop_int()?);
            Ok(())
        })
        .register("PrintFloat", |machine: &mut Machine| {
            println!("{}", machine.pop_float()?);
            Ok(())
        })
        .register("PrintBool", |machine: &mut Machine| {
            println!("{}", machine.pop_bool()?);
            Ok(())
        });
    table
}
