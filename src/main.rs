use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use kiln::bytecode::disasm;
use kiln::natives::default_natives;
use kiln::vm::Vm;
use kiln::{compile_source, ir, irgen, lexer, parser};

/// kiln — a small statically typed language compiled to a stack-based
/// bytecode VM.
#[derive(Parser)]
#[command(name = "kiln", version, about)]
struct Cli {
    /// Source file to run.
    file: Option<PathBuf>,

    /// Inline source to run instead of a file.
    #[arg(short, long, value_name = "SOURCE")]
    eval: Option<String>,

    /// Stop after a stage and print its output.
    #[arg(long, value_enum, value_name = "STAGE")]
    emit: Option<Emit>,
}

#[derive(clap::ValueEnum, Clone, Copy)]
enum Emit {
    Tokens,
    Ast,
    Ir,
    Bytecode,
}

const EXIT_USAGE: u8 = 64;
const EXIT_COMPILE: u8 = 65;
const EXIT_RUNTIME: u8 = 70;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let source = match (&cli.eval, &cli.file) {
        (Some(source), _) => source.clone(),
        (None, Some(path)) => match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("error reading {}: {e}", path.display());
                return ExitCode::from(EXIT_USAGE);
            }
        },
        (None, None) => {
            eprintln!("usage: kiln <file.kn> | kiln --eval '<source>'");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let natives = default_natives();

    let tokens = match lexer::lex(&source) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_COMPILE);
        }
    };
    if matches!(cli.emit, Some(Emit::Tokens)) {
        for (token, span) in &tokens {
            println!("{:>4}..{:<4} {token:?}", span.start, span.end);
        }
        return ExitCode::SUCCESS;
    }

    let (program, parse_errors) = parser::parse(tokens);
    if !parse_errors.is_empty() {
        for e in &parse_errors {
            eprintln!("{e}");
        }
        return ExitCode::from(EXIT_COMPILE);
    }
    if matches!(cli.emit, Some(Emit::Ast)) {
        match serde_json::to_string_pretty(&program) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("serialization error: {e}");
                return ExitCode::from(EXIT_COMPILE);
            }
        }
        return ExitCode::SUCCESS;
    }

    if matches!(cli.emit, Some(Emit::Ir)) {
        let (unit, errors) = irgen::compile(&program, &natives);
        if !errors.is_empty() {
            for e in &errors {
                eprintln!("{e}");
            }
            return ExitCode::from(EXIT_COMPILE);
        }
        for (ir_chunk, name) in unit.functions.iter().zip(&unit.func_names) {
            print!("{}", ir::dump(ir_chunk, name));
        }
        print!("{}", ir::dump(&unit.entry, "<entry>"));
        return ExitCode::SUCCESS;
    }

    let compiled = match compile_source(&source, &natives) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_COMPILE);
        }
    };

    if matches!(cli.emit, Some(Emit::Bytecode)) {
        for (i, chunk) in compiled.chunks.iter().enumerate() {
            print!("{}", disasm::disassemble_chunk(chunk, &format!("fn #{i}")));
        }
        print!("{}", disasm::disassemble_chunk(&compiled.entry, "<entry>"));
        return ExitCode::SUCCESS;
    }

    let mut vm = Vm::new(&compiled, &natives);
    if let Err(fault) = vm.run() {
        eprintln!("runtime fault: {fault}");
        return ExitCode::from(EXIT_RUNTIME);
    }
    ExitCode::SUCCESS
}
