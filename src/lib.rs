pub mod ast;
pub mod bytecode;
pub mod codegen;
pub mod ir;
pub mod irgen;
pub mod lexer;
pub mod natives;
pub mod parser;
pub mod vm;

use crate::codegen::CodeGen;
use crate::natives::NativeDef;
use crate::vm::{Program, RuntimeFault, Vm};

/// Any stage's failure, carrying every diagnostic that stage reported.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Lex(#[from] lexer::LexError),
    #[error("{}", render(.0))]
    Parse(Vec<parser::ParseError>),
    #[error("{}", render(.0))]
    Compile(Vec<irgen::CompileError>),
    #[error("{}", render(.0))]
    Lower(Vec<codegen::LowerError>),
}

fn render<E: std::fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("runtime fault: {0}")]
    Runtime(#[from] RuntimeFault),
}

/// Source to a runnable program: lex, parse, compile to IR, lower to
/// bytecode. Stops at the first stage that reported diagnostics.
pub fn compile_source(source: &str, natives: &[NativeDef]) -> Result<Program, PipelineError> {
    let tokens = lexer::lex(source)?;
    let (program, parse_errors) = parser::parse(tokens);
    if !parse_errors.is_empty() {
        return Err(PipelineError::Parse(parse_errors));
    }

    let (unit, compile_errors) = irgen::compile(&program, natives);
    if !compile_errors.is_empty() {
        return Err(PipelineError::Compile(compile_errors));
    }

    let mut cg = CodeGen::new(&unit.globals);
    let chunks = unit.functions.iter().map(|ir| cg.generate(ir)).collect();
    let entry = cg.generate(&unit.entry);
    if cg.had_error() {
        return Err(PipelineError::Lower(cg.diagnostics().to_vec()));
    }

    Ok(Program { chunks, entry, globals: cg.globals().to_vec() })
}

/// Compiles and runs; the VM's final globals are returned for callers that
/// want to observe results.
pub fn run_source(source: &str, natives: &[NativeDef]) -> Result<Vec<bytecode::Data>, RunError> {
    let program = compile_source(source, natives)?;
    let mut vm = Vm::new(&program, natives);
    vm.run()?;
    Ok(vm.globals().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Data;
    use crate::natives::default_natives;

    /// Compile, run, and look a global's final value up by name.
    fn run_and_get(source: &str, name: &str) -> Data {
        let natives = default_natives();
        let (unit, errors) = irgen::compile(
            &parser::parse(lexer::lex(source).unwrap()).0,
            &natives,
        );
        assert!(errors.is_empty(), "{errors:?}");
        let slot = unit
            .globals
            .iter()
            .find(|g| g.name == name)
            .unwrap_or_else(|| panic!("no global named {name}"))
            .slot;

        let globals = run_source(source, &natives).expect("program should run");
        globals[slot]
    }

    #[test]
    fn arithmetic_with_precedence_end_to_end() {
        let source = "int x; int y; int result; x = 2; y = 3; result = x + y * 2;";
        assert_eq!(run_and_get(source, "result"), Data::Int(8));
    }

    #[test]
    fn global_initializers_fold_and_compute() {
        let source = "int a = 5; int b = a * 2; int result; result = a + b;";
        assert_eq!(run_and_get(source, "result"), Data::Int(15));
    }

    #[test]
    fn function_calls_recurse() {
        let source = "
            int fib(int n) {
                if (n < 2) { return n; }
                return fib(n - 1) + fib(n - 2);
            }
            int result = fib(10);
        ";
        assert_eq!(run_and_get(source, "result"), Data::Int(55));
    }

    #[test]
    fn while_loop_counts_down() {
        let source = "
            int result = 0;
            int i = 5;
            while (i > 0) {
                result = result + i;
                i = i - 1;
            }
        ";
        assert_eq!(run_and_get(source, "result"), Data::Int(15));
    }

    #[test]
    fn for_loop_with_cast() {
        let source = "
            double total = 0.0;
            for (int i = 1; i <= 4; ++i) {
                total = total + (double)i;
            }
        ";
        assert_eq!(run_and_get(source, "total"), Data::Double(10.0));
    }

    #[test]
    fn arrays_store_and_load_by_runtime_index() {
        let source = "
            int[4] xs;
            int i;
            for (i = 0; i < 4; i = i + 1) {
                xs[i] = i * i;
            }
            int result = xs[3];
        ";
        assert_eq!(run_and_get(source, "result"), Data::Int(9));
    }

    #[test]
    fn short_circuit_avoids_division_by_zero() {
        let source = "
            int d = 0;
            bool safe;
            safe = d != 0 and 10 / d > 1;
        ";
        assert_eq!(run_and_get(source, "safe"), Data::Bool(false));
    }

    #[test]
    fn float_widens_to_double_in_mixed_arithmetic() {
        let source = "double result; result = 1.5f + 2.0;";
        assert_eq!(run_and_get(source, "result"), Data::Double(3.5));
    }

    #[test]
    fn compile_errors_stop_before_the_vm() {
        let natives = default_natives();
        let err = run_source("undefined = 3;", &natives).unwrap_err();
        assert!(matches!(err, RunError::Pipeline(PipelineError::Compile(_))));
    }

    #[test]
    fn runtime_fault_is_distinguishable() {
        let natives = default_natives();
        let err = run_source("int x = 1; int y = 0; int z; z = x / y;", &natives).unwrap_err();
        assert!(matches!(
            err,
            RunError::Runtime(RuntimeFault::DivisionByZero)
        ));
    }
}
