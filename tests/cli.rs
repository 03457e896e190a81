use std::io::Write;
use std::process::Command;

fn kiln() -> Command {
    Command::new(env!("CARGO_BIN_EXE_kiln"))
}

// --- Inline source ---

#[test]
fn eval_prints_an_integer() {
    let out = kiln()
        .args(["--eval", "print(42);"])
        .output()
        .expect("failed to run kiln");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "42");
}

#[test]
fn eval_arithmetic_and_globals() {
    let out = kiln()
        .args(["--eval", "int x = 2; int y = 3; print(x + y * 2);"])
        .output()
        .expect("failed to run kiln");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "8");
}

#[test]
fn eval_loop_prints_each_iteration() {
    let out = kiln()
        .args(["--eval", "for (int i = 3; i > 0; i = i - 1) { print(i); }"])
        .output()
        .expect("failed to run kiln");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["3", "2", "1"]);
}

#[test]
fn eval_function_call() {
    let out = kiln()
        .args(["--eval", "int dbl(int x) { return x * 2; } print(dbl(21));"])
        .output()
        .expect("failed to run kiln");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "42");
}

// --- File-based run ---

#[test]
fn runs_a_source_file() {
    let mut file = tempfile::Builder::new()
        .suffix(".kn")
        .tempfile()
        .expect("temp file");
    writeln!(file, "int[3] xs; xs[0] = 7; xs[2] = 35; print(xs[0] + xs[2]);").unwrap();

    let out = kiln().arg(file.path()).output().expect("failed to run kiln");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "42");
}

#[test]
fn missing_file_is_a_usage_error() {
    let out = kiln().arg("no-such-file.kn").output().expect("failed to run kiln");
    assert_eq!(out.status.code(), Some(64));
}

// --- Emit stages ---

#[test]
fn emit_tokens_lists_spans() {
    let out = kiln()
        .args(["--eval", "int x = 5;", "--emit", "tokens"])
        .output()
        .expect("failed to run kiln");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Int"), "got: {stdout}");
    assert!(stdout.contains("IntLit(5)"), "got: {stdout}");
}

#[test]
fn emit_ast_is_json() {
    let out = kiln()
        .args(["--eval", "int x = 5;", "--emit", "ast"])
        .output()
        .expect("failed to run kiln");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    let json: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert!(json.get("items").is_some(), "got: {stdout}");
}

#[test]
fn emit_ir_shows_instructions() {
    let out = kiln()
        .args(["--eval", "int x; x = 1 + 2;", "--emit", "ir"])
        .output()
        .expect("failed to run kiln");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("IADD"), "got: {stdout}");
    assert!(stdout.contains("SET_GLOBAL x"), "got: {stdout}");
}

#[test]
fn emit_bytecode_disassembles() {
    let out = kiln()
        .args(["--eval", "print(1);", "--emit", "bytecode"])
        .output()
        .expect("failed to run kiln");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("<entry>"), "got: {stdout}");
    assert!(stdout.contains("Constant"), "got: {stdout}");
    assert!(stdout.contains("NativeCall"), "got: {stdout}");
}

// --- Failure modes ---

#[test]
fn compile_error_exits_65_with_diagnostics() {
    let out = kiln()
        .args(["--eval", "undefined = 3; alsoUndefined = 4;"])
        .output()
        .expect("failed to run kiln");
    assert_eq!(out.status.code(), Some(65));
    let stderr = String::from_utf8_lossy(&out.stderr);
    // Both problems surface in one run.
    assert!(stderr.contains("undefined"), "got: {stderr}");
    assert!(stderr.contains("alsoUndefined"), "got: {stderr}");
}

#[test]
fn runtime_fault_exits_70() {
    let out = kiln()
        .args(["--eval", "int a = 1; int b = 0; print(a / b);"])
        .output()
        .expect("failed to run kiln");
    assert_eq!(out.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("division by zero"), "got: {stderr}");
}

#[test]
fn parse_error_reports_and_exits_65() {
    let out = kiln()
        .args(["--eval", "int x = ;"])
        .output()
        .expect("failed to run kiln");
    assert_eq!(out.status.code(), Some(65));
    assert!(
        String::from_utf8_lossy(&out.stderr).contains("expected an expression"),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}
