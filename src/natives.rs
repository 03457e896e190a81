//! Native bindings: host functions registered by name before compilation
//! and invoked by the VM through NATIVE_CALL. A native sees a raw window
//! over its argument slots and returns exactly one [`Data`].

use std::io::BufRead;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bytecode::Data;
use crate::ir::TypeTag;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NativeError {
    #[error("native '{name}' expected {expected} argument(s), got {got}")]
    ArgCount { name: &'static str, expected: usize, got: usize },
    #[error("native '{name}' expected a {expected} argument")]
    ArgType { name: &'static str, expected: &'static str },
    #[error("could not read input: {0}")]
    Input(String),
}

pub type NativeFn = fn(args: &[Data]) -> Result<Data, NativeError>;

/// A registered native: its source-level name, declared signature (slot
/// types; `ret` of `None` means void), and the host function. The front end
/// type-checks calls against the signature; the VM never looks at it.
#[derive(Debug, Clone)]
pub struct NativeDef {
    pub name: &'static str,
    pub args: &'static [TypeTag],
    pub ret: Option<TypeTag>,
    pub func: NativeFn,
}

/// The reference bindings. `Data` has no string representation, so `print`
/// takes one integer and `input` reads one character.
pub fn default_natives() -> Vec<NativeDef> {
    vec![
        NativeDef { name: "print", args: &[TypeTag::Integer], ret: None, func: native_print },
        NativeDef { name: "input", args: &[], ret: Some(TypeTag::Char), func: native_input },
        NativeDef { name: "clock", args: &[], ret: Some(TypeTag::Double), func: native_clock },
        NativeDef { name: "inputInt", args: &[], ret: Some(TypeTag::Integer), func: native_input_int },
        NativeDef { name: "rand", args: &[], ret: Some(TypeTag::Float), func: native_rand },
    ]
}

fn native_print(args: &[Data]) -> Result<Data, NativeError> {
    let [value] = args else {
        return Err(NativeError::ArgCount { name: "print", expected: 1, got: args.len() });
    };
    let value = value
        .as_int()
        .ok_or(NativeError::ArgType { name: "print", expected: "int" })?;
    println!("{value}");
    Ok(Data::default())
}

fn native_input(args: &[Data]) -> Result<Data, NativeError> {
    if !args.is_empty() {
        return Err(NativeError::ArgCount { name: "input", expected: 0, got: args.len() });
    }
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| NativeError::Input(e.to_string()))?;
    let c = line.chars().next().unwrap_or('\0');
    Ok(Data::Char(c))
}

fn native_clock(args: &[Data]) -> Result<Data, NativeError> {
    if !args.is_empty() {
        return Err(NativeError::ArgCount { name: "clock", expected: 0, got: args.len() });
    }
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Data::Double(secs))
}

fn native_input_int(args: &[Data]) -> Result<Data, NativeError> {
    if !args.is_empty() {
        return Err(NativeError::ArgCount { name: "inputInt", expected: 0, got: args.len() });
    }
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| NativeError::Input(e.to_string()))?;
    let value: i64 = line
        .trim()
        .parse()
        .map_err(|_| NativeError::Input(format!("not an integer: '{}'", line.trim())))?;
    Ok(Data::Int(value))
}

fn native_rand(args: &[Data]) -> Result<Data, NativeError> {
    if !args.is_empty() {
        return Err(NativeError::ArgCount { name: "rand", expected: 0, got: args.len() });
    }
    Ok(Data::Float(fastrand::f32()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_holds_the_reference_bindings() {
        let natives = default_natives();
        let names: Vec<&str> = natives.iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["print", "input", "clock", "inputInt", "rand"]);
    }

    #[test]
    fn print_rejects_wrong_arity_and_representation() {
        assert!(matches!(
            native_print(&[]),
            Err(NativeError::ArgCount { name: "print", .. })
        ));
        assert!(matches!(
            native_print(&[Data::Bool(true)]),
            Err(NativeError::ArgType { name: "print", .. })
        ));
    }

    #[test]
    fn rand_stays_in_unit_range() {
        let Data::Float(v) = native_rand(&[]).unwrap() else {
            panic!("rand must return a float");
        };
        assert!((0.0..1.0).contains(&v));
    }
}
