//! Human-readable dump of a [`Chunk`], one instruction per line.

use super::{Chunk, OpCode};

/// Disassembles the instruction starting at `offset`, appending to `out`.
/// Returns the offset of the next instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    use std::fmt::Write;

    let _ = write!(out, "{offset:04} ");
    let byte = chunk.code[offset];
    let Some(op) = OpCode::decode(byte) else {
        let _ = writeln!(out, "??       (byte {byte})");
        return offset + 1;
    };

    let operands = op.operand_count();
    let _ = write!(out, "{:<14}", format!("{op:?}"));
    for i in 0..operands {
        match chunk.code.get(offset + 1 + i) {
            Some(b) => {
                let _ = write!(out, " {b:>3}");
            }
            None => {
                let _ = write!(out, " <truncated>");
            }
        }
    }

    if op == OpCode::Constant {
        if let Some(val) = chunk
            .code
            .get(offset + 1)
            .and_then(|&addr| chunk.get_constant(addr as usize))
        {
            let _ = write!(out, "    ; {val}");
        }
    }

    let _ = writeln!(out);
    offset + 1 + operands
}

/// Disassembles a whole chunk, constant pool first.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    for (i, c) in chunk.constants.iter().enumerate() {
        let _ = writeln!(out, "const [{i}] = {c}");
    }

    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Data;

    #[test]
    fn disassembles_constants_and_operands() {
        let mut chunk = Chunk::new();
        let addr = chunk.add_constant(Data::Int(42)) as u8;
        chunk.emit1(OpCode::Constant, addr);
        chunk.emit(OpCode::IAdd);
        chunk.emit2(OpCode::GetLocalN, 1, 4);

        let text = disassemble_chunk(&chunk, "test");
        assert!(text.contains("== test =="));
        assert!(text.contains("const [0] = 42"));
        assert!(text.contains("Constant"));
        assert!(text.contains("; 42"));
        assert!(text.contains("GetLocalN"));
    }

    #[test]
    fn steps_past_operand_bytes() {
        let mut chunk = Chunk::new();
        chunk.emit2(OpCode::Cast, 0, 2);
        chunk.emit(OpCode::Return);

        let mut out = String::new();
        let next = disassemble_instruction(&chunk, 0, &mut out);
        assert_eq!(next, 3);
    }
}
