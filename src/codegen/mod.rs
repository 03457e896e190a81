//! Lowering pass: one [`IrChunk`] in, one [`Chunk`] out, in a single
//! forward sweep. Selects opcode variants by type tag and access width,
//! resolves global names against the symbol table, and patches forward jump
//! offsets when their label is reached. Diagnostics accumulate; lowering
//! keeps going so one run surfaces every problem.

use crate::bytecode::{Chunk, Data, OpCode};
use crate::ir::{BitOp, Instruction, IrChunk, JumpMode, LabelId, TypeTag};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LowerError {
    #[error("{space} address {value} does not fit in one byte")]
    AddressOverflow { space: &'static str, value: usize },
    #[error("jump of {distance} bytes does not fit in a one-byte offset")]
    JumpTooLong { distance: usize },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// One resolved global: its slot, its width in slots, and the initial
/// values for those slots. Produced by the front end.
#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub name: String,
    pub slot: usize,
    pub size: usize,
    pub init: Vec<Data>,
}

#[derive(Debug, Default)]
struct LabelState {
    pos: Option<usize>,
    pending: Vec<usize>,
}

pub struct CodeGen {
    globals: Vec<Data>,
    /// Resolved global name -> base slot.
    global_info: Vec<(String, usize)>,
    chunk: Chunk,
    const_addrs: Vec<usize>,
    labels: Vec<LabelState>,
    pos: usize,
    diagnostics: Vec<LowerError>,
}

impl CodeGen {
    /// Seeds the globals snapshot from the front end's resolved symbol
    /// table. The snapshot plus the lowered chunks are everything the VM
    /// needs to start.
    pub fn new(defs: &[GlobalDef]) -> Self {
        let total: usize = defs.iter().map(|d| d.slot + d.size).max().unwrap_or(0);
        let mut globals = vec![Data::default(); total];
        let mut global_info = Vec::with_capacity(defs.len());
        for def in defs {
            for (i, val) in def.init.iter().enumerate() {
                globals[def.slot + i] = *val;
            }
            global_info.push((def.name.clone(), def.slot));
        }

        CodeGen {
            globals,
            global_info,
            chunk: Chunk::new(),
            const_addrs: Vec::new(),
            labels: Vec::new(),
            pos: 0,
            diagnostics: Vec::new(),
        }
    }

    pub fn globals(&self) -> &[Data] {
        &self.globals
    }

    pub fn diagnostics(&self) -> &[LowerError] {
        &self.diagnostics
    }

    pub fn had_error(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    fn report(&mut self, err: LowerError) {
        self.diagnostics.push(err);
    }

    /// Narrows an operand to one byte, reporting the overflow but emitting
    /// the truncated value so the byte layout (and `pos`) stays consistent
    /// for everything already lowered.
    fn operand(&mut self, value: usize, space: &'static str) -> u8 {
        if value > u8::MAX as usize {
            self.report(LowerError::AddressOverflow { space, value });
        }
        value as u8
    }

    fn resolve_global(&mut self, name: &str) -> Option<usize> {
        let found = self.global_info.iter().find(|(n, _)| n == name).map(|(_, slot)| *slot);
        if found.is_none() {
            self.report(LowerError::InvariantViolation(format!(
                "global '{name}' reached lowering unresolved"
            )));
        }
        found
    }

    fn emit(&mut self, op: OpCode) {
        self.chunk.emit(op);
        self.pos += 1;
    }

    fn emit1(&mut self, op: OpCode, a: u8) {
        self.chunk.emit1(op, a);
        self.pos += 2;
    }

    fn emit2(&mut self, op: OpCode, a: u8, b: u8) {
        self.chunk.emit2(op, a, b);
        self.pos += 3;
    }

    /// Size 1 emits the base opcode with the resolved address; a wider
    /// access emits the `N` variant with an extra slot-count byte. The
    /// offset flag selects the `_OFF` family (a runtime slot offset is on
    /// the stack).
    fn emit_access(
        &mut self,
        quad: [OpCode; 4],
        addr: usize,
        size: usize,
        offset: bool,
        space: &'static str,
    ) {
        let [base, base_n, off, off_n] = quad;
        let addr = self.operand(addr, space);
        match (offset, size) {
            (false, 1) => self.emit1(base, addr),
            (false, _) => {
                let size = self.operand(size, "slot count");
                self.emit2(base_n, addr, size);
            }
            (true, 1) => self.emit1(off, addr),
            (true, _) => {
                let size = self.operand(size, "slot count");
                self.emit2(off_n, addr, size);
            }
        }
    }

    fn arith_op(&mut self, ty: TypeTag, ops: [OpCode; 3], what: &str) -> Option<OpCode> {
        match ty {
            TypeTag::Integer => Some(ops[0]),
            TypeTag::Float => Some(ops[1]),
            TypeTag::Double => Some(ops[2]),
            other => {
                self.report(LowerError::InvariantViolation(format!(
                    "{what} lowered with non-numeric type tag {other}"
                )));
                None
            }
        }
    }

    fn compare_op(&mut self, ty: TypeTag, int_op: OpCode, double_op: OpCode) -> Option<OpCode> {
        match ty {
            TypeTag::Integer => Some(int_op),
            TypeTag::Double => Some(double_op),
            other => {
                self.report(LowerError::InvariantViolation(format!(
                    "comparison lowered with type tag {other}"
                )));
                None
            }
        }
    }

    /// Lowers one IR chunk into a fresh bytecode chunk. `pos` equals the
    /// number of bytes emitted at every step; label/jump resolution runs in
    /// the same forward pass.
    pub fn generate(&mut self, ir: &IrChunk) -> Chunk {
        self.chunk = Chunk::new();
        self.pos = 0;
        self.const_addrs.clear();
        self.labels = (0..ir.label_count()).map(|_| LabelState::default()).collect();

        for &val in ir.constants() {
            let addr = self.chunk.add_constant(val);
            self.const_addrs.push(addr);
        }

        for inst in ir.code() {
            self.lower(inst);
        }

        for (id, label) in self.labels.iter().enumerate() {
            if !label.pending.is_empty() {
                let pending = label.pending.len();
                self.diagnostics.push(LowerError::InvariantViolation(format!(
                    "label L{id} never bound; {pending} jump(s) left unpatched"
                )));
            }
        }

        debug_assert_eq!(self.pos, self.chunk.len());
        std::mem::take(&mut self.chunk)
    }

    fn lower(&mut self, inst: &Instruction) {
        match inst {
            Instruction::Const { id } => {
                let addr = self.const_addrs[*id];
                if addr > u8::MAX as usize {
                    self.report(LowerError::AddressOverflow { space: "constant pool", value: addr });
                }
                self.emit1(OpCode::Constant, addr as u8);
            }
            Instruction::Cast { from, to } => {
                self.emit2(OpCode::Cast, *from as u8, *to as u8);
            }
            Instruction::Add { ty } => {
                if let Some(op) = self.arith_op(*ty, [OpCode::IAdd, OpCode::FAdd, OpCode::DAdd], "add") {
                    self.emit(op);
                }
            }
            Instruction::Sub { ty } => {
                if let Some(op) = self.arith_op(*ty, [OpCode::ISub, OpCode::FSub, OpCode::DSub], "sub") {
                    self.emit(op);
                }
            }
            Instruction::Mul { ty } => {
                if let Some(op) = self.arith_op(*ty, [OpCode::IMul, OpCode::FMul, OpCode::DMul], "mul") {
                    self.emit(op);
                }
            }
            Instruction::Div { ty } => {
                if let Some(op) = self.arith_op(*ty, [OpCode::IDiv, OpCode::FDiv, OpCode::DDiv], "div") {
                    self.emit(op);
                }
            }
            Instruction::Neg { ty } => {
                if let Some(op) = self.arith_op(*ty, [OpCode::INeg, OpCode::FNeg, OpCode::DNeg], "neg") {
                    self.emit(op);
                }
            }
            Instruction::Mod => self.emit(OpCode::Mod),
            Instruction::Bit { op } => {
                let op = match op {
                    BitOp::Not => OpCode::BitNot,
                    BitOp::And => OpCode::BitAnd,
                    BitOp::Or => OpCode::BitOr,
                    BitOp::Xor => OpCode::BitXor,
                    BitOp::ShiftLeft => OpCode::BitshiftLeft,
                    BitOp::ShiftRight => OpCode::BitshiftRight,
                };
                self.emit(op);
            }
            Instruction::Not => self.emit(OpCode::LogicNot),
            Instruction::Inc { ty, dec } => {
                let ops = if *dec {
                    [OpCode::IDec, OpCode::FDec, OpCode::DDec]
                } else {
                    [OpCode::IInc, OpCode::FInc, OpCode::DInc]
                };
                if let Some(op) = self.arith_op(*ty, ops, "increment") {
                    self.emit(op);
                }
            }
            Instruction::Less { ty } => {
                if let Some(op) = self.compare_op(*ty, OpCode::ILess, OpCode::DLess) {
                    self.emit(op);
                }
            }
            Instruction::Lte { ty } => {
                if let Some(op) = self.compare_op(*ty, OpCode::ILessEqual, OpCode::DLessEqual) {
                    self.emit(op);
                }
            }
            Instruction::Great { ty } => {
                if let Some(op) = self.compare_op(*ty, OpCode::IGreat, OpCode::DGreat) {
                    self.emit(op);
                }
            }
            Instruction::Gte { ty } => {
                if let Some(op) = self.compare_op(*ty, OpCode::IGreatEqual, OpCode::DGreatEqual) {
                    self.emit(op);
                }
            }
            Instruction::Eq { ty } => {
                if let Some(op) = self.compare_op(*ty, OpCode::IIsEqual, OpCode::DIsEqual) {
                    self.emit(op);
                }
            }
            Instruction::Neq { ty } => {
                if let Some(op) = self.compare_op(*ty, OpCode::INotEqual, OpCode::DNotEqual) {
                    self.emit(op);
                }
            }
            Instruction::GetGlobal { name, size, offset } => {
                if let Some(slot) = self.resolve_global(name) {
                    self.emit_access(
                        [OpCode::GetGlobal, OpCode::GetGlobalN, OpCode::GetGlobalOff, OpCode::GetGlobalOffN],
                        slot,
                        *size,
                        *offset,
                        "global slot",
                    );
                }
            }
            Instruction::SetGlobal { name, size, offset } => {
                if let Some(slot) = self.resolve_global(name) {
                    self.emit_access(
                        [OpCode::SetGlobal, OpCode::SetGlobalN, OpCode::SetGlobalOff, OpCode::SetGlobalOffN],
                        slot,
                        *size,
                        *offset,
                        "global slot",
                    );
                }
            }
            Instruction::GetLocal { slot, size, offset } => {
                self.emit_access(
                    [OpCode::GetLocal, OpCode::GetLocalN, OpCode::GetLocalOff, OpCode::GetLocalOffN],
                    *slot,
                    *size,
                    *offset,
                    "local slot",
                );
            }
            Instruction::SetLocal { slot, size, offset } => {
                self.emit_access(
                    [OpCode::SetLocal, OpCode::SetLocalN, OpCode::SetLocalOff, OpCode::SetLocalOffN],
                    *slot,
                    *size,
                    *offset,
                    "local slot",
                );
            }
            Instruction::AddrLocal { slot, offset } => {
                let slot = self.operand(*slot, "local slot");
                let op = if *offset { OpCode::AddrLocalOff } else { OpCode::AddrLocal };
                self.emit1(op, slot);
            }
            Instruction::AddrGlobal { name, offset } => {
                if let Some(slot) = self.resolve_global(name) {
                    let addr = self.operand(slot, "global slot");
                    let op = if *offset { OpCode::AddrGlobalOff } else { OpCode::AddrGlobal };
                    self.emit1(op, addr);
                }
            }
            Instruction::Alloc { size } => {
                let size = self.operand(*size, "allocation size");
                self.emit1(OpCode::Alloc, size);
            }
            Instruction::Free => self.emit(OpCode::Free),
            Instruction::GetDeref { size, offset } => {
                let size = self.operand(*size, "slot count");
                let op = if *offset { OpCode::GetDerefOff } else { OpCode::GetDeref };
                self.emit1(op, size);
            }
            Instruction::SetDeref { size, offset } => {
                let size = self.operand(*size, "slot count");
                let op = if *offset { OpCode::SetDerefOff } else { OpCode::SetDeref };
                self.emit1(op, size);
            }
            Instruction::Call { args, native } => {
                let width: usize = args.iter().sum();
                let width = self.operand(width, "call arguments");
                let op = if *native { OpCode::NativeCall } else { OpCode::Call };
                self.emit1(op, width);
            }
            Instruction::Pop { widths } => {
                let width: usize = widths.iter().sum();
                if width > 0 {
                    let width = self.operand(width, "pop width");
                    self.emit1(OpCode::PopN, width);
                }
            }
            Instruction::Push { widths } => {
                let width: usize = widths.iter().sum();
                if width > 0 {
                    let width = self.operand(width, "push width");
                    self.emit1(OpCode::PushN, width);
                }
            }
            Instruction::Return { size } => {
                let size = self.operand(*size, "return width");
                self.emit1(OpCode::Return, size);
            }
            Instruction::Label(LabelId(id)) => {
                let pos = self.pos;
                let pending = std::mem::take(&mut self.labels[*id].pending);
                self.labels[*id].pos = Some(pos);
                for jump_pos in pending {
                    let distance = pos - jump_pos - 2;
                    if distance > u8::MAX as usize {
                        self.report(LowerError::JumpTooLong { distance });
                    }
                    self.chunk.code[jump_pos + 1] = distance as u8;
                }
            }
            Instruction::Jump { label: LabelId(id), mode } => {
                match mode {
                    JumpMode::Always => {
                        if let Some(target) = self.labels[*id].pos {
                            // Backward edge: the target is known, encode the
                            // loop immediately.
                            let distance = self.pos + 2 - target;
                            if distance > u8::MAX as usize {
                                self.report(LowerError::JumpTooLong { distance });
                            }
                            self.emit1(OpCode::Loop, distance as u8);
                        } else {
                            self.labels[*id].pending.push(self.pos);
                            self.emit1(OpCode::Jump, 0);
                        }
                    }
                    JumpMode::IfFalse | JumpMode::IfFalsePop => {
                        // There is no conditional LOOP encoding, so a
                        // backward conditional edge cannot exist here.
                        if self.labels[*id].pos.is_some() {
                            self.report(LowerError::InvariantViolation(format!(
                                "conditional jump to already-bound label L{id}"
                            )));
                        } else {
                            self.labels[*id].pending.push(self.pos);
                        }
                        let op = if *mode == JumpMode::IfFalse {
                            OpCode::JumpNt
                        } else {
                            OpCode::JumpNtPop
                        };
                        self.emit1(op, 0);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lower(ir: &IrChunk) -> (Chunk, Vec<LowerError>) {
        let mut cg = CodeGen::new(&[]);
        let chunk = cg.generate(ir);
        (chunk, cg.diagnostics().to_vec())
    }

    #[test]
    fn straight_line_pos_equals_chunk_len() {
        let mut ir = IrChunk::new();
        let c = ir.add_constant(Data::Int(7));
        ir.write(Instruction::Const { id: c });
        ir.write(Instruction::Const { id: c });
        ir.write(Instruction::Add { ty: TypeTag::Integer });
        ir.write(Instruction::Cast { from: TypeTag::Integer, to: TypeTag::Double });
        ir.write(Instruction::GetLocal { slot: 0, size: 3, offset: false });
        ir.write(Instruction::Return { size: 1 });

        let (chunk, diags) = lower(&ir);
        assert!(diags.is_empty(), "{diags:?}");
        // 2 + 2 + 1 + 3 + 3 + 2
        assert_eq!(chunk.len(), 13);
    }

    #[test]
    fn size_and_offset_select_opcode_family() {
        let mut ir = IrChunk::new();
        ir.write(Instruction::GetLocal { slot: 2, size: 1, offset: false });
        ir.write(Instruction::GetLocal { slot: 2, size: 4, offset: false });
        ir.write(Instruction::GetLocal { slot: 2, size: 1, offset: true });
        ir.write(Instruction::GetLocal { slot: 2, size: 4, offset: true });

        let (chunk, diags) = lower(&ir);
        assert!(diags.is_empty());
        assert_eq!(
            chunk.code,
            vec![
                OpCode::GetLocal as u8, 2,
                OpCode::GetLocalN as u8, 2, 4,
                OpCode::GetLocalOff as u8, 2,
                OpCode::GetLocalOffN as u8, 2, 4,
            ]
        );
    }

    #[test]
    fn forward_jump_patched_with_documented_formula() {
        let mut ir = IrChunk::new();
        let end = ir.new_label();
        let c = ir.add_constant(Data::Bool(true));
        ir.write(Instruction::Const { id: c });
        ir.write(Instruction::Jump { label: end, mode: JumpMode::IfFalsePop });
        ir.write(Instruction::Const { id: c });
        ir.write(Instruction::Const { id: c });
        ir.write(Instruction::Label(end));

        let (chunk, diags) = lower(&ir);
        assert!(diags.is_empty());
        // Jump is emitted at byte 2, label binds at byte 8.
        let jump_pos = 2;
        let label_pos = 8;
        assert_eq!(chunk.code[jump_pos], OpCode::JumpNtPop as u8);
        assert_eq!(chunk.code[jump_pos + 1] as usize, label_pos - jump_pos - 2);
    }

    #[test]
    fn backward_jump_encodes_loop_distance() {
        let mut ir = IrChunk::new();
        let top = ir.new_label();
        let c = ir.add_constant(Data::Int(1));
        ir.write(Instruction::Label(top));
        ir.write(Instruction::Const { id: c });
        ir.write(Instruction::Jump { label: top, mode: JumpMode::Always });

        let (chunk, diags) = lower(&ir);
        assert!(diags.is_empty());
        // Label binds at 0, the jump is lowered at byte 2.
        assert_eq!(chunk.code[2], OpCode::Loop as u8);
        assert_eq!(chunk.code[3] as usize, 2 + 2 - 0);
    }

    #[test]
    fn label_at_byte_zero_is_a_valid_loop_target() {
        let mut ir = IrChunk::new();
        let top = ir.new_label();
        ir.write(Instruction::Label(top));
        ir.write(Instruction::Jump { label: top, mode: JumpMode::Always });

        let (chunk, diags) = lower(&ir);
        assert!(diags.is_empty());
        assert_eq!(chunk.code, vec![OpCode::Loop as u8, 2]);
    }

    #[test]
    fn constant_address_over_255_is_reported_not_fatal() {
        let mut ir = IrChunk::new();
        let mut last = 0;
        for i in 0..300 {
            last = ir.add_constant(Data::Int(i));
        }
        ir.write(Instruction::Const { id: 0 });
        ir.write(Instruction::Const { id: last });
        ir.write(Instruction::Add { ty: TypeTag::Integer });

        let (chunk, diags) = lower(&ir);
        assert!(diags.iter().any(|d| matches!(
            d,
            LowerError::AddressOverflow { space: "constant pool", .. }
        )));
        // Bytes emitted before and after the bad constant are intact.
        assert_eq!(chunk.code[0], OpCode::Constant as u8);
        assert_eq!(chunk.code[1], 0);
        assert_eq!(chunk.code[4], OpCode::IAdd as u8);
    }

    #[test]
    fn oversized_call_width_is_reported_and_lowering_continues() {
        let mut ir = IrChunk::new();
        ir.write(Instruction::Call { args: vec![200, 100], native: false });
        ir.write(Instruction::Return { size: 0 });

        let (chunk, diags) = lower(&ir);
        assert!(diags.iter().any(|d| matches!(
            d,
            LowerError::AddressOverflow { space: "call arguments", .. }
        )));
        assert_eq!(chunk.code[2], OpCode::Return as u8);
    }

    #[test]
    fn pointer_family_lowers_with_one_operand_byte() {
        let mut ir = IrChunk::new();
        ir.write(Instruction::Alloc { size: 4 });
        ir.write(Instruction::AddrLocal { slot: 2, offset: false });
        ir.write(Instruction::AddrLocal { slot: 2, offset: true });
        ir.write(Instruction::GetDeref { size: 4, offset: false });
        ir.write(Instruction::SetDeref { size: 1, offset: true });
        ir.write(Instruction::Free);

        let (chunk, diags) = lower(&ir);
        assert!(diags.is_empty());
        assert_eq!(
            chunk.code,
            vec![
                OpCode::Alloc as u8, 4,
                OpCode::AddrLocal as u8, 2,
                OpCode::AddrLocalOff as u8, 2,
                OpCode::GetDeref as u8, 4,
                OpCode::SetDerefOff as u8, 1,
                OpCode::Free as u8,
            ]
        );
    }

    #[test]
    fn zero_width_pop_and_push_emit_nothing() {
        let mut ir = IrChunk::new();
        ir.write(Instruction::Pop { widths: vec![] });
        ir.write(Instruction::Push { widths: vec![0, 0] });

        let (chunk, diags) = lower(&ir);
        assert!(diags.is_empty());
        assert!(chunk.is_empty());
    }

    #[test]
    fn conditional_jump_to_bound_label_is_an_invariant_violation() {
        let mut ir = IrChunk::new();
        let top = ir.new_label();
        ir.write(Instruction::Label(top));
        ir.write(Instruction::Jump { label: top, mode: JumpMode::IfFalse });

        let (_, diags) = lower(&ir);
        assert!(diags.iter().any(|d| matches!(d, LowerError::InvariantViolation(_))));
    }

    #[test]
    fn unbound_label_with_pending_jumps_is_reported() {
        let mut ir = IrChunk::new();
        let nowhere = ir.new_label();
        ir.write(Instruction::Jump { label: nowhere, mode: JumpMode::Always });

        let (_, diags) = lower(&ir);
        assert!(diags.iter().any(|d| matches!(d, LowerError::InvariantViolation(_))));
    }

    #[test]
    fn comparison_with_float_tag_is_an_invariant_violation() {
        let mut ir = IrChunk::new();
        ir.write(Instruction::Less { ty: TypeTag::Float });

        let (chunk, diags) = lower(&ir);
        assert!(chunk.is_empty());
        assert!(diags.iter().any(|d| matches!(d, LowerError::InvariantViolation(_))));
    }

    #[test]
    fn globals_snapshot_seeded_from_symbol_table() {
        let defs = vec![
            GlobalDef { name: "x".into(), slot: 0, size: 1, init: vec![Data::Int(5)] },
            GlobalDef {
                name: "arr".into(),
                slot: 1,
                size: 3,
                init: vec![Data::Int(1), Data::Int(2), Data::Int(3)],
            },
        ];
        let mut cg = CodeGen::new(&defs);

        let mut ir = IrChunk::new();
        ir.write(Instruction::GetGlobal { name: "arr".into(), size: 3, offset: false });
        let chunk = cg.generate(&ir);

        assert_eq!(cg.globals().len(), 4);
        assert_eq!(cg.globals()[0], Data::Int(5));
        assert_eq!(cg.globals()[3], Data::Int(3));
        assert_eq!(chunk.code, vec![OpCode::GetGlobalN as u8, 1, 3]);
    }
}
