//! Stack-machine interpreter. One program counter into the current chunk,
//! one operand stack shared by expression temporaries and local-variable
//! storage, one LIFO frame stack, a globals array seeded before execution.
//!
//! The instruction stream is trusted to be type-correct (the front end and
//! code generator guarantee it), but every access here is still checked:
//! a malformed program surfaces a [`RuntimeFault`] instead of undefined
//! behavior.

use crate::bytecode::{Chunk, Data, OpCode};
use crate::ir::TypeTag;
use crate::natives::{NativeDef, NativeError};

const FRAMES_MAX: usize = 1024;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeFault {
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("call depth exceeded {FRAMES_MAX} frames")]
    FrameOverflow,
    #[error("return with no active frame")]
    NoFrame,
    #[error("function chunk ran off its end without RETURN")]
    MissingReturn,
    #[error("unknown opcode byte {byte}")]
    UnknownOpcode { byte: u8 },
    #[error("instruction truncated at end of chunk")]
    TruncatedInstruction,
    #[error("constant address {addr} out of range")]
    BadConstant { addr: usize },
    #[error("global slot {slot} out of range")]
    BadGlobal { slot: usize },
    #[error("local slot {slot} out of range")]
    BadLocal { slot: usize },
    #[error("function index {index} out of range")]
    BadFunction { index: u16 },
    #[error("native index {index} out of range")]
    BadNative { index: u16 },
    #[error("bad heap handle {handle}")]
    BadHandle { handle: i64 },
    #[error("heap access at offset {offset} width {size} outside block of {len} slot(s)")]
    BadDeref { offset: usize, size: usize, len: usize },
    #[error("expected a {expected} value, found {found}")]
    Representation { expected: &'static str, found: &'static str },
    #[error("cast with invalid type byte {byte}")]
    BadCastTag { byte: u8 },
    #[error("negative slot offset {offset}")]
    NegativeOffset { offset: i64 },
    #[error("integer division by zero")]
    DivisionByZero,
    #[error(transparent)]
    Native(#[from] NativeError),
}

/// Everything the VM needs to start: the function chunk table (indexed by
/// `Data::Func`), the entry chunk of top-level code, and the initial
/// globals snapshot.
#[derive(Debug, Default)]
pub struct Program {
    pub chunks: Vec<Chunk>,
    pub entry: Chunk,
    pub globals: Vec<Data>,
}

/// Which chunk the program counter points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkId {
    Entry,
    Func(u16),
}

/// A call activation record. Locals of the callee start at `frame_start`;
/// GET_LOCAL/SET_LOCAL index relative to it, which is what keeps recursion
/// and stack growth safe.
#[derive(Debug, Clone, Copy)]
struct Frame {
    ret_ip: usize,
    ret_chunk: ChunkId,
    frame_start: usize,
}

/// Slab of explicitly allocated blocks, addressed by integer handles.
/// ALLOC/FREE are the only lifecycle; nothing is traced.
#[derive(Debug, Default)]
struct Heap {
    blocks: Vec<Option<Vec<Data>>>,
    free_list: Vec<usize>,
}

impl Heap {
    fn alloc(&mut self, size: usize) -> i64 {
        let block = vec![Data::default(); size];
        match self.free_list.pop() {
            Some(idx) => {
                self.blocks[idx] = Some(block);
                idx as i64
            }
            None => {
                self.blocks.push(Some(block));
                (self.blocks.len() - 1) as i64
            }
        }
    }

    fn release(&mut self, handle: i64) -> Result<(), RuntimeFault> {
        let idx = self.index(handle)?;
        self.blocks[idx] = None;
        self.free_list.push(idx);
        Ok(())
    }

    fn index(&self, handle: i64) -> Result<usize, RuntimeFault> {
        let idx = usize::try_from(handle).map_err(|_| RuntimeFault::BadHandle { handle })?;
        match self.blocks.get(idx) {
            Some(Some(_)) => Ok(idx),
            _ => Err(RuntimeFault::BadHandle { handle }),
        }
    }

    fn block(&self, handle: i64) -> Result<&[Data], RuntimeFault> {
        let idx = self.index(handle)?;
        Ok(self.blocks[idx].as_deref().unwrap_or(&[]))
    }

    fn block_mut(&mut self, handle: i64) -> Result<&mut [Data], RuntimeFault> {
        let idx = self.index(handle)?;
        Ok(self.blocks[idx].as_deref_mut().unwrap_or(&mut []))
    }
}

pub struct Vm<'a> {
    program: &'a Program,
    natives: &'a [NativeDef],
    stack: Vec<Data>,
    frames: Vec<Frame>,
    globals: Vec<Data>,
    heap: Heap,
}

impl<'a> Vm<'a> {
    pub fn new(program: &'a Program, natives: &'a [NativeDef]) -> Self {
        Vm {
            program,
            natives,
            stack: Vec::with_capacity(128),
            frames: Vec::with_capacity(64),
            globals: program.globals.clone(),
            heap: Heap::default(),
        }
    }

    pub fn globals(&self) -> &[Data] {
        &self.globals
    }

    pub fn stack(&self) -> &[Data] {
        &self.stack
    }

    fn chunk(&self, id: ChunkId) -> Result<&Chunk, RuntimeFault> {
        match id {
            ChunkId::Entry => Ok(&self.program.entry),
            ChunkId::Func(index) => self
                .program
                .chunks
                .get(index as usize)
                .ok_or(RuntimeFault::BadFunction { index }),
        }
    }

    fn pop(&mut self) -> Result<Data, RuntimeFault> {
        self.stack.pop().ok_or(RuntimeFault::StackUnderflow)
    }

    fn peek(&self) -> Result<Data, RuntimeFault> {
        self.stack.last().copied().ok_or(RuntimeFault::StackUnderflow)
    }

    fn pop_int(&mut self) -> Result<i64, RuntimeFault> {
        let v = self.pop()?;
        v.as_int().ok_or(RuntimeFault::Representation { expected: "int", found: v.kind() })
    }

    fn pop_float(&mut self) -> Result<f32, RuntimeFault> {
        let v = self.pop()?;
        v.as_float().ok_or(RuntimeFault::Representation { expected: "float", found: v.kind() })
    }

    fn pop_double(&mut self) -> Result<f64, RuntimeFault> {
        let v = self.pop()?;
        v.as_double().ok_or(RuntimeFault::Representation { expected: "double", found: v.kind() })
    }

    fn pop_bool(&mut self) -> Result<bool, RuntimeFault> {
        let v = self.pop()?;
        v.as_bool().ok_or(RuntimeFault::Representation { expected: "bool", found: v.kind() })
    }

    fn peek_bool(&self) -> Result<bool, RuntimeFault> {
        let v = self.peek()?;
        v.as_bool().ok_or(RuntimeFault::Representation { expected: "bool", found: v.kind() })
    }

    /// Pops a runtime slot offset (always an integer, never negative).
    fn pop_offset(&mut self) -> Result<usize, RuntimeFault> {
        let offset = self.pop_int()?;
        usize::try_from(offset).map_err(|_| RuntimeFault::NegativeOffset { offset })
    }

    /// Base index of the active frame's locals; top-level code owns the
    /// bottom of the stack.
    fn frame_base(&self) -> usize {
        self.frames.last().map(|f| f.frame_start).unwrap_or(0)
    }

    fn local_index(&self, slot: usize, offset: usize) -> Result<usize, RuntimeFault> {
        let idx = self.frame_base() + slot + offset;
        if idx >= self.stack.len() {
            return Err(RuntimeFault::BadLocal { slot: slot + offset });
        }
        Ok(idx)
    }

    fn global_slot(&self, slot: usize) -> Result<usize, RuntimeFault> {
        if slot >= self.globals.len() {
            return Err(RuntimeFault::BadGlobal { slot });
        }
        Ok(slot)
    }

    /// Runs the entry chunk to completion. There is no halt opcode:
    /// reaching the end of the entry chunk is the only normal termination.
    pub fn run(&mut self) -> Result<(), RuntimeFault> {
        let mut chunk_id = ChunkId::Entry;
        let mut ip = 0usize;

        loop {
            let code_len = self.chunk(chunk_id)?.code.len();
            if ip >= code_len {
                if chunk_id == ChunkId::Entry {
                    return Ok(());
                }
                return Err(RuntimeFault::MissingReturn);
            }

            let byte = self.chunk(chunk_id)?.code[ip];
            let op = OpCode::decode(byte).ok_or(RuntimeFault::UnknownOpcode { byte })?;
            let operands = op.operand_count();
            if ip + 1 + operands > code_len {
                return Err(RuntimeFault::TruncatedInstruction);
            }
            let a = if operands >= 1 { self.chunk(chunk_id)?.code[ip + 1] } else { 0 };
            let b = if operands >= 2 { self.chunk(chunk_id)?.code[ip + 2] } else { 0 };
            ip += 1 + operands;

            macro_rules! binary {
                ($pop:ident, $wrap:expr, $op:tt) => {{
                    let rhs = self.$pop()?;
                    let lhs = self.$pop()?;
                    self.stack.push($wrap(lhs $op rhs));
                }};
            }
            macro_rules! compare {
                ($pop:ident, $op:tt) => {{
                    let rhs = self.$pop()?;
                    let lhs = self.$pop()?;
                    self.stack.push(Data::Bool(lhs $op rhs));
                }};
            }

            match op {
                OpCode::Constant => {
                    let addr = a as usize;
                    let value = self
                        .chunk(chunk_id)?
                        .get_constant(addr)
                        .ok_or(RuntimeFault::BadConstant { addr })?;
                    self.stack.push(value);
                }

                OpCode::IAdd => binary!(pop_int, Data::Int, +),
                OpCode::ISub => binary!(pop_int, Data::Int, -),
                OpCode::IMul => binary!(pop_int, Data::Int, *),
                OpCode::IDiv => {
                    let rhs = self.pop_int()?;
                    let lhs = self.pop_int()?;
                    if rhs == 0 {
                        return Err(RuntimeFault::DivisionByZero);
                    }
                    self.stack.push(Data::Int(lhs.wrapping_div(rhs)));
                }
                OpCode::INeg => {
                    let v = self.pop_int()?;
                    self.stack.push(Data::Int(-v));
                }
                OpCode::Mod => {
                    let rhs = self.pop_int()?;
                    let lhs = self.pop_int()?;
                    if rhs == 0 {
                        return Err(RuntimeFault::DivisionByZero);
                    }
                    self.stack.push(Data::Int(lhs.wrapping_rem(rhs)));
                }
                OpCode::FAdd => binary!(pop_float, Data::Float, +),
                OpCode::FSub => binary!(pop_float, Data::Float, -),
                OpCode::FMul => binary!(pop_float, Data::Float, *),
                OpCode::FDiv => binary!(pop_float, Data::Float, /),
                OpCode::FNeg => {
                    let v = self.pop_float()?;
                    self.stack.push(Data::Float(-v));
                }
                OpCode::DAdd => binary!(pop_double, Data::Double, +),
                OpCode::DSub => binary!(pop_double, Data::Double, -),
                OpCode::DMul => binary!(pop_double, Data::Double, *),
                OpCode::DDiv => binary!(pop_double, Data::Double, /),
                OpCode::DNeg => {
                    let v = self.pop_double()?;
                    self.stack.push(Data::Double(-v));
                }

                OpCode::BitNot => {
                    let v = self.pop_int()?;
                    self.stack.push(Data::Int(!v));
                }
                OpCode::BitAnd => binary!(pop_int, Data::Int, &),
                OpCode::BitOr => binary!(pop_int, Data::Int, |),
                OpCode::BitXor => binary!(pop_int, Data::Int, ^),
                OpCode::BitshiftLeft => {
                    let rhs = self.pop_int()?;
                    let lhs = self.pop_int()?;
                    self.stack.push(Data::Int(lhs.wrapping_shl(rhs as u32)));
                }
                OpCode::BitshiftRight => {
                    let rhs = self.pop_int()?;
                    let lhs = self.pop_int()?;
                    self.stack.push(Data::Int(lhs.wrapping_shr(rhs as u32)));
                }

                OpCode::IInc => {
                    let v = self.pop_int()?;
                    self.stack.push(Data::Int(v + 1));
                }
                OpCode::IDec => {
                    let v = self.pop_int()?;
                    self.stack.push(Data::Int(v - 1));
                }
                OpCode::FInc => {
                    let v = self.pop_float()?;
                    self.stack.push(Data::Float(v + 1.0));
                }
                OpCode::FDec => {
                    let v = self.pop_float()?;
                    self.stack.push(Data::Float(v - 1.0));
                }
                OpCode::DInc => {
                    let v = self.pop_double()?;
                    self.stack.push(Data::Double(v + 1.0));
                }
                OpCode::DDec => {
                    let v = self.pop_double()?;
                    self.stack.push(Data::Double(v - 1.0));
                }

                OpCode::LogicNot => {
                    let v = self.pop_bool()?;
                    self.stack.push(Data::Bool(!v));
                }

                OpCode::ILess => compare!(pop_int, <),
                OpCode::IGreat => compare!(pop_int, >),
                OpCode::ILessEqual => compare!(pop_int, <=),
                OpCode::IGreatEqual => compare!(pop_int, >=),
                OpCode::IIsEqual => compare!(pop_int, ==),
                OpCode::INotEqual => compare!(pop_int, !=),
                OpCode::DLess => compare!(pop_double, <),
                OpCode::DGreat => compare!(pop_double, >),
                OpCode::DLessEqual => compare!(pop_double, <=),
                OpCode::DGreatEqual => compare!(pop_double, >=),
                OpCode::DIsEqual => compare!(pop_double, ==),
                OpCode::DNotEqual => compare!(pop_double, !=),

                OpCode::Cast => {
                    let from = TypeTag::decode(a).ok_or(RuntimeFault::BadCastTag { byte: a })?;
                    let to = TypeTag::decode(b).ok_or(RuntimeFault::BadCastTag { byte: b })?;
                    let value = self.pop()?;
                    self.stack.push(cast(value, from, to)?);
                }

                OpCode::PopN => {
                    let n = a as usize;
                    if self.stack.len() < n {
                        return Err(RuntimeFault::StackUnderflow);
                    }
                    self.stack.truncate(self.stack.len() - n);
                }
                OpCode::PushN => {
                    let n = a as usize;
                    self.stack.extend(std::iter::repeat_n(Data::default(), n));
                }

                OpCode::GetGlobal => {
                    let slot = self.global_slot(a as usize)?;
                    self.stack.push(self.globals[slot]);
                }
                OpCode::GetGlobalN => {
                    let slot = a as usize;
                    let n = b as usize;
                    if n > 0 {
                        self.global_slot(slot + n - 1)?;
                    }
                    for i in 0..n {
                        self.stack.push(self.globals[slot + i]);
                    }
                }
                OpCode::GetGlobalOff => {
                    let offset = self.pop_offset()?;
                    let slot = self.global_slot(a as usize + offset)?;
                    self.stack.push(self.globals[slot]);
                }
                OpCode::GetGlobalOffN => {
                    let offset = self.pop_offset()?;
                    let slot = a as usize + offset;
                    let n = b as usize;
                    if n > 0 {
                        self.global_slot(slot + n - 1)?;
                    }
                    for i in 0..n {
                        self.stack.push(self.globals[slot + i]);
                    }
                }
                OpCode::SetGlobal => {
                    let slot = self.global_slot(a as usize)?;
                    self.globals[slot] = self.peek()?;
                }
                OpCode::SetGlobalN => {
                    let slot = a as usize;
                    let n = b as usize;
                    if n > 0 {
                        self.global_slot(slot + n - 1)?;
                    }
                    if self.stack.len() < n {
                        return Err(RuntimeFault::StackUnderflow);
                    }
                    let top = self.stack.len() - n;
                    for i in 0..n {
                        self.globals[slot + i] = self.stack[top + i];
                    }
                }
                OpCode::SetGlobalOff => {
                    let offset = self.pop_offset()?;
                    let slot = self.global_slot(a as usize + offset)?;
                    self.globals[slot] = self.peek()?;
                }
                OpCode::SetGlobalOffN => {
                    let offset = self.pop_offset()?;
                    let slot = a as usize + offset;
                    let n = b as usize;
                    if n > 0 {
                        self.global_slot(slot + n - 1)?;
                    }
                    if self.stack.len() < n {
                        return Err(RuntimeFault::StackUnderflow);
                    }
                    let top = self.stack.len() - n;
                    for i in 0..n {
                        self.globals[slot + i] = self.stack[top + i];
                    }
                }

                OpCode::GetLocal => {
                    let idx = self.local_index(a as usize, 0)?;
                    self.stack.push(self.stack[idx]);
                }
                OpCode::GetLocalN => {
                    let n = b as usize;
                    let idx = self.local_index(a as usize, 0)?;
                    if n > 1 {
                        self.local_index(a as usize, n - 1)?;
                    }
                    for i in 0..n {
                        let v = self.stack[idx + i];
                        self.stack.push(v);
                    }
                }
                OpCode::GetLocalOff => {
                    let offset = self.pop_offset()?;
                    let idx = self.local_index(a as usize, offset)?;
                    self.stack.push(self.stack[idx]);
                }
                OpCode::GetLocalOffN => {
                    let offset = self.pop_offset()?;
                    let n = b as usize;
                    let idx = self.local_index(a as usize, offset)?;
                    if n > 1 {
                        self.local_index(a as usize, offset + n - 1)?;
                    }
                    for i in 0..n {
                        let v = self.stack[idx + i];
                        self.stack.push(v);
                    }
                }
                OpCode::SetLocal => {
                    let idx = self.local_index(a as usize, 0)?;
                    self.stack[idx] = self.peek()?;
                }
                OpCode::SetLocalN => {
                    let n = b as usize;
                    let idx = self.local_index(a as usize, 0)?;
                    if n > 1 {
                        self.local_index(a as usize, n - 1)?;
                    }
                    if self.stack.len() < n {
                        return Err(RuntimeFault::StackUnderflow);
                    }
                    let top = self.stack.len() - n;
                    for i in 0..n {
                        self.stack[idx + i] = self.stack[top + i];
                    }
                }
                OpCode::SetLocalOff => {
                    let offset = self.pop_offset()?;
                    let idx = self.local_index(a as usize, offset)?;
                    self.stack[idx] = self.peek()?;
                }
                OpCode::SetLocalOffN => {
                    let offset = self.pop_offset()?;
                    let n = b as usize;
                    let idx = self.local_index(a as usize, offset)?;
                    if n > 1 {
                        self.local_index(a as usize, offset + n - 1)?;
                    }
                    if self.stack.len() < n {
                        return Err(RuntimeFault::StackUnderflow);
                    }
                    let top = self.stack.len() - n;
                    for i in 0..n {
                        self.stack[idx + i] = self.stack[top + i];
                    }
                }

                OpCode::AddrLocal => {
                    let addr = self.frame_base() + a as usize;
                    self.stack.push(Data::Int(addr as i64));
                }
                OpCode::AddrLocalOff => {
                    let offset = self.pop_offset()?;
                    let addr = self.frame_base() + a as usize + offset;
                    self.stack.push(Data::Int(addr as i64));
                }
                OpCode::AddrGlobal => {
                    self.stack.push(Data::Int(a as i64));
                }
                OpCode::AddrGlobalOff => {
                    let offset = self.pop_offset()?;
                    self.stack.push(Data::Int(a as i64 + offset as i64));
                }

                OpCode::Alloc => {
                    let handle = self.heap.alloc(a as usize);
                    self.stack.push(Data::Int(handle));
                }
                OpCode::Free => {
                    let handle = self.pop_int()?;
                    self.heap.release(handle)?;
                }
                OpCode::GetDeref => {
                    let handle = self.pop_int()?;
                    self.deref_load(handle, 0, a as usize)?;
                }
                OpCode::SetDeref => {
                    let handle = self.pop_int()?;
                    self.deref_store(handle, 0, a as usize)?;
                }
                OpCode::GetDerefOff => {
                    let handle = self.pop_int()?;
                    let offset = self.pop_offset()?;
                    self.deref_load(handle, offset, a as usize)?;
                }
                OpCode::SetDerefOff => {
                    let handle = self.pop_int()?;
                    let offset = self.pop_offset()?;
                    self.deref_store(handle, offset, a as usize)?;
                }

                OpCode::Jump => {
                    ip += a as usize;
                }
                OpCode::JumpNt => {
                    if !self.peek_bool()? {
                        ip += a as usize;
                    }
                }
                OpCode::JumpNtPop => {
                    if !self.peek_bool()? {
                        ip += a as usize;
                    }
                    self.stack.pop();
                }
                OpCode::Loop => {
                    ip = ip
                        .checked_sub(a as usize)
                        .ok_or(RuntimeFault::TruncatedInstruction)?;
                }

                OpCode::Call => {
                    if self.frames.len() >= FRAMES_MAX {
                        return Err(RuntimeFault::FrameOverflow);
                    }
                    let callee = self.pop()?;
                    let Data::Func(index) = callee else {
                        return Err(RuntimeFault::Representation {
                            expected: "function",
                            found: callee.kind(),
                        });
                    };
                    self.chunk(ChunkId::Func(index))?;
                    let arg_size = a as usize;
                    if self.stack.len() < arg_size {
                        return Err(RuntimeFault::StackUnderflow);
                    }
                    self.frames.push(Frame {
                        ret_ip: ip,
                        ret_chunk: chunk_id,
                        frame_start: self.stack.len() - arg_size,
                    });
                    chunk_id = ChunkId::Func(index);
                    ip = 0;
                }
                OpCode::NativeCall => {
                    let callee = self.pop()?;
                    let Data::Native(index) = callee else {
                        return Err(RuntimeFault::Representation {
                            expected: "native",
                            found: callee.kind(),
                        });
                    };
                    let native = self
                        .natives
                        .get(index as usize)
                        .ok_or(RuntimeFault::BadNative { index })?;
                    let arg_size = a as usize;
                    if self.stack.len() < arg_size {
                        return Err(RuntimeFault::StackUnderflow);
                    }
                    let window_start = self.stack.len() - arg_size;
                    let result = (native.func)(&self.stack[window_start..])?;
                    self.stack.truncate(window_start);
                    self.stack.push(result);
                }
                OpCode::Return => {
                    let frame = self.frames.pop().ok_or(RuntimeFault::NoFrame)?;
                    let width = a as usize;
                    if width != 0 {
                        if self.stack.len() < width
                            || self.stack.len() - width < frame.frame_start
                        {
                            return Err(RuntimeFault::StackUnderflow);
                        }
                        let top = self.stack.len() - width;
                        for i in 0..width {
                            self.stack[frame.frame_start + i] = self.stack[top + i];
                        }
                    }
                    self.stack.truncate(frame.frame_start + width);
                    ip = frame.ret_ip;
                    chunk_id = frame.ret_chunk;
                }
            }
        }
    }

    fn deref_load(&mut self, handle: i64, offset: usize, size: usize) -> Result<(), RuntimeFault> {
        let block = self.heap.block(handle)?;
        if offset + size > block.len() {
            return Err(RuntimeFault::BadDeref { offset, size, len: block.len() });
        }
        for i in 0..size {
            let v = block[offset + i];
            self.stack.push(v);
        }
        Ok(())
    }

    fn deref_store(&mut self, handle: i64, offset: usize, size: usize) -> Result<(), RuntimeFault> {
        if self.stack.len() < size {
            return Err(RuntimeFault::StackUnderflow);
        }
        let top = self.stack.len() - size;
        let values: Vec<Data> = self.stack[top..].to_vec();
        let block = self.heap.block_mut(handle)?;
        if offset + size > block.len() {
            return Err(RuntimeFault::BadDeref { offset, size, len: block.len() });
        }
        block[offset..offset + size].copy_from_slice(&values);
        Ok(())
    }
}

/// Numeric conversion table over {integer, float, double, boolean,
/// character}. Reads the `from` representation, produces the `to`
/// representation; a value whose representation does not match `from` is a
/// fault.
fn cast(value: Data, from: TypeTag, to: TypeTag) -> Result<Data, RuntimeFault> {
    fn expect(value: Data, from: TypeTag) -> Result<f64, RuntimeFault> {
        let ok = match (value, from) {
            (Data::Int(v), TypeTag::Integer) => v as f64,
            (Data::Float(v), TypeTag::Float) => v as f64,
            (Data::Double(v), TypeTag::Double) => v,
            (Data::Bool(v), TypeTag::Bool) => v as u8 as f64,
            (Data::Char(v), TypeTag::Char) => v as u32 as f64,
            _ => {
                return Err(RuntimeFault::Representation {
                    expected: match from {
                        TypeTag::Integer => "int",
                        TypeTag::Float => "float",
                        TypeTag::Double => "double",
                        TypeTag::Bool => "bool",
                        TypeTag::Char => "char",
                    },
                    found: value.kind(),
                });
            }
        };
        Ok(ok)
    }

    // Integer-to-integer-like paths keep full 64-bit precision; everything
    // else goes through f64, which covers the float/double lattice.
    if let (Data::Int(v), TypeTag::Integer) = (value, from) {
        return Ok(match to {
            TypeTag::Integer => Data::Int(v),
            TypeTag::Float => Data::Float(v as f32),
            TypeTag::Double => Data::Double(v as f64),
            TypeTag::Bool => Data::Bool(v != 0),
            TypeTag::Char => Data::Char((v as u8) as char),
        });
    }

    let v = expect(value, from)?;
    Ok(match to {
        TypeTag::Integer => Data::Int(v as i64),
        TypeTag::Float => Data::Float(v as f32),
        TypeTag::Double => Data::Double(v),
        TypeTag::Bool => Data::Bool(v != 0.0),
        TypeTag::Char => Data::Char((v as i64 as u8) as char),
    })
}
