//! Bytecode representation for the Kestrel virtual machine.
//!
//! A compiled function is a [`FunctionPrototype`]: its [`Chunk`] (a flat
//! `Vec<u8>` of instructions, a constant pool and a run-length line table)
//! plus the metadata the VM needs to bind and call it: parameters, locals,
//! capture descriptors and nested prototypes.
//!
//! # Encoding
//!
//! Each instruction is encoded as one or more bytes:
//! - The first byte is the [`OpCode`] discriminant.
//! - Operands immediately follow, in big-endian order, with the widths given
//!   by [`OpCode::operands`].
//!
//! All jumps store the *absolute* bytecode offset of the target instruction.
//!
//! # Frame layout
//!
//! A call frame starts at the `this` slot: slot 0 is `this`, slots
//! `1..=arity` are the parameters, and declared locals follow in order.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::value::TypeMask;

// ─────────────────────────────────────────────────────────────────────────────
// OpCode
// ─────────────────────────────────────────────────────────────────────────────

/// Every instruction the Kestrel VM can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // ── Constants / literals ─────────────────────────────────────────────────
    /// Push a constant. Operand: u16 pool index.
    Const = 0x01,
    Null = 0x02,
    True = 0x03,
    False = 0x04,
    Int0 = 0x05,
    Int1 = 0x06,

    // ── Stack manipulation ────────────────────────────────────────────────────
    Pop = 0x10,
    /// Pop N values. Operand: u8 count.
    PopN = 0x11,
    Dup = 0x12,
    /// Duplicate the top two values, preserving order.
    Dup2 = 0x13,
    /// Move the top value below the next N values. Operand: u8 depth.
    Insert = 0x14,

    // ── Variables ─────────────────────────────────────────────────────────────
    /// Operand: u8 frame slot. Reads through capture cells.
    LoadLocal = 0x20,
    /// Pop into a frame slot. Operand: u8 slot. Writes through capture cells.
    StoreLocal = 0x21,
    /// Operand: u8 index into the closure's capture array.
    LoadCapture = 0x22,
    StoreCapture = 0x23,
    /// Look a name up in the VM root table. Operand: u16 name constant.
    LoadGlobal = 0x24,
    /// Check the top value against a mask without popping it.
    /// Operand: u32 mask bits. Fails with `invalid_type_assignment`.
    CheckType = 0x25,
    /// Check a parameter slot against a mask.
    /// Operands: u8 slot, u32 mask bits. Fails with `invalid_parameters`.
    CheckParam = 0x26,
    /// Pop a value into the module export table. Operand: u16 name constant.
    Export = 0x27,

    // ── Arithmetic ────────────────────────────────────────────────────────────
    Add = 0x30,
    Sub = 0x31,
    Mul = 0x32,
    Div = 0x33,
    Mod = 0x34,
    Exp = 0x35,
    BitOr = 0x36,
    BitAnd = 0x37,
    BitXor = 0x38,
    Shl = 0x39,
    Shr = 0x3a,
    Neg = 0x3b,
    BitNot = 0x3c,
    /// Replace the top value with its successor or predecessor.
    /// Operand: u8 [`crate::arith::IncrOp`] byte.
    Step = 0x3d,

    // ── Comparison ────────────────────────────────────────────────────────────
    Eq = 0x40,
    Ne = 0x41,
    Lt = 0x42,
    Le = 0x43,
    Gt = 0x44,
    Ge = 0x45,

    // ── Logic ─────────────────────────────────────────────────────────────────
    Not = 0x50,
    /// Short-circuit AND: if the top is falsy jump (keeping it), else pop.
    /// Operand: u16 target.
    And = 0x51,
    /// Short-circuit OR: if the top is truthy jump (keeping it), else pop.
    Or = 0x52,

    // ── Control flow ──────────────────────────────────────────────────────────
    /// Operand: u16 target.
    Jump = 0x60,
    /// Pop; jump when falsy. Operand: u16 target.
    JumpIfFalse = 0x61,
    /// Backward jump. Operand: u16 target.
    Loop = 0x62,

    // ── Calls and returns ─────────────────────────────────────────────────────
    /// Stack: callee this arg0 … argN-1. Operand: u8 argument count.
    Call = 0x70,
    /// Pop the result and leave the frame.
    Return = 0x71,
    /// Stack: receiver arg0 … argN-1.
    /// Operands: u16 method name constant, u8 argument count.
    CallMethod = 0x72,

    // ── Closures ──────────────────────────────────────────────────────────────
    /// Bind a nested prototype, popping its default values.
    /// Operand: u16 index into `FunctionPrototype::functions`.
    Closure = 0x80,

    // ── Collections ───────────────────────────────────────────────────────────
    /// Operand: u16 item count.
    NewArray = 0x90,
    /// Stack: key0 val0 … Operand: u16 entry count.
    NewTable = 0x91,

    // ── Field / index access ──────────────────────────────────────────────────
    /// Operand: u16 field name constant.
    GetField = 0xa0,
    /// Stack: object value → value. Operand: u16 field name constant.
    SetField = 0xa1,
    /// Stack: object key → value.
    GetIndex = 0xa2,
    /// Stack: object key value → value.
    SetIndex = 0xa3,

    // ── Struct declarations ───────────────────────────────────────────────────
    /// Push a fresh schema. Operand: u16 name constant.
    NewStruct = 0xb0,
    /// Stack: schema default → schema.
    /// Operands: u16 name constant, u8 member flags, u32 mask bits.
    StructMember = 0xb1,
    /// Stack: schema closure → schema. Operands: u16 name constant, u8 flags.
    StructMethod = 0xb2,
    /// Stack: schema closure → schema.
    StructConstructor = 0xb3,
    /// Mark the schema as having a body-less default constructor.
    StructDefaultConstructor = 0xb4,

    Nop = 0xff,
}

/// Width of one instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    U8,
    U16,
    U32,
}

impl Operand {
    pub fn width(self) -> usize {
        match self {
            Operand::U8 => 1,
            Operand::U16 => 2,
            Operand::U32 => 4,
        }
    }
}

impl OpCode {
    /// Operand layout following the opcode byte.
    pub fn operands(self) -> &'static [Operand] {
        use Operand::*;
        match self {
            OpCode::Const
            | OpCode::LoadGlobal
            | OpCode::Export
            | OpCode::And
            | OpCode::Or
            | OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::Loop
            | OpCode::Closure
            | OpCode::NewArray
            | OpCode::NewTable
            | OpCode::GetField
            | OpCode::SetField
            | OpCode::NewStruct => &[U16],
            OpCode::PopN
            | OpCode::Insert
            | OpCode::LoadLocal
            | OpCode::StoreLocal
            | OpCode::LoadCapture
            | OpCode::StoreCapture
            | OpCode::Step
            | OpCode::Call => &[U8],
            OpCode::CheckType => &[U32],
            OpCode::CheckParam => &[U8, U32],
            OpCode::CallMethod | OpCode::StructMethod => &[U16, U8],
            OpCode::StructMember => &[U16, U8, U32],
            _ => &[],
        }
    }

    /// Total encoded size, opcode byte included.
    pub fn size(self) -> usize {
        1 + self.operands().iter().map(|o| o.width()).sum::<usize>()
    }

    /// Whether the first operand is a constant-pool name index.
    fn names_constant(self) -> bool {
        matches!(
            self,
            OpCode::Const
                | OpCode::LoadGlobal
                | OpCode::Export
                | OpCode::GetField
                | OpCode::SetField
                | OpCode::CallMethod
                | OpCode::NewStruct
                | OpCode::StructMember
                | OpCode::StructMethod
        )
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;
    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x01 => OpCode::Const,
            0x02 => OpCode::Null,
            0x03 => OpCode::True,
            0x04 => OpCode::False,
            0x05 => OpCode::Int0,
            0x06 => OpCode::Int1,
            0x10 => OpCode::Pop,
            0x11 => OpCode::PopN,
            0x12 => OpCode::Dup,
            0x13 => OpCode::Dup2,
            0x14 => OpCode::Insert,
            0x20 => OpCode::LoadLocal,
            0x21 => OpCode::StoreLocal,
            0x22 => OpCode::LoadCapture,
            0x23 => OpCode::StoreCapture,
            0x24 => OpCode::LoadGlobal,
            0x25 => OpCode::CheckType,
            0x26 => OpCode::CheckParam,
            0x27 => OpCode::Export,
            0x30 => OpCode::Add,
            0x31 => OpCode::Sub,
            0x32 => OpCode::Mul,
            0x33 => OpCode::Div,
            0x34 => OpCode::Mod,
            0x35 => OpCode::Exp,
            0x36 => OpCode::BitOr,
            0x37 => OpCode::BitAnd,
            0x38 => OpCode::BitXor,
            0x39 => OpCode::Shl,
            0x3a => OpCode::Shr,
            0x3b => OpCode::Neg,
            0x3c => OpCode::BitNot,
            0x3d => OpCode::Step,
            0x40 => OpCode::Eq,
            0x41 => OpCode::Ne,
            0x42 => OpCode::Lt,
            0x43 => OpCode::Le,
            0x44 => OpCode::Gt,
            0x45 => OpCode::Ge,
            0x50 => OpCode::Not,
            0x51 => OpCode::And,
            0x52 => OpCode::Or,
            0x60 => OpCode::Jump,
            0x61 => OpCode::JumpIfFalse,
            0x62 => OpCode::Loop,
            0x70 => OpCode::Call,
            0x71 => OpCode::Return,
            0x72 => OpCode::CallMethod,
            0x80 => OpCode::Closure,
            0x90 => OpCode::NewArray,
            0x91 => OpCode::NewTable,
            0xa0 => OpCode::GetField,
            0xa1 => OpCode::SetField,
            0xa2 => OpCode::GetIndex,
            0xa3 => OpCode::SetIndex,
            0xb0 => OpCode::NewStruct,
            0xb1 => OpCode::StructMember,
            0xb2 => OpCode::StructMethod,
            0xb3 => OpCode::StructConstructor,
            0xb4 => OpCode::StructDefaultConstructor,
            0xff => OpCode::Nop,
            other => return Err(other),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Constant pool value
// ─────────────────────────────────────────────────────────────────────────────

/// A compile-time literal in the [`Chunk`]'s constant pool.
///
/// Constants are plain data; the VM turns them into [`crate::value::Value`]s
/// when they are pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Constant {
    /// Pool identity: floats compare by bit pattern so `0.0` and `-0.0`
    /// stay distinct.
    fn same_as(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => write!(f, "null"),
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Int(n) => write!(f, "{n}"),
            Constant::Float(n) => write!(f, "{n:?}"),
            Constant::Str(s) => write!(f, "{s:?}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Function prototype
// ─────────────────────────────────────────────────────────────────────────────

/// A declared local: its slot, live range and restrictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalInfo {
    pub name: String,
    pub slot: u32,
    /// First instruction offset where the local is live.
    pub start: u32,
    /// Offset one past the last instruction where it is live.
    pub end: u32,
    pub mask: TypeMask,
    pub is_const: bool,
    /// Number of nested closures capturing this slot.
    pub captured: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureKind {
    /// A local slot of the immediately enclosing function.
    OuterLocal,
    /// An entry of the enclosing closure's own capture array.
    OuterCapture,
}

/// One captured variable of a closure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDesc {
    pub name: String,
    pub index: u32,
    pub kind: CaptureKind,
}

/// Source position of the instructions starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineInfo {
    pub offset: u32,
    pub line: u32,
    pub column: u32,
}

/// A compiled function: bytecode plus everything needed to bind and call it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionPrototype {
    /// Declared name; `"<anonymous>"` for function expressions.
    pub name: String,
    /// Module the function was compiled from.
    pub source_name: String,
    /// Highest slot count reached by the frame.
    pub stack_size: u32,
    /// Parameter names, `this` excluded.
    pub parameter_names: Vec<String>,
    /// How many trailing parameters have default values.
    pub default_count: u32,
    pub locals: Vec<LocalInfo>,
    /// Type names referenced by `var<...>` restrictions.
    pub restricted_types: Vec<String>,
    pub functions: Vec<Rc<FunctionPrototype>>,
    pub captures: Vec<CaptureDesc>,
    /// Number of local slots that escape into nested closures.
    pub capture_count: u32,
    /// Slot holding the module export table, when the module exports.
    pub export_slot: Option<u32>,
    pub chunk: Chunk,
}

impl FunctionPrototype {
    pub fn new(name: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_name: source_name.into(),
            stack_size: 1,
            parameter_names: Vec::new(),
            default_count: 0,
            locals: Vec::new(),
            restricted_types: Vec::new(),
            functions: Vec::new(),
            captures: Vec::new(),
            capture_count: 0,
            export_slot: None,
            chunk: Chunk::new(),
        }
    }

    pub fn arity(&self) -> usize {
        self.parameter_names.len()
    }

    /// Declared mask of parameter `index` (0-based, `this` excluded).
    pub fn parameter_mask(&self, index: usize) -> TypeMask {
        let slot = index as u32 + 1;
        self.locals
            .iter()
            .find(|l| l.slot == slot && l.start == 0)
            .map(|l| l.mask)
            .unwrap_or(TypeMask::ANY)
    }

    /// Name of the local occupying `slot` at instruction `offset`.
    pub fn local_name(&self, slot: u32, offset: u32) -> Option<&str> {
        self.locals
            .iter()
            .find(|l| l.slot == slot && l.start <= offset && offset < l.end)
            .map(|l| l.name.as_str())
    }

    /// Check every instruction stream in this prototype tree is well formed.
    pub fn validate(&self) -> Result<(), String> {
        self.chunk
            .validate()
            .map_err(|e| format!("{}: {e}", self.name))?;
        for f in &self.functions {
            f.validate()?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chunk
// ─────────────────────────────────────────────────────────────────────────────

/// A bytecode chunk: the instruction stream of one function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Raw instruction bytes.
    pub code: Vec<u8>,
    /// Constant pool; indexed by u16.
    pub constants: Vec<Constant>,
    /// Run-length position table, sorted by offset.
    pub lines: Vec<LineInfo>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Emission helpers ─────────────────────────────────────────────────────

    /// Record that code emitted from here on comes from `line:column`.
    pub fn mark(&mut self, line: u32, column: u32) {
        let offset = self.code.len() as u32;
        match self.lines.last_mut() {
            Some(last) if last.line == line && last.column == column => {}
            Some(last) if last.offset == offset => {
                last.line = line;
                last.column = column;
            }
            _ => self.lines.push(LineInfo {
                offset,
                line,
                column,
            }),
        }
    }

    #[inline]
    pub fn emit_byte(&mut self, byte: u8) {
        self.code.push(byte);
    }

    #[inline]
    pub fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    #[inline]
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    #[inline]
    pub fn emit_op_u8(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    #[inline]
    pub fn emit_op_u16(&mut self, op: OpCode, operand: u16) {
        self.emit_op(op);
        self.emit_u16(operand);
    }

    #[inline]
    pub fn emit_op_u16_u8(&mut self, op: OpCode, a: u16, b: u8) {
        self.emit_op(op);
        self.emit_u16(a);
        self.emit_byte(b);
    }

    // ── Constant pool ────────────────────────────────────────────────────────

    /// Add a constant, reusing an identical entry. `None` when the pool is
    /// full.
    pub fn add_constant(&mut self, c: Constant) -> Option<u16> {
        if let Some(idx) = self.constants.iter().position(|x| x.same_as(&c)) {
            return u16::try_from(idx).ok();
        }
        let idx = u16::try_from(self.constants.len()).ok()?;
        self.constants.push(c);
        Some(idx)
    }

    pub fn add_str(&mut self, s: impl Into<String>) -> Option<u16> {
        self.add_constant(Constant::Str(s.into()))
    }

    /// The string constant at `index`.
    pub fn str_at(&self, index: u16) -> Option<&str> {
        match self.constants.get(index as usize) {
            Some(Constant::Str(s)) => Some(s),
            _ => None,
        }
    }

    // ── Jump patching ────────────────────────────────────────────────────────

    /// Emit a jump with a placeholder target; returns the operand offset.
    pub fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let patch_offset = self.code.len();
        self.emit_u16(0xFFFF);
        patch_offset
    }

    /// Point a previously emitted jump at the current end of code.
    pub fn patch_jump(&mut self, patch_offset: usize) -> Option<()> {
        let target = u16::try_from(self.code.len()).ok()?;
        self.patch_u16(patch_offset, target);
        Some(())
    }

    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.code[offset] = hi;
        self.code[offset + 1] = lo;
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    #[inline]
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_be_bytes([
            self.code[offset],
            self.code[offset + 1],
            self.code[offset + 2],
            self.code[offset + 3],
        ])
    }

    /// Source position of the instruction at `offset`.
    pub fn position_at(&self, offset: usize) -> Option<(u32, u32)> {
        let offset = offset as u32;
        let i = self.lines.partition_point(|l| l.offset <= offset);
        i.checked_sub(1)
            .map(|i| (self.lines[i].line, self.lines[i].column))
    }

    /// Every opcode is known, every operand is in bounds and every constant
    /// reference resolves.
    pub fn validate(&self) -> Result<(), String> {
        let mut offset = 0;
        while offset < self.code.len() {
            let byte = self.code[offset];
            let op = OpCode::try_from(byte)
                .map_err(|b| format!("invalid opcode {b:#04x} at {offset:#06x}"))?;
            if offset + op.size() > self.code.len() {
                return Err(format!("truncated {op:?} at {offset:#06x}"));
            }
            if op.names_constant() {
                let idx = self.read_u16(offset + 1) as usize;
                if idx >= self.constants.len() {
                    return Err(format!("constant {idx} out of range at {offset:#06x}"));
                }
            }
            offset += op.size();
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Disassembler
// ─────────────────────────────────────────────────────────────────────────────

/// Disassemble `proto` and its nested prototypes.
pub fn disassemble(proto: &FunctionPrototype) -> String {
    let mut out = String::new();
    disassemble_into(proto, &mut out);
    out
}

fn disassemble_into(proto: &FunctionPrototype, out: &mut String) {
    let chunk = &proto.chunk;
    out.push_str(&format!(
        "=== {} ({} params, {} slots) ===\n",
        proto.name,
        proto.arity(),
        proto.stack_size
    ));
    let mut offset = 0usize;
    while offset < chunk.code.len() {
        let (s, size) = disassemble_instruction(chunk, offset);
        let line = chunk.position_at(offset).map_or(0, |(l, _)| l);
        out.push_str(&format!("{offset:04x}  [{line:4}]  {s}\n"));
        offset += size;
    }
    for f in &proto.functions {
        disassemble_into(f, out);
    }
}

/// Disassemble a single instruction at `offset`.
///
/// Returns `(text, bytes_consumed)`.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let byte = chunk.code[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(_) => return (format!("UNKNOWN({byte:#04x})"), 1),
    };
    if offset + op.size() > chunk.code.len() {
        return (format!("{op:?} <truncated>"), chunk.code.len() - offset);
    }

    let mut text = format!("{op:?}");
    let mut at = offset + 1;
    for (i, operand) in op.operands().iter().enumerate() {
        let value = match operand {
            Operand::U8 => chunk.code[at] as u32,
            Operand::U16 => chunk.read_u16(at) as u32,
            Operand::U32 => chunk.read_u32(at),
        };
        at += operand.width();
        if i == 0 && op.names_constant() {
            let c = chunk
                .constants
                .get(value as usize)
                .map(|c| c.to_string())
                .unwrap_or_else(|| "<oob>".to_string());
            text.push_str(&format!(" [{value}] {c}"));
        } else if matches!(op, OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop | OpCode::And | OpCode::Or) {
            text.push_str(&format!(" -> {value:#06x}"));
        } else if *operand == Operand::U32 {
            text.push_str(&format!(" mask={value:#x}"));
        } else {
            text.push_str(&format!(" {value}"));
        }
    }
    (text, op.size())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0u8..=255 {
            if let Ok(op) = OpCode::try_from(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert!(OpCode::try_from(0x99u8).is_err());
    }

    #[test]
    fn test_operand_sizes() {
        assert_eq!(OpCode::Add.size(), 1);
        assert_eq!(OpCode::LoadLocal.size(), 2);
        assert_eq!(OpCode::Const.size(), 3);
        assert_eq!(OpCode::CallMethod.size(), 4);
        assert_eq!(OpCode::CheckParam.size(), 6);
        assert_eq!(OpCode::StructMember.size(), 8);
    }

    #[test]
    fn test_constant_dedup() {
        let mut chunk = Chunk::new();
        let i1 = chunk.add_constant(Constant::Int(42));
        let i2 = chunk.add_constant(Constant::Int(42));
        let i3 = chunk.add_constant(Constant::Int(99));
        assert_eq!(i1, i2, "duplicate constants should share an index");
        assert_ne!(i1, i3);
        let z = chunk.add_constant(Constant::Float(0.0));
        let nz = chunk.add_constant(Constant::Float(-0.0));
        assert_ne!(z, nz);
        assert_eq!(chunk.constants.len(), 4);
    }

    #[test]
    fn test_jump_patch() {
        let mut chunk = Chunk::new();
        let patch = chunk.emit_jump(OpCode::JumpIfFalse);
        chunk.emit_op(OpCode::Pop);
        chunk.patch_jump(patch).unwrap();
        let target = chunk.read_u16(patch);
        assert_eq!(target as usize, chunk.code.len());
    }

    #[test]
    fn test_line_table_is_run_length() {
        let mut chunk = Chunk::new();
        chunk.mark(1, 1);
        chunk.emit_op(OpCode::Null);
        chunk.mark(1, 1);
        chunk.emit_op(OpCode::Pop);
        chunk.mark(3, 5);
        chunk.emit_op(OpCode::Return);
        assert_eq!(chunk.lines.len(), 2);
        assert_eq!(chunk.position_at(1), Some((1, 1)));
        assert_eq!(chunk.position_at(2), Some((3, 5)));
    }

    #[test]
    fn test_validate_rejects_bad_streams() {
        let mut chunk = Chunk::new();
        chunk.emit_op(OpCode::Return);
        assert!(chunk.validate().is_ok());
        chunk.emit_byte(0x99);
        assert!(chunk.validate().is_err());

        let mut chunk = Chunk::new();
        chunk.emit_op(OpCode::LoadLocal);
        assert!(chunk.validate().is_err(), "missing operand");

        let mut chunk = Chunk::new();
        chunk.emit_op_u16(OpCode::Const, 3);
        assert!(chunk.validate().is_err(), "dangling constant");
    }

    #[test]
    fn test_parameter_mask() {
        let mut proto = FunctionPrototype::new("f", "main");
        proto.parameter_names = vec!["a".into(), "b".into()];
        proto.locals.push(LocalInfo {
            name: "b".into(),
            slot: 2,
            start: 0,
            end: 10,
            mask: TypeMask::INTEGER,
            is_const: false,
            captured: 0,
        });
        assert_eq!(proto.parameter_mask(0), TypeMask::ANY);
        assert_eq!(proto.parameter_mask(1), TypeMask::INTEGER);
    }

    #[test]
    fn test_disassemble_smoke() {
        let mut proto = FunctionPrototype::new("test", "main");
        let idx = proto.chunk.add_constant(Constant::Int(42)).unwrap();
        proto.chunk.emit_op_u16(OpCode::Const, idx);
        proto.chunk.emit_op(OpCode::Return);
        let text = disassemble(&proto);
        assert!(text.contains("Const [0] 42"));
        assert!(text.contains("Return"));
    }
}
