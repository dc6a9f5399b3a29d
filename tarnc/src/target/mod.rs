//! # GC Target Module
//!
//! The backend emits modules for a small register machine with garbage
//! collected structs and arrays, typed function references and a flat linear
//! memory used only for host scratch space and constant strings.
//!
//! ## Layout
//!
//! | Item          | Index space                               |
//! |---------------|-------------------------------------------|
//! | [`TypeDef`]   | struct, array and function types          |
//! | [`Import`]    | host functions, called with `CallImport`  |
//! | [`Function`]  | module functions, called with `Call`      |
//! | [`Global`]    | mutable scalar cells                      |
//!
//! Registers are numbered per function; parameters occupy the first
//! registers. Control flow uses absolute instruction indices.
//!
//! - [`builder`] - Function and module builders with label fixups
//! - [`codec`] - The binary encoding

pub mod builder;
pub mod codec;

pub use builder::{BuildError, FunctionBuilder, Label, ModuleBuilder};
pub use codec::{decode, encode, DecodeError};

use std::fmt;

pub type TypeIdx = u32;
pub type FuncIdx = u32;
pub type ImportIdx = u32;
pub type GlobalIdx = u32;
pub type Reg = u32;

/// A value type of a register, field or parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValType {
    I32,
    I64,
    /// Any GC reference, nullable.
    AnyRef,
    /// A nullable reference to a struct or array of the given type.
    Ref(TypeIdx),
    /// A nullable function reference.
    FuncRef,
}

impl ValType {
    pub fn is_ref(self) -> bool {
        matches!(self, ValType::AnyRef | ValType::Ref(_) | ValType::FuncRef)
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::AnyRef => write!(f, "anyref"),
            ValType::Ref(idx) => write!(f, "(ref {})", idx),
            ValType::FuncRef => write!(f, "funcref"),
        }
    }
}

/// A type definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDef {
    Struct { name: String, fields: Vec<ValType> },
    Array { name: String, elem: ValType },
    Func { params: Vec<ValType>, results: Vec<ValType> },
}

impl TypeDef {
    pub fn name(&self) -> Option<&str> {
        match self {
            TypeDef::Struct { name, .. } | TypeDef::Array { name, .. } => Some(name),
            TypeDef::Func { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    pub name: String,
    /// A function type.
    pub ty: TypeIdx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    /// A function type.
    pub ty: TypeIdx,
    /// Every register, parameters first.
    pub regs: Vec<ValType>,
    pub code: Vec<Instr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalInit {
    I32(i32),
    I64(i64),
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub name: String,
    pub ty: ValType,
    pub mutable: bool,
    pub init: GlobalInit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub func: FuncIdx,
}

/// Bytes copied into linear memory at instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// Uninterpreted named bytes, e.g. the effect protocol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSection {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Integer binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinaryOp {
    I32Add = 0,
    I32Sub = 1,
    I32Mul = 2,
    I32Eq = 3,
    I32Ne = 4,
    I32LtS = 5,
    I32LtU = 6,
    I32LeS = 7,
    I32LeU = 8,
    I32GtS = 9,
    I32GtU = 10,
    I32GeS = 11,
    I32GeU = 12,
    I64Add = 13,
    I64Sub = 14,
    I64Mul = 15,
    I64Eq = 16,
    I64Ne = 17,
    I64LtS = 18,
    I64LeS = 19,
    I64GtS = 20,
    I64GeS = 21,
    I64ShrU = 22,
}

impl BinaryOp {
    const ALL: [BinaryOp; 23] = [
        BinaryOp::I32Add,
        BinaryOp::I32Sub,
        BinaryOp::I32Mul,
        BinaryOp::I32Eq,
        BinaryOp::I32Ne,
        BinaryOp::I32LtS,
        BinaryOp::I32LtU,
        BinaryOp::I32LeS,
        BinaryOp::I32LeU,
        BinaryOp::I32GtS,
        BinaryOp::I32GtU,
        BinaryOp::I32GeS,
        BinaryOp::I32GeU,
        BinaryOp::I64Add,
        BinaryOp::I64Sub,
        BinaryOp::I64Mul,
        BinaryOp::I64Eq,
        BinaryOp::I64Ne,
        BinaryOp::I64LtS,
        BinaryOp::I64LeS,
        BinaryOp::I64GtS,
        BinaryOp::I64GeS,
        BinaryOp::I64ShrU,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    /// Whether the operands are 64-bit.
    pub fn is_i64(self) -> bool {
        self as u8 >= BinaryOp::I64Add as u8
    }

    /// Whether the result is an `i32` truth value.
    pub fn is_comparison(self) -> bool {
        !matches!(
            self,
            BinaryOp::I32Add
                | BinaryOp::I32Sub
                | BinaryOp::I32Mul
                | BinaryOp::I64Add
                | BinaryOp::I64Sub
                | BinaryOp::I64Mul
                | BinaryOp::I64ShrU
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnaryOp {
    I32Eqz = 0,
    I64ExtendI32S = 1,
    I64ExtendI32U = 2,
    I32WrapI64 = 3,
}

impl UnaryOp {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(UnaryOp::I32Eqz),
            1 => Some(UnaryOp::I64ExtendI32S),
            2 => Some(UnaryOp::I64ExtendI32U),
            3 => Some(UnaryOp::I32WrapI64),
            _ => None,
        }
    }
}

/// Deliberate traps raised by generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrapKind {
    /// A tail continuation was not resumed exactly once.
    /// Arguments: label pointer, label length, observed call count.
    TailResumption = 0,
    /// A continuation was invoked after `end`.
    /// Arguments: label pointer, label length.
    ContinuationEnded = 1,
    /// An export ran before `init_effects`.
    NotReady = 2,
    /// A request reached the host for an operation it cannot marshal.
    UnsupportedPayload = 3,
    /// A request for an in-module handler surfaced outside its scope.
    EscapedEffect = 4,
    Unreachable = 5,
}

impl TrapKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TrapKind::TailResumption),
            1 => Some(TrapKind::ContinuationEnded),
            2 => Some(TrapKind::NotReady),
            3 => Some(TrapKind::UnsupportedPayload),
            4 => Some(TrapKind::EscapedEffect),
            5 => Some(TrapKind::Unreachable),
            _ => None,
        }
    }

    /// The trap message. `label` is the operation label read from memory
    /// and `count` the last argument, for the kinds that carry them.
    pub fn message(self, label: &str, count: i64) -> String {
        match self {
            TrapKind::TailResumption => format!(
                "tail continuation `{}` must be resumed exactly once (observed {} calls)",
                label, count
            ),
            TrapKind::ContinuationEnded => format!("continuation `{}` was already ended", label),
            TrapKind::NotReady => "effects system not initialized (call init_effects first)".to_string(),
            TrapKind::UnsupportedPayload => "operation cannot be marshaled to the host".to_string(),
            TrapKind::EscapedEffect => "effect request escaped the handler that owns it".to_string(),
            TrapKind::Unreachable => "unreachable code executed".to_string(),
        }
    }
}

/// One machine instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    I32Const { dst: Reg, value: i32 },
    I64Const { dst: Reg, value: i64 },
    RefNull { dst: Reg },
    RefFunc { dst: Reg, func: FuncIdx },
    Move { dst: Reg, src: Reg },
    Binary { op: BinaryOp, dst: Reg, lhs: Reg, rhs: Reg },
    Unary { op: UnaryOp, dst: Reg, src: Reg },
    StructNew { dst: Reg, ty: TypeIdx, fields: Vec<Reg> },
    StructGet { dst: Reg, obj: Reg, ty: TypeIdx, field: u32 },
    StructSet { obj: Reg, ty: TypeIdx, field: u32, src: Reg },
    ArrayNewFixed { dst: Reg, ty: TypeIdx, elems: Vec<Reg> },
    ArrayGet { dst: Reg, array: Reg, index: Reg },
    ArrayLen { dst: Reg, array: Reg },
    RefIsNull { dst: Reg, src: Reg },
    RefEq { dst: Reg, lhs: Reg, rhs: Reg },
    /// Downcast; traps when a non-null reference has another type.
    RefCast { dst: Reg, src: Reg, ty: TypeIdx },
    GlobalGet { dst: Reg, global: GlobalIdx },
    GlobalSet { global: GlobalIdx, src: Reg },
    Load64 { dst: Reg, addr: Reg, offset: u32 },
    Store64 { addr: Reg, offset: u32, src: Reg },
    Call { dst: Option<Reg>, func: FuncIdx, args: Vec<Reg> },
    CallRef { dst: Option<Reg>, ty: TypeIdx, callee: Reg, args: Vec<Reg> },
    CallImport { dst: Option<Reg>, import: ImportIdx, args: Vec<Reg> },
    Jump { target: u32 },
    BranchIf { cond: Reg, target: u32 },
    BranchIfNot { cond: Reg, target: u32 },
    Return { value: Option<Reg> },
    Trap { kind: TrapKind, args: Vec<Reg> },
}

impl Instr {
    /// Redirect a branch. Other instructions are left unchanged.
    pub fn set_target(&mut self, to: u32) {
        match self {
            Instr::Jump { target } | Instr::BranchIf { target, .. } | Instr::BranchIfNot { target, .. } => {
                *target = to
            }
            _ => {}
        }
    }
}

/// A complete module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    pub types: Vec<TypeDef>,
    pub imports: Vec<Import>,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    /// Size of linear memory in bytes.
    pub memory_size: u32,
    pub data: Vec<DataSegment>,
    pub custom: Vec<CustomSection>,
}

impl Module {
    pub fn export(&self, name: &str) -> Option<FuncIdx> {
        self.exports.iter().find(|e| e.name == name).map(|e| e.func)
    }

    pub fn custom_section(&self, name: &str) -> Option<&[u8]> {
        self.custom.iter().find(|c| c.name == name).map(|c| c.bytes.as_slice())
    }

    /// Parameters and results of a function type.
    pub fn func_type(&self, ty: TypeIdx) -> Option<(&[ValType], &[ValType])> {
        match self.types.get(ty as usize)? {
            TypeDef::Func { params, results } => Some((params, results)),
            _ => None,
        }
    }

    pub fn type_named(&self, name: &str) -> Option<TypeIdx> {
        self.types
            .iter()
            .position(|t| t.name() == Some(name))
            .map(|i| i as TypeIdx)
    }

    pub fn function_named(&self, name: &str) -> Option<FuncIdx> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as FuncIdx)
    }
}
