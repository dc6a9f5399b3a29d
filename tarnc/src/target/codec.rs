//! Binary encoding of [`Module`]s.
//!
//! ```text
//! module  := magic:"\0tgc" version:u32le section*
//! section := tag:u8 len:uleb payload[len]
//! ```
//!
//! Integers inside payloads are LEB128; strings and byte blobs are
//! length-prefixed. Every section but `custom` appears at most once.

use thiserror::Error;

use super::{
    BinaryOp, CustomSection, DataSegment, Export, Function, Global, GlobalInit, Import, Instr,
    Module, Reg, TrapKind, TypeDef, UnaryOp, ValType,
};

pub const MAGIC: &[u8; 4] = b"\0tgc";
pub const VERSION: u32 = 1;

const SECTION_TYPES: u8 = 1;
const SECTION_IMPORTS: u8 = 2;
const SECTION_FUNCTIONS: u8 = 3;
const SECTION_GLOBALS: u8 = 4;
const SECTION_EXPORTS: u8 = 5;
const SECTION_MEMORY: u8 = 6;
const SECTION_DATA: u8 = 7;
const SECTION_CUSTOM: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid varint encoding")]
    InvalidVarint,
    #[error("out of bounds")]
    OutOfBounds,
    #[error("invalid UTF-8")]
    InvalidUtf8,
    #[error("bad magic header")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown section tag {0}")]
    UnknownSection(u8),
    #[error("duplicate section {0}")]
    DuplicateSection(u8),
    #[error("section {0} has trailing bytes")]
    TrailingBytes(u8),
    #[error("unknown value type {0:#x}")]
    UnknownValType(u8),
    #[error("unknown type definition {0:#x}")]
    UnknownTypeDef(u8),
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("unknown operator {0}")]
    UnknownOperator(u8),
    #[error("unknown trap kind {0}")]
    UnknownTrap(u8),
}

// ============================================================================
// Primitives
// ============================================================================

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.offset.checked_add(len).ok_or(DecodeError::OutOfBounds)?;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_uleb128_u64(&mut self) -> Result<u64, DecodeError> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(DecodeError::InvalidVarint);
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::InvalidVarint);
            }
        }
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        u32::try_from(self.read_uleb128_u64()?).map_err(|_| DecodeError::OutOfBounds)
    }

    fn read_sleb128_i64(&mut self) -> Result<i64, DecodeError> {
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift > 63 {
                return Err(DecodeError::InvalidVarint);
            }
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    fn read_str(&mut self) -> Result<String, DecodeError> {
        let b = self.read_bytes()?;
        std::str::from_utf8(b)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    fn read_vec<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T, DecodeError>) -> Result<Vec<T>, DecodeError> {
        let n = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            out.push(item(self)?);
        }
        Ok(out)
    }
}

#[derive(Default)]
struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    fn write_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    fn write_uleb128_u64(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.bytes.push(byte);
                return;
            }
            self.bytes.push(byte | 0x80);
        }
    }

    fn write_u32(&mut self, v: u32) {
        self.write_uleb128_u64(u64::from(v));
    }

    fn write_sleb128_i64(&mut self, mut v: i64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
            if done {
                self.bytes.push(byte);
                return;
            }
            self.bytes.push(byte | 0x80);
        }
    }

    fn write_bytes(&mut self, b: &[u8]) {
        self.write_u32(b.len() as u32);
        self.bytes.extend_from_slice(b);
    }

    fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    fn write_regs(&mut self, regs: &[Reg]) {
        self.write_u32(regs.len() as u32);
        for r in regs {
            self.write_u32(*r);
        }
    }

    fn write_opt_reg(&mut self, reg: Option<Reg>) {
        match reg {
            Some(r) => {
                self.write_u8(1);
                self.write_u32(r);
            }
            None => self.write_u8(0),
        }
    }

    fn section(&mut self, tag: u8, payload: Writer) {
        self.write_u8(tag);
        self.write_bytes(&payload.bytes);
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a module.
pub fn encode(module: &Module) -> Vec<u8> {
    let mut out = Writer::default();
    out.bytes.extend_from_slice(MAGIC);
    out.bytes.extend_from_slice(&VERSION.to_le_bytes());

    let mut w = Writer::default();
    w.write_u32(module.types.len() as u32);
    for ty in &module.types {
        write_type_def(&mut w, ty);
    }
    out.section(SECTION_TYPES, w);

    let mut w = Writer::default();
    w.write_u32(module.imports.len() as u32);
    for import in &module.imports {
        w.write_str(&import.module);
        w.write_str(&import.name);
        w.write_u32(import.ty);
    }
    out.section(SECTION_IMPORTS, w);

    let mut w = Writer::default();
    w.write_u32(module.functions.len() as u32);
    for f in &module.functions {
        w.write_str(&f.name);
        w.write_u32(f.ty);
        w.write_u32(f.regs.len() as u32);
        for r in &f.regs {
            write_val_type(&mut w, *r);
        }
        w.write_u32(f.code.len() as u32);
        for instr in &f.code {
            write_instr(&mut w, instr);
        }
    }
    out.section(SECTION_FUNCTIONS, w);

    let mut w = Writer::default();
    w.write_u32(module.globals.len() as u32);
    for g in &module.globals {
        w.write_str(&g.name);
        write_val_type(&mut w, g.ty);
        w.write_u8(u8::from(g.mutable));
        match g.init {
            GlobalInit::I32(v) => {
                w.write_u8(0);
                w.write_sleb128_i64(i64::from(v));
            }
            GlobalInit::I64(v) => {
                w.write_u8(1);
                w.write_sleb128_i64(v);
            }
            GlobalInit::Null => w.write_u8(2),
        }
    }
    out.section(SECTION_GLOBALS, w);

    let mut w = Writer::default();
    w.write_u32(module.exports.len() as u32);
    for e in &module.exports {
        w.write_str(&e.name);
        w.write_u32(e.func);
    }
    out.section(SECTION_EXPORTS, w);

    let mut w = Writer::default();
    w.write_u32(module.memory_size);
    out.section(SECTION_MEMORY, w);

    let mut w = Writer::default();
    w.write_u32(module.data.len() as u32);
    for d in &module.data {
        w.write_u32(d.offset);
        w.write_bytes(&d.bytes);
    }
    out.section(SECTION_DATA, w);

    for c in &module.custom {
        let mut w = Writer::default();
        w.write_str(&c.name);
        w.write_bytes(&c.bytes);
        out.section(SECTION_CUSTOM, w);
    }
    out.bytes
}

fn write_val_type(w: &mut Writer, ty: ValType) {
    match ty {
        ValType::I32 => w.write_u8(0x01),
        ValType::I64 => w.write_u8(0x02),
        ValType::AnyRef => w.write_u8(0x03),
        ValType::Ref(idx) => {
            w.write_u8(0x04);
            w.write_u32(idx);
        }
        ValType::FuncRef => w.write_u8(0x05),
    }
}

fn write_type_def(w: &mut Writer, ty: &TypeDef) {
    match ty {
        TypeDef::Struct { name, fields } => {
            w.write_u8(0x10);
            w.write_str(name);
            w.write_u32(fields.len() as u32);
            for f in fields {
                write_val_type(w, *f);
            }
        }
        TypeDef::Array { name, elem } => {
            w.write_u8(0x11);
            w.write_str(name);
            write_val_type(w, *elem);
        }
        TypeDef::Func { params, results } => {
            w.write_u8(0x12);
            w.write_u32(params.len() as u32);
            for p in params {
                write_val_type(w, *p);
            }
            w.write_u32(results.len() as u32);
            for r in results {
                write_val_type(w, *r);
            }
        }
    }
}

fn write_instr(w: &mut Writer, instr: &Instr) {
    match instr {
        Instr::I32Const { dst, value } => {
            w.write_u8(0x01);
            w.write_u32(*dst);
            w.write_sleb128_i64(i64::from(*value));
        }
        Instr::I64Const { dst, value } => {
            w.write_u8(0x02);
            w.write_u32(*dst);
            w.write_sleb128_i64(*value);
        }
        Instr::RefNull { dst } => {
            w.write_u8(0x03);
            w.write_u32(*dst);
        }
        Instr::RefFunc { dst, func } => {
            w.write_u8(0x04);
            w.write_u32(*dst);
            w.write_u32(*func);
        }
        Instr::Move { dst, src } => {
            w.write_u8(0x05);
            w.write_u32(*dst);
            w.write_u32(*src);
        }
        Instr::Binary { op, dst, lhs, rhs } => {
            w.write_u8(0x06);
            w.write_u8(*op as u8);
            w.write_u32(*dst);
            w.write_u32(*lhs);
            w.write_u32(*rhs);
        }
        Instr::Unary { op, dst, src } => {
            w.write_u8(0x07);
            w.write_u8(*op as u8);
            w.write_u32(*dst);
            w.write_u32(*src);
        }
        Instr::StructNew { dst, ty, fields } => {
            w.write_u8(0x08);
            w.write_u32(*dst);
            w.write_u32(*ty);
            w.write_regs(fields);
        }
        Instr::StructGet { dst, obj, ty, field } => {
            w.write_u8(0x09);
            w.write_u32(*dst);
            w.write_u32(*obj);
            w.write_u32(*ty);
            w.write_u32(*field);
        }
        Instr::StructSet { obj, ty, field, src } => {
            w.write_u8(0x0a);
            w.write_u32(*obj);
            w.write_u32(*ty);
            w.write_u32(*field);
            w.write_u32(*src);
        }
        Instr::ArrayNewFixed { dst, ty, elems } => {
            w.write_u8(0x0b);
            w.write_u32(*dst);
            w.write_u32(*ty);
            w.write_regs(elems);
        }
        Instr::ArrayGet { dst, array, index } => {
            w.write_u8(0x0c);
            w.write_u32(*dst);
            w.write_u32(*array);
            w.write_u32(*index);
        }
        Instr::ArrayLen { dst, array } => {
            w.write_u8(0x0d);
            w.write_u32(*dst);
            w.write_u32(*array);
        }
        Instr::RefIsNull { dst, src } => {
            w.write_u8(0x0e);
            w.write_u32(*dst);
            w.write_u32(*src);
        }
        Instr::RefEq { dst, lhs, rhs } => {
            w.write_u8(0x0f);
            w.write_u32(*dst);
            w.write_u32(*lhs);
            w.write_u32(*rhs);
        }
        Instr::RefCast { dst, src, ty } => {
            w.write_u8(0x10);
            w.write_u32(*dst);
            w.write_u32(*src);
            w.write_u32(*ty);
        }
        Instr::GlobalGet { dst, global } => {
            w.write_u8(0x11);
            w.write_u32(*dst);
            w.write_u32(*global);
        }
        Instr::GlobalSet { global, src } => {
            w.write_u8(0x12);
            w.write_u32(*global);
            w.write_u32(*src);
        }
        Instr::Load64 { dst, addr, offset } => {
            w.write_u8(0x13);
            w.write_u32(*dst);
            w.write_u32(*addr);
            w.write_u32(*offset);
        }
        Instr::Store64 { addr, offset, src } => {
            w.write_u8(0x14);
            w.write_u32(*addr);
            w.write_u32(*offset);
            w.write_u32(*src);
        }
        Instr::Call { dst, func, args } => {
            w.write_u8(0x15);
            w.write_opt_reg(*dst);
            w.write_u32(*func);
            w.write_regs(args);
        }
        Instr::CallRef { dst, ty, callee, args } => {
            w.write_u8(0x16);
            w.write_opt_reg(*dst);
            w.write_u32(*ty);
            w.write_u32(*callee);
            w.write_regs(args);
        }
        Instr::CallImport { dst, import, args } => {
            w.write_u8(0x17);
            w.write_opt_reg(*dst);
            w.write_u32(*import);
            w.write_regs(args);
        }
        Instr::Jump { target } => {
            w.write_u8(0x18);
            w.write_u32(*target);
        }
        Instr::BranchIf { cond, target } => {
            w.write_u8(0x19);
            w.write_u32(*cond);
            w.write_u32(*target);
        }
        Instr::BranchIfNot { cond, target } => {
            w.write_u8(0x1a);
            w.write_u32(*cond);
            w.write_u32(*target);
        }
        Instr::Return { value } => {
            w.write_u8(0x1b);
            w.write_opt_reg(*value);
        }
        Instr::Trap { kind, args } => {
            w.write_u8(0x1c);
            w.write_u8(*kind as u8);
            w.write_regs(args);
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a module, validating framing and every tag.
pub fn decode(bytes: &[u8]) -> Result<Module, DecodeError> {
    let mut r = Reader::new(bytes);
    if r.take(4).map_err(|_| DecodeError::BadMagic)? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = r.read_u32_le()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let mut module = Module::default();
    let mut seen = [false; 9];
    while !r.is_empty() {
        let tag = r.read_u8()?;
        let payload = r.read_bytes()?;
        if !(SECTION_TYPES..=SECTION_CUSTOM).contains(&tag) {
            return Err(DecodeError::UnknownSection(tag));
        }
        if tag != SECTION_CUSTOM {
            if seen[tag as usize] {
                return Err(DecodeError::DuplicateSection(tag));
            }
            seen[tag as usize] = true;
        }
        let mut s = Reader::new(payload);
        match tag {
            SECTION_TYPES => module.types = s.read_vec(read_type_def)?,
            SECTION_IMPORTS => {
                module.imports = s.read_vec(|s| {
                    Ok(Import {
                        module: s.read_str()?,
                        name: s.read_str()?,
                        ty: s.read_u32()?,
                    })
                })?
            }
            SECTION_FUNCTIONS => module.functions = s.read_vec(read_function)?,
            SECTION_GLOBALS => module.globals = s.read_vec(read_global)?,
            SECTION_EXPORTS => {
                module.exports = s.read_vec(|s| {
                    Ok(Export {
                        name: s.read_str()?,
                        func: s.read_u32()?,
                    })
                })?
            }
            SECTION_MEMORY => module.memory_size = s.read_u32()?,
            SECTION_DATA => {
                module.data = s.read_vec(|s| {
                    Ok(DataSegment {
                        offset: s.read_u32()?,
                        bytes: s.read_bytes()?.to_vec(),
                    })
                })?
            }
            _ => module.custom.push(CustomSection {
                name: s.read_str()?,
                bytes: s.read_bytes()?.to_vec(),
            }),
        }
        if !s.is_empty() {
            return Err(DecodeError::TrailingBytes(tag));
        }
    }
    Ok(module)
}

fn read_val_type(r: &mut Reader<'_>) -> Result<ValType, DecodeError> {
    match r.read_u8()? {
        0x01 => Ok(ValType::I32),
        0x02 => Ok(ValType::I64),
        0x03 => Ok(ValType::AnyRef),
        0x04 => Ok(ValType::Ref(r.read_u32()?)),
        0x05 => Ok(ValType::FuncRef),
        other => Err(DecodeError::UnknownValType(other)),
    }
}

fn read_type_def(r: &mut Reader<'_>) -> Result<TypeDef, DecodeError> {
    match r.read_u8()? {
        0x10 => Ok(TypeDef::Struct {
            name: r.read_str()?,
            fields: r.read_vec(read_val_type)?,
        }),
        0x11 => Ok(TypeDef::Array {
            name: r.read_str()?,
            elem: read_val_type(r)?,
        }),
        0x12 => Ok(TypeDef::Func {
            params: r.read_vec(read_val_type)?,
            results: r.read_vec(read_val_type)?,
        }),
        other => Err(DecodeError::UnknownTypeDef(other)),
    }
}

fn read_function(r: &mut Reader<'_>) -> Result<Function, DecodeError> {
    Ok(Function {
        name: r.read_str()?,
        ty: r.read_u32()?,
        regs: r.read_vec(read_val_type)?,
        code: r.read_vec(read_instr)?,
    })
}

fn read_global(r: &mut Reader<'_>) -> Result<Global, DecodeError> {
    let name = r.read_str()?;
    let ty = read_val_type(r)?;
    let mutable = r.read_u8()? != 0;
    let init = match r.read_u8()? {
        0 => GlobalInit::I32(i32::try_from(r.read_sleb128_i64()?).map_err(|_| DecodeError::OutOfBounds)?),
        1 => GlobalInit::I64(r.read_sleb128_i64()?),
        2 => GlobalInit::Null,
        other => return Err(DecodeError::UnknownValType(other)),
    };
    Ok(Global {
        name,
        ty,
        mutable,
        init,
    })
}

fn read_opt_reg(r: &mut Reader<'_>) -> Result<Option<Reg>, DecodeError> {
    match r.read_u8()? {
        0 => Ok(None),
        _ => Ok(Some(r.read_u32()?)),
    }
}

fn read_regs(r: &mut Reader<'_>) -> Result<Vec<Reg>, DecodeError> {
    r.read_vec(Reader::read_u32)
}

fn read_instr(r: &mut Reader<'_>) -> Result<Instr, DecodeError> {
    let opcode = r.read_u8()?;
    let instr = match opcode {
        0x01 => Instr::I32Const {
            dst: r.read_u32()?,
            value: i32::try_from(r.read_sleb128_i64()?).map_err(|_| DecodeError::OutOfBounds)?,
        },
        0x02 => Instr::I64Const {
            dst: r.read_u32()?,
            value: r.read_sleb128_i64()?,
        },
        0x03 => Instr::RefNull { dst: r.read_u32()? },
        0x04 => Instr::RefFunc {
            dst: r.read_u32()?,
            func: r.read_u32()?,
        },
        0x05 => Instr::Move {
            dst: r.read_u32()?,
            src: r.read_u32()?,
        },
        0x06 => {
            let raw = r.read_u8()?;
            Instr::Binary {
                op: BinaryOp::from_u8(raw).ok_or(DecodeError::UnknownOperator(raw))?,
                dst: r.read_u32()?,
                lhs: r.read_u32()?,
                rhs: r.read_u32()?,
            }
        }
        0x07 => {
            let raw = r.read_u8()?;
            Instr::Unary {
                op: UnaryOp::from_u8(raw).ok_or(DecodeError::UnknownOperator(raw))?,
                dst: r.read_u32()?,
                src: r.read_u32()?,
            }
        }
        0x08 => Instr::StructNew {
            dst: r.read_u32()?,
            ty: r.read_u32()?,
            fields: read_regs(r)?,
        },
        0x09 => Instr::StructGet {
            dst: r.read_u32()?,
            obj: r.read_u32()?,
            ty: r.read_u32()?,
            field: r.read_u32()?,
        },
        0x0a => Instr::StructSet {
            obj: r.read_u32()?,
            ty: r.read_u32()?,
            field: r.read_u32()?,
            src: r.read_u32()?,
        },
        0x0b => Instr::ArrayNewFixed {
            dst: r.read_u32()?,
            ty: r.read_u32()?,
            elems: read_regs(r)?,
        },
        0x0c => Instr::ArrayGet {
            dst: r.read_u32()?,
            array: r.read_u32()?,
            index: r.read_u32()?,
        },
        0x0d => Instr::ArrayLen {
            dst: r.read_u32()?,
            array: r.read_u32()?,
        },
        0x0e => Instr::RefIsNull {
            dst: r.read_u32()?,
            src: r.read_u32()?,
        },
        0x0f => Instr::RefEq {
            dst: r.read_u32()?,
            lhs: r.read_u32()?,
            rhs: r.read_u32()?,
        },
        0x10 => Instr::RefCast {
            dst: r.read_u32()?,
            src: r.read_u32()?,
            ty: r.read_u32()?,
        },
        0x11 => Instr::GlobalGet {
            dst: r.read_u32()?,
            global: r.read_u32()?,
        },
        0x12 => Instr::GlobalSet {
            global: r.read_u32()?,
            src: r.read_u32()?,
        },
        0x13 => Instr::Load64 {
            dst: r.read_u32()?,
            addr: r.read_u32()?,
            offset: r.read_u32()?,
        },
        0x14 => Instr::Store64 {
            addr: r.read_u32()?,
            offset: r.read_u32()?,
            src: r.read_u32()?,
        },
        0x15 => Instr::Call {
            dst: read_opt_reg(r)?,
            func: r.read_u32()?,
            args: read_regs(r)?,
        },
        0x16 => Instr::CallRef {
            dst: read_opt_reg(r)?,
            ty: r.read_u32()?,
            callee: r.read_u32()?,
            args: read_regs(r)?,
        },
        0x17 => Instr::CallImport {
            dst: read_opt_reg(r)?,
            import: r.read_u32()?,
            args: read_regs(r)?,
        },
        0x18 => Instr::Jump { target: r.read_u32()? },
        0x19 => Instr::BranchIf {
            cond: r.read_u32()?,
            target: r.read_u32()?,
        },
        0x1a => Instr::BranchIfNot {
            cond: r.read_u32()?,
            target: r.read_u32()?,
        },
        0x1b => Instr::Return { value: read_opt_reg(r)? },
        0x1c => {
            let raw = r.read_u8()?;
            Instr::Trap {
                kind: TrapKind::from_u8(raw).ok_or(DecodeError::UnknownTrap(raw))?,
                args: read_regs(r)?,
            }
        }
        other => return Err(DecodeError::UnknownOpcode(other)),
    };
    Ok(instr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Module {
        Module {
            types: vec![
                TypeDef::Func {
                    params: vec![ValType::I32],
                    results: vec![ValType::I64],
                },
                TypeDef::Struct {
                    name: "pair".into(),
                    fields: vec![ValType::I64, ValType::Ref(2)],
                },
                TypeDef::Array {
                    name: "fns".into(),
                    elem: ValType::FuncRef,
                },
            ],
            imports: vec![Import {
                module: "env".into(),
                name: "write_value".into(),
                ty: 0,
            }],
            functions: vec![Function {
                name: "f".into(),
                ty: 0,
                regs: vec![ValType::I32, ValType::I64, ValType::AnyRef],
                code: vec![
                    Instr::I64Const { dst: 1, value: -300 },
                    Instr::I32Const {
                        dst: 0,
                        value: i32::MIN,
                    },
                    Instr::Binary {
                        op: BinaryOp::I64ShrU,
                        dst: 1,
                        lhs: 1,
                        rhs: 1,
                    },
                    Instr::Call {
                        dst: None,
                        func: 0,
                        args: vec![0],
                    },
                    Instr::Trap {
                        kind: TrapKind::TailResumption,
                        args: vec![0, 0, 0],
                    },
                    Instr::Return { value: Some(1) },
                ],
            }],
            globals: vec![Global {
                name: "ready".into(),
                ty: ValType::I32,
                mutable: true,
                init: GlobalInit::I32(0),
            }],
            exports: vec![Export {
                name: "f".into(),
                func: 0,
            }],
            memory_size: 65536,
            data: vec![DataSegment {
                offset: 272,
                bytes: b"Async.await".to_vec(),
            }],
            custom: vec![CustomSection {
                name: "tarn.effects".into(),
                bytes: b"{}".to_vec(),
            }],
        }
    }

    #[test]
    fn test_module_survives_encoding() {
        let module = sample();
        let bytes = encode(&module);
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(decode(&bytes).unwrap(), module);
    }

    #[test]
    fn test_signed_varints_cover_extremes() {
        for v in [0i64, -1, 63, -64, 64, -65, i64::MAX, i64::MIN] {
            let mut w = Writer::default();
            w.write_sleb128_i64(v);
            let mut r = Reader::new(&w.bytes);
            assert_eq!(r.read_sleb128_i64().unwrap(), v);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        assert_eq!(decode(b"\0wasm"), Err(DecodeError::BadMagic));
        let mut bytes = encode(&Module::default());
        bytes[4] = 9;
        assert_eq!(decode(&bytes), Err(DecodeError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let bytes = encode(&sample());
        let cut = &bytes[..bytes.len() - 3];
        assert!(decode(cut).is_err());
    }

    #[test]
    fn test_duplicate_section_is_rejected() {
        let mut bytes = encode(&Module::default());
        bytes.extend_from_slice(&[SECTION_MEMORY, 1, 0]);
        assert_eq!(decode(&bytes), Err(DecodeError::DuplicateSection(SECTION_MEMORY)));
    }
}
