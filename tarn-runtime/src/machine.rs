//! # GC Register Machine
//!
//! Executes target modules produced by `tarnc`. Structs and arrays are
//! reference counted; the module code never builds cycles through mutable
//! fields, so reference counting is enough for the machine's lifetime.
//!
//! ## Execution Model
//!
//! Every call gets a fresh register file initialized from the function's
//! register types. Frames live on an explicit stack owned by
//! [`Instance::invoke`], so nesting is bounded by
//! [`MachineConfig::max_call_depth`] rather than the native stack. Imports
//! are provided per call through the [`Imports`] trait, which also gets
//! mutable access to linear memory.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tarnc::target::{
    BinaryOp, FuncIdx, GlobalInit, Import, Instr, Module, TrapKind, TypeDef, TypeIdx, UnaryOp, ValType,
};
use thiserror::Error;

use crate::config::MachineConfig;

/// A register value.
#[derive(Clone, Default)]
pub enum Value {
    /// A 32-bit integer.
    I32(i32),
    /// A 64-bit integer.
    I64(i64),
    /// A nullable reference to a GC object.
    #[default]
    Null,
    /// A GC object.
    Ref(Rc<Object>),
    /// A nullable function reference.
    Func(Option<FuncIdx>),
}

impl Value {
    fn zero(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::AnyRef | ValType::Ref(_) => Value::Null,
            ValType::FuncRef => Value::Func(None),
        }
    }

    /// The object, if the value is a non-null reference.
    pub fn object(&self) -> Option<&Rc<Object>> {
        match self {
            Value::Ref(obj) => Some(obj),
            _ => None,
        }
    }

    /// Whether the value is a null reference.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Func(None))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "i32:{}", v),
            Value::I64(v) => write!(f, "i64:{}", v),
            Value::Null => write!(f, "null"),
            Value::Ref(obj) => write!(f, "ref:{}", obj.ty),
            Value::Func(Some(idx)) => write!(f, "func:{}", idx),
            Value::Func(None) => write!(f, "func:null"),
        }
    }
}

/// A heap object tagged with its type index.
#[derive(Debug)]
pub struct Object {
    /// The struct or array type.
    pub ty: TypeIdx,
    /// Fields or elements.
    pub slots: RefCell<Vec<Value>>,
}

/// Linear memory.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    /// Zeroed memory of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size] }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the memory has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn range(&self, addr: u64, len: u64) -> Result<std::ops::Range<usize>, MachineError> {
        let end = addr.checked_add(len).filter(|end| *end <= self.bytes.len() as u64);
        match end {
            Some(end) => Ok(addr as usize..end as usize),
            None => Err(MachineError::MemoryOutOfBounds { addr, len }),
        }
    }

    /// Borrow `len` bytes at `addr`.
    pub fn read_bytes(&self, addr: u32, len: u32) -> Result<&[u8], MachineError> {
        let range = self.range(addr as u64, len as u64)?;
        Ok(&self.bytes[range])
    }

    /// Copy `bytes` to `addr`.
    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MachineError> {
        let range = self.range(addr as u64, bytes.len() as u64)?;
        self.bytes[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Read a little-endian 64-bit word.
    pub fn read_u64(&self, addr: u64) -> Result<u64, MachineError> {
        let range = self.range(addr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.bytes[range]);
        Ok(u64::from_le_bytes(word))
    }

    /// Write a little-endian 64-bit word.
    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), MachineError> {
        let range = self.range(addr, 8)?;
        self.bytes[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read `len` bytes at `addr` as UTF-8, replacing invalid sequences.
    pub fn read_str(&self, addr: u32, len: u32) -> Result<String, MachineError> {
        Ok(String::from_utf8_lossy(self.read_bytes(addr, len)?).into_owned())
    }
}

/// Host functions imported by a module.
pub trait Imports {
    /// Call `import` with `args`. Returns the result value, if the import's
    /// type has one.
    fn call_import(
        &mut self,
        import: &Import,
        args: &[Value],
        memory: &mut Memory,
    ) -> Result<Option<Value>, MachineError>;
}

/// Imports for modules that never call the host.
#[derive(Debug, Default)]
pub struct NoImports;

impl Imports for NoImports {
    fn call_import(&mut self, import: &Import, _: &[Value], _: &mut Memory) -> Result<Option<Value>, MachineError> {
        Err(MachineError::UnknownImport {
            module: import.module.clone(),
            name: import.name.clone(),
        })
    }
}

/// Errors raised while executing a module.
#[derive(Debug, Clone, Error)]
pub enum MachineError {
    /// Generated code trapped deliberately.
    #[error("{message}")]
    Trap {
        /// The trap kind.
        kind: TrapKind,
        /// Message with the operation label filled in.
        message: String,
    },
    /// No export with this name.
    #[error("module has no export `{0}`")]
    UnknownExport(String),
    /// A call referred to a missing function.
    #[error("invalid function index {0}")]
    UnknownFunction(FuncIdx),
    /// The host does not provide an import.
    #[error("unresolved import `{module}.{name}`")]
    UnknownImport {
        /// Import module.
        module: String,
        /// Import name.
        name: String,
    },
    /// A function was called with the wrong number of arguments.
    #[error("`{func}` expects {expected} arguments, got {found}")]
    ArityMismatch {
        /// Function name.
        func: String,
        /// Declared parameter count.
        expected: usize,
        /// Passed argument count.
        found: usize,
    },
    /// An instruction found a value of the wrong shape.
    #[error("type mismatch in `{func}` at {pc}: expected {expected}")]
    TypeMismatch {
        /// Function name.
        func: String,
        /// Instruction index.
        pc: usize,
        /// The expected shape.
        expected: &'static str,
    },
    /// A null reference was dereferenced or called.
    #[error("null reference in `{func}` at {pc}")]
    NullReference {
        /// Function name.
        func: String,
        /// Instruction index.
        pc: usize,
    },
    /// A downcast failed.
    #[error("cannot cast object of type #{found} to type #{expected}")]
    BadCast {
        /// Target type.
        expected: TypeIdx,
        /// Actual type.
        found: TypeIdx,
    },
    /// A field or element index was out of range.
    #[error("index {index} out of bounds for object of type #{ty}")]
    IndexOutOfBounds {
        /// Object type.
        ty: TypeIdx,
        /// Requested index.
        index: i64,
    },
    /// A memory access was out of range.
    #[error("memory access of {len} bytes at {addr} is out of bounds")]
    MemoryOutOfBounds {
        /// Start address.
        addr: u64,
        /// Access width.
        len: u64,
    },
    /// A register, global or type index is invalid.
    #[error("malformed module: {0}")]
    Malformed(String),
    /// Too many nested calls.
    #[error("call depth limit of {0} exceeded")]
    CallDepthExceeded(usize),
    /// Too many instructions in one host call.
    #[error("step limit of {0} exceeded")]
    StepLimitExceeded(u64),
}

/// An instantiated module.
pub struct Instance {
    module: Rc<Module>,
    memory: Memory,
    globals: Vec<Value>,
    config: MachineConfig,
    steps: u64,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("functions", &self.module.functions.len())
            .field("memory", &self.memory.len())
            .finish()
    }
}

/// One activation on the machine's call stack.
struct Frame<'m> {
    name: &'m str,
    code: &'m [Instr],
    regs: Vec<Value>,
    pc: usize,
    /// The caller's register receiving this call's result.
    ret: Option<u32>,
}

/// What the current instruction asks the dispatch loop to do.
enum Step {
    Next,
    Call { func: FuncIdx, args: Vec<Value>, dst: Option<u32> },
    Return(Option<Value>),
}

impl<'m> Frame<'m> {
    fn reg(&self, r: u32, pc: usize) -> Result<&Value, MachineError> {
        self.regs
            .get(r as usize)
            .ok_or_else(|| MachineError::Malformed(format!("register {} out of range in `{}` at {}", r, self.name, pc)))
    }

    fn set(&mut self, r: u32, value: Value, pc: usize) -> Result<(), MachineError> {
        match self.regs.get_mut(r as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(MachineError::Malformed(format!(
                "register {} out of range in `{}` at {}",
                r, self.name, pc
            ))),
        }
    }

    fn i32(&self, r: u32, pc: usize) -> Result<i32, MachineError> {
        match self.reg(r, pc)? {
            Value::I32(v) => Ok(*v),
            _ => Err(self.mismatch(pc, "i32")),
        }
    }

    fn i64(&self, r: u32, pc: usize) -> Result<i64, MachineError> {
        match self.reg(r, pc)? {
            Value::I64(v) => Ok(*v),
            _ => Err(self.mismatch(pc, "i64")),
        }
    }

    fn object(&self, r: u32, pc: usize) -> Result<Rc<Object>, MachineError> {
        match self.reg(r, pc)? {
            Value::Ref(obj) => Ok(Rc::clone(obj)),
            Value::Null => Err(MachineError::NullReference {
                func: self.name.to_string(),
                pc,
            }),
            _ => Err(self.mismatch(pc, "reference")),
        }
    }

    fn args(&self, regs: &[u32], pc: usize) -> Result<Vec<Value>, MachineError> {
        regs.iter().map(|r| self.reg(*r, pc).cloned()).collect()
    }

    fn mismatch(&self, pc: usize, expected: &'static str) -> MachineError {
        MachineError::TypeMismatch {
            func: self.name.to_string(),
            pc,
            expected,
        }
    }
}

impl Instance {
    /// Instantiate `module`: allocate memory, copy data segments and
    /// initialize globals.
    pub fn new(module: Module, config: MachineConfig) -> Result<Self, MachineError> {
        let mut memory = Memory::new(module.memory_size as usize);
        for segment in &module.data {
            memory.write_bytes(segment.offset, &segment.bytes)?;
        }
        let globals = module
            .globals
            .iter()
            .map(|g| match g.init {
                GlobalInit::I32(v) => Value::I32(v),
                GlobalInit::I64(v) => Value::I64(v),
                GlobalInit::Null => Value::Null,
            })
            .collect();
        Ok(Self {
            module: Rc::new(module),
            memory,
            globals,
            config,
            steps: 0,
        })
    }

    /// The instantiated module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Linear memory.
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Mutable linear memory.
    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Call the export `name`.
    pub fn invoke_export(
        &mut self,
        name: &str,
        args: Vec<Value>,
        imports: &mut dyn Imports,
    ) -> Result<Option<Value>, MachineError> {
        let func = self
            .module
            .export(name)
            .ok_or_else(|| MachineError::UnknownExport(name.to_string()))?;
        self.invoke(func, args, imports)
    }

    /// Call function `func` from the host. Resets the step counter.
    pub fn invoke(
        &mut self,
        func: FuncIdx,
        args: Vec<Value>,
        imports: &mut dyn Imports,
    ) -> Result<Option<Value>, MachineError> {
        self.steps = 0;
        let module = Rc::clone(&self.module);
        let mut stack = Vec::new();
        stack.push(enter(&module, func, args, None)?);
        self.execute(&module, stack, imports)
    }

    /// Run until the bottom frame returns.
    fn execute<'m>(
        &mut self,
        module: &'m Module,
        mut stack: Vec<Frame<'m>>,
        imports: &mut dyn Imports,
    ) -> Result<Option<Value>, MachineError> {
        loop {
            let step = match stack.last_mut() {
                Some(frame) => self.step(module, frame, imports)?,
                None => return Ok(None),
            };
            match step {
                Step::Next => {}
                Step::Call { func, args, dst } => {
                    if stack.len() >= self.config.max_call_depth {
                        return Err(MachineError::CallDepthExceeded(self.config.max_call_depth));
                    }
                    stack.push(enter(module, func, args, dst)?);
                }
                Step::Return(value) => {
                    let ret = stack.pop().and_then(|f| f.ret);
                    match stack.last_mut() {
                        Some(caller) => {
                            let pc = caller.pc.saturating_sub(1);
                            store_result(caller, ret, value, pc)?;
                        }
                        None => return Ok(value),
                    }
                }
            }
        }
    }

    /// Execute the instruction at `frame.pc`. Calls and returns are handed
    /// back to [`Instance::execute`].
    fn step<'m>(
        &mut self,
        module: &'m Module,
        frame: &mut Frame<'m>,
        imports: &mut dyn Imports,
    ) -> Result<Step, MachineError> {
        let pc = frame.pc;
        let code: &'m [Instr] = frame.code;
        let Some(instr) = code.get(pc) else {
            return Ok(Step::Return(None));
        };
        self.steps += 1;
        if self.config.max_steps > 0 && self.steps > self.config.max_steps {
            return Err(MachineError::StepLimitExceeded(self.config.max_steps));
        }
        let mut next = pc + 1;
        match instr {
            Instr::I32Const { dst, value } => frame.set(*dst, Value::I32(*value), pc)?,
            Instr::I64Const { dst, value } => frame.set(*dst, Value::I64(*value), pc)?,
            Instr::RefNull { dst } => frame.set(*dst, Value::Null, pc)?,
            Instr::RefFunc { dst, func } => frame.set(*dst, Value::Func(Some(*func)), pc)?,
            Instr::Move { dst, src } => {
                let v = frame.reg(*src, pc)?.clone();
                frame.set(*dst, v, pc)?;
            }
            Instr::Binary { op, dst, lhs, rhs } => {
                let v = if op.is_i64() {
                    binary_i64(*op, frame.i64(*lhs, pc)?, frame.i64(*rhs, pc)?)
                } else {
                    Value::I32(binary_i32(*op, frame.i32(*lhs, pc)?, frame.i32(*rhs, pc)?))
                };
                frame.set(*dst, v, pc)?;
            }
            Instr::Unary { op, dst, src } => {
                let v = match op {
                    UnaryOp::I32Eqz => Value::I32((frame.i32(*src, pc)? == 0) as i32),
                    UnaryOp::I64ExtendI32S => Value::I64(frame.i32(*src, pc)? as i64),
                    UnaryOp::I64ExtendI32U => Value::I64(frame.i32(*src, pc)? as u32 as i64),
                    UnaryOp::I32WrapI64 => Value::I32(frame.i64(*src, pc)? as i32),
                };
                frame.set(*dst, v, pc)?;
            }
            Instr::StructNew { dst, ty, fields } => {
                let slots = frame.args(fields, pc)?;
                self.check_struct(module, *ty, slots.len())?;
                frame.set(*dst, new_object(*ty, slots), pc)?;
            }
            Instr::StructGet { dst, obj, field, .. } => {
                let obj = frame.object(*obj, pc)?;
                let v = slot(&obj, *field as i64)?;
                frame.set(*dst, v, pc)?;
            }
            Instr::StructSet { obj, field, src, .. } => {
                let obj = frame.object(*obj, pc)?;
                let v = frame.reg(*src, pc)?.clone();
                let mut slots = obj.slots.borrow_mut();
                match slots.get_mut(*field as usize) {
                    Some(s) => *s = v,
                    None => {
                        return Err(MachineError::IndexOutOfBounds {
                            ty: obj.ty,
                            index: *field as i64,
                        })
                    }
                }
            }
            Instr::ArrayNewFixed { dst, ty, elems } => {
                let slots = frame.args(elems, pc)?;
                frame.set(*dst, new_object(*ty, slots), pc)?;
            }
            Instr::ArrayGet { dst, array, index } => {
                let array = frame.object(*array, pc)?;
                let v = slot(&array, frame.i32(*index, pc)? as i64)?;
                frame.set(*dst, v, pc)?;
            }
            Instr::ArrayLen { dst, array } => {
                let array = frame.object(*array, pc)?;
                let len = array.slots.borrow().len() as i32;
                frame.set(*dst, Value::I32(len), pc)?;
            }
            Instr::RefIsNull { dst, src } => {
                let v = frame.reg(*src, pc)?.is_null();
                frame.set(*dst, Value::I32(v as i32), pc)?;
            }
            Instr::RefEq { dst, lhs, rhs } => {
                let eq = match (frame.reg(*lhs, pc)?, frame.reg(*rhs, pc)?) {
                    (Value::Ref(a), Value::Ref(b)) => Rc::ptr_eq(a, b),
                    (a, b) => a.is_null() && b.is_null(),
                };
                frame.set(*dst, Value::I32(eq as i32), pc)?;
            }
            Instr::RefCast { dst, src, ty } => {
                let v = frame.reg(*src, pc)?.clone();
                if let Value::Ref(obj) = &v {
                    if obj.ty != *ty {
                        return Err(MachineError::BadCast {
                            expected: *ty,
                            found: obj.ty,
                        });
                    }
                }
                frame.set(*dst, v, pc)?;
            }
            Instr::GlobalGet { dst, global } => {
                let v = self
                    .globals
                    .get(*global as usize)
                    .cloned()
                    .ok_or_else(|| MachineError::Malformed(format!("invalid global {}", global)))?;
                frame.set(*dst, v, pc)?;
            }
            Instr::GlobalSet { global, src } => {
                let v = frame.reg(*src, pc)?.clone();
                match self.globals.get_mut(*global as usize) {
                    Some(g) => *g = v,
                    None => return Err(MachineError::Malformed(format!("invalid global {}", global))),
                }
            }
            Instr::Load64 { dst, addr, offset } => {
                let at = frame.i32(*addr, pc)? as u32 as u64 + *offset as u64;
                let word = self.memory.read_u64(at)?;
                frame.set(*dst, Value::I64(word as i64), pc)?;
            }
            Instr::Store64 { addr, offset, src } => {
                let at = frame.i32(*addr, pc)? as u32 as u64 + *offset as u64;
                let word = frame.i64(*src, pc)?;
                self.memory.write_u64(at, word as u64)?;
            }
            Instr::Call { dst, func, args } => {
                frame.pc = next;
                return Ok(Step::Call {
                    func: *func,
                    args: frame.args(args, pc)?,
                    dst: *dst,
                });
            }
            Instr::CallRef { dst, callee, args, .. } => {
                let target = match frame.reg(*callee, pc)? {
                    Value::Func(Some(idx)) => *idx,
                    Value::Func(None) | Value::Null => {
                        return Err(MachineError::NullReference {
                            func: frame.name.to_string(),
                            pc,
                        })
                    }
                    _ => return Err(frame.mismatch(pc, "funcref")),
                };
                frame.pc = next;
                return Ok(Step::Call {
                    func: target,
                    args: frame.args(args, pc)?,
                    dst: *dst,
                });
            }
            Instr::CallImport { dst, import, args } => {
                let import = module
                    .imports
                    .get(*import as usize)
                    .ok_or_else(|| MachineError::Malformed(format!("invalid import {}", import)))?;
                let args = frame.args(args, pc)?;
                let result = imports.call_import(import, &args, &mut self.memory)?;
                store_result(frame, *dst, result, pc)?;
            }
            Instr::Jump { target } => next = *target as usize,
            Instr::BranchIf { cond, target } => {
                if frame.i32(*cond, pc)? != 0 {
                    next = *target as usize;
                }
            }
            Instr::BranchIfNot { cond, target } => {
                if frame.i32(*cond, pc)? == 0 {
                    next = *target as usize;
                }
            }
            Instr::Return { value } => {
                let value = match value {
                    Some(r) => Some(frame.reg(*r, pc)?.clone()),
                    None => None,
                };
                return Ok(Step::Return(value));
            }
            Instr::Trap { kind, args } => return Err(self.trap(*kind, &frame.args(args, pc)?)),
        }
        frame.pc = next;
        Ok(Step::Next)
    }

    fn check_struct(&self, module: &Module, ty: TypeIdx, len: usize) -> Result<(), MachineError> {
        match module.types.get(ty as usize) {
            Some(TypeDef::Struct { fields, .. }) if fields.len() == len => Ok(()),
            Some(TypeDef::Struct { name, fields }) => Err(MachineError::Malformed(format!(
                "struct `{}` has {} fields, {} given",
                name,
                fields.len(),
                len
            ))),
            _ => Err(MachineError::Malformed(format!("type #{} is not a struct", ty))),
        }
    }

    /// Build the error for a trap. Label-carrying kinds pass
    /// `(label_ptr, label_len, count)`.
    fn trap(&self, kind: TrapKind, args: &[Value]) -> MachineError {
        let word = |i: usize| match args.get(i) {
            Some(Value::I32(v)) => *v as i64,
            Some(Value::I64(v)) => *v,
            _ => 0,
        };
        let label = match (args.first(), args.get(1)) {
            (Some(Value::I32(ptr)), Some(Value::I32(len))) => self
                .memory
                .read_str(*ptr as u32, *len as u32)
                .unwrap_or_else(|_| "<invalid label>".to_string()),
            _ => String::new(),
        };
        let message = kind.message(&label, word(2));
        tracing::debug!(?kind, %message, "trap");
        MachineError::Trap { kind, message }
    }
}

/// A fresh frame for `func` with `args` in its first registers.
fn enter<'m>(module: &'m Module, func: FuncIdx, args: Vec<Value>, ret: Option<u32>) -> Result<Frame<'m>, MachineError> {
    let function = module
        .functions
        .get(func as usize)
        .ok_or(MachineError::UnknownFunction(func))?;
    let params = module.func_type(function.ty).map(|(p, _)| p.len()).unwrap_or(0);
    if args.len() != params {
        return Err(MachineError::ArityMismatch {
            func: function.name.clone(),
            expected: params,
            found: args.len(),
        });
    }
    let mut frame = Frame {
        name: &function.name,
        code: &function.code,
        regs: function.regs.iter().map(|t| Value::zero(*t)).collect(),
        pc: 0,
        ret,
    };
    for (i, arg) in args.into_iter().enumerate() {
        frame.set(i as u32, arg, 0)?;
    }
    Ok(frame)
}

fn new_object(ty: TypeIdx, slots: Vec<Value>) -> Value {
    Value::Ref(Rc::new(Object {
        ty,
        slots: RefCell::new(slots),
    }))
}

fn slot(obj: &Object, index: i64) -> Result<Value, MachineError> {
    let slots = obj.slots.borrow();
    usize::try_from(index)
        .ok()
        .and_then(|i| slots.get(i))
        .cloned()
        .ok_or(MachineError::IndexOutOfBounds { ty: obj.ty, index })
}

fn store_result(frame: &mut Frame<'_>, dst: Option<u32>, result: Option<Value>, pc: usize) -> Result<(), MachineError> {
    match (dst, result) {
        (Some(dst), Some(v)) => frame.set(dst, v, pc),
        (Some(_), None) => Err(frame.mismatch(pc, "a call result")),
        (None, _) => Ok(()),
    }
}

fn binary_i32(op: BinaryOp, a: i32, b: i32) -> i32 {
    match op {
        BinaryOp::I32Add => a.wrapping_add(b),
        BinaryOp::I32Sub => a.wrapping_sub(b),
        BinaryOp::I32Mul => a.wrapping_mul(b),
        BinaryOp::I32Eq => (a == b) as i32,
        BinaryOp::I32Ne => (a != b) as i32,
        BinaryOp::I32LtS => (a < b) as i32,
        BinaryOp::I32LtU => ((a as u32) < (b as u32)) as i32,
        BinaryOp::I32LeS => (a <= b) as i32,
        BinaryOp::I32LeU => ((a as u32) <= (b as u32)) as i32,
        BinaryOp::I32GtS => (a > b) as i32,
        BinaryOp::I32GtU => ((a as u32) > (b as u32)) as i32,
        BinaryOp::I32GeS => (a >= b) as i32,
        BinaryOp::I32GeU => ((a as u32) >= (b as u32)) as i32,
        _ => 0,
    }
}

fn binary_i64(op: BinaryOp, a: i64, b: i64) -> Value {
    match op {
        BinaryOp::I64Add => Value::I64(a.wrapping_add(b)),
        BinaryOp::I64Sub => Value::I64(a.wrapping_sub(b)),
        BinaryOp::I64Mul => Value::I64(a.wrapping_mul(b)),
        BinaryOp::I64ShrU => Value::I64(((a as u64) >> (b as u64 & 63)) as i64),
        BinaryOp::I64Eq => Value::I32((a == b) as i32),
        BinaryOp::I64Ne => Value::I32((a != b) as i32),
        BinaryOp::I64LtS => Value::I32((a < b) as i32),
        BinaryOp::I64LeS => Value::I32((a <= b) as i32),
        BinaryOp::I64GtS => Value::I32((a > b) as i32),
        BinaryOp::I64GeS => Value::I32((a >= b) as i32),
        _ => Value::I64(0),
    }
}
