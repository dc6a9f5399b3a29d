//! Names and layouts shared between generated code and the host runtime.
//!
//! The host never links against generated support code; it calls the
//! exports and provides the imports named here, and reads results through
//! the accessor exports. Field indices are the positions inside the support
//! structs every module declares.

/// Host imports, all in module [`imports::MODULE`].
pub mod imports {
    pub const MODULE: &str = "host";
    /// `(tag: i32, payload: i64, ptr: i32, len: i32) -> i32`
    pub const WRITE_VALUE: &str = "write_value";
    /// `(op_index: i32, id_ptr: i32, id_len: i32, op_id: i32, hash: i64,
    /// args_ptr: i32, args_len: i32) -> i32`
    pub const WRITE_EFFECT: &str = "write_effect";
    /// `(ptr: i32, len: i32) -> i64`
    pub const READ_VALUE: &str = "read_value";
}

/// Shared exports present in every module.
pub mod exports {
    pub const EFFECT_STATUS: &str = "effect_status";
    pub const EFFECT_CONT: &str = "effect_cont";
    pub const EFFECT_LEN: &str = "effect_len";
    pub const INIT_EFFECTS: &str = "init_effects";
    pub const READ_VALUE: &str = "read_value";
    pub const EFFECT_RESUME: &str = "effect_resume";
}

/// `$EffectResult { status: i32, value: i64, ref_value: anyref, cont: anyref,
/// request: anyref, len: i32 }`
///
/// A returned result carries the value of a `return` leaving a handled body
/// or clause; its `request` field holds the handler frame the return left
/// from. It never reaches the host.
pub mod effect_result {
    pub const STATUS: u32 = 0;
    pub const VALUE: u32 = 1;
    pub const REF_VALUE: u32 = 2;
    pub const CONT: u32 = 3;
    pub const REQUEST: u32 = 4;
    pub const LEN: u32 = 5;

    pub const DONE: i32 = 0;
    pub const SUSPENDED: i32 = 1;
    pub const RETURNED: i32 = 2;
}

/// `$Request { op_index: i32, args: anyref, frame: anyref }`. A null frame
/// addresses the host.
pub mod request {
    pub const OP_INDEX: u32 = 0;
    pub const ARGS: u32 = 1;
    pub const FRAME: u32 = 2;
}

/// `$Cont { func: funcref, env: anyref }`
pub mod cont {
    pub const FUNC: u32 = 0;
    pub const ENV: u32 = 1;
}

/// `$Frame { parent: anyref, effect: i32, first_op: i32, op_count: i32,
/// clauses: anyref, env: anyref }`
pub mod frame {
    pub const PARENT: u32 = 0;
    pub const EFFECT: u32 = 1;
    pub const FIRST_OP: u32 = 2;
    pub const OP_COUNT: u32 = 3;
    pub const CLAUSES: u32 = 4;
    pub const ENV: u32 = 5;
}

/// `$HCont { chain: anyref, frame: anyref, kind: i32, calls: i32, ended: i32,
/// label_ptr: i32, label_len: i32 }`
pub mod hcont {
    pub const CHAIN: u32 = 0;
    pub const FRAME: u32 = 1;
    pub const KIND: u32 = 2;
    pub const CALLS: u32 = 3;
    pub const ENDED: u32 = 4;
    pub const LABEL_PTR: u32 = 5;
    pub const LABEL_LEN: u32 = 6;

    pub const KIND_RESUME: i32 = 0;
    pub const KIND_TAIL: i32 = 1;

    pub const MODE_RESUME: i32 = 0;
    pub const MODE_TAIL: i32 = 1;
    pub const MODE_END: i32 = 2;
}

/// `$ExportCont { inner: anyref, settle: funcref, op_index: i32 }`
pub mod export_cont {
    pub const INNER: u32 = 0;
    pub const SETTLE: u32 = 1;
    pub const OP_INDEX: u32 = 2;
}

/// Linear memory layout.
pub mod memory {
    /// Argument words written for `write_effect`.
    pub const SCRATCH_BASE: u32 = 16;
    /// Bytes per argument word.
    pub const WORD: u32 = 8;
    pub const PAGE: u32 = 65536;
}
