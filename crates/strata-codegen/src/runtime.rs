//! Runtime support shared by generated code and the host.
//!
//! Generated code imports a handful of `__strata_*` functions and defines a
//! few `__strata_*` data objects. The functions are implemented here in Rust
//! and registered with the JIT; `malloc`, `free` and `memcpy` resolve from
//! the C library.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use cranelift::prelude::AbiParam;
use cranelift_codegen::ir::{Type, types};
use cranelift_jit::JITBuilder;
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};

use crate::census::CensusTable;
use crate::layout::{LINEAR_STR_BYTES_OFFSET, LINEAR_STR_LEN_OFFSET, LINEAR_STR_OVERHEAD};
use crate::{CodegenError, module_error};

pub const EXIT_SYMBOL: &str = "__strata_exit";
pub const GETCH_SYMBOL: &str = "__strata_getch";
pub const PRINT_ERR_SYMBOL: &str = "__strata_print_err";
pub const CENSUS_ADD_SYMBOL: &str = "__strata_census_add";
pub const CENSUS_REMOVE_SYMBOL: &str = "__strata_census_remove";
pub const ASSERT_I64_EQ_SYMBOL: &str = "__strata_assert_i64_eq";

pub const LIVE_HEAP_OBJS_SYMBOL: &str = "__strata_live_heap_objs";
pub const REGION_READY_SYMBOL: &str = "__strata_region_ready";
pub const CENSUS_TABLE_SYMBOL: &str = "__strata_census_table";
pub const NUM_MAIN_ARGS_SYMBOL: &str = "__strata_num_main_args";
pub const MAIN_ARGS_SYMBOL: &str = "__strata_main_args";

/// Status a program exits with after `__builtin_panic` or a failed runtime
/// assertion.
pub const FAILURE_EXIT_CODE: i64 = 1;

/// Functions and data objects every generated module links against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RuntimeImports {
    pub malloc: FuncId,
    pub free: FuncId,
    pub memcpy: FuncId,
    pub exit: FuncId,
    pub getch: FuncId,
    pub print_err: FuncId,
    pub census_add: FuncId,
    pub census_remove: FuncId,
    pub assert_i64_eq: FuncId,
    pub live_heap_objs: DataId,
    pub region_ready: DataId,
    pub census_table: DataId,
    pub num_main_args: DataId,
    pub main_args: DataId,
}

impl RuntimeImports {
    pub fn declare<M: Module>(module: &mut M) -> Result<Self, CodegenError> {
        let ptr_ty = module.target_config().pointer_type();

        let malloc = import(module, "malloc", &[ptr_ty], Some(ptr_ty))?;
        let free = import(module, "free", &[ptr_ty], None)?;
        let memcpy = import(module, "memcpy", &[ptr_ty, ptr_ty, ptr_ty], Some(ptr_ty))?;
        let exit = import(module, EXIT_SYMBOL, &[types::I64], None)?;
        let getch = import(module, GETCH_SYMBOL, &[], Some(types::I64))?;
        let print_err = import(module, PRINT_ERR_SYMBOL, &[ptr_ty, types::I64], None)?;
        let census_add = import(module, CENSUS_ADD_SYMBOL, &[ptr_ty, ptr_ty], None)?;
        let census_remove = import(module, CENSUS_REMOVE_SYMBOL, &[ptr_ty, ptr_ty], None)?;
        let assert_i64_eq = import(
            module,
            ASSERT_I64_EQ_SYMBOL,
            &[types::I64, types::I64, ptr_ty, types::I64],
            None,
        )?;

        Ok(Self {
            malloc,
            free,
            memcpy,
            exit,
            getch,
            print_err,
            census_add,
            census_remove,
            assert_i64_eq,
            live_heap_objs: define_word(module, LIVE_HEAP_OBJS_SYMBOL)?,
            region_ready: define_word(module, REGION_READY_SYMBOL)?,
            census_table: define_word(module, CENSUS_TABLE_SYMBOL)?,
            num_main_args: define_word(module, NUM_MAIN_ARGS_SYMBOL)?,
            main_args: define_word(module, MAIN_ARGS_SYMBOL)?,
        })
    }
}

fn import<M: Module>(
    module: &mut M,
    name: &str,
    params: &[Type],
    ret: Option<Type>,
) -> Result<FuncId, CodegenError> {
    let mut sig = module.make_signature();
    sig.params
        .extend(params.iter().map(|ty| AbiParam::new(*ty)));
    if let Some(ret) = ret {
        sig.returns.push(AbiParam::new(ret));
    }
    module
        .declare_function(name, Linkage::Import, &sig)
        .map_err(module_error)
}

/// A writable, zero-initialized, 8-byte global.
fn define_word<M: Module>(module: &mut M, name: &str) -> Result<DataId, CodegenError> {
    let data_id = module
        .declare_data(name, Linkage::Local, true, false)
        .map_err(module_error)?;
    let mut data = DataDescription::new();
    data.define_zeroinit(8);
    data.set_align(8);
    module.define_data(data_id, &data).map_err(module_error)?;
    Ok(data_id)
}

// ---------------------------------------------------------------------------
// Host-side implementations
// ---------------------------------------------------------------------------

unsafe extern "C" {
    fn malloc(size: usize) -> *mut u8;
    fn free(ptr: *mut u8);
}

extern "C" fn strata_exit(status: i64) {
    exit_process(status)
}

/// Flush stdout, logging a failure instead of returning it.
pub fn flush_stdout() {
    if let Err(err) = std::io::stdout().flush() {
        tracing::warn!(error = %err, "failed to flush stdout");
    }
}

/// Flush stdout and end the process with `status`. Host functions returning
/// `Never` finish through here.
pub fn exit_process(status: i64) -> ! {
    flush_stdout();
    std::process::exit(status as i32)
}

/// One byte from stdin, or -1 at end of input.
extern "C" fn strata_getch() -> i64 {
    let mut byte = [0u8; 1];
    match std::io::stdin().read(&mut byte) {
        Ok(1) => i64::from(byte[0]),
        _ => -1,
    }
}

/// # Safety
/// `ptr` must point to `len` readable bytes.
unsafe extern "C" fn strata_print_err(ptr: *const u8, len: i64) {
    // SAFETY: guaranteed by the caller; generated code passes message data.
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len as usize) };
    eprint!("{}", String::from_utf8_lossy(bytes));
}

/// # Safety
/// `msg` must point to `msg_len` readable bytes.
unsafe extern "C" fn strata_assert_i64_eq(expected: i64, actual: i64, msg: *const u8, msg_len: i64) {
    if expected == actual {
        return;
    }
    // SAFETY: guaranteed by the caller; generated code passes message data.
    let bytes = unsafe { std::slice::from_raw_parts(msg, msg_len as usize) };
    eprintln!(
        "{} Expected {expected} but was {actual}.",
        String::from_utf8_lossy(bytes)
    );
    strata_exit(FAILURE_EXIT_CODE);
}

/// # Safety
/// `table` must be null or point to a live [`CensusTable`].
unsafe extern "C" fn strata_census_add(table: *mut CensusTable, addr: usize) {
    // SAFETY: the JIT runner stores either null or a boxed table that
    // outlives the program.
    let Some(table) = (unsafe { table.as_mut() }) else {
        return;
    };
    if let Err(violation) = table.add(addr) {
        eprintln!("{violation}");
        strata_exit(FAILURE_EXIT_CODE);
    }
}

/// # Safety
/// `table` must be null or point to a live [`CensusTable`].
unsafe extern "C" fn strata_census_remove(table: *mut CensusTable, addr: usize) {
    // SAFETY: see `strata_census_add`.
    let Some(table) = (unsafe { table.as_mut() }) else {
        return;
    };
    if let Err(violation) = table.remove(addr) {
        eprintln!("{violation}");
        strata_exit(FAILURE_EXIT_CODE);
    }
}

pub(crate) fn register_runtime_symbols(builder: &mut JITBuilder) {
    builder.symbol(EXIT_SYMBOL, strata_exit as *const u8);
    builder.symbol(GETCH_SYMBOL, strata_getch as *const u8);
    builder.symbol(PRINT_ERR_SYMBOL, strata_print_err as *const u8);
    builder.symbol(CENSUS_ADD_SYMBOL, strata_census_add as *const u8);
    builder.symbol(CENSUS_REMOVE_SYMBOL, strata_census_remove as *const u8);
    builder.symbol(ASSERT_I64_EQ_SYMBOL, strata_assert_i64_eq as *const u8);
}

/// Host functions made available to JIT-compiled code by name.
#[derive(Debug, Clone, Default)]
pub struct HostSymbolTable {
    symbols: BTreeMap<String, usize>,
}

impl HostSymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, address: *const u8) {
        self.symbols.insert(name.into(), address as usize);
    }

    pub fn with(mut self, name: impl Into<String>, address: *const u8) -> Self {
        self.insert(name, address);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<*const u8> {
        self.symbols.get(name).map(|address| *address as *const u8)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    pub(crate) fn register(&self, builder: &mut JITBuilder) {
        for (name, address) in &self.symbols {
            builder.symbol(name.clone(), *address as *const u8);
        }
    }
}

// ---------------------------------------------------------------------------
// Linear strings
// ---------------------------------------------------------------------------

/// Copy a linear string received from generated code. The buffer is not
/// freed.
///
/// # Safety
/// `buf` must point to a `[len][bytes][nul]` buffer produced by generated
/// code or [`alloc_linear_str`].
pub unsafe fn read_linear_str(buf: *const u8) -> String {
    // SAFETY: guaranteed by the caller.
    unsafe {
        let len = *(buf.add(LINEAR_STR_LEN_OFFSET as usize) as *const i64);
        let bytes =
            std::slice::from_raw_parts(buf.add(LINEAR_STR_BYTES_OFFSET as usize), len as usize);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Allocate a linear string for returning to generated code, which takes
/// ownership of it. Returns null if allocation fails.
pub fn alloc_linear_str(text: &str) -> *mut u8 {
    let len = text.len();
    // SAFETY: the buffer is sized for the length word, the bytes and the
    // terminator before any of them are written.
    unsafe {
        let buf = malloc(len + LINEAR_STR_OVERHEAD as usize);
        if buf.is_null() {
            return buf;
        }
        *(buf as *mut i64) = len as i64;
        let bytes = buf.add(LINEAR_STR_BYTES_OFFSET as usize);
        std::ptr::copy_nonoverlapping(text.as_ptr(), bytes, len);
        *bytes.add(len) = 0;
        buf
    }
}

/// Release a linear buffer the host received.
///
/// # Safety
/// `buf` must come from generated code or [`alloc_linear_str`] and must not
/// be used afterwards.
pub unsafe fn free_linear(buf: *mut u8) {
    // SAFETY: guaranteed by the caller.
    unsafe { free(buf) }
}
