//! Cranelift backend for strata MIR.
//!
//! The backend lowers typed MIR into native code. The interesting parts live
//! at the boundary between the region model and the host calling
//! convention: [`intrinsics`] lowers built-in operations to single
//! instructions, [`externs`] marshals arguments and results across the host
//! ABI, and [`lifecycle`] wraps the user entry point with region setup,
//! cleanup, and the census consistency check.

use std::collections::BTreeMap;
use std::ffi::{CString, c_char};
use std::sync::Arc;

use cranelift::prelude::Configurable;
use cranelift_codegen::{isa, settings};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{DataId, FuncId, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};
use strata_mir::{MirError, MirInst, MirModule};
use strata_types::Kind;

mod census;
mod context;
pub mod externs;
mod function;
pub mod intrinsics;
pub mod layout;
pub mod lifecycle;
pub mod region;
pub mod runtime;
mod strings;

pub use census::CensusTable;
pub use externs::ExternAbi;
pub use intrinsics::Intrinsic;
pub use lifecycle::LifecyclePhase;
pub use runtime::HostSymbolTable;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub target_triple: String,
    pub opt_level: OptimizationLevel,
    pub mode: CodegenMode,
    /// Register allocations and dispatch tables in the census and assert
    /// that no heap object survives the run.
    pub census: bool,
    /// Emit runtime trace lines around extern calls.
    pub flares: bool,
    pub size_args: SizeArgPolicy,
    /// Keep the textual CLIF of every defined function in the artifact.
    pub emit_clif: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            target_triple: "host".to_string(),
            opt_level: OptimizationLevel::Default,
            mode: CodegenMode::Jit,
            census: cfg!(debug_assertions),
            flares: false,
            size_args: SizeArgPolicy::SharedOnly,
            emit_clif: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationLevel {
    None,
    Default,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodegenMode {
    Jit,
    Aot,
}

/// Which dynamically sized arguments get a trailing size argument when
/// they cross into the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeArgPolicy {
    /// Only values that are linearized.
    SharedOnly,
    /// Every dynamically sized value, including owning in-region ones.
    AllDynamic,
}

// ---------------------------------------------------------------------------
// Artifacts and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BackendArtifact {
    pub object: Vec<u8>,
    pub stats: PassStats,
    /// Lifecycle phases emitted into the synthesized entry, in order.
    pub lifecycle: Vec<LifecyclePhase>,
    /// Function symbol name to CLIF text, populated when `emit_clif` is set.
    pub clif: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PassStats {
    pub per_function: Vec<FunctionPassStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionPassStats {
    pub function: String,
    pub intrinsic_call_count: usize,
    pub extern_call_count: usize,
    pub local_call_count: usize,
    pub alloc_count: usize,
    pub retain_count: usize,
    pub release_count: usize,
}

/// Compiler-internal faults. Every variant means an upstream stage handed
/// the backend something inconsistent; none of them are retried.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("invalid MIR: {0}")]
    InvalidMir(#[from] MirError),
    #[error("call to `{callee}` expects {expected} arguments, got {actual}")]
    ArityMismatch {
        callee: String,
        expected: usize,
        actual: usize,
    },
    #[error("in `{function}`: expected a `{expected}` reference, got `{actual}`")]
    ReferenceMismatch {
        function: String,
        expected: String,
        actual: String,
    },
    #[error("intrinsic `{intrinsic}` cannot operate on `{actual}`")]
    IntrinsicOperandMismatch { intrinsic: String, actual: String },
    #[error("extern `{name}` was never registered")]
    UnresolvedExtern { name: String },
    #[error("unknown function `{function}`")]
    UnknownFunction { function: String },
    #[error("unknown struct `{name}`")]
    UnknownStruct { name: String },
    #[error("unsupported reference `{reference}`: {detail}")]
    UnsupportedReference { reference: String, detail: String },
    #[error("invalid MIR value `%{value}` referenced in `{function}`")]
    InvalidMirValue { function: String, value: u32 },
    #[error("unsupported MIR operation in `{function}`: {detail}")]
    UnsupportedMir { function: String, detail: String },
    #[error("entry function cannot return `{ty}`")]
    UnsupportedEntryReturn { ty: String },
    #[error("lifecycle phase {phase:?} emitted after {after:?}")]
    LifecycleOrder {
        phase: LifecyclePhase,
        after: LifecyclePhase,
    },
    #[error("target triple `{target}` is not yet supported by this backend")]
    UnsupportedTarget { target: String },
    #[error("Cranelift module error: {detail}")]
    Module { detail: String },
    #[error("Cranelift object emission failed: {detail}")]
    ObjectEmit { detail: String },
}

pub(crate) fn module_error(detail: impl std::fmt::Display) -> CodegenError {
    CodegenError::Module {
        detail: detail.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub trait Backend {
    fn name(&self) -> &'static str;

    fn compile_module(
        &self,
        module: &MirModule,
        config: &BackendConfig,
    ) -> Result<BackendArtifact, CodegenError>;
}

#[derive(Debug, Default)]
pub struct CraneliftBackend {
    /// Host functions available to JIT-compiled code.
    pub host: HostSymbolTable,
}

impl Backend for CraneliftBackend {
    fn name(&self) -> &'static str {
        "cranelift"
    }

    fn compile_module(
        &self,
        module: &MirModule,
        config: &BackendConfig,
    ) -> Result<BackendArtifact, CodegenError> {
        let isa = build_isa(config)?;
        let stats = collect_pass_stats(module);
        let (object, compiled) = match config.mode {
            CodegenMode::Jit => compile_with_jit(module, &isa, config, &self.host)?,
            CodegenMode::Aot => compile_with_object(module, &isa, config)?,
        };

        Ok(BackendArtifact {
            object,
            stats,
            lifecycle: compiled.lifecycle,
            clif: compiled.clif,
        })
    }
}

pub(crate) fn build_isa(config: &BackendConfig) -> Result<Arc<dyn isa::TargetIsa>, CodegenError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", opt_level_setting(config.opt_level))
        .map_err(module_error)?;
    flag_builder
        .set("preserve_frame_pointers", "true")
        .map_err(module_error)?;
    if matches!(config.mode, CodegenMode::Aot) {
        flag_builder.set("is_pic", "true").map_err(module_error)?;
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(module_error)?;
    }

    if config.target_triple == "host" {
        let isa_builder = cranelift_native::builder().map_err(|detail| CodegenError::Module {
            detail: format!("host ISA not supported: {detail}"),
        })?;
        return isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(module_error);
    }

    Err(CodegenError::UnsupportedTarget {
        target: config.target_triple.clone(),
    })
}

fn opt_level_setting(level: OptimizationLevel) -> &'static str {
    match level {
        OptimizationLevel::None => "none",
        OptimizationLevel::Default => "speed",
        OptimizationLevel::Aggressive => "speed_and_size",
    }
}

/// Ids and bookkeeping from lowering one MIR module into a Cranelift module.
#[derive(Debug)]
pub(crate) struct CompiledModule {
    pub entry: FuncId,
    pub functions: BTreeMap<String, FuncId>,
    pub live_heap_objs: DataId,
    pub census_table: DataId,
    pub lifecycle: Vec<LifecyclePhase>,
    pub clif: BTreeMap<String, String>,
}

/// Every extern the module calls must be resolvable before JIT finalization.
fn check_host_symbols(module: &MirModule, host: &HostSymbolTable) -> Result<(), CodegenError> {
    for proto in &module.externs {
        if Intrinsic::from_name(&proto.name).is_some() {
            continue;
        }
        if host.lookup(&proto.name).is_none() {
            return Err(CodegenError::UnresolvedExtern {
                name: proto.name.clone(),
            });
        }
    }
    Ok(())
}

fn jit_module_for(
    isa: &Arc<dyn isa::TargetIsa>,
    host: &HostSymbolTable,
) -> JITModule {
    let mut builder = JITBuilder::with_isa(isa.clone(), cranelift_module::default_libcall_names());
    runtime::register_runtime_symbols(&mut builder);
    host.register(&mut builder);
    JITModule::new(builder)
}

fn compile_with_jit(
    module: &MirModule,
    isa: &Arc<dyn isa::TargetIsa>,
    config: &BackendConfig,
    host: &HostSymbolTable,
) -> Result<(Vec<u8>, CompiledModule), CodegenError> {
    check_host_symbols(module, host)?;
    let mut jit_module = jit_module_for(isa, host);
    let compiled = context::compile_into_module(&mut jit_module, module, config)?;
    jit_module.finalize_definitions().map_err(module_error)?;

    // JIT mode emits executable memory, not an object file payload.
    Ok((Vec::new(), compiled))
}

fn compile_with_object(
    module: &MirModule,
    isa: &Arc<dyn isa::TargetIsa>,
    config: &BackendConfig,
) -> Result<(Vec<u8>, CompiledModule), CodegenError> {
    let builder = ObjectBuilder::new(
        isa.clone(),
        "strata",
        cranelift_module::default_libcall_names(),
    )
    .map_err(module_error)?;
    let mut object_module = ObjectModule::new(builder);
    let compiled = context::compile_into_module(&mut object_module, module, config)?;
    let product = object_module.finish();
    let object = product.emit().map_err(|detail| CodegenError::ObjectEmit {
        detail: detail.to_string(),
    })?;
    Ok((object, compiled))
}

// ---------------------------------------------------------------------------
// JIT execution
// ---------------------------------------------------------------------------

/// What a JIT run left behind once the synthesized entry returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// The value `main` returned. The CLI truncates it to a process status.
    pub exit_code: i64,
    pub live_heap_objects: i64,
    /// Addresses still registered in the census after teardown.
    pub census_entries: usize,
}

/// Compile `module` into executable memory and run its synthesized entry
/// point with `args` as `argv`.
///
/// Runtime faults in the generated program (panic, census violations, the
/// leak assertion) terminate the current process.
pub fn execute_module_jit(
    module: &MirModule,
    config: &BackendConfig,
    host: &HostSymbolTable,
    args: &[String],
) -> Result<RunOutcome, CodegenError> {
    let jit_config = BackendConfig {
        mode: CodegenMode::Jit,
        ..config.clone()
    };
    let isa = build_isa(&jit_config)?;
    check_host_symbols(module, host)?;
    let mut jit_module = jit_module_for(&isa, host);
    let compiled = context::compile_into_module(&mut jit_module, module, &jit_config)?;
    jit_module.finalize_definitions().map_err(module_error)?;

    let mut census = jit_config.census.then(|| Box::new(CensusTable::default()));
    let census_ptr: *mut CensusTable = census
        .as_deref_mut()
        .map_or(std::ptr::null_mut(), |table| table as *mut CensusTable);
    let (census_slot, _) = jit_module.get_finalized_data(compiled.census_table);
    // SAFETY: the census slot is a writable, pointer-sized, pointer-aligned
    // data object defined by `compile_into_module`.
    unsafe {
        *(census_slot as *mut *mut CensusTable) = census_ptr;
    }

    let c_args = args
        .iter()
        .map(|arg| {
            CString::new(arg.as_str()).map_err(|_| CodegenError::UnsupportedMir {
                function: "main".to_string(),
                detail: format!("program argument {arg:?} contains a NUL byte"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut argv: Vec<*const c_char> = c_args.iter().map(|arg| arg.as_ptr()).collect();
    argv.push(std::ptr::null());

    let entrypoint = jit_module.get_finalized_function(compiled.entry);
    tracing::debug!(argc = c_args.len(), "entering JIT-compiled program");
    // SAFETY: the synthesized entry is defined with signature
    // `(i64, *const *const c_char) -> i64` by the lifecycle driver.
    let status = unsafe {
        let main_fn = std::mem::transmute::<*const u8, extern "C" fn(i64, *const *const c_char) -> i64>(
            entrypoint,
        );
        main_fn(c_args.len() as i64, argv.as_ptr())
    };

    let (live_slot, _) = jit_module.get_finalized_data(compiled.live_heap_objs);
    // SAFETY: the live counter is an 8-byte aligned i64 data object.
    let live_heap_objects = unsafe { *(live_slot as *const i64) };
    let census_entries = census.as_ref().map_or(0, |table| table.len());
    if census_entries > 0 {
        tracing::debug!(census_entries, "census entries remain after teardown");
    }
    drop(census);

    Ok(RunOutcome {
        exit_code: status,
        live_heap_objects,
        census_entries,
    })
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

pub fn collect_pass_stats(module: &MirModule) -> PassStats {
    PassStats {
        per_function: module
            .functions
            .iter()
            .map(|function| {
                let mut stats = FunctionPassStats {
                    function: function.name().to_string(),
                    ..FunctionPassStats::default()
                };
                for inst in function.blocks.iter().flat_map(|block| &block.instructions) {
                    match inst {
                        MirInst::ExternCall { callee, .. } => {
                            if Intrinsic::from_name(&callee.name).is_some() {
                                stats.intrinsic_call_count += 1;
                            } else {
                                stats.extern_call_count += 1;
                            }
                        }
                        MirInst::Call { .. } => stats.local_call_count += 1,
                        MirInst::NewStruct { .. } => stats.alloc_count += 1,
                        MirInst::Const { literal, .. }
                            if literal.reference().kind == Kind::Str =>
                        {
                            stats.alloc_count += 1
                        }
                        MirInst::Retain { .. } => stats.retain_count += 1,
                        MirInst::Release { .. } => stats.release_count += 1,
                        _ => {}
                    }
                }
                stats
            })
            .collect(),
    }
}

/// The host calling convention of every non-intrinsic extern in `module`,
/// in declaration order.
pub fn plan_extern_abis(
    module: &MirModule,
    config: &BackendConfig,
) -> Result<Vec<ExternAbi>, CodegenError> {
    let isa = build_isa(config)?;
    let ptr_ty = isa.pointer_type();
    let layouts = layout::LayoutCatalog::plan(&module.structs)?;
    let heap = region::heap::HeapRegion::new(config);
    module
        .externs
        .iter()
        .filter(|proto| Intrinsic::from_name(&proto.name).is_none())
        .map(|proto| ExternAbi::for_prototype(proto, &heap, &layouts, ptr_ty))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support;


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use strata_mir::{MirLiteral, MirValueId, Prototype};
    use strata_types::Reference;

    #[test]
    fn default_config_targets_host_jit_with_shared_size_args() {
        let config = BackendConfig::default();
        assert_eq!(config.target_triple, "host");
        assert_eq!(config.mode, CodegenMode::Jit);
        assert_eq!(config.size_args, SizeArgPolicy::SharedOnly);
        assert!(!config.flares);
    }

    #[test]
    fn unsupported_target_is_rejected() {
        let config = BackendConfig {
            target_triple: "riscv-unknown-none".to_string(),
            ..BackendConfig::default()
        };
        assert!(matches!(
            build_isa(&config),
            Err(CodegenError::UnsupportedTarget { .. })
        ));
    }

    #[test]
    fn pass_stats_separate_intrinsics_from_host_calls() {
        let module = entry_module(
            Reference::int64(),
            vec![
                MirInst::Const {
                    dest: MirValueId(0),
                    literal: MirLiteral::Str("hi".to_string()),
                },
                MirInst::ExternCall {
                    callee: Prototype::new(
                        "__builtin_strLength",
                        vec![Reference::shared_str()],
                        Reference::int64(),
                    ),
                    args: vec![MirValueId(0)],
                    result: Some(MirValueId(1)),
                },
                MirInst::ExternCall {
                    callee: host_identity_i64(),
                    args: vec![MirValueId(1)],
                    result: Some(MirValueId(2)),
                },
            ],
            Some(2),
        );
        let stats = collect_pass_stats(&module);
        let main = &stats.per_function[0];
        assert_eq!(main.intrinsic_call_count, 1);
        assert_eq!(main.extern_call_count, 1);
        assert_eq!(main.alloc_count, 1);
    }

    #[test]
    fn jit_compile_rejects_unregistered_host_extern() {
        let mut module = entry_module(
            Reference::int64(),
            vec![
                MirInst::Const {
                    dest: MirValueId(0),
                    literal: MirLiteral::Int64(1),
                },
                MirInst::ExternCall {
                    callee: host_identity_i64(),
                    args: vec![MirValueId(0)],
                    result: Some(MirValueId(1)),
                },
            ],
            Some(1),
        );
        module.externs.push(host_identity_i64());
        let err = CraneliftBackend::default()
            .compile_module(&module, &BackendConfig::default())
            .expect_err("missing host symbol must be a compile fault");
        assert_eq!(
            err,
            CodegenError::UnresolvedExtern {
                name: "host_identity_i64".to_string()
            }
        );
    }

    #[test]
    fn repeated_block_id_is_a_compile_fault() {
        let mut module = entry_module(Reference::void(), vec![], None);
        let copy = module.functions[0].blocks[0].clone();
        module.functions[0].blocks.push(copy);
        let err = CraneliftBackend::default()
            .compile_module(&module, &BackendConfig::default())
            .expect_err("a block id defined twice must not reach the builder");
        assert_eq!(
            err,
            CodegenError::InvalidMir(strata_mir::MirError::DuplicateBlock {
                function: "main".to_string(),
                block: 0,
            })
        );
    }

    #[test]
    fn aot_mode_emits_object_bytes() {
        let module = entry_module(
            Reference::int64(),
            vec![MirInst::Const {
                dest: MirValueId(0),
                literal: MirLiteral::Int64(3),
            }],
            Some(0),
        );
        let artifact = CraneliftBackend::default()
            .compile_module(
                &module,
                &BackendConfig {
                    mode: CodegenMode::Aot,
                    ..BackendConfig::default()
                },
            )
            .expect("AOT compile should succeed");
        assert!(!artifact.object.is_empty());
    }

    #[test]
    fn balanced_entry_returns_its_int64_result() {
        let module = entry_module(
            Reference::int64(),
            vec![MirInst::Const {
                dest: MirValueId(0),
                literal: MirLiteral::Int64(42),
            }],
            Some(0),
        );
        let outcome = run(&module, census_config());
        assert_eq!(outcome.exit_code, 42);
        assert_eq!(outcome.live_heap_objects, 0);
        assert_eq!(outcome.census_entries, 0);
    }
}
