//! Shared fixtures for codegen tests: tiny MIR programs and the host
//! functions they call.

use strata_mir::{
    MirBlock, MirBlockId, MirFunction, MirInst, MirLiteral, MirModule, MirTerminator, MirValueId,
    Prototype,
};
use strata_types::{Reference, StructDef};

use crate::runtime::{alloc_linear_str, free_linear, read_linear_str};
use crate::{
    Backend, BackendArtifact, BackendConfig, CodegenError, CraneliftBackend, HostSymbolTable,
    RunOutcome, execute_module_jit,
};

/// A module whose only function is `main`, one block long.
pub(crate) fn entry_module(
    ret: Reference,
    instructions: Vec<MirInst>,
    ret_value: Option<u32>,
) -> MirModule {
    MirModule {
        structs: vec![],
        externs: vec![],
        functions: vec![MirFunction {
            prototype: Prototype::new("main", vec![], ret),
            entry: MirBlockId(0),
            blocks: vec![MirBlock {
                id: MirBlockId(0),
                instructions,
                terminator: MirTerminator::Return {
                    value: ret_value.map(MirValueId),
                },
            }],
        }],
        interface_tables: vec![],
        entry: "main".to_string(),
    }
}

/// Rewrite `main` to return 1 when `condition` holds and 0 otherwise.
pub(crate) fn returning_bool_as_int(mut module: MirModule, condition: MirValueId) -> MirModule {
    let main = &mut module.functions[0];
    main.prototype.ret = Reference::int64();
    main.blocks[0].terminator = MirTerminator::Branch {
        condition,
        then_block: MirBlockId(1),
        else_block: MirBlockId(2),
    };
    for (id, result) in [(1u32, 1i64), (2, 0)] {
        let dest = MirValueId(10_000 + id);
        main.blocks.push(MirBlock {
            id: MirBlockId(id),
            instructions: vec![MirInst::Const {
                dest,
                literal: MirLiteral::Int64(result),
            }],
            terminator: MirTerminator::Return { value: Some(dest) },
        });
    }
    module
}

pub(crate) fn binary(name: &str, operand: Reference, ret: Reference) -> Prototype {
    Prototype::new(name, vec![operand.clone(), operand], ret)
}

pub(crate) fn engine_structs() -> Vec<StructDef> {
    vec![
        StructDef::immutable(
            "Engine",
            vec![("fuel", Reference::int32()), ("name", Reference::shared_str())],
        ),
        StructDef::mutable("Crew", vec![("size", Reference::int64())]),
    ]
}

pub(crate) fn host_identity_i64() -> Prototype {
    Prototype::new("host_identity_i64", vec![Reference::int64()], Reference::int64())
}

pub(crate) fn echo_str() -> Prototype {
    Prototype::new("echo_str", vec![Reference::shared_str()], Reference::shared_str())
}

pub(crate) fn echo_engine() -> Prototype {
    Prototype::new(
        "echo_engine",
        vec![Reference::shared_struct("Engine")],
        Reference::shared_struct("Engine"),
    )
}

pub(crate) fn make_engine() -> Prototype {
    Prototype::new("make_engine", vec![], Reference::shared_struct("Engine"))
}

pub(crate) fn crew_size() -> Prototype {
    Prototype::new("crew_size", vec![Reference::owned_struct("Crew")], Reference::int64())
}

#[repr(C)]
struct LinearEngine {
    fuel: i32,
    name: *mut u8,
}

extern "C" fn host_identity_i64_impl(value: i64) -> i64 {
    value
}

extern "C" fn echo_str_impl(buf: *mut u8, _len: i64) -> *mut u8 {
    // SAFETY: generated code hands over a linear string it no longer uses.
    let text = unsafe { read_linear_str(buf) };
    // SAFETY: `buf` is not touched again.
    unsafe { free_linear(buf) };
    alloc_linear_str(&text)
}

extern "C" fn echo_engine_impl(out: *mut LinearEngine, engine: *const LinearEngine) {
    // SAFETY: both pointers address caller-owned slots with the linear
    // Engine layout. The name buffer moves from the argument to the result.
    unsafe {
        out.write(LinearEngine {
            fuel: (*engine).fuel,
            name: (*engine).name,
        });
    }
}

extern "C" fn make_engine_impl(out: *mut LinearEngine) {
    // SAFETY: `out` addresses a caller-owned slot with the linear Engine
    // layout.
    unsafe {
        out.write(LinearEngine {
            fuel: 11,
            name: alloc_linear_str("spare"),
        });
    }
}

extern "C" fn crew_size_impl(crew: *const u8) -> i64 {
    // SAFETY: `crew` is a live in-region Crew: `[rc][size]`.
    unsafe { *(crew.add(8) as *const i64) }
}

pub(crate) fn test_host() -> HostSymbolTable {
    HostSymbolTable::new()
        .with("host_identity_i64", host_identity_i64_impl as *const u8)
        .with("echo_str", echo_str_impl as *const u8)
        .with("echo_engine", echo_engine_impl as *const u8)
        .with("make_engine", make_engine_impl as *const u8)
        .with("crew_size", crew_size_impl as *const u8)
}

pub(crate) fn census_config() -> BackendConfig {
    BackendConfig {
        census: true,
        ..BackendConfig::default()
    }
}

pub(crate) fn compile(
    module: &MirModule,
    config: BackendConfig,
) -> Result<BackendArtifact, CodegenError> {
    CraneliftBackend { host: test_host() }.compile_module(module, &config)
}

pub(crate) fn run(module: &MirModule, config: BackendConfig) -> RunOutcome {
    run_with_args(module, config, &["strata-test".to_string()])
}

pub(crate) fn run_with_args(module: &MirModule, config: BackendConfig, args: &[String]) -> RunOutcome {
    execute_module_jit(module, &config, &test_host(), args).expect("program should compile and run")
}
