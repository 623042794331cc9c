use std::fs;
use std::path::Path;

use strata_codegen::{
    Backend, BackendConfig, CodegenMode, CraneliftBackend, LifecyclePhase, PassStats,
    execute_module_jit, plan_extern_abis,
};
use strata_mir::MirModule;
use tracing::debug;

use crate::host::host_symbols;

#[derive(Debug)]
pub struct CompileResult {
    pub object: Vec<u8>,
    pub stats: PassStats,
    pub lifecycle: Vec<LifecyclePhase>,
}

#[derive(Debug)]
pub struct RunResult {
    pub exit_code: i32,
    pub live_heap_objects: i64,
}

/// Read a MIR program from its JSON form.
pub fn load_program(input: &Path) -> Result<MirModule, String> {
    let source = fs::read_to_string(input)
        .map_err(|err| format!("failed to read `{}`: {err}", input.display()))?;
    let module: MirModule = serde_json::from_str(&source)
        .map_err(|err| format!("failed to parse `{}` as MIR: {err}", input.display()))?;
    debug!(
        input = %input.display(),
        functions = module.functions.len(),
        externs = module.externs.len(),
        "loaded MIR program"
    );
    Ok(module)
}

pub fn compile_module(module: &MirModule, config: &BackendConfig) -> Result<CompileResult, String> {
    let backend = CraneliftBackend {
        host: host_symbols(),
    };
    let artifact = backend
        .compile_module(module, config)
        .map_err(|err| format!("codegen failed: {err}"))?;
    Ok(CompileResult {
        object: artifact.object,
        stats: artifact.stats,
        lifecycle: artifact.lifecycle,
    })
}

pub fn compile_file(input: &Path, config: &BackendConfig) -> Result<CompileResult, String> {
    let module = load_program(input)?;
    compile_module(&module, config)
}

/// Run `module` in-process. `args` become the program's `argv`, the
/// program name included.
pub fn execute_jit(
    module: &MirModule,
    config: &BackendConfig,
    args: &[String],
) -> Result<RunResult, String> {
    let outcome = execute_module_jit(module, config, &host_symbols(), args)
        .map_err(|err| format!("codegen failed: {err}"))?;
    Ok(RunResult {
        exit_code: outcome.exit_code as i32,
        live_heap_objects: outcome.live_heap_objects,
    })
}

pub fn run_file(input: &Path, config: &BackendConfig, args: &[String]) -> Result<RunResult, String> {
    let module = load_program(input)?;
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(input.display().to_string());
    argv.extend(args.iter().cloned());
    execute_jit(&module, config, &argv)
}

/// One block per host extern describing how its arguments and result
/// cross the boundary.
pub fn abi_report(module: &MirModule, config: &BackendConfig) -> Result<String, String> {
    let plans = plan_extern_abis(module, config).map_err(|err| format!("codegen failed: {err}"))?;
    Ok(plans
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n\n"))
}

/// The CLIF of every function the backend defines, the synthesized ones
/// included.
pub fn clif_report(module: &MirModule, config: &BackendConfig) -> Result<String, String> {
    let config = BackendConfig {
        mode: CodegenMode::Aot,
        emit_clif: true,
        ..config.clone()
    };
    let artifact = CraneliftBackend::default()
        .compile_module(module, &config)
        .map_err(|err| format!("codegen failed: {err}"))?;
    Ok(artifact
        .clif
        .iter()
        .map(|(name, clif)| format!("; {name}\n{clif}"))
        .collect::<Vec<_>>()
        .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::host_prototypes;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};
    use strata_mir::{
        MirBlock, MirBlockId, MirFunction, MirInst, MirLiteral, MirTerminator, MirValueId,
        Prototype,
    };
    use strata_types::Reference;

    static TEMP_NONCE: AtomicU64 = AtomicU64::new(0);

    fn write_temp_program(module: &MirModule, prefix: &str) -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should move forward")
            .as_nanos();
        let counter = TEMP_NONCE.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("{prefix}-{timestamp}-{counter}.json"));
        let json = serde_json::to_string_pretty(module).expect("MIR should serialize");
        std::fs::write(&path, json).expect("temp program write should succeed");
        path
    }

    fn greeting_module() -> MirModule {
        MirModule {
            structs: vec![],
            externs: host_prototypes(),
            functions: vec![MirFunction {
                prototype: Prototype::new("main", vec![], Reference::int64()),
                entry: MirBlockId(0),
                blocks: vec![MirBlock {
                    id: MirBlockId(0),
                    instructions: vec![
                        MirInst::Const {
                            dest: MirValueId(0),
                            literal: MirLiteral::Str("ahoy".to_string()),
                        },
                        MirInst::ExternCall {
                            callee: host_prototypes()[1].clone(),
                            args: vec![MirValueId(0)],
                            result: None,
                        },
                        MirInst::ExternCall {
                            callee: Prototype::new(
                                "__builtin_numMainArgs",
                                vec![],
                                Reference::int64(),
                            ),
                            args: vec![],
                            result: Some(MirValueId(1)),
                        },
                    ],
                    terminator: MirTerminator::Return {
                        value: Some(MirValueId(1)),
                    },
                }],
            }],
            interface_tables: vec![],
            entry: "main".to_string(),
        }
    }

    #[test]
    fn run_file_passes_program_arguments() {
        let path = write_temp_program(&greeting_module(), "strata-compiler-run");
        let config = BackendConfig {
            census: true,
            ..BackendConfig::default()
        };
        let run = run_file(&path, &config, &["one".to_string(), "two".to_string()])
            .expect("run should succeed");
        let _ = std::fs::remove_file(path);
        assert_eq!(run.exit_code, 3);
        assert_eq!(run.live_heap_objects, 0);
    }

    #[test]
    fn load_program_reports_malformed_json() {
        let path = std::env::temp_dir().join(format!(
            "strata-compiler-bad-{}.json",
            TEMP_NONCE.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, "{ \"functions\": 3 }").expect("temp write should succeed");
        let err = load_program(&path).expect_err("malformed program");
        let _ = std::fs::remove_file(path);
        assert!(err.contains("as MIR"), "{err}");
    }

    #[test]
    fn aot_compile_produces_an_object() {
        let config = BackendConfig {
            mode: CodegenMode::Aot,
            ..BackendConfig::default()
        };
        let result = compile_module(&greeting_module(), &config).expect("compile should succeed");
        assert!(!result.object.is_empty());
        assert_eq!(result.stats.per_function[0].extern_call_count, 1);
        assert_eq!(result.stats.per_function[0].intrinsic_call_count, 1);
    }

    #[test]
    fn abi_report_lists_host_externs_only() {
        let report =
            abi_report(&greeting_module(), &BackendConfig::default()).expect("abi plans");
        assert!(report.contains("extern println(share Str) -> Void"), "{report}");
        assert!(report.contains("extern printInt(Int64) -> Void"), "{report}");
        assert!(report.contains("extern exit(Int64) -> Never"), "{report}");
        assert!(!report.contains("__builtin_"), "{report}");
    }

    #[test]
    fn clif_report_includes_synthesized_entry() {
        let report =
            clif_report(&greeting_module(), &BackendConfig::default()).expect("clif text");
        assert!(report.contains("; __strata_fn_main"), "{report}");
        assert!(report.contains("; main"), "{report}");
    }
}
