//! Program lifecycle: the synthesized entry points wrapped around the
//! user's entry function.
//!
//! `main(argc, argv)` records the program arguments and calls
//! `__strata_main`, which runs string setup, region setup, the optional
//! census prewarm, the user entry, region cleanup, the optional census
//! teardown with its leak check, and finally maps the entry's result to an
//! exit code.

use std::collections::BTreeMap;

use cranelift::prelude::{AbiParam, InstBuilder, Value};
use cranelift_codegen::ir::types;
use cranelift_module::{FuncId, Linkage, Module};
use strata_types::{Kind, Reference};

use crate::census::Census;
use crate::context::{CodegenGlobals, FunctionCx, MessagePool, define_body};
use crate::{CodegenError, module_error};

pub(crate) const SETUP_STRINGS_SYMBOL: &str = "__strata_setup_strings";
pub(crate) const REGION_SETUP_SYMBOL: &str = "__strata_region_setup";
pub(crate) const REGION_CLEANUP_SYMBOL: &str = "__strata_region_cleanup";
pub(crate) const STRATA_MAIN_SYMBOL: &str = "__strata_main";
pub(crate) const ENTRY_SYMBOL: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecyclePhase {
    StringSetup,
    RegionSetup,
    CensusPrewarm,
    UserEntry,
    RegionCleanup,
    CensusTeardown,
    ExitMapping,
}

/// Records the phases emitted into `__strata_main` and rejects any phase
/// that does not come strictly after the previous one.
#[derive(Debug, Default)]
pub(crate) struct PhaseTracker {
    entered: Vec<LifecyclePhase>,
}

impl PhaseTracker {
    pub fn enter(&mut self, phase: LifecyclePhase) -> Result<(), CodegenError> {
        if let Some(after) = self.entered.last().copied()
            && after >= phase
        {
            return Err(CodegenError::LifecycleOrder { phase, after });
        }
        tracing::debug!(?phase, "emitting lifecycle phase");
        self.entered.push(phase);
        Ok(())
    }

    pub fn into_phases(self) -> Vec<LifecyclePhase> {
        self.entered
    }
}

/// How the user entry's result becomes the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitMapping {
    Zero,
    SignExtend,
    Passthrough,
}

impl ExitMapping {
    fn for_reference(reference: &Reference) -> Result<Self, CodegenError> {
        match reference.kind {
            Kind::Void | Kind::Never => Ok(ExitMapping::Zero),
            Kind::Int32 => Ok(ExitMapping::SignExtend),
            Kind::Int64 => Ok(ExitMapping::Passthrough),
            _ => Err(CodegenError::UnsupportedEntryReturn {
                ty: reference.to_string(),
            }),
        }
    }

    fn emit<M: Module>(
        self,
        cx: &mut FunctionCx<'_, '_, M>,
        result: Option<Value>,
    ) -> Result<Value, CodegenError> {
        if self == ExitMapping::Zero {
            return Ok(cx.builder.ins().iconst(types::I64, 0));
        }
        let Some(value) = result else {
            return Err(cx.unsupported("entry function returned no value"));
        };
        Ok(match self {
            ExitMapping::SignExtend => cx.builder.ins().sextend(types::I64, value),
            ExitMapping::Zero | ExitMapping::Passthrough => value,
        })
    }
}

pub(crate) struct LifecycleOutput {
    pub entry: FuncId,
    pub phases: Vec<LifecyclePhase>,
}

pub(crate) struct LifecycleDriver<'m> {
    user_entry: &'m str,
    census: Option<Census>,
}

impl<'m> LifecycleDriver<'m> {
    pub fn new(user_entry: &'m str, census: Option<Census>) -> Self {
        Self { user_entry, census }
    }

    pub fn define<M: Module>(
        self,
        module: &mut M,
        globals: &CodegenGlobals,
        messages: &mut MessagePool,
        clif: &mut BTreeMap<String, String>,
    ) -> Result<LifecycleOutput, CodegenError> {
        let user = globals
            .functions
            .get(self.user_entry)
            .ok_or_else(|| CodegenError::UnknownFunction {
                function: self.user_entry.to_string(),
            })?;
        let exit_mapping = ExitMapping::for_reference(&user.prototype.ret)?;
        let ptr_ty = module.target_config().pointer_type();

        let nullary = module.make_signature();
        let setup_strings = declare_local(module, SETUP_STRINGS_SYMBOL, &nullary)?;
        let region_setup = declare_local(module, REGION_SETUP_SYMBOL, &nullary)?;
        let region_cleanup = declare_local(module, REGION_CLEANUP_SYMBOL, &nullary)?;

        let mut strata_main_sig = module.make_signature();
        strata_main_sig.returns.push(AbiParam::new(types::I64));
        let strata_main = declare_local(module, STRATA_MAIN_SYMBOL, &strata_main_sig)?;

        let mut entry_sig = module.make_signature();
        entry_sig.params.push(AbiParam::new(types::I64));
        entry_sig.params.push(AbiParam::new(ptr_ty));
        entry_sig.returns.push(AbiParam::new(types::I64));
        let entry = module
            .declare_function(ENTRY_SYMBOL, Linkage::Export, &entry_sig)
            .map_err(module_error)?;

        define_body(
            module,
            globals,
            messages,
            clif,
            setup_strings,
            SETUP_STRINGS_SYMBOL,
            nullary.clone(),
            |cx, _| {
                let globals = cx.globals;
                globals.strings.emit_setup(cx);
                cx.builder.ins().return_(&[]);
                Ok(())
            },
        )?;

        define_body(
            module,
            globals,
            messages,
            clif,
            region_setup,
            REGION_SETUP_SYMBOL,
            nullary.clone(),
            |cx, _| {
                let runtime = cx.globals.runtime;
                let zero = cx.builder.ins().iconst(types::I64, 0);
                cx.store_word(runtime.live_heap_objs, zero);
                let one = cx.builder.ins().iconst(types::I64, 1);
                cx.store_word(runtime.region_ready, one);
                cx.builder.ins().return_(&[]);
                Ok(())
            },
        )?;

        define_body(
            module,
            globals,
            messages,
            clif,
            region_cleanup,
            REGION_CLEANUP_SYMBOL,
            nullary,
            |cx, _| {
                let runtime = cx.globals.runtime;
                let zero = cx.builder.ins().iconst(types::I64, 0);
                cx.store_word(runtime.region_ready, zero);
                cx.builder.ins().return_(&[]);
                Ok(())
            },
        )?;

        let mut tracker = PhaseTracker::default();
        let census = self.census;
        let user_id = user.id;
        define_body(
            module,
            globals,
            messages,
            clif,
            strata_main,
            STRATA_MAIN_SYMBOL,
            strata_main_sig,
            |cx, _| {
                tracker.enter(LifecyclePhase::StringSetup)?;
                cx.call(setup_strings, &[]);

                tracker.enter(LifecyclePhase::RegionSetup)?;
                cx.call(region_setup, &[]);

                if let Some(census) = &census {
                    tracker.enter(LifecyclePhase::CensusPrewarm)?;
                    census.prewarm(cx)?;
                }

                tracker.enter(LifecyclePhase::UserEntry)?;
                let result = cx.call(user_id, &[]);

                tracker.enter(LifecyclePhase::RegionCleanup)?;
                cx.call(region_cleanup, &[]);

                if let Some(census) = census {
                    tracker.enter(LifecyclePhase::CensusTeardown)?;
                    census.teardown(cx)?;
                }

                tracker.enter(LifecyclePhase::ExitMapping)?;
                let code = exit_mapping.emit(cx, result)?;
                cx.builder.ins().return_(&[code]);
                Ok(())
            },
        )?;

        define_body(
            module,
            globals,
            messages,
            clif,
            entry,
            ENTRY_SYMBOL,
            entry_sig,
            |cx, params| {
                let runtime = cx.globals.runtime;
                cx.store_word(runtime.num_main_args, params[0]);
                cx.store_word(runtime.main_args, params[1]);
                let status = cx.call_value(strata_main, &[], STRATA_MAIN_SYMBOL)?;
                cx.builder.ins().return_(&[status]);
                Ok(())
            },
        )?;

        Ok(LifecycleOutput {
            entry,
            phases: tracker.into_phases(),
        })
    }
}

fn declare_local<M: Module>(
    module: &mut M,
    name: &str,
    sig: &cranelift_codegen::ir::Signature,
) -> Result<FuncId, CodegenError> {
    module
        .declare_function(name, Linkage::Local, sig)
        .map_err(module_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{BackendConfig, CodegenMode};
    use strata_mir::{MirInst, MirLiteral, MirValueId};

    #[test]
    fn tracker_rejects_out_of_order_phases() {
        let mut tracker = PhaseTracker::default();
        tracker.enter(LifecyclePhase::RegionSetup).expect("first");
        tracker.enter(LifecyclePhase::UserEntry).expect("second");
        assert_eq!(
            tracker.enter(LifecyclePhase::StringSetup),
            Err(CodegenError::LifecycleOrder {
                phase: LifecyclePhase::StringSetup,
                after: LifecyclePhase::UserEntry,
            })
        );
        assert_eq!(
            tracker.enter(LifecyclePhase::UserEntry),
            Err(CodegenError::LifecycleOrder {
                phase: LifecyclePhase::UserEntry,
                after: LifecyclePhase::UserEntry,
            })
        );
    }

    #[test]
    fn census_adds_prewarm_and_teardown_phases() {
        let module = entry_module(Reference::void(), vec![], None);
        let aot = |census| BackendConfig {
            mode: CodegenMode::Aot,
            census,
            ..BackendConfig::default()
        };

        let checked = compile(&module, aot(true)).expect("census build");
        assert_eq!(
            checked.lifecycle,
            vec![
                LifecyclePhase::StringSetup,
                LifecyclePhase::RegionSetup,
                LifecyclePhase::CensusPrewarm,
                LifecyclePhase::UserEntry,
                LifecyclePhase::RegionCleanup,
                LifecyclePhase::CensusTeardown,
                LifecyclePhase::ExitMapping,
            ]
        );

        let unchecked = compile(&module, aot(false)).expect("plain build");
        assert_eq!(
            unchecked.lifecycle,
            vec![
                LifecyclePhase::StringSetup,
                LifecyclePhase::RegionSetup,
                LifecyclePhase::UserEntry,
                LifecyclePhase::RegionCleanup,
                LifecyclePhase::ExitMapping,
            ]
        );
    }

    #[test]
    fn string_entry_return_is_unsupported() {
        let module = entry_module(
            Reference::shared_str(),
            vec![MirInst::Const {
                dest: MirValueId(0),
                literal: MirLiteral::Str("nope".to_string()),
            }],
            Some(0),
        );
        assert_eq!(
            compile(&module, BackendConfig::default()).expect_err("str entry"),
            CodegenError::UnsupportedEntryReturn {
                ty: "share Str".to_string()
            }
        );
    }

    #[test]
    fn int32_exit_code_is_sign_extended() {
        for code in [-3, -1, i32::MIN, i32::MAX] {
            let module = entry_module(
                Reference::int32(),
                vec![MirInst::Const {
                    dest: MirValueId(0),
                    literal: MirLiteral::Int32(code),
                }],
                Some(0),
            );
            assert_eq!(run(&module, BackendConfig::default()).exit_code, i64::from(code));
        }
    }

    #[test]
    fn leaked_object_stays_counted_without_census() {
        let module = entry_module(
            Reference::int64(),
            vec![
                MirInst::Const {
                    dest: MirValueId(0),
                    literal: MirLiteral::Str("adrift".to_string()),
                },
                MirInst::Const {
                    dest: MirValueId(1),
                    literal: MirLiteral::Int64(0),
                },
            ],
            Some(1),
        );
        let outcome = run(
            &module,
            BackendConfig {
                census: false,
                ..BackendConfig::default()
            },
        );
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.live_heap_objects, 1);
    }

    #[test]
    fn interface_tables_are_registered_and_released() {
        let mut module = entry_module(
            Reference::int64(),
            vec![MirInst::Const {
                dest: MirValueId(0),
                literal: MirLiteral::Int64(0),
            }],
            Some(0),
        );
        module.interface_tables.push(strata_mir::MirInterfaceTable {
            interface: "Vessel".to_string(),
            implementor: "Raft".to_string(),
            methods: vec!["main".to_string()],
        });
        let outcome = run(&module, census_config());
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.census_entries, 0);
    }
}
