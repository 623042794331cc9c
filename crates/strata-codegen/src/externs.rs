//! The extern call bridge: marshaling between region values and the host
//! calling convention.
//!
//! [`ExternAbi`] is planned once per extern prototype. The same plan
//! declares the import signature and drives every call site, so the two
//! can never disagree.

use std::fmt;

use cranelift::prelude::{AbiParam, InstBuilder, Value};
use cranelift_codegen::ir::{Signature, TrapCode, Type, types};
use cranelift_module::Module;
use strata_mir::Prototype;
use strata_types::{Crossing, Ownership, Reference};

use crate::CodegenError;
use crate::context::{FunctionCx, Handle, check_valid_reference};
use crate::layout::LayoutCatalog;
use crate::region::heap::HeapRegion;
use crate::region::{ExternalType, HostDest, HostReference, RegionStrategy};

/// How one argument crosses into the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgAbi {
    pub host: HostReference,
    pub external: ExternalType,
    /// Passed as the address of a caller-owned stack slot.
    pub by_pointer: bool,
    /// A trailing size argument follows the fixed arguments.
    pub size_arg: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnAbi {
    Void,
    Divergent,
    Direct { host: HostReference, ty: Type },
    /// The caller passes a slot address as the first argument and reads
    /// the result from it.
    OutParam {
        host: HostReference,
        size: u32,
        align: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternAbi {
    pub prototype: Prototype,
    pub args: Vec<ArgAbi>,
    pub ret: ReturnAbi,
    ptr_ty: Type,
}

impl ExternAbi {
    pub fn for_prototype(
        prototype: &Prototype,
        region: &HeapRegion,
        layouts: &LayoutCatalog,
        ptr_ty: Type,
    ) -> Result<Self, CodegenError> {
        let mut args = Vec::with_capacity(prototype.params.len());
        for param in &prototype.params {
            let host = region.linearize_reference(param);
            let external = region.external_type(layouts, &host, ptr_ty)?;
            if external == ExternalType::Empty {
                return Err(CodegenError::UnsupportedReference {
                    reference: param.to_string(),
                    detail: format!("cannot be a parameter of extern `{}`", prototype.name),
                });
            }
            args.push(ArgAbi {
                by_pointer: region.needs_pointer_parameter(layouts, &host, ptr_ty)?,
                size_arg: region.includes_size_arg(param),
                host,
                external,
            });
        }

        let ret = match prototype.ret.crossing() {
            Crossing::Void => ReturnAbi::Void,
            Crossing::Divergent => ReturnAbi::Divergent,
            Crossing::Owning | Crossing::Shared => {
                let host = region.linearize_reference(&prototype.ret);
                match region.external_type(layouts, &host, ptr_ty)? {
                    ExternalType::Aggregate { size, align } => {
                        ReturnAbi::OutParam { host, size, align }
                    }
                    ExternalType::Scalar(ty) => ReturnAbi::Direct { host, ty },
                    ExternalType::Empty => ReturnAbi::Void,
                }
            }
        };

        Ok(Self {
            prototype: prototype.clone(),
            args,
            ret,
            ptr_ty,
        })
    }

    /// Host parameters in call order: the out-param slot, then every
    /// argument, then the size arguments.
    pub fn host_params(&self) -> Vec<(String, Type)> {
        let mut params = Vec::new();
        if matches!(self.ret, ReturnAbi::OutParam { .. }) {
            params.push(("out".to_string(), self.ptr_ty));
        }
        for (index, arg) in self.args.iter().enumerate() {
            let ty = match arg.external {
                ExternalType::Scalar(ty) if !arg.by_pointer => ty,
                _ => self.ptr_ty,
            };
            params.push((format!("arg{index}"), ty));
        }
        for (index, arg) in self.args.iter().enumerate() {
            if arg.size_arg {
                params.push((format!("size{index}"), types::I64));
            }
        }
        params
    }

    pub fn host_return(&self) -> Option<Type> {
        match self.ret {
            ReturnAbi::Direct { ty, .. } => Some(ty),
            ReturnAbi::Void | ReturnAbi::Divergent | ReturnAbi::OutParam { .. } => None,
        }
    }

    pub fn signature<M: Module>(&self, module: &M) -> Signature {
        let mut sig = module.make_signature();
        sig.params.extend(
            self.host_params()
                .into_iter()
                .map(|(_, ty)| AbiParam::new(ty)),
        );
        if let Some(ret) = self.host_return() {
            sig.returns.push(AbiParam::new(ret));
        }
        sig
    }
}

impl fmt::Display for ExternAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .prototype
            .params
            .iter()
            .map(Reference::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            f,
            "extern {}({params}) -> {}",
            self.prototype.name, self.prototype.ret
        )?;
        for (index, arg) in self.args.iter().enumerate() {
            write!(f, "  arg{index}: {} {}", arg.host, arg.external)?;
            if arg.by_pointer {
                write!(f, " by pointer")?;
            }
            if arg.size_arg {
                write!(f, ", size arg")?;
            }
            writeln!(f)?;
        }
        match &self.ret {
            ReturnAbi::Void => writeln!(f, "  return: void")?,
            ReturnAbi::Divergent => writeln!(f, "  return: never")?,
            ReturnAbi::Direct { host, ty } => writeln!(f, "  return: {host} {ty}")?,
            ReturnAbi::OutParam { host, size, align } => writeln!(
                f,
                "  return: {host} aggregate(size={size}, align={align}) via out-param"
            )?,
        }
        let host_params = self
            .host_params()
            .iter()
            .map(|(name, ty)| format!("{name}: {ty}"))
            .collect::<Vec<_>>()
            .join(", ");
        match self.host_return() {
            Some(ret) => write!(f, "  host: ({host_params}) -> {ret}"),
            None => write!(f, "  host: ({host_params})"),
        }
    }
}

/// Emit a call to a host function, marshaling arguments and the result.
pub(crate) fn lower_extern_call<M: Module>(
    cx: &mut FunctionCx<'_, '_, M>,
    callee: &Prototype,
    args: &[Handle],
) -> Result<Handle, CodegenError> {
    let globals = cx.globals;
    let caller = cx.function_name;
    let declared = globals
        .externs
        .get(&callee.name)
        .ok_or_else(|| CodegenError::UnresolvedExtern {
            name: callee.name.clone(),
        })?;
    let abi = &declared.abi;
    if abi.prototype != *callee {
        return Err(cx.unsupported(format!(
            "call to `{}` does not match its declared prototype",
            callee.name
        )));
    }
    if args.len() != callee.params.len() {
        return Err(CodegenError::ArityMismatch {
            callee: callee.name.clone(),
            expected: callee.params.len(),
            actual: args.len(),
        });
    }
    for (param, arg) in callee.params.iter().zip(args) {
        check_valid_reference(caller, param, arg)?;
    }
    tracing::trace!(extern_name = %callee.name, function = caller, "lowering extern call");

    let region = &globals.heap;
    let mut fixed = Vec::with_capacity(args.len());
    let mut sizes = Vec::new();
    let mut lent: Vec<(&Reference, Value)> = Vec::new();
    for (arg_abi, handle) in abi.args.iter().zip(args) {
        let value = handle.value(caller)?;
        let reference = &arg_abi.host.reference;
        match reference.crossing() {
            Crossing::Shared => {
                let dest = match arg_abi.external {
                    ExternalType::Aggregate { size, align } => {
                        HostDest::Memory(cx.scratch_slot(size, align))
                    }
                    ExternalType::Scalar(_) | ExternalType::Empty => HostDest::Register,
                };
                let host_arg = region.linearize(cx, reference, value, dest)?;
                // The host owns the linear copy from here on.
                region.dealias(cx, reference, value)?;
                fixed.push(host_arg.value);
                if arg_abi.size_arg {
                    let size = host_arg.size.ok_or_else(|| {
                        cx.unsupported(format!("`{reference}` produced no size argument"))
                    })?;
                    sizes.push(size);
                }
            }
            Crossing::Owning => {
                fixed.push(value);
                if arg_abi.size_arg {
                    sizes.push(region.get_string_len(cx, value)?);
                }
                if reference.ownership == Ownership::Own {
                    lent.push((reference, value));
                }
            }
            Crossing::Void | Crossing::Divergent => {
                return Err(CodegenError::UnsupportedReference {
                    reference: reference.to_string(),
                    detail: format!("cannot be passed to `{}`", callee.name),
                });
            }
        }
    }

    let mut call_args = Vec::with_capacity(fixed.len() + sizes.len() + 1);
    let out_slot = match abi.ret {
        ReturnAbi::OutParam { size, align, .. } => {
            let slot = cx.scratch_slot(size, align);
            call_args.push(slot);
            Some(slot)
        }
        _ => None,
    };
    call_args.extend(fixed);
    call_args.extend(sizes);

    cx.flare(&format!("Suspending function {caller}"))?;
    cx.flare(&format!("Calling extern function {}", callee.name))?;
    let result = cx.call(declared.id, &call_args);
    cx.flare(&format!("Done calling function {}", callee.name))?;
    cx.flare(&format!("Resuming function {caller}"))?;

    if abi.ret == ReturnAbi::Divergent {
        cx.builder.ins().trap(TrapCode::unwrap_user(1));
        return Ok(Handle::never());
    }

    for (reference, value) in lent {
        region.dealias(cx, reference, value)?;
    }

    let missing_result =
        || CodegenError::UnsupportedMir {
            function: caller.to_string(),
            detail: format!("extern `{}` produced no result", callee.name),
        };
    let (host, host_value) = match &abi.ret {
        ReturnAbi::Void | ReturnAbi::Divergent => return Ok(Handle::void()),
        ReturnAbi::Direct { host, .. } => (host, result.ok_or_else(missing_result)?),
        ReturnAbi::OutParam { host, .. } => (host, out_slot.ok_or_else(missing_result)?),
    };
    let value = if host.is_linear() {
        region.delinearize(cx, &host.reference, host_value)?
    } else {
        host_value
    };
    Ok(Handle::new(callee.ret.clone(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{BackendConfig, CodegenMode, SizeArgPolicy};
    use strata_mir::{MirInst, MirLiteral, MirValueId};
    use strata_types::StructDef;

    fn catalog() -> LayoutCatalog {
        LayoutCatalog::plan(&[
            StructDef::immutable(
                "Engine",
                vec![("fuel", Reference::int32()), ("name", Reference::shared_str())],
            ),
            StructDef::mutable("Crew", vec![("size", Reference::int64())]),
        ])
        .expect("layouts")
    }

    fn plan(prototype: &Prototype, size_args: SizeArgPolicy) -> ExternAbi {
        let region = HeapRegion::new(&BackendConfig {
            size_args,
            ..BackendConfig::default()
        });
        ExternAbi::for_prototype(prototype, &region, &catalog(), types::I64).expect("plan")
    }

    #[test]
    fn size_arguments_trail_the_fixed_arguments() {
        let abi = plan(
            &Prototype::new(
                "tally",
                vec![Reference::int64(), Reference::shared_str(), Reference::int32()],
                Reference::void(),
            ),
            SizeArgPolicy::SharedOnly,
        );
        let params = abi.host_params();
        assert_eq!(
            params,
            vec![
                ("arg0".to_string(), types::I64),
                ("arg1".to_string(), types::I64),
                ("arg2".to_string(), types::I32),
                ("size1".to_string(), types::I64),
            ]
        );
    }

    #[test]
    fn owning_strings_get_size_args_only_under_all_dynamic() {
        let prototype = Prototype::new("keep", vec![Reference::owned_str()], Reference::void());
        assert!(!plan(&prototype, SizeArgPolicy::SharedOnly).args[0].size_arg);
        assert!(plan(&prototype, SizeArgPolicy::AllDynamic).args[0].size_arg);
    }

    #[test]
    fn shared_struct_abi_snapshot() {
        let abi = plan(
            &Prototype::new(
                "inspect",
                vec![
                    Reference::shared_struct("Engine"),
                    Reference::shared_str(),
                    Reference::owned_struct("Crew"),
                ],
                Reference::shared_struct("Engine"),
            ),
            SizeArgPolicy::SharedOnly,
        );
        insta::assert_snapshot!(abi.to_string(), @r"
        extern inspect(share Engine, share Str, own Crew) -> share Engine
          arg0: share Engine as linear aggregate(size=16, align=8) by pointer
          arg1: share Str as linear i64, size arg
          arg2: own Crew as in-region i64
          return: share Engine as linear aggregate(size=16, align=8) via out-param
          host: (out: i64, arg0: i64, arg1: i64, arg2: i64, size1: i64)
        ");
    }

    #[test]
    fn primitive_and_never_abi_snapshot() {
        let abi = plan(
            &Prototype::new("halt", vec![Reference::float()], Reference::never()),
            SizeArgPolicy::SharedOnly,
        );
        insta::assert_snapshot!(abi.to_string(), @r"
        extern halt(Float) -> Never
          arg0: Float as linear f64
          return: never
          host: (arg0: f64)
        ");
    }

    #[test]
    fn void_parameters_are_rejected() {
        let region = HeapRegion::new(&BackendConfig::default());
        let err = ExternAbi::for_prototype(
            &Prototype::new("odd", vec![Reference::void()], Reference::void()),
            &region,
            &catalog(),
            types::I64,
        )
        .expect_err("void parameter");
        assert!(matches!(err, CodegenError::UnsupportedReference { .. }));
    }

    #[test]
    fn undeclared_extern_is_unresolved() {
        let module = entry_module(
            Reference::int64(),
            vec![
                MirInst::Const {
                    dest: MirValueId(0),
                    literal: MirLiteral::Int64(5),
                },
                MirInst::ExternCall {
                    callee: host_identity_i64(),
                    args: vec![MirValueId(0)],
                    result: Some(MirValueId(1)),
                },
            ],
            Some(1),
        );
        let config = BackendConfig {
            mode: CodegenMode::Aot,
            ..BackendConfig::default()
        };
        assert_eq!(
            compile(&module, config).expect_err("undeclared extern"),
            CodegenError::UnresolvedExtern {
                name: "host_identity_i64".to_string()
            }
        );
    }

    #[test]
    fn out_param_return_uses_exactly_one_slot() {
        let mut module = entry_module(
            Reference::int32(),
            vec![
                MirInst::ExternCall {
                    callee: make_engine(),
                    args: vec![],
                    result: Some(MirValueId(0)),
                },
                MirInst::LoadField {
                    dest: MirValueId(1),
                    target: MirValueId(0),
                    field: 0,
                },
                MirInst::Release {
                    value: MirValueId(0),
                },
            ],
            Some(1),
        );
        module.structs = engine_structs();
        module.externs.push(make_engine());
        let artifact = compile(
            &module,
            BackendConfig {
                mode: CodegenMode::Aot,
                emit_clif: true,
                ..BackendConfig::default()
            },
        )
        .expect("compiles");
        let clif = &artifact.clif["__strata_fn_main"];
        assert_eq!(clif.matches("explicit_slot").count(), 1, "{clif}");
    }

    /// One line per block: its label, then the opcode of each instruction.
    fn opcode_outline(clif: &str) -> String {
        let mut lines: Vec<String> = Vec::new();
        for line in clif.lines().map(str::trim) {
            if line.starts_with("block") && line.ends_with(':') {
                let label = line.split(['(', ':']).next().unwrap_or(line);
                lines.push(format!("{label}:"));
            } else if let Some(current) = lines.last_mut()
                && !line.is_empty()
                && line != "}"
            {
                let inst = line.split_once(" = ").map_or(line, |(_, rhs)| rhs);
                let opcode = inst.split([' ', '.']).next().unwrap_or(inst);
                current.push(' ');
                current.push_str(opcode);
            }
        }
        lines.join("\n")
    }

    fn halt() -> Prototype {
        Prototype::new("halt", vec![Reference::int64()], Reference::never())
    }

    #[test]
    fn never_returning_extern_ends_its_block_in_a_trap() {
        let mut module = entry_module(
            Reference::int64(),
            vec![
                MirInst::Const {
                    dest: MirValueId(0),
                    literal: MirLiteral::Int64(42),
                },
                MirInst::ExternCall {
                    callee: halt(),
                    args: vec![MirValueId(0)],
                    result: None,
                },
                MirInst::Const {
                    dest: MirValueId(1),
                    literal: MirLiteral::Int64(7),
                },
            ],
            Some(1),
        );
        module.externs.push(halt());
        let artifact = compile(
            &module,
            BackendConfig {
                mode: CodegenMode::Aot,
                emit_clif: true,
                ..BackendConfig::default()
            },
        )
        .expect("compiles");
        let clif = &artifact.clif["__strata_fn_main"];
        insta::assert_snapshot!(opcode_outline(clif), @r"
        block0: jump
        block1: iconst call trap
        ");
        assert!(clif.contains("trap user1"), "{clif}");
        assert!(!clif.contains("return"), "{clif}");
    }

    #[test]
    fn shared_string_round_trips_through_the_host() {
        let mut module = entry_module(
            Reference::int64(),
            vec![
                MirInst::Const {
                    dest: MirValueId(0),
                    literal: MirLiteral::Str("porthole".to_string()),
                },
                MirInst::ExternCall {
                    callee: echo_str(),
                    args: vec![MirValueId(0)],
                    result: Some(MirValueId(1)),
                },
                MirInst::ExternCall {
                    callee: Prototype::new(
                        "__builtin_strLength",
                        vec![Reference::shared_str()],
                        Reference::int64(),
                    ),
                    args: vec![MirValueId(1)],
                    result: Some(MirValueId(2)),
                },
            ],
            Some(2),
        );
        module.externs.push(echo_str());
        let outcome = run(&module, census_config());
        assert_eq!(outcome.exit_code, 8);
        assert_eq!(outcome.live_heap_objects, 0);
        assert_eq!(outcome.census_entries, 0);
    }

    #[test]
    fn shared_struct_round_trips_through_the_host() {
        let mut module = entry_module(
            Reference::int32(),
            vec![
                MirInst::Const {
                    dest: MirValueId(0),
                    literal: MirLiteral::Int32(7),
                },
                MirInst::Const {
                    dest: MirValueId(1),
                    literal: MirLiteral::Str("prop".to_string()),
                },
                MirInst::NewStruct {
                    dest: MirValueId(2),
                    struct_name: "Engine".to_string(),
                    ownership: Ownership::Share,
                    fields: vec![MirValueId(0), MirValueId(1)],
                },
                MirInst::ExternCall {
                    callee: echo_engine(),
                    args: vec![MirValueId(2)],
                    result: Some(MirValueId(3)),
                },
                MirInst::LoadField {
                    dest: MirValueId(4),
                    target: MirValueId(3),
                    field: 0,
                },
                MirInst::Release {
                    value: MirValueId(3),
                },
            ],
            Some(4),
        );
        module.structs = engine_structs();
        module.externs.push(echo_engine());
        let outcome = run(&module, census_config());
        assert_eq!(outcome.exit_code, 7);
        assert_eq!(outcome.live_heap_objects, 0);
    }

    #[test]
    fn owning_argument_is_released_after_the_call() {
        let mut module = entry_module(
            Reference::int64(),
            vec![
                MirInst::Const {
                    dest: MirValueId(0),
                    literal: MirLiteral::Int64(3),
                },
                MirInst::NewStruct {
                    dest: MirValueId(1),
                    struct_name: "Crew".to_string(),
                    ownership: Ownership::Own,
                    fields: vec![MirValueId(0)],
                },
                MirInst::ExternCall {
                    callee: crew_size(),
                    args: vec![MirValueId(1)],
                    result: Some(MirValueId(2)),
                },
            ],
            Some(2),
        );
        module.structs = vec![StructDef::mutable("Crew", vec![("size", Reference::int64())])];
        module.externs.push(crew_size());
        let outcome = run(&module, census_config());
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.live_heap_objects, 0);
    }
}
