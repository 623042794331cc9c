//! Lowering of user functions: MIR blocks, instructions and terminators.

use std::collections::BTreeMap;

use cranelift::prelude::{Block, InstBuilder, Value};
use cranelift_codegen::ir::{TrapCode, types};
use cranelift_module::Module;
use strata_mir::{MirBlockId, MirFunction, MirInst, MirLiteral, MirTerminator, MirValueId};
use strata_types::{Kind, Mutability, Ownership, Reference};

use crate::context::{
    CodegenGlobals, FunctionCx, Handle, MessagePool, check_valid_reference, define_body,
    user_signature, user_symbol,
};
use crate::externs::lower_extern_call;
use crate::intrinsics::{Intrinsic, lower_intrinsic};
use crate::region::RegionStrategy;
use crate::CodegenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The block ended in a trap; nothing after it is reachable.
    Diverged,
}

pub(crate) fn define_user_function<M: Module>(
    module: &mut M,
    globals: &CodegenGlobals,
    messages: &mut MessagePool,
    clif: &mut BTreeMap<String, String>,
    function: &MirFunction,
) -> Result<(), CodegenError> {
    let declared = globals
        .functions
        .get(function.name())
        .ok_or_else(|| CodegenError::UnknownFunction {
            function: function.name().to_string(),
        })?;
    let symbol = user_symbol(function.name());
    let sig = user_signature(module, &function.prototype)?;
    define_body(
        module,
        globals,
        messages,
        clif,
        declared.id,
        &symbol,
        sig,
        |cx, params| lower_body(cx, function, params),
    )
}

fn lower_body<M: Module>(
    cx: &mut FunctionCx<'_, '_, M>,
    function: &MirFunction,
    params: &[Value],
) -> Result<(), CodegenError> {
    let mut values = BTreeMap::new();
    for (index, (param, value)) in function.prototype.params.iter().zip(params).enumerate() {
        values.insert(MirValueId(index as u32), Handle::new(param.clone(), *value));
    }

    let mut blocks: BTreeMap<MirBlockId, Block> = BTreeMap::new();
    for block in &function.blocks {
        blocks.insert(block.id, cx.builder.create_block());
    }
    let entry = *blocks
        .get(&function.entry)
        .ok_or_else(|| cx.unsupported(format!("missing entry block {}", function.entry.0)))?;
    cx.builder.ins().jump(entry, &[]);

    // The entry block defines values every other block may use.
    let ordered = function
        .blocks
        .iter()
        .filter(|block| block.id == function.entry)
        .chain(function.blocks.iter().filter(|block| block.id != function.entry));
    for block in ordered {
        cx.builder.switch_to_block(blocks[&block.id]);
        let mut flow = Flow::Continue;
        for inst in &block.instructions {
            flow = lower_inst(cx, inst, &mut values)?;
            if flow == Flow::Diverged {
                break;
            }
        }
        if flow == Flow::Continue {
            lower_terminator(cx, function, &block.terminator, &values, &blocks)?;
        }
    }
    Ok(())
}

fn handle(
    cx: &FunctionCx<'_, '_, impl Module>,
    values: &BTreeMap<MirValueId, Handle>,
    id: MirValueId,
) -> Result<Handle, CodegenError> {
    values
        .get(&id)
        .cloned()
        .ok_or_else(|| CodegenError::InvalidMirValue {
            function: cx.function_name.to_string(),
            value: id.0,
        })
}

fn handles(
    cx: &FunctionCx<'_, '_, impl Module>,
    values: &BTreeMap<MirValueId, Handle>,
    ids: &[MirValueId],
) -> Result<Vec<Handle>, CodegenError> {
    ids.iter().map(|id| handle(cx, values, *id)).collect()
}

fn bind(values: &mut BTreeMap<MirValueId, Handle>, dest: Option<MirValueId>, result: Handle) {
    if let Some(dest) = dest {
        values.insert(dest, result);
    }
}

fn lower_inst<M: Module>(
    cx: &mut FunctionCx<'_, '_, M>,
    inst: &MirInst,
    values: &mut BTreeMap<MirValueId, Handle>,
) -> Result<Flow, CodegenError> {
    let globals = cx.globals;
    match inst {
        MirInst::Const { dest, literal } => {
            let value = match literal {
                // Narrow immediates are stored zero-extended.
                MirLiteral::Int32(v) => cx.builder.ins().iconst(types::I32, i64::from(*v as u32)),
                MirLiteral::Int64(v) => cx.builder.ins().iconst(types::I64, *v),
                MirLiteral::Float(v) => cx.builder.ins().f64const(*v),
                MirLiteral::Bool(v) => cx.builder.ins().iconst(types::I8, i64::from(*v)),
                MirLiteral::Str(text) => globals.strings.load_literal(cx, text)?,
            };
            values.insert(*dest, Handle::new(literal.reference(), value));
        }
        MirInst::Call {
            callee,
            args,
            result,
        } => {
            let declared = globals.functions.get(&callee.name).ok_or_else(|| {
                CodegenError::UnknownFunction {
                    function: callee.name.clone(),
                }
            })?;
            if declared.prototype != *callee {
                return Err(cx.unsupported(format!(
                    "call to `{}` does not match its definition",
                    callee.name
                )));
            }
            let arg_handles = handles(cx, values, args)?;
            if arg_handles.len() != callee.params.len() {
                return Err(CodegenError::ArityMismatch {
                    callee: callee.name.clone(),
                    expected: callee.params.len(),
                    actual: arg_handles.len(),
                });
            }
            let mut arg_values = Vec::with_capacity(arg_handles.len());
            for (param, arg) in callee.params.iter().zip(&arg_handles) {
                check_valid_reference(cx.function_name, param, arg)?;
                arg_values.push(arg.value(cx.function_name)?);
            }
            let ret = cx.call(declared.id, &arg_values);
            if callee.ret.is_never() {
                cx.builder.ins().trap(TrapCode::unwrap_user(1));
                return Ok(Flow::Diverged);
            }
            let returned = match ret {
                Some(value) => Handle::new(callee.ret.clone(), value),
                None => Handle::void(),
            };
            bind(values, *result, returned);
        }
        MirInst::ExternCall {
            callee,
            args,
            result,
        } => {
            let arg_handles = handles(cx, values, args)?;
            let returned = match Intrinsic::from_name(&callee.name) {
                Some(intrinsic) => lower_intrinsic(cx, intrinsic, callee, &arg_handles)?,
                None => lower_extern_call(cx, callee, &arg_handles)?,
            };
            if returned.is_never() {
                return Ok(Flow::Diverged);
            }
            bind(values, *result, returned);
        }
        MirInst::NewStruct {
            dest,
            struct_name,
            ownership,
            fields,
        } => {
            let def = globals.layouts.struct_def(struct_name)?;
            let reference = Reference::new(*ownership, Kind::Struct(struct_name.clone()));
            if *ownership == Ownership::Borrow
                || (*ownership == Ownership::Share && def.mutability == Mutability::Mutable)
            {
                return Err(CodegenError::UnsupportedReference {
                    reference: reference.to_string(),
                    detail: "cannot be constructed".to_string(),
                });
            }
            let field_handles = handles(cx, values, fields)?;
            if field_handles.len() != def.fields.len() {
                return Err(CodegenError::ArityMismatch {
                    callee: struct_name.clone(),
                    expected: def.fields.len(),
                    actual: field_handles.len(),
                });
            }
            let mut field_values = Vec::with_capacity(field_handles.len());
            for (field, field_handle) in def.fields.iter().zip(&field_handles) {
                check_valid_reference(cx.function_name, &field.reference, field_handle)?;
                field_values.push(field_handle.value(cx.function_name)?);
            }
            let obj = globals.heap.construct_struct(cx, struct_name, &field_values)?;
            values.insert(*dest, Handle::new(reference, obj));
        }
        MirInst::LoadField {
            dest,
            target,
            field,
        } => {
            let target = handle(cx, values, *target)?;
            let name = target
                .reference
                .struct_name()
                .ok_or_else(|| cx.unsupported(format!("field load from `{}`", target.reference)))?;
            let obj = target.value(cx.function_name)?;
            let (field_ref, value) = globals.heap.load_field(cx, name, obj, *field)?;
            let loaded = if field_ref.is_primitive() {
                Handle::new(field_ref, value)
            } else if field_ref.ownership == Ownership::Share {
                globals.heap.retain(cx, &field_ref, value);
                Handle::new(field_ref, value)
            } else {
                Handle::new(field_ref.as_borrow(), value)
            };
            values.insert(*dest, loaded);
        }
        MirInst::Retain { value } => {
            let target = handle(cx, values, *value)?;
            if target.reference.kind.is_heap_object() {
                if target.reference.ownership != Ownership::Share {
                    return Err(cx.unsupported(format!("cannot retain `{}`", target.reference)));
                }
                let obj = target.value(cx.function_name)?;
                globals.heap.retain(cx, &target.reference, obj);
            }
        }
        MirInst::Release { value } => {
            let target = handle(cx, values, *value)?;
            if let Some(obj) = target.value {
                globals.heap.dealias(cx, &target.reference, obj)?;
            }
        }
        MirInst::Nop => {}
    }
    Ok(Flow::Continue)
}

fn lower_terminator<M: Module>(
    cx: &mut FunctionCx<'_, '_, M>,
    function: &MirFunction,
    terminator: &MirTerminator,
    values: &BTreeMap<MirValueId, Handle>,
    blocks: &BTreeMap<MirBlockId, Block>,
) -> Result<(), CodegenError> {
    let block = |id: &MirBlockId| {
        blocks
            .get(id)
            .copied()
            .ok_or_else(|| CodegenError::UnsupportedMir {
                function: function.name().to_string(),
                detail: format!("jump to missing block {}", id.0),
            })
    };
    match terminator {
        MirTerminator::Jump { target } => {
            let target = block(target)?;
            cx.builder.ins().jump(target, &[]);
        }
        MirTerminator::Branch {
            condition,
            then_block,
            else_block,
        } => {
            let condition = handle(cx, values, *condition)?;
            check_valid_reference(cx.function_name, &Reference::bool(), &condition)?;
            let condition = condition.value(cx.function_name)?;
            let then_block = block(then_block)?;
            let else_block = block(else_block)?;
            cx.builder
                .ins()
                .brif(condition, then_block, &[], else_block, &[]);
        }
        MirTerminator::Return { value } => {
            let ret = &function.prototype.ret;
            match (value, ret.is_void() || ret.is_never()) {
                (_, true) => {
                    cx.builder.ins().return_(&[]);
                }
                (Some(id), false) => {
                    let returned = handle(cx, values, *id)?;
                    if returned.reference != *ret {
                        return Err(CodegenError::ReferenceMismatch {
                            function: cx.function_name.to_string(),
                            expected: ret.to_string(),
                            actual: returned.reference.to_string(),
                        });
                    }
                    let value = returned.value(cx.function_name)?;
                    cx.builder.ins().return_(&[value]);
                }
                (None, false) => {
                    return Err(cx.unsupported(format!("missing return value of type `{ret}`")));
                }
            }
        }
        MirTerminator::Unreachable => {
            cx.builder.ins().trap(TrapCode::unwrap_user(1));
        }
    }
    Ok(())
}
