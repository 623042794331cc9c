//! Linear encoding of shared values for the host.
//!
//! Strings become malloc'd `[len][bytes][nul]` buffers; immutable structs
//! become C aggregates with nested structs inlined. The host owns every
//! buffer it receives, and buffers it hands back are freed once copied
//! into the region.

use cranelift::prelude::{InstBuilder, MemFlags, Value};
use cranelift_codegen::ir::types;
use cranelift_module::Module;
use strata_types::Kind;

use super::heap::{HeapRegion, field_type};
use crate::CodegenError;
use crate::context::FunctionCx;
use crate::layout::{
    LINEAR_STR_BYTES_OFFSET, LINEAR_STR_LEN_OFFSET, LINEAR_STR_OVERHEAD, STR_BYTES_OFFSET,
};

/// Copy a heap string into a fresh linear buffer. Returns the buffer and
/// the string length.
pub(crate) fn linearize_str<M: Module>(
    region: &HeapRegion,
    cx: &mut FunctionCx<'_, '_, M>,
    obj: Value,
) -> Result<(Value, Value), CodegenError> {
    let runtime = cx.globals.runtime;
    let len = region.string_len(cx, obj);
    let size = cx.builder.ins().iadd_imm(len, LINEAR_STR_OVERHEAD);
    let buf = cx.call_value(runtime.malloc, &[size], "malloc")?;
    cx.builder
        .ins()
        .store(MemFlags::new(), len, buf, LINEAR_STR_LEN_OFFSET);
    let dest = cx
        .builder
        .ins()
        .iadd_imm(buf, i64::from(LINEAR_STR_BYTES_OFFSET));
    let src = cx.builder.ins().iadd_imm(obj, i64::from(STR_BYTES_OFFSET));
    let with_nul = cx.builder.ins().iadd_imm(len, 1);
    cx.call(runtime.memcpy, &[dest, src, with_nul]);
    Ok((buf, len))
}

/// Copy a linear buffer into a new heap string and free the buffer.
pub(crate) fn delinearize_str<M: Module>(
    region: &HeapRegion,
    cx: &mut FunctionCx<'_, '_, M>,
    buf: Value,
) -> Result<Value, CodegenError> {
    let runtime = cx.globals.runtime;
    let len = cx
        .builder
        .ins()
        .load(types::I64, MemFlags::new(), buf, LINEAR_STR_LEN_OFFSET);
    let bytes = cx
        .builder
        .ins()
        .iadd_imm(buf, i64::from(LINEAR_STR_BYTES_OFFSET));
    let obj = region.new_string_from_bytes(cx, bytes, len)?;
    cx.call(runtime.free, &[buf]);
    Ok(obj)
}

/// Write the linear form of struct `name` at `dest + base`.
pub(crate) fn write_struct<M: Module>(
    region: &HeapRegion,
    cx: &mut FunctionCx<'_, '_, M>,
    name: &str,
    obj: Value,
    dest: Value,
    base: i32,
) -> Result<(), CodegenError> {
    let globals = cx.globals;
    let def = globals.layouts.struct_def(name)?;
    let heap = globals.layouts.heap_layout(name)?;
    let linear = globals.layouts.linear_layout(name)?;
    let ptr_ty = cx.ptr_ty();

    for (index, field) in def.fields.iter().enumerate() {
        let heap_offset = heap.offsets[index] as i32;
        let linear_offset = base + linear.offsets[index] as i32;
        let ty = field_type(&field.reference, ptr_ty)?;
        let value = cx
            .builder
            .ins()
            .load(ty, MemFlags::new(), obj, heap_offset);
        match &field.reference.kind {
            Kind::Str => {
                let (buf, _) = linearize_str(region, cx, value)?;
                cx.builder
                    .ins()
                    .store(MemFlags::new(), buf, dest, linear_offset);
            }
            Kind::Struct(child) => {
                write_struct(region, cx, child, value, dest, linear_offset)?;
            }
            _ => {
                cx.builder
                    .ins()
                    .store(MemFlags::new(), value, dest, linear_offset);
            }
        }
    }
    Ok(())
}

/// Rebuild struct `name` from the linear form at `src + base`.
pub(crate) fn read_struct<M: Module>(
    region: &HeapRegion,
    cx: &mut FunctionCx<'_, '_, M>,
    name: &str,
    src: Value,
    base: i32,
) -> Result<Value, CodegenError> {
    let globals = cx.globals;
    let def = globals.layouts.struct_def(name)?;
    let linear = globals.layouts.linear_layout(name)?;
    let ptr_ty = cx.ptr_ty();

    let mut fields = Vec::with_capacity(def.fields.len());
    for (index, field) in def.fields.iter().enumerate() {
        let offset = base + linear.offsets[index] as i32;
        let value = match &field.reference.kind {
            Kind::Str => {
                let buf = cx.builder.ins().load(ptr_ty, MemFlags::new(), src, offset);
                delinearize_str(region, cx, buf)?
            }
            Kind::Struct(child) => read_struct(region, cx, child, src, offset)?,
            _ => {
                let ty = field_type(&field.reference, ptr_ty)?;
                cx.builder.ins().load(ty, MemFlags::new(), src, offset)
            }
        };
        fields.push(value);
    }
    region.construct_struct(cx, name, &fields)
}
