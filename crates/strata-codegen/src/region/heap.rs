//! Reference-counted heap region.

use cranelift::prelude::{InstBuilder, IntCC, MemFlags, Value};
use cranelift_codegen::ir::{Type, types};
use cranelift_module::Module;
use strata_types::{Crossing, Kind, Ownership, Reference};

use super::{ExternalType, HostArg, HostDest, HostReference, RegionStrategy, linear};
use crate::context::FunctionCx;
use crate::layout::{
    LayoutCatalog, RC_OFFSET, STR_BYTES_OFFSET, STR_LEN_OFFSET, STR_OVERHEAD, clif_type,
    is_counted,
};
use crate::{BackendConfig, CodegenError, SizeArgPolicy};

pub(crate) const OUTSIDE_REGION_MESSAGE: &str = "allocation outside region lifetime";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRegion {
    size_args: SizeArgPolicy,
    census: bool,
}

impl HeapRegion {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            size_args: config.size_args,
            census: config.census,
        }
    }

    /// Allocate `size` bytes with a reference count of one.
    pub(crate) fn allocate<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        size: Value,
    ) -> Result<Value, CodegenError> {
        let runtime = cx.globals.runtime;
        if self.census {
            let ready = cx.load_word(runtime.region_ready);
            let one = cx.builder.ins().iconst(types::I64, 1);
            let (msg, msg_len) = cx.message(OUTSIDE_REGION_MESSAGE)?;
            cx.call(runtime.assert_i64_eq, &[one, ready, msg, msg_len]);
        }

        let obj = cx.call_value(runtime.malloc, &[size], "malloc")?;
        let one = cx.builder.ins().iconst(types::I64, 1);
        cx.builder.ins().store(MemFlags::new(), one, obj, RC_OFFSET);
        self.adjust_live_count(cx, 1);

        if self.census {
            let table = cx.load_census_table();
            cx.call(runtime.census_add, &[table, obj]);
        }
        Ok(obj)
    }

    pub(crate) fn deallocate<M: Module>(&self, cx: &mut FunctionCx<'_, '_, M>, obj: Value) {
        let runtime = cx.globals.runtime;
        self.adjust_live_count(cx, -1);
        if self.census {
            let table = cx.load_census_table();
            cx.call(runtime.census_remove, &[table, obj]);
        }
        cx.call(runtime.free, &[obj]);
    }

    fn adjust_live_count<M: Module>(&self, cx: &mut FunctionCx<'_, '_, M>, delta: i64) {
        let live_heap_objs = cx.globals.runtime.live_heap_objs;
        let live = cx.load_word(live_heap_objs);
        let next = cx.builder.ins().iadd_imm(live, delta);
        cx.store_word(live_heap_objs, next);
    }

    pub(crate) fn retain<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        reference: &Reference,
        value: Value,
    ) {
        if !is_counted(reference) {
            return;
        }
        let rc = cx
            .builder
            .ins()
            .load(types::I64, MemFlags::new(), value, RC_OFFSET);
        let next = cx.builder.ins().iadd_imm(rc, 1);
        cx.builder.ins().store(MemFlags::new(), next, value, RC_OFFSET);
    }

    /// Release every counted field, then free the object itself.
    fn destroy<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        kind: &Kind,
        obj: Value,
    ) -> Result<(), CodegenError> {
        if let Kind::Struct(name) = kind {
            let globals = cx.globals;
            let def = globals.layouts.struct_def(name)?;
            let layout = globals.layouts.heap_layout(name)?;
            let ptr_ty = cx.ptr_ty();
            for (field, offset) in def.fields.iter().zip(&layout.offsets) {
                if !is_counted(&field.reference) {
                    continue;
                }
                let child = cx
                    .builder
                    .ins()
                    .load(ptr_ty, MemFlags::new(), obj, *offset as i32);
                self.dealias(cx, &field.reference, child)?;
            }
        }
        self.deallocate(cx, obj);
        Ok(())
    }

    /// A new heap string holding `len` bytes copied from `bytes`, which
    /// must be followed by a NUL terminator.
    pub(crate) fn new_string_from_bytes<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        bytes: Value,
        len: Value,
    ) -> Result<Value, CodegenError> {
        let total = cx.builder.ins().iadd_imm(len, STR_OVERHEAD);
        let obj = self.allocate(cx, total)?;
        cx.builder
            .ins()
            .store(MemFlags::new(), len, obj, STR_LEN_OFFSET);
        let dest = cx.builder.ins().iadd_imm(obj, i64::from(STR_BYTES_OFFSET));
        let with_nul = cx.builder.ins().iadd_imm(len, 1);
        let memcpy = cx.globals.runtime.memcpy;
        cx.call(memcpy, &[dest, bytes, with_nul]);
        Ok(obj)
    }

    pub(crate) fn string_len<M: Module>(&self, cx: &mut FunctionCx<'_, '_, M>, obj: Value) -> Value {
        cx.builder
            .ins()
            .load(types::I64, MemFlags::new(), obj, STR_LEN_OFFSET)
    }

    /// Allocate a struct and move `fields` into it, in declaration order.
    pub(crate) fn construct_struct<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        name: &str,
        fields: &[Value],
    ) -> Result<Value, CodegenError> {
        let globals = cx.globals;
        let def = globals.layouts.struct_def(name)?;
        let layout = globals.layouts.heap_layout(name)?;
        if def.fields.len() != fields.len() {
            return Err(cx.unsupported(format!(
                "struct `{name}` has {} fields, got {}",
                def.fields.len(),
                fields.len()
            )));
        }
        let size = cx.builder.ins().iconst(types::I64, i64::from(layout.size));
        let obj = self.allocate(cx, size)?;
        for (value, offset) in fields.iter().zip(&layout.offsets) {
            cx.builder
                .ins()
                .store(MemFlags::new(), *value, obj, *offset as i32);
        }
        Ok(obj)
    }

    /// Load field `index` of a struct. The result carries the field's
    /// declared reference; no reference count changes.
    pub(crate) fn load_field<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        name: &str,
        obj: Value,
        index: usize,
    ) -> Result<(Reference, Value), CodegenError> {
        let globals = cx.globals;
        let def = globals.layouts.struct_def(name)?;
        let layout = globals.layouts.heap_layout(name)?;
        let field = def
            .fields
            .get(index)
            .ok_or_else(|| cx.unsupported(format!("struct `{name}` has no field {index}")))?;
        let ptr_ty = cx.ptr_ty();
        let ty = field_type(&field.reference, ptr_ty)?;
        let value = cx
            .builder
            .ins()
            .load(ty, MemFlags::new(), obj, layout.offsets[index] as i32);
        Ok((field.reference.clone(), value))
    }
}

pub(crate) fn field_type(reference: &Reference, ptr_ty: Type) -> Result<Type, CodegenError> {
    clif_type(reference, ptr_ty).ok_or_else(|| CodegenError::UnsupportedReference {
        reference: reference.to_string(),
        detail: "has no value representation".to_string(),
    })
}

impl RegionStrategy for HeapRegion {
    fn external_type(
        &self,
        layouts: &LayoutCatalog,
        host: &HostReference,
        ptr_ty: Type,
    ) -> Result<ExternalType, CodegenError> {
        let reference = &host.reference;
        match &reference.kind {
            Kind::Void | Kind::Never => Ok(ExternalType::Empty),
            Kind::Struct(name) if host.is_linear() => {
                let layout = layouts.linear_layout(name)?;
                Ok(ExternalType::Aggregate {
                    size: layout.size,
                    align: layout.align,
                })
            }
            _ => Ok(ExternalType::Scalar(field_type(reference, ptr_ty)?)),
        }
    }

    fn includes_size_arg(&self, reference: &Reference) -> bool {
        if !reference.kind.is_dynamically_sized() {
            return false;
        }
        match self.size_args {
            SizeArgPolicy::SharedOnly => reference.crossing() == Crossing::Shared,
            SizeArgPolicy::AllDynamic => true,
        }
    }

    fn linearize<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        reference: &Reference,
        value: Value,
        dest: HostDest,
    ) -> Result<HostArg, CodegenError> {
        if reference.crossing() != Crossing::Shared {
            return Err(CodegenError::UnsupportedReference {
                reference: reference.to_string(),
                detail: "only shared references have a linear form".to_string(),
            });
        }
        match (&reference.kind, dest) {
            (kind, _) if kind.is_primitive() => Ok(HostArg { value, size: None }),
            (Kind::Str, _) => {
                let (buf, len) = linear::linearize_str(self, cx, value)?;
                Ok(HostArg {
                    value: buf,
                    size: Some(len),
                })
            }
            (Kind::Struct(name), HostDest::Memory(addr)) => {
                linear::write_struct(self, cx, name, value, addr, 0)?;
                Ok(HostArg {
                    value: addr,
                    size: None,
                })
            }
            _ => Err(CodegenError::UnsupportedReference {
                reference: reference.to_string(),
                detail: "cannot be linearized into a register".to_string(),
            }),
        }
    }

    fn delinearize<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        reference: &Reference,
        host_value: Value,
    ) -> Result<Value, CodegenError> {
        match &reference.kind {
            Kind::Int32 | Kind::Int64 | Kind::Float | Kind::Bool => Ok(host_value),
            Kind::Str => linear::delinearize_str(self, cx, host_value),
            Kind::Struct(name) => linear::read_struct(self, cx, name, host_value, 0),
            Kind::Void | Kind::Never => Err(CodegenError::UnsupportedReference {
                reference: reference.to_string(),
                detail: "has no host value".to_string(),
            }),
        }
    }

    fn dealias<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        reference: &Reference,
        value: Value,
    ) -> Result<(), CodegenError> {
        if !is_counted(reference) {
            return Ok(());
        }
        if reference.ownership == Ownership::Own {
            return self.destroy(cx, &reference.kind, value);
        }

        let rc = cx
            .builder
            .ins()
            .load(types::I64, MemFlags::new(), value, RC_OFFSET);
        let next = cx.builder.ins().iadd_imm(rc, -1);
        cx.builder.ins().store(MemFlags::new(), next, value, RC_OFFSET);
        let is_last = cx.builder.ins().icmp_imm(IntCC::Equal, next, 0);

        let destroy_block = cx.builder.create_block();
        let cont_block = cx.builder.create_block();
        cx.builder
            .ins()
            .brif(is_last, destroy_block, &[], cont_block, &[]);

        cx.builder.switch_to_block(destroy_block);
        self.destroy(cx, &reference.kind, value)?;
        cx.builder.ins().jump(cont_block, &[]);

        cx.builder.switch_to_block(cont_block);
        Ok(())
    }

    fn get_string_len<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        value: Value,
    ) -> Result<Value, CodegenError> {
        Ok(self.string_len(cx, value))
    }
}
