//! Program-wide string table.
//!
//! Every distinct literal gets a constant `[len][bytes][nul]` data object and
//! a slot in `__strata_string_table`. `__strata_setup_strings` fills the
//! slots before the user entry runs; literal uses load the slot and copy the
//! bytes into a fresh heap string.

use std::collections::BTreeMap;

use cranelift::prelude::{InstBuilder, MemFlags, Value};
use cranelift_codegen::ir::types;
use cranelift_module::{DataDescription, DataId, Linkage, Module};

use crate::context::FunctionCx;
use crate::layout::{LINEAR_STR_BYTES_OFFSET, LINEAR_STR_LEN_OFFSET, POINTER_SIZE};
use crate::{CodegenError, module_error};

pub(crate) const STRING_TABLE_SYMBOL: &str = "__strata_string_table";

#[derive(Debug, Clone)]
pub(crate) struct StringTable {
    table: DataId,
    slots: BTreeMap<String, u32>,
    literals: Vec<DataId>,
}

impl StringTable {
    pub fn declare<M: Module>(module: &mut M, literals: &[&str]) -> Result<Self, CodegenError> {
        let table = module
            .declare_data(STRING_TABLE_SYMBOL, Linkage::Local, true, false)
            .map_err(module_error)?;
        let mut description = DataDescription::new();
        description.define_zeroinit(literals.len().max(1) * POINTER_SIZE as usize);
        description.set_align(8);
        module.define_data(table, &description).map_err(module_error)?;

        let mut slots = BTreeMap::new();
        let mut literal_ids = Vec::with_capacity(literals.len());
        for (slot, text) in literals.iter().enumerate() {
            let data_id = module
                .declare_data(&format!("__strata_str_{slot}"), Linkage::Local, false, false)
                .map_err(module_error)?;
            let mut bytes = Vec::with_capacity(text.len() + 9);
            bytes.extend_from_slice(&(text.len() as i64).to_le_bytes());
            bytes.extend_from_slice(text.as_bytes());
            bytes.push(0);
            let mut description = DataDescription::new();
            description.define(bytes.into_boxed_slice());
            description.set_align(8);
            module.define_data(data_id, &description).map_err(module_error)?;

            slots.insert(text.to_string(), slot as u32);
            literal_ids.push(data_id);
        }

        Ok(Self {
            table,
            slots,
            literals: literal_ids,
        })
    }

    /// Store each literal's address into its table slot.
    pub fn emit_setup<M: Module>(&self, cx: &mut FunctionCx<'_, '_, M>) {
        let table = cx.data_addr(self.table);
        for (slot, literal) in self.literals.iter().enumerate() {
            let addr = cx.data_addr(*literal);
            cx.builder.ins().store(
                MemFlags::new(),
                addr,
                table,
                (slot as u32 * POINTER_SIZE) as i32,
            );
        }
    }

    /// A new shared heap string holding a copy of `text`.
    pub fn load_literal<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        text: &str,
    ) -> Result<Value, CodegenError> {
        let slot = *self.slots.get(text).ok_or_else(|| CodegenError::UnsupportedMir {
            function: cx.function_name.to_string(),
            detail: format!("string literal {text:?} missing from the string table"),
        })?;
        let ptr_ty = cx.ptr_ty();
        let table = cx.data_addr(self.table);
        let literal = cx.builder.ins().load(
            ptr_ty,
            MemFlags::new(),
            table,
            (slot * POINTER_SIZE) as i32,
        );
        let len = cx
            .builder
            .ins()
            .load(types::I64, MemFlags::new(), literal, LINEAR_STR_LEN_OFFSET);
        let bytes = cx
            .builder
            .ins()
            .iadd_imm(literal, i64::from(LINEAR_STR_BYTES_OFFSET));
        let globals = cx.globals;
        globals.heap.new_string_from_bytes(cx, bytes, len)
    }
}
