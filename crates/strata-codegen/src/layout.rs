//! Object layouts for the two representations a value can have.
//!
//! In-region heap objects start with an 8-byte reference count. Strings
//! store their byte length after the count, followed by the bytes and a NUL
//! terminator. Structs store primitive fields inline and reference fields
//! as pointers to other heap objects.
//!
//! The linear (host-facing) form of an immutable struct is a plain C
//! aggregate: nested immutable structs are inlined, strings become pointers
//! to malloc'd `[len][bytes][nul]` buffers the host owns.

use std::collections::BTreeMap;

use cranelift_codegen::ir::{Type, types};
use strata_types::{Kind, Mutability, Ownership, Reference, StructDef};

use crate::CodegenError;

pub const POINTER_SIZE: u32 = 8;
pub const RC_OFFSET: i32 = 0;
pub const HEADER_SIZE: u32 = 8;
pub const STR_LEN_OFFSET: i32 = 8;
pub const STR_BYTES_OFFSET: i32 = 16;
/// Header plus length word plus the NUL terminator.
pub const STR_OVERHEAD: i64 = 17;
pub const LINEAR_STR_LEN_OFFSET: i32 = 0;
pub const LINEAR_STR_BYTES_OFFSET: i32 = 8;
/// Length word plus the NUL terminator.
pub const LINEAR_STR_OVERHEAD: i64 = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub size: u32,
    pub align: u32,
    pub offsets: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct LayoutCatalog {
    defs: BTreeMap<String, StructDef>,
    heap: BTreeMap<String, StructLayout>,
    linear: BTreeMap<String, StructLayout>,
}

impl LayoutCatalog {
    pub fn plan(structs: &[StructDef]) -> Result<Self, CodegenError> {
        let mut catalog = Self {
            defs: structs
                .iter()
                .map(|def| (def.name.clone(), def.clone()))
                .collect(),
            ..Self::default()
        };
        for def in structs {
            let layout = plan_heap_layout(def)?;
            catalog.heap.insert(def.name.clone(), layout);
        }
        for def in structs {
            if def.mutability == Mutability::Immutable {
                catalog.plan_linear(&def.name)?;
            }
        }
        Ok(catalog)
    }

    pub fn struct_def(&self, name: &str) -> Result<&StructDef, CodegenError> {
        self.defs.get(name).ok_or_else(|| CodegenError::UnknownStruct {
            name: name.to_string(),
        })
    }

    pub fn heap_layout(&self, name: &str) -> Result<&StructLayout, CodegenError> {
        self.heap.get(name).ok_or_else(|| CodegenError::UnknownStruct {
            name: name.to_string(),
        })
    }

    /// Only immutable structs have a linear form.
    pub fn linear_layout(&self, name: &str) -> Result<&StructLayout, CodegenError> {
        if let Some(layout) = self.linear.get(name) {
            return Ok(layout);
        }
        let def = self.struct_def(name)?;
        Err(CodegenError::UnsupportedReference {
            reference: Reference::shared_struct(def.name.clone()).to_string(),
            detail: "mutable structs have no linear form".to_string(),
        })
    }

    fn plan_linear(&mut self, name: &str) -> Result<(), CodegenError> {
        if self.linear.contains_key(name) {
            return Ok(());
        }
        let def = self.struct_def(name)?.clone();
        let mut offset = 0u32;
        let mut align = 1u32;
        let mut offsets = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            let (field_size, field_align) = match &field.reference.kind {
                Kind::Struct(child) => {
                    self.plan_linear(child)?;
                    let child_layout = self.linear_layout(child)?;
                    (child_layout.size, child_layout.align)
                }
                _ => scalar_size_align(&field.reference)?,
            };
            offset = align_up(offset, field_align);
            offsets.push(offset);
            offset += field_size;
            align = align.max(field_align);
        }
        let layout = StructLayout {
            size: align_up(offset.max(1), align),
            align,
            offsets,
        };
        self.linear.insert(def.name.clone(), layout);
        Ok(())
    }
}

fn plan_heap_layout(def: &StructDef) -> Result<StructLayout, CodegenError> {
    let mut offset = HEADER_SIZE;
    let mut align = POINTER_SIZE;
    let mut offsets = Vec::with_capacity(def.fields.len());
    for field in &def.fields {
        let (field_size, field_align) = scalar_size_align(&field.reference)?;
        offset = align_up(offset, field_align);
        offsets.push(offset);
        offset += field_size;
        align = align.max(field_align);
    }
    Ok(StructLayout {
        size: align_up(offset, align),
        align,
        offsets,
    })
}

/// Size and alignment of a value held in a register or a pointer slot.
fn scalar_size_align(reference: &Reference) -> Result<(u32, u32), CodegenError> {
    match &reference.kind {
        Kind::Int32 => Ok((4, 4)),
        Kind::Int64 | Kind::Float => Ok((8, 8)),
        Kind::Bool => Ok((1, 1)),
        Kind::Str | Kind::Struct(_) => Ok((POINTER_SIZE, POINTER_SIZE)),
        Kind::Void | Kind::Never => Err(CodegenError::UnsupportedReference {
            reference: reference.to_string(),
            detail: "has no storage representation".to_string(),
        }),
    }
}

/// The Cranelift type of a reference while it lives in a region.
/// Void and Never have no value.
pub fn clif_type(reference: &Reference, ptr_ty: Type) -> Option<Type> {
    match &reference.kind {
        Kind::Int32 => Some(types::I32),
        Kind::Int64 => Some(types::I64),
        Kind::Float => Some(types::F64),
        Kind::Bool => Some(types::I8),
        Kind::Str | Kind::Struct(_) => Some(ptr_ty),
        Kind::Void | Kind::Never => None,
    }
}

/// Whether releasing this reference can free memory.
pub fn is_counted(reference: &Reference) -> bool {
    reference.kind.is_heap_object() && reference.ownership != Ownership::Borrow
}

pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> LayoutCatalog {
        LayoutCatalog::plan(&[
            StructDef::immutable(
                "Engine",
                vec![("fuel", Reference::int32()), ("name", Reference::shared_str())],
            ),
            StructDef::immutable(
                "Ship",
                vec![
                    ("sunk", Reference::bool()),
                    ("engine", Reference::shared_struct("Engine")),
                    ("speed", Reference::float()),
                ],
            ),
            StructDef::mutable("Dock", vec![("ships", Reference::int64())]),
        ])
        .expect("layouts should plan")
    }

    #[test]
    fn heap_fields_follow_the_reference_count() {
        let catalog = catalog();
        let ship = catalog.heap_layout("Ship").expect("ship layout");
        assert_eq!(ship.offsets, vec![8, 16, 24]);
        assert_eq!(ship.size, 32);
    }

    #[test]
    fn linear_structs_inline_nested_immutable_structs() {
        let catalog = catalog();
        let engine = catalog.linear_layout("Engine").expect("engine layout");
        assert_eq!(engine.offsets, vec![0, 8]);
        assert_eq!(engine.size, 16);

        let ship = catalog.linear_layout("Ship").expect("ship layout");
        assert_eq!(ship.offsets, vec![0, 8, 24]);
        assert_eq!(ship.size, 32);
        assert_eq!(ship.align, 8);
    }

    #[test]
    fn mutable_structs_have_no_linear_layout() {
        let catalog = catalog();
        assert!(matches!(
            catalog.linear_layout("Dock"),
            Err(CodegenError::UnsupportedReference { .. })
        ));
        assert!(matches!(
            catalog.linear_layout("Harbor"),
            Err(CodegenError::UnknownStruct { .. })
        ));
    }

    #[test]
    fn align_up_rounds_to_the_next_multiple() {
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_up(3, 1), 3);
    }
}
