//! Backend-neutral mid-level IR (MIR) for strata.
//!
//! MIR arrives fully typed: every call carries the callee's prototype, and
//! every value has a [`Reference`]. The backend consumes MIR as-is; the
//! front end is responsible for having registered every extern it calls.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strata_types::{Kind, Mutability, Ownership, Reference, StructDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MirValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MirBlockId(pub u32);

/// Qualified name plus ordered parameter references and return reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Prototype {
    pub name: String,
    pub params: Vec<Reference>,
    pub ret: Reference,
}

impl Prototype {
    pub fn new(name: impl Into<String>, params: Vec<Reference>, ret: Reference) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirModule {
    #[serde(default)]
    pub structs: Vec<StructDef>,
    #[serde(default)]
    pub externs: Vec<Prototype>,
    pub functions: Vec<MirFunction>,
    #[serde(default)]
    pub interface_tables: Vec<MirInterfaceTable>,
    /// Name of the user entry function.
    pub entry: String,
}

/// A statically known dynamic-dispatch table: the methods `implementor`
/// provides for `interface`, in slot order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirInterfaceTable {
    pub interface: String,
    pub implementor: String,
    pub methods: Vec<String>,
}

impl MirInterfaceTable {
    pub fn symbol_name(&self) -> String {
        format!("__strata_itable_{}_for_{}", self.interface, self.implementor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirFunction {
    pub prototype: Prototype,
    pub entry: MirBlockId,
    pub blocks: Vec<MirBlock>,
}

impl MirFunction {
    pub fn name(&self) -> &str {
        &self.prototype.name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirBlock {
    pub id: MirBlockId,
    pub instructions: Vec<MirInst>,
    pub terminator: MirTerminator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MirInst {
    Const {
        dest: MirValueId,
        literal: MirLiteral,
    },
    /// Call to a function defined in this module.
    Call {
        callee: Prototype,
        args: Vec<MirValueId>,
        result: Option<MirValueId>,
    },
    /// Call to a built-in intrinsic or a host function.
    ExternCall {
        callee: Prototype,
        args: Vec<MirValueId>,
        result: Option<MirValueId>,
    },
    NewStruct {
        dest: MirValueId,
        struct_name: String,
        ownership: Ownership,
        fields: Vec<MirValueId>,
    },
    LoadField {
        dest: MirValueId,
        target: MirValueId,
        field: usize,
    },
    Retain {
        value: MirValueId,
    },
    Release {
        value: MirValueId,
    },
    Nop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MirLiteral {
    Int32(i32),
    Int64(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl MirLiteral {
    pub fn reference(&self) -> Reference {
        match self {
            MirLiteral::Int32(_) => Reference::int32(),
            MirLiteral::Int64(_) => Reference::int64(),
            MirLiteral::Float(_) => Reference::float(),
            MirLiteral::Bool(_) => Reference::bool(),
            MirLiteral::Str(_) => Reference::shared_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MirTerminator {
    Jump {
        target: MirBlockId,
    },
    Branch {
        condition: MirValueId,
        then_block: MirBlockId,
        else_block: MirBlockId,
    },
    Return {
        value: Option<MirValueId>,
    },
    Unreachable,
}

impl MirInst {
    pub fn is_memory_op(&self) -> bool {
        matches!(
            self,
            MirInst::Retain { .. } | MirInst::Release { .. } | MirInst::NewStruct { .. }
        )
    }

    pub fn is_call(&self) -> bool {
        matches!(self, MirInst::Call { .. } | MirInst::ExternCall { .. })
    }
}

impl MirModule {
    pub fn struct_def(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|def| def.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&MirFunction> {
        self.functions.iter().find(|function| function.name() == name)
    }

    pub fn extern_prototype(&self, name: &str) -> Option<&Prototype> {
        self.externs.iter().find(|proto| proto.name == name)
    }

    /// Every distinct string literal, in first-use order.
    pub fn string_literals(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut literals = Vec::new();
        for function in &self.functions {
            for block in &function.blocks {
                for inst in &block.instructions {
                    if let MirInst::Const {
                        literal: MirLiteral::Str(text),
                        ..
                    } = inst
                        && seen.insert(text.as_str())
                    {
                        literals.push(text.as_str());
                    }
                }
            }
        }
        literals
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MirError {
    #[error("duplicate struct `{name}`")]
    DuplicateStruct { name: String },
    #[error("duplicate function `{name}`")]
    DuplicateFunction { name: String },
    #[error("duplicate extern `{name}`")]
    DuplicateExtern { name: String },
    #[error("unknown struct `{name}` referenced from {context}")]
    UnknownStruct { name: String, context: String },
    #[error("shared reference to mutable struct `{name}` in {context}")]
    SharedMutableStruct { name: String, context: String },
    #[error("immutable struct `{name}` has non-shared field `{field}`")]
    NonSharedFieldInImmutable { name: String, field: String },
    #[error("struct `{name}` contains itself")]
    RecursiveStruct { name: String },
    #[error("entry function `{name}` is not defined")]
    MissingEntry { name: String },
    #[error("entry function `{name}` must take no parameters")]
    EntryHasParams { name: String },
    #[error("call to `{callee}` in `{function}` passes {actual} arguments, prototype declares {expected}")]
    ArgumentCount {
        function: String,
        callee: String,
        expected: usize,
        actual: usize,
    },
    #[error("function `{function}` references missing block {block}")]
    MissingBlock { function: String, block: u32 },
    #[error("function `{function}` defines block {block} more than once")]
    DuplicateBlock { function: String, block: u32 },
    #[error("interface table `{table}` names unknown function `{method}`")]
    UnknownTableMethod { table: String, method: String },
}

/// Structural checks that do not need any backend knowledge.
pub fn validate_module(module: &MirModule) -> Result<(), MirError> {
    let mut structs = BTreeMap::new();
    for def in &module.structs {
        if structs.insert(def.name.as_str(), def).is_some() {
            return Err(MirError::DuplicateStruct {
                name: def.name.clone(),
            });
        }
    }

    for def in &module.structs {
        for field in &def.fields {
            let context = format!("field `{}.{}`", def.name, field.name);
            check_reference(&structs, &field.reference, &context)?;
            if def.mutability == Mutability::Immutable
                && field.reference.kind.is_heap_object()
                && field.reference.ownership != Ownership::Share
            {
                return Err(MirError::NonSharedFieldInImmutable {
                    name: def.name.clone(),
                    field: field.name.clone(),
                });
            }
        }
    }
    for def in &module.structs {
        check_acyclic(&structs, &def.name, &mut Vec::new())?;
    }

    let mut externs = BTreeSet::new();
    for proto in &module.externs {
        if !externs.insert(proto.name.as_str()) {
            return Err(MirError::DuplicateExtern {
                name: proto.name.clone(),
            });
        }
        check_prototype(&structs, proto)?;
    }

    let mut functions = BTreeSet::new();
    for function in &module.functions {
        if !functions.insert(function.name()) {
            return Err(MirError::DuplicateFunction {
                name: function.name().to_string(),
            });
        }
        check_prototype(&structs, &function.prototype)?;
        check_function_body(&structs, function)?;
    }

    let entry = module
        .function(&module.entry)
        .ok_or_else(|| MirError::MissingEntry {
            name: module.entry.clone(),
        })?;
    if !entry.prototype.params.is_empty() {
        return Err(MirError::EntryHasParams {
            name: module.entry.clone(),
        });
    }

    for table in &module.interface_tables {
        for method in &table.methods {
            if !functions.contains(method.as_str()) {
                return Err(MirError::UnknownTableMethod {
                    table: table.symbol_name(),
                    method: method.clone(),
                });
            }
        }
    }

    Ok(())
}

fn check_prototype(
    structs: &BTreeMap<&str, &StructDef>,
    proto: &Prototype,
) -> Result<(), MirError> {
    for (index, param) in proto.params.iter().enumerate() {
        check_reference(structs, param, &format!("parameter {index} of `{}`", proto.name))?;
    }
    check_reference(structs, &proto.ret, &format!("return of `{}`", proto.name))
}

fn check_reference(
    structs: &BTreeMap<&str, &StructDef>,
    reference: &Reference,
    context: &str,
) -> Result<(), MirError> {
    let Kind::Struct(name) = &reference.kind else {
        return Ok(());
    };
    let def = structs.get(name.as_str()).ok_or_else(|| MirError::UnknownStruct {
        name: name.clone(),
        context: context.to_string(),
    })?;
    if reference.ownership == Ownership::Share && def.mutability == Mutability::Mutable {
        return Err(MirError::SharedMutableStruct {
            name: name.clone(),
            context: context.to_string(),
        });
    }
    Ok(())
}

fn check_acyclic<'a>(
    structs: &BTreeMap<&str, &'a StructDef>,
    name: &'a str,
    path: &mut Vec<&'a str>,
) -> Result<(), MirError> {
    if path.contains(&name) {
        return Err(MirError::RecursiveStruct {
            name: name.to_string(),
        });
    }
    let Some(def) = structs.get(name) else {
        return Ok(());
    };
    path.push(name);
    for field in &def.fields {
        if let Kind::Struct(child) = &field.reference.kind {
            check_acyclic(structs, child, path)?;
        }
    }
    path.pop();
    Ok(())
}

fn check_function_body(
    structs: &BTreeMap<&str, &StructDef>,
    function: &MirFunction,
) -> Result<(), MirError> {
    let mut blocks = BTreeSet::new();
    for block in &function.blocks {
        if !blocks.insert(block.id.0) {
            return Err(MirError::DuplicateBlock {
                function: function.name().to_string(),
                block: block.id.0,
            });
        }
    }
    let missing = |id: &MirBlockId| MirError::MissingBlock {
        function: function.name().to_string(),
        block: id.0,
    };
    if !blocks.contains(&function.entry.0) {
        return Err(missing(&function.entry));
    }

    for block in &function.blocks {
        for inst in &block.instructions {
            match inst {
                MirInst::Call { callee, args, .. } | MirInst::ExternCall { callee, args, .. } => {
                    if callee.params.len() != args.len() {
                        return Err(MirError::ArgumentCount {
                            function: function.name().to_string(),
                            callee: callee.name.clone(),
                            expected: callee.params.len(),
                            actual: args.len(),
                        });
                    }
                }
                MirInst::NewStruct { struct_name, .. } => {
                    if !structs.contains_key(struct_name.as_str()) {
                        return Err(MirError::UnknownStruct {
                            name: struct_name.clone(),
                            context: format!("function `{}`", function.name()),
                        });
                    }
                }
                _ => {}
            }
        }
        match &block.terminator {
            MirTerminator::Jump { target } if !blocks.contains(&target.0) => {
                return Err(missing(target));
            }
            MirTerminator::Branch {
                then_block,
                else_block,
                ..
            } => {
                if !blocks.contains(&then_block.0) {
                    return Err(missing(then_block));
                }
                if !blocks.contains(&else_block.0) {
                    return Err(missing(else_block));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
