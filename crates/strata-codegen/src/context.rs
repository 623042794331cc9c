//! Module-wide codegen state and the per-function emission context.

use std::collections::BTreeMap;

use cranelift::prelude::{
    AbiParam, FunctionBuilder, FunctionBuilderContext, InstBuilder, MemFlags, StackSlotData,
    StackSlotKind, Value,
};
use cranelift_codegen::ir::{FuncRef, GlobalValue, Signature, Type, types};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use strata_mir::{MirModule, Prototype, validate_module};
use strata_types::Reference;

use crate::census::Census;
use crate::externs::ExternAbi;
use crate::intrinsics::Intrinsic;
use crate::layout::{LayoutCatalog, clif_type};
use crate::region::heap::HeapRegion;
use crate::runtime::RuntimeImports;
use crate::strings::StringTable;
use crate::{BackendConfig, CodegenError, CompiledModule, function, lifecycle, module_error};

/// A value in flight during lowering, tagged with its semantic reference.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Handle {
    pub reference: Reference,
    pub value: Option<Value>,
}

impl Handle {
    pub fn new(reference: Reference, value: Value) -> Self {
        Self {
            reference,
            value: Some(value),
        }
    }

    pub fn void() -> Self {
        Self {
            reference: Reference::void(),
            value: None,
        }
    }

    pub fn never() -> Self {
        Self {
            reference: Reference::never(),
            value: None,
        }
    }

    pub fn is_never(&self) -> bool {
        self.reference.is_never()
    }

    pub fn value(&self, function: &str) -> Result<Value, CodegenError> {
        self.value.ok_or_else(|| CodegenError::UnsupportedReference {
            reference: self.reference.to_string(),
            detail: format!("used as a value in `{function}`"),
        })
    }
}

/// Whether a handle may be passed where `expected` is declared. Owned and
/// shared heap references may be lent to a borrow parameter.
pub(crate) fn conforms(expected: &Reference, actual: &Reference) -> bool {
    expected == actual
        || (expected.ownership == strata_types::Ownership::Borrow && expected.kind == actual.kind)
}

pub(crate) fn check_valid_reference(
    function: &str,
    expected: &Reference,
    handle: &Handle,
) -> Result<(), CodegenError> {
    if conforms(expected, &handle.reference) {
        Ok(())
    } else {
        Err(CodegenError::ReferenceMismatch {
            function: function.to_string(),
            expected: expected.to_string(),
            actual: handle.reference.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DeclaredFunction {
    pub id: FuncId,
    pub prototype: Prototype,
}

#[derive(Debug, Clone)]
pub(crate) struct DeclaredExtern {
    pub id: FuncId,
    pub abi: ExternAbi,
}

/// Everything function lowering needs to know about the module as a whole.
pub(crate) struct CodegenGlobals {
    pub config: BackendConfig,
    pub layouts: LayoutCatalog,
    pub runtime: RuntimeImports,
    pub strings: StringTable,
    pub heap: HeapRegion,
    pub functions: BTreeMap<String, DeclaredFunction>,
    pub externs: BTreeMap<String, DeclaredExtern>,
}

/// Constant byte strings used for diagnostics and flares, shared by every
/// function in the module.
#[derive(Debug, Default)]
pub(crate) struct MessagePool {
    messages: BTreeMap<String, DataId>,
}

impl MessagePool {
    fn intern<M: Module>(&mut self, module: &mut M, text: &str) -> Result<DataId, CodegenError> {
        if let Some(data_id) = self.messages.get(text) {
            return Ok(*data_id);
        }
        let data_id = module
            .declare_data(
                &format!("__strata_msg_{}", self.messages.len()),
                Linkage::Local,
                false,
                false,
            )
            .map_err(module_error)?;
        let mut description = DataDescription::new();
        description.define(text.as_bytes().to_vec().into_boxed_slice());
        module.define_data(data_id, &description).map_err(module_error)?;
        self.messages.insert(text.to_string(), data_id);
        Ok(data_id)
    }
}

pub(crate) struct FunctionCx<'a, 'b, M: Module> {
    pub module: &'a mut M,
    pub builder: &'a mut FunctionBuilder<'b>,
    pub globals: &'a CodegenGlobals,
    pub function_name: &'a str,
    messages: &'a mut MessagePool,
    func_refs: BTreeMap<FuncId, FuncRef>,
    data_values: BTreeMap<DataId, GlobalValue>,
}

impl<'a, 'b, M: Module> FunctionCx<'a, 'b, M> {
    pub fn new(
        module: &'a mut M,
        builder: &'a mut FunctionBuilder<'b>,
        globals: &'a CodegenGlobals,
        messages: &'a mut MessagePool,
        function_name: &'a str,
    ) -> Self {
        Self {
            module,
            builder,
            globals,
            function_name,
            messages,
            func_refs: BTreeMap::new(),
            data_values: BTreeMap::new(),
        }
    }

    pub fn ptr_ty(&self) -> Type {
        self.module.target_config().pointer_type()
    }

    pub fn func_ref(&mut self, id: FuncId) -> FuncRef {
        if let Some(func_ref) = self.func_refs.get(&id) {
            return *func_ref;
        }
        let func_ref = self.module.declare_func_in_func(id, self.builder.func);
        self.func_refs.insert(id, func_ref);
        func_ref
    }

    /// Emit a call and return its first result, if any.
    pub fn call(&mut self, id: FuncId, args: &[Value]) -> Option<Value> {
        let func_ref = self.func_ref(id);
        let call = self.builder.ins().call(func_ref, args);
        self.builder.inst_results(call).first().copied()
    }

    pub fn call_value(&mut self, id: FuncId, args: &[Value], what: &str) -> Result<Value, CodegenError> {
        self.call(id, args).ok_or_else(|| CodegenError::UnsupportedMir {
            function: self.function_name.to_string(),
            detail: format!("{what} returned no value"),
        })
    }

    /// The address of a module data object.
    pub fn data_addr(&mut self, id: DataId) -> Value {
        let global = match self.data_values.get(&id) {
            Some(global) => *global,
            None => {
                let global = self.module.declare_data_in_func(id, self.builder.func);
                self.data_values.insert(id, global);
                global
            }
        };
        let ptr_ty = self.ptr_ty();
        self.builder.ins().global_value(ptr_ty, global)
    }

    pub fn load_census_table(&mut self) -> Value {
        let ptr_ty = self.ptr_ty();
        let slot = self.data_addr(self.globals.runtime.census_table);
        self.builder.ins().load(ptr_ty, MemFlags::new(), slot, 0)
    }

    pub fn load_word(&mut self, id: DataId) -> Value {
        let addr = self.data_addr(id);
        self.builder.ins().load(types::I64, MemFlags::new(), addr, 0)
    }

    pub fn store_word(&mut self, id: DataId, value: Value) {
        let addr = self.data_addr(id);
        self.builder.ins().store(MemFlags::new(), value, addr, 0);
    }

    /// Pointer and length of a constant message.
    pub fn message(&mut self, text: &str) -> Result<(Value, Value), CodegenError> {
        let data_id = self.messages.intern(self.module, text)?;
        let ptr = self.data_addr(data_id);
        let len = self.builder.ins().iconst(types::I64, text.len() as i64);
        Ok((ptr, len))
    }

    /// Write `text` to stderr at run time.
    pub fn print_err(&mut self, text: &str) -> Result<(), CodegenError> {
        let (ptr, len) = self.message(text)?;
        let print_err = self.globals.runtime.print_err;
        self.call(print_err, &[ptr, len]);
        Ok(())
    }

    pub fn flare(&mut self, text: &str) -> Result<(), CodegenError> {
        if !self.globals.config.flares {
            return Ok(());
        }
        self.print_err(&format!("{text}\n"))
    }

    /// A fresh explicit stack slot, returned as its address. Slots are never
    /// reused within a function.
    pub fn scratch_slot(&mut self, size: u32, align: u32) -> Value {
        let slot = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size,
            align.max(1).trailing_zeros() as u8,
        ));
        let ptr_ty = self.ptr_ty();
        self.builder.ins().stack_addr(ptr_ty, slot, 0)
    }

    pub fn unsupported(&self, detail: impl Into<String>) -> CodegenError {
        CodegenError::UnsupportedMir {
            function: self.function_name.to_string(),
            detail: detail.into(),
        }
    }
}

/// Declare-once helper for synthesized and user functions: builds the body
/// with `body`, records its CLIF when requested, and defines it.
pub(crate) fn define_body<M: Module>(
    module: &mut M,
    globals: &CodegenGlobals,
    messages: &mut MessagePool,
    clif: &mut BTreeMap<String, String>,
    id: FuncId,
    symbol: &str,
    signature: Signature,
    body: impl FnOnce(&mut FunctionCx<'_, '_, M>, &[Value]) -> Result<(), CodegenError>,
) -> Result<(), CodegenError> {
    let mut ctx = module.make_context();
    ctx.func.signature = signature;
    let mut fbctx = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fbctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let params = builder.block_params(entry).to_vec();
        let mut cx = FunctionCx::new(module, &mut builder, globals, messages, symbol);
        body(&mut cx, &params)?;
        builder.seal_all_blocks();
        builder.finalize();
    }

    if globals.config.emit_clif {
        clif.insert(symbol.to_string(), ctx.func.display().to_string());
    }
    module
        .define_function(id, &mut ctx)
        .map_err(|detail| CodegenError::Module {
            detail: format!("{detail:?}"),
        })?;
    module.clear_context(&mut ctx);
    tracing::debug!(function = symbol, "defined function");
    Ok(())
}

/// Symbol for a user function. Prefixed so user names never collide with
/// the exported `main` or with C library symbols.
pub(crate) fn user_symbol(name: &str) -> String {
    format!("__strata_fn_{name}")
}

/// Cranelift signature of a module-local function: every parameter and the
/// return value in their in-region form.
pub(crate) fn user_signature<M: Module>(
    module: &M,
    prototype: &Prototype,
) -> Result<Signature, CodegenError> {
    let ptr_ty = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    for param in &prototype.params {
        let ty = clif_type(param, ptr_ty).ok_or_else(|| CodegenError::UnsupportedReference {
            reference: param.to_string(),
            detail: format!("cannot be a parameter of `{}`", prototype.name),
        })?;
        sig.params.push(AbiParam::new(ty));
    }
    if let Some(ret) = clif_type(&prototype.ret, ptr_ty) {
        sig.returns.push(AbiParam::new(ret));
    }
    Ok(sig)
}

/// Lower a whole MIR module into `module`.
pub(crate) fn compile_into_module<M: Module>(
    module: &mut M,
    mir: &MirModule,
    config: &BackendConfig,
) -> Result<CompiledModule, CodegenError> {
    validate_module(mir)?;
    let ptr_ty = module.target_config().pointer_type();
    let layouts = LayoutCatalog::plan(&mir.structs)?;
    let runtime = RuntimeImports::declare(module)?;
    let strings = StringTable::declare(module, &mir.string_literals())?;
    let heap = HeapRegion::new(config);

    let mut functions = BTreeMap::new();
    for function in &mir.functions {
        let sig = user_signature(module, &function.prototype)?;
        let id = module
            .declare_function(&user_symbol(function.name()), Linkage::Local, &sig)
            .map_err(module_error)?;
        functions.insert(
            function.name().to_string(),
            DeclaredFunction {
                id,
                prototype: function.prototype.clone(),
            },
        );
    }

    let mut externs = BTreeMap::new();
    for proto in &mir.externs {
        if Intrinsic::from_name(&proto.name).is_some() {
            continue;
        }
        let abi = ExternAbi::for_prototype(proto, &heap, &layouts, ptr_ty)?;
        tracing::trace!(extern_name = %proto.name, plan = %abi, "planned extern call");
        let sig = abi.signature(module);
        let id = module
            .declare_function(&proto.name, Linkage::Import, &sig)
            .map_err(module_error)?;
        externs.insert(proto.name.clone(), DeclaredExtern { id, abi });
    }

    let mut tables = Vec::with_capacity(mir.interface_tables.len());
    for table in &mir.interface_tables {
        let data_id = module
            .declare_data(&table.symbol_name(), Linkage::Local, false, false)
            .map_err(module_error)?;
        let mut description = DataDescription::new();
        description.define_zeroinit(table.methods.len().max(1) * ptr_ty.bytes() as usize);
        description.set_align(8);
        for (slot, method) in table.methods.iter().enumerate() {
            let declared = functions
                .get(method)
                .ok_or_else(|| CodegenError::UnknownFunction {
                    function: method.clone(),
                })?;
            let func_ref = module.declare_func_in_data(declared.id, &mut description);
            description.write_function_addr(slot as u32 * ptr_ty.bytes(), func_ref);
        }
        module.define_data(data_id, &description).map_err(module_error)?;
        tables.push(data_id);
    }

    let globals = CodegenGlobals {
        config: config.clone(),
        layouts,
        runtime,
        strings,
        heap,
        functions,
        externs,
    };
    let mut messages = MessagePool::default();
    let mut clif = BTreeMap::new();

    for function in &mir.functions {
        function::define_user_function(module, &globals, &mut messages, &mut clif, function)?;
    }

    let census = Census::new(config, tables);
    let lifecycle =
        lifecycle::LifecycleDriver::new(&mir.entry, census).define(module, &globals, &mut messages, &mut clif)?;

    Ok(CompiledModule {
        entry: lifecycle.entry,
        functions: globals
            .functions
            .iter()
            .map(|(name, declared)| (name.clone(), declared.id))
            .collect(),
        live_heap_objs: globals.runtime.live_heap_objs,
        census_table: globals.runtime.census_table,
        lifecycle: lifecycle.phases,
        clif,
    })
}
