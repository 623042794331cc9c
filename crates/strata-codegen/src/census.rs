//! The census: a registry of every live heap address, used to catch
//! double frees and leaks in checked builds.

use std::collections::HashSet;

use cranelift::prelude::InstBuilder;
use cranelift_codegen::ir::types;
use cranelift_module::{DataId, FuncId, Module};

use crate::BackendConfig;
use crate::CodegenError;
use crate::context::FunctionCx;

/// Host-side census storage. Generated code reaches it through the
/// `__strata_census_table` global.
#[derive(Debug, Default)]
pub struct CensusTable {
    live: HashSet<usize>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CensusViolation {
    #[error("census: address {addr:#x} registered twice")]
    AlreadyRegistered { addr: usize },
    #[error("census: address {addr:#x} was never registered")]
    NotRegistered { addr: usize },
}

impl CensusTable {
    pub fn add(&mut self, addr: usize) -> Result<(), CensusViolation> {
        if self.live.insert(addr) {
            Ok(())
        } else {
            Err(CensusViolation::AlreadyRegistered { addr })
        }
    }

    pub fn remove(&mut self, addr: usize) -> Result<(), CensusViolation> {
        if self.live.remove(&addr) {
            Ok(())
        } else {
            Err(CensusViolation::NotRegistered { addr })
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.live.contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

pub(crate) const LEAK_MESSAGE: &str = "Memory leaks!";

/// Codegen-side census hooks for the lifecycle wrapper. Present only when
/// the census is enabled.
#[derive(Debug, Clone)]
pub(crate) struct Census {
    static_objects: Vec<DataId>,
}

impl Census {
    pub fn new(config: &BackendConfig, static_objects: Vec<DataId>) -> Option<Self> {
        config.census.then_some(Self { static_objects })
    }

    /// Register statically allocated objects such as dispatch tables, so
    /// the census recognizes them as valid addresses.
    pub fn prewarm<M: Module>(&self, cx: &mut FunctionCx<'_, '_, M>) -> Result<(), CodegenError> {
        let census_add = cx.globals.runtime.census_add;
        self.for_each_static(cx, census_add)
    }

    /// Unregister the static objects, then assert that the region freed
    /// everything it allocated.
    pub fn teardown<M: Module>(self, cx: &mut FunctionCx<'_, '_, M>) -> Result<(), CodegenError> {
        let census_remove = cx.globals.runtime.census_remove;
        self.for_each_static(cx, census_remove)?;

        let live_heap_objs = cx.globals.runtime.live_heap_objs;
        let live = cx.load_word(live_heap_objs);
        let zero = cx.builder.ins().iconst(types::I64, 0);
        let (msg, msg_len) = cx.message(LEAK_MESSAGE)?;
        let assert_eq = cx.globals.runtime.assert_i64_eq;
        cx.call(assert_eq, &[zero, live, msg, msg_len]);
        Ok(())
    }

    fn for_each_static<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        func: FuncId,
    ) -> Result<(), CodegenError> {
        if self.static_objects.is_empty() {
            return Ok(());
        }
        let table = cx.load_census_table();
        for object in &self.static_objects {
            let addr = cx.data_addr(*object);
            cx.call(func, &[table, addr]);
        }
        Ok(())
    }
}
