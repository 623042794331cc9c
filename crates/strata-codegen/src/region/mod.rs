//! Region strategies: how values are laid out in memory, how they are
//! released, and how they cross into and out of the host.
//!
//! The only strategy today is the reference-counted heap in [`heap`]; its
//! host-facing (linear) encoding lives in [`linear`].

use std::fmt;

use cranelift::prelude::Value;
use cranelift_codegen::ir::Type;
use cranelift_module::Module;
use strata_types::{Crossing, Reference};

use crate::CodegenError;
use crate::context::FunctionCx;
use crate::layout::LayoutCatalog;

pub mod heap;
pub(crate) mod linear;

/// Which representation a value has when the host sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostForm {
    /// The native region pointer or scalar, passed through untouched.
    InRegion,
    /// A flattened copy the host owns.
    Linear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReference {
    pub reference: Reference,
    pub form: HostForm,
}

impl HostReference {
    pub fn is_linear(&self) -> bool {
        self.form == HostForm::Linear
    }
}

impl fmt::Display for HostReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let form = match self.form {
            HostForm::InRegion => "in-region",
            HostForm::Linear => "linear",
        };
        write!(f, "{} as {form}", self.reference)
    }
}

/// The native calling-convention type of a host-facing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalType {
    Empty,
    Scalar(Type),
    Aggregate { size: u32, align: u32 },
}

impl fmt::Display for ExternalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalType::Empty => write!(f, "void"),
            ExternalType::Scalar(ty) => write!(f, "{ty}"),
            ExternalType::Aggregate { size, align } => {
                write!(f, "aggregate(size={size}, align={align})")
            }
        }
    }
}

/// Where linearization should put its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDest {
    /// Produce a scalar value.
    Register,
    /// Write the aggregate at this address.
    Memory(Value),
}

/// The host-facing value for one argument, plus its size when the value is
/// dynamically sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostArg {
    pub value: Value,
    pub size: Option<Value>,
}

pub(crate) trait RegionStrategy {
    fn linearize_reference(&self, reference: &Reference) -> HostReference {
        let form = match reference.crossing() {
            Crossing::Shared => HostForm::Linear,
            Crossing::Owning | Crossing::Void | Crossing::Divergent => HostForm::InRegion,
        };
        HostReference {
            reference: reference.clone(),
            form,
        }
    }

    fn external_type(
        &self,
        layouts: &LayoutCatalog,
        host: &HostReference,
        ptr_ty: Type,
    ) -> Result<ExternalType, CodegenError>;

    fn needs_pointer_parameter(
        &self,
        layouts: &LayoutCatalog,
        host: &HostReference,
        ptr_ty: Type,
    ) -> Result<bool, CodegenError> {
        Ok(matches!(
            self.external_type(layouts, host, ptr_ty)?,
            ExternalType::Aggregate { .. }
        ))
    }

    fn includes_size_arg(&self, reference: &Reference) -> bool;

    /// Produce the linear form of a shared value.
    fn linearize<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        reference: &Reference,
        value: Value,
        dest: HostDest,
    ) -> Result<HostArg, CodegenError>;

    /// Rebuild an in-region value from its linear form, consuming any host
    /// buffers it holds.
    fn delinearize<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        reference: &Reference,
        host_value: Value,
    ) -> Result<Value, CodegenError>;

    /// Give up one reference to `value`, freeing it if it was the last.
    fn dealias<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        reference: &Reference,
        value: Value,
    ) -> Result<(), CodegenError>;

    fn get_string_len<M: Module>(
        &self,
        cx: &mut FunctionCx<'_, '_, M>,
        value: Value,
    ) -> Result<Value, CodegenError>;
}
