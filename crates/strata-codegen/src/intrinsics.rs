//! Built-in operations that lower to a few instructions instead of a host
//! call.
//!
//! An extern call whose callee name is in the intrinsic table is handled
//! here; every other name falls through to the extern bridge.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use cranelift::prelude::{FloatCC, FunctionBuilder, InstBuilder, IntCC, Value};
use cranelift_codegen::ir::{TrapCode, types};
use cranelift_module::Module;
use strata_mir::Prototype;
use strata_types::Kind;

use crate::CodegenError;
use crate::context::{FunctionCx, Handle, check_valid_reference};
use crate::region::RegionStrategy;
use crate::runtime::FAILURE_EXIT_CODE;

pub(crate) const PANIC_MESSAGE: &str = "(panic)\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Intrinsic {
    AddI32,
    SubtractI32,
    MultiplyI32,
    DivideI32,
    ModI32,
    LessThanI32,
    GreaterThanI32,
    LessThanOrEqI32,
    GreaterThanOrEqI32,
    EqI32,
    AddI64,
    SubtractI64,
    MultiplyI64,
    DivideI64,
    ModI64,
    LessThanI64,
    GreaterThanI64,
    LessThanOrEqI64,
    GreaterThanOrEqI64,
    EqI64,
    AddFloat,
    SubtractFloat,
    MultiplyFloat,
    DivideFloat,
    NegateFloat,
    LessThanFloat,
    GreaterThanFloat,
    LessThanOrEqFloat,
    GreaterThanOrEqFloat,
    EqFloat,
    EqBool,
    Not,
    And,
    Or,
    StrLength,
    Panic,
    Getch,
    NumMainArgs,
}

impl Intrinsic {
    pub const ALL: [Intrinsic; 38] = [
        Intrinsic::AddI32,
        Intrinsic::SubtractI32,
        Intrinsic::MultiplyI32,
        Intrinsic::DivideI32,
        Intrinsic::ModI32,
        Intrinsic::LessThanI32,
        Intrinsic::GreaterThanI32,
        Intrinsic::LessThanOrEqI32,
        Intrinsic::GreaterThanOrEqI32,
        Intrinsic::EqI32,
        Intrinsic::AddI64,
        Intrinsic::SubtractI64,
        Intrinsic::MultiplyI64,
        Intrinsic::DivideI64,
        Intrinsic::ModI64,
        Intrinsic::LessThanI64,
        Intrinsic::GreaterThanI64,
        Intrinsic::LessThanOrEqI64,
        Intrinsic::GreaterThanOrEqI64,
        Intrinsic::EqI64,
        Intrinsic::AddFloat,
        Intrinsic::SubtractFloat,
        Intrinsic::MultiplyFloat,
        Intrinsic::DivideFloat,
        Intrinsic::NegateFloat,
        Intrinsic::LessThanFloat,
        Intrinsic::GreaterThanFloat,
        Intrinsic::LessThanOrEqFloat,
        Intrinsic::GreaterThanOrEqFloat,
        Intrinsic::EqFloat,
        Intrinsic::EqBool,
        Intrinsic::Not,
        Intrinsic::And,
        Intrinsic::Or,
        Intrinsic::StrLength,
        Intrinsic::Panic,
        Intrinsic::Getch,
        Intrinsic::NumMainArgs,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        static BY_NAME: LazyLock<BTreeMap<&'static str, Intrinsic>> = LazyLock::new(|| {
            Intrinsic::ALL
                .iter()
                .map(|intrinsic| (intrinsic.name(), *intrinsic))
                .collect()
        });
        BY_NAME.get(name).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Intrinsic::AddI32 => "__builtin_addI32",
            Intrinsic::SubtractI32 => "__builtin_subtractI32",
            Intrinsic::MultiplyI32 => "__builtin_multiplyI32",
            Intrinsic::DivideI32 => "__builtin_divideI32",
            Intrinsic::ModI32 => "__builtin_modI32",
            Intrinsic::LessThanI32 => "__builtin_lessThanI32",
            Intrinsic::GreaterThanI32 => "__builtin_greaterThanI32",
            Intrinsic::LessThanOrEqI32 => "__builtin_lessThanOrEqI32",
            Intrinsic::GreaterThanOrEqI32 => "__builtin_greaterThanOrEqI32",
            Intrinsic::EqI32 => "__builtin_eqI32",
            Intrinsic::AddI64 => "__builtin_addI64",
            Intrinsic::SubtractI64 => "__builtin_subtractI64",
            Intrinsic::MultiplyI64 => "__builtin_multiplyI64",
            Intrinsic::DivideI64 => "__builtin_divideI64",
            Intrinsic::ModI64 => "__builtin_modI64",
            Intrinsic::LessThanI64 => "__builtin_lessThanI64",
            Intrinsic::GreaterThanI64 => "__builtin_greaterThanI64",
            Intrinsic::LessThanOrEqI64 => "__builtin_lessThanOrEqI64",
            Intrinsic::GreaterThanOrEqI64 => "__builtin_greaterThanOrEqI64",
            Intrinsic::EqI64 => "__builtin_eqI64",
            Intrinsic::AddFloat => "__builtin_addFloat",
            Intrinsic::SubtractFloat => "__builtin_subtractFloat",
            Intrinsic::MultiplyFloat => "__builtin_multiplyFloat",
            Intrinsic::DivideFloat => "__builtin_divideFloat",
            Intrinsic::NegateFloat => "__builtin_negateFloat",
            Intrinsic::LessThanFloat => "__builtin_lessThanFloat",
            Intrinsic::GreaterThanFloat => "__builtin_greaterThanFloat",
            Intrinsic::LessThanOrEqFloat => "__builtin_lessThanOrEqFloat",
            Intrinsic::GreaterThanOrEqFloat => "__builtin_greaterThanOrEqFloat",
            Intrinsic::EqFloat => "__builtin_eqFloat",
            Intrinsic::EqBool => "__builtin_eqBool",
            Intrinsic::Not => "__builtin_not",
            Intrinsic::And => "__builtin_and",
            Intrinsic::Or => "__builtin_or",
            Intrinsic::StrLength => "__builtin_strLength",
            Intrinsic::Panic => "__builtin_panic",
            Intrinsic::Getch => "__builtin_getch",
            Intrinsic::NumMainArgs => "__builtin_numMainArgs",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Intrinsic::Panic | Intrinsic::Getch | Intrinsic::NumMainArgs => 0,
            Intrinsic::NegateFloat | Intrinsic::Not | Intrinsic::StrLength => 1,
            _ => 2,
        }
    }

    /// The kind every operand must have.
    pub fn operand_kind(self) -> Option<Kind> {
        use Intrinsic::*;
        match self {
            AddI32 | SubtractI32 | MultiplyI32 | DivideI32 | ModI32 | LessThanI32
            | GreaterThanI32 | LessThanOrEqI32 | GreaterThanOrEqI32 | EqI32 => Some(Kind::Int32),
            AddI64 | SubtractI64 | MultiplyI64 | DivideI64 | ModI64 | LessThanI64
            | GreaterThanI64 | LessThanOrEqI64 | GreaterThanOrEqI64 | EqI64 => Some(Kind::Int64),
            AddFloat | SubtractFloat | MultiplyFloat | DivideFloat | NegateFloat
            | LessThanFloat | GreaterThanFloat | LessThanOrEqFloat | GreaterThanOrEqFloat
            | EqFloat => Some(Kind::Float),
            EqBool | Not | And | Or => Some(Kind::Bool),
            StrLength => Some(Kind::Str),
            Panic | Getch | NumMainArgs => None,
        }
    }

    pub fn result_kind(self) -> Kind {
        use Intrinsic::*;
        match self {
            AddI32 | SubtractI32 | MultiplyI32 | DivideI32 | ModI32 => Kind::Int32,
            AddI64 | SubtractI64 | MultiplyI64 | DivideI64 | ModI64 => Kind::Int64,
            AddFloat | SubtractFloat | MultiplyFloat | DivideFloat | NegateFloat => Kind::Float,
            LessThanI32 | GreaterThanI32 | LessThanOrEqI32 | GreaterThanOrEqI32 | EqI32
            | LessThanI64 | GreaterThanI64 | LessThanOrEqI64 | GreaterThanOrEqI64 | EqI64
            | LessThanFloat | GreaterThanFloat | LessThanOrEqFloat | GreaterThanOrEqFloat
            | EqFloat | EqBool | Not | And | Or => Kind::Bool,
            StrLength | Getch | NumMainArgs => Kind::Int64,
            Panic => Kind::Never,
        }
    }
}

fn b1_to_i8(builder: &mut FunctionBuilder, predicate: Value) -> Value {
    let ty = builder.func.dfg.value_type(predicate);
    if ty.bits() == 1 {
        builder.ins().uextend(types::I8, predicate)
    } else {
        predicate
    }
}

fn compare_int(builder: &mut FunctionBuilder, cc: IntCC, values: &[Value]) -> Value {
    let pred = builder.ins().icmp(cc, values[0], values[1]);
    b1_to_i8(builder, pred)
}

fn compare_float(builder: &mut FunctionBuilder, cc: FloatCC, values: &[Value]) -> Value {
    let pred = builder.ins().fcmp(cc, values[0], values[1]);
    b1_to_i8(builder, pred)
}

pub(crate) fn lower_intrinsic<M: Module>(
    cx: &mut FunctionCx<'_, '_, M>,
    intrinsic: Intrinsic,
    callee: &Prototype,
    args: &[Handle],
) -> Result<Handle, CodegenError> {
    for actual in [args.len(), callee.params.len()] {
        if actual != intrinsic.arity() {
            return Err(CodegenError::ArityMismatch {
                callee: intrinsic.name().to_string(),
                expected: intrinsic.arity(),
                actual,
            });
        }
    }
    for (param, arg) in callee.params.iter().zip(args) {
        check_valid_reference(cx.function_name, param, arg)?;
        if intrinsic.operand_kind().is_some_and(|kind| kind != param.kind) {
            return Err(CodegenError::IntrinsicOperandMismatch {
                intrinsic: intrinsic.name().to_string(),
                actual: param.to_string(),
            });
        }
    }
    if callee.ret.kind != intrinsic.result_kind() {
        return Err(CodegenError::IntrinsicOperandMismatch {
            intrinsic: intrinsic.name().to_string(),
            actual: format!("result {}", callee.ret),
        });
    }
    tracing::trace!(
        intrinsic = intrinsic.name(),
        function = cx.function_name,
        "lowering intrinsic"
    );

    let values = args
        .iter()
        .map(|arg| arg.value(cx.function_name))
        .collect::<Result<Vec<_>, _>>()?;
    let globals = cx.globals;
    let b = &mut *cx.builder;
    let result = match intrinsic {
        Intrinsic::AddI32 | Intrinsic::AddI64 => b.ins().iadd(values[0], values[1]),
        Intrinsic::SubtractI32 | Intrinsic::SubtractI64 => b.ins().isub(values[0], values[1]),
        Intrinsic::MultiplyI32 | Intrinsic::MultiplyI64 => b.ins().imul(values[0], values[1]),
        Intrinsic::DivideI32 | Intrinsic::DivideI64 => b.ins().sdiv(values[0], values[1]),
        Intrinsic::ModI32 | Intrinsic::ModI64 => b.ins().srem(values[0], values[1]),
        Intrinsic::LessThanI32 | Intrinsic::LessThanI64 => {
            compare_int(b, IntCC::SignedLessThan, &values)
        }
        Intrinsic::GreaterThanI32 | Intrinsic::GreaterThanI64 => {
            compare_int(b, IntCC::SignedGreaterThan, &values)
        }
        Intrinsic::LessThanOrEqI32 | Intrinsic::LessThanOrEqI64 => {
            compare_int(b, IntCC::SignedLessThanOrEqual, &values)
        }
        Intrinsic::GreaterThanOrEqI32 | Intrinsic::GreaterThanOrEqI64 => {
            compare_int(b, IntCC::SignedGreaterThanOrEqual, &values)
        }
        Intrinsic::EqI32 | Intrinsic::EqI64 | Intrinsic::EqBool => {
            compare_int(b, IntCC::Equal, &values)
        }
        Intrinsic::AddFloat => b.ins().fadd(values[0], values[1]),
        Intrinsic::SubtractFloat => b.ins().fsub(values[0], values[1]),
        Intrinsic::MultiplyFloat => b.ins().fmul(values[0], values[1]),
        Intrinsic::DivideFloat => b.ins().fdiv(values[0], values[1]),
        Intrinsic::NegateFloat => b.ins().fneg(values[0]),
        Intrinsic::LessThanFloat => compare_float(b, FloatCC::LessThan, &values),
        Intrinsic::GreaterThanFloat => compare_float(b, FloatCC::GreaterThan, &values),
        Intrinsic::LessThanOrEqFloat => compare_float(b, FloatCC::LessThanOrEqual, &values),
        Intrinsic::GreaterThanOrEqFloat => {
            compare_float(b, FloatCC::GreaterThanOrEqual, &values)
        }
        Intrinsic::EqFloat => compare_float(b, FloatCC::Equal, &values),
        Intrinsic::Not => {
            let pred = b.ins().icmp_imm(IntCC::Equal, values[0], 0);
            b1_to_i8(b, pred)
        }
        Intrinsic::And => b.ins().band(values[0], values[1]),
        Intrinsic::Or => b.ins().bor(values[0], values[1]),
        Intrinsic::StrLength => {
            let len = globals.heap.get_string_len(cx, values[0])?;
            globals.heap.dealias(cx, &callee.params[0], values[0])?;
            len
        }
        Intrinsic::Panic => {
            cx.print_err(PANIC_MESSAGE)?;
            let status = cx.builder.ins().iconst(types::I64, FAILURE_EXIT_CODE);
            cx.call(globals.runtime.exit, &[status]);
            cx.builder.ins().trap(TrapCode::unwrap_user(1));
            return Ok(Handle::never());
        }
        Intrinsic::Getch => cx.call_value(globals.runtime.getch, &[], "__strata_getch")?,
        Intrinsic::NumMainArgs => cx.load_word(globals.runtime.num_main_args),
    };
    Ok(Handle::new(callee.ret.clone(), result))
}
