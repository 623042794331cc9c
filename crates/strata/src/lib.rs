mod compiler;
pub mod host;

pub use compiler::{
    CompileResult, RunResult, abi_report, clif_report, compile_file, compile_module, execute_jit,
    load_program, run_file,
};
