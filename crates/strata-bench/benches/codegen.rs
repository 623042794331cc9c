use std::hint::black_box;

use divan::{AllocProfiler, Bencher};
use strata_bench::{arithmetic_chain_module, extern_fanout_module, struct_churn_module};
use strata_codegen::runtime::free_linear;
use strata_codegen::{
    Backend, BackendConfig, CodegenMode, CraneliftBackend, HostSymbolTable, execute_module_jit,
    plan_extern_abis,
};

#[global_allocator]
static ALLOC: AllocProfiler = AllocProfiler::system();

fn main() {
    divan::main();
}

extern "C" fn bench_sink(buf: *mut u8, acc: i64, len: i64) -> i64 {
    // SAFETY: generated code hands over a linear string it no longer uses.
    unsafe { free_linear(buf) };
    acc + len
}

fn bench_host() -> HostSymbolTable {
    HostSymbolTable::new().with("bench_sink", bench_sink as *const u8)
}

fn aot_config() -> BackendConfig {
    BackendConfig {
        mode: CodegenMode::Aot,
        census: false,
        ..BackendConfig::default()
    }
}

#[divan::bench(args = [16, 64, 256])]
fn compile_arithmetic_chain(bencher: Bencher, terms: usize) {
    let module = arithmetic_chain_module(terms);
    let config = aot_config();
    bencher.bench(|| {
        let artifact = CraneliftBackend::default()
            .compile_module(black_box(&module), &config)
            .unwrap_or_else(|err| panic!("codegen failed in benchmark: {err}"));
        black_box(artifact.object.len())
    });
}

#[divan::bench(args = [16, 64, 256])]
fn compile_extern_fanout(bencher: Bencher, calls: usize) {
    let module = extern_fanout_module(calls);
    let config = aot_config();
    bencher.bench(|| {
        let artifact = CraneliftBackend::default()
            .compile_module(black_box(&module), &config)
            .unwrap_or_else(|err| panic!("codegen failed in benchmark: {err}"));
        black_box(artifact.object.len())
    });
}

#[divan::bench(args = [16, 64, 256])]
fn compile_struct_churn_with_census(bencher: Bencher, count: usize) {
    let module = struct_churn_module(count);
    let config = BackendConfig {
        census: true,
        ..aot_config()
    };
    bencher.bench(|| {
        let artifact = CraneliftBackend::default()
            .compile_module(black_box(&module), &config)
            .unwrap_or_else(|err| panic!("codegen failed in benchmark: {err}"));
        black_box(artifact.object.len())
    });
}

#[divan::bench]
fn plan_fanout_abis(bencher: Bencher) {
    let module = extern_fanout_module(1);
    let config = aot_config();
    bencher.bench(|| {
        let plans = plan_extern_abis(black_box(&module), &config)
            .unwrap_or_else(|err| panic!("ABI planning failed in benchmark: {err}"));
        black_box(plans.len())
    });
}

#[divan::bench(args = [16, 64])]
fn jit_run_extern_fanout(bencher: Bencher, calls: usize) {
    let module = extern_fanout_module(calls);
    let config = BackendConfig {
        census: true,
        ..BackendConfig::default()
    };
    let host = bench_host();
    let args = ["bench".to_string()];
    bencher.bench(|| {
        let outcome = execute_module_jit(black_box(&module), &config, &host, &args)
            .unwrap_or_else(|err| panic!("JIT run failed in benchmark: {err}"));
        assert_eq!(outcome.live_heap_objects, 0);
        black_box(outcome.exit_code)
    });
}
