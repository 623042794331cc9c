//! The standard host library linked into `strata run`.
//!
//! Shared strings reach these functions as linear buffers the host owns, so
//! each function frees its buffer once the text is copied out.

use strata_codegen::HostSymbolTable;
use strata_codegen::runtime::{exit_process, flush_stdout, free_linear, read_linear_str};
use strata_mir::Prototype;
use strata_types::Reference;

extern "C" fn host_print(buf: *mut u8, _len: i64) {
    // SAFETY: generated code passes a linear string and never reads it again.
    let text = unsafe { take_linear_str(buf) };
    print!("{text}");
}

extern "C" fn host_println(buf: *mut u8, _len: i64) {
    // SAFETY: as for `host_print`.
    let text = unsafe { take_linear_str(buf) };
    println!("{text}");
}

extern "C" fn host_print_int(value: i64) {
    print!("{value}");
}

extern "C" fn host_flush() {
    flush_stdout();
}

extern "C" fn host_exit(status: i64) -> ! {
    exit_process(status)
}

/// # Safety
/// `buf` must be a linear string the caller no longer uses.
unsafe fn take_linear_str(buf: *mut u8) -> String {
    // SAFETY: guaranteed by the caller.
    unsafe {
        let text = read_linear_str(buf);
        free_linear(buf);
        text
    }
}

/// Prototypes of every host function in [`host_symbols`], as MIR must
/// declare them.
pub fn host_prototypes() -> Vec<Prototype> {
    vec![
        Prototype::new("print", vec![Reference::shared_str()], Reference::void()),
        Prototype::new("println", vec![Reference::shared_str()], Reference::void()),
        Prototype::new("printInt", vec![Reference::int64()], Reference::void()),
        Prototype::new("flush", vec![], Reference::void()),
        Prototype::new("exit", vec![Reference::int64()], Reference::never()),
    ]
}

pub fn host_symbols() -> HostSymbolTable {
    HostSymbolTable::new()
        .with("print", host_print as *const u8)
        .with("println", host_println as *const u8)
        .with("printInt", host_print_int as *const u8)
        .with("flush", host_flush as *const u8)
        .with("exit", host_exit as *const u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_prototype_has_a_symbol() {
        let symbols = host_symbols();
        for proto in host_prototypes() {
            assert!(
                symbols.lookup(&proto.name).is_some(),
                "missing host symbol `{}`",
                proto.name
            );
        }
        assert_eq!(symbols.names().count(), host_prototypes().len());
    }
}
