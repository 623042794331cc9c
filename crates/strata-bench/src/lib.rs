//! Synthetic MIR programs sized for benchmarking the backend.

use strata_mir::{
    MirBlock, MirBlockId, MirFunction, MirInst, MirLiteral, MirModule, MirTerminator, MirValueId,
    Prototype,
};
use strata_types::{Ownership, Reference, StructDef};

/// Host function every extern-heavy program calls.
pub fn sink_prototype() -> Prototype {
    Prototype::new(
        "bench_sink",
        vec![Reference::shared_str(), Reference::int64()],
        Reference::int64(),
    )
}

fn add_i64() -> Prototype {
    Prototype::new(
        "__builtin_addI64",
        vec![Reference::int64(), Reference::int64()],
        Reference::int64(),
    )
}

struct Values(u32);

impl Values {
    fn next(&mut self) -> MirValueId {
        let id = MirValueId(self.0);
        self.0 += 1;
        id
    }
}

fn entry_module(
    structs: Vec<StructDef>,
    externs: Vec<Prototype>,
    instructions: Vec<MirInst>,
    ret: MirValueId,
) -> MirModule {
    MirModule {
        structs,
        externs,
        functions: vec![MirFunction {
            prototype: Prototype::new("main", vec![], Reference::int64()),
            entry: MirBlockId(0),
            blocks: vec![MirBlock {
                id: MirBlockId(0),
                instructions,
                terminator: MirTerminator::Return { value: Some(ret) },
            }],
        }],
        interface_tables: vec![],
        entry: "main".to_string(),
    }
}

/// `1 + 1 + ... + 1`, `terms` times, through the add intrinsic.
pub fn arithmetic_chain_module(terms: usize) -> MirModule {
    let mut values = Values(0);
    let one = values.next();
    let mut acc = values.next();
    let mut instructions = vec![
        MirInst::Const {
            dest: one,
            literal: MirLiteral::Int64(1),
        },
        MirInst::Const {
            dest: acc,
            literal: MirLiteral::Int64(0),
        },
    ];
    for _ in 0..terms {
        let next = values.next();
        instructions.push(MirInst::ExternCall {
            callee: add_i64(),
            args: vec![acc, one],
            result: Some(next),
        });
        acc = next;
    }
    entry_module(vec![], vec![], instructions, acc)
}

/// `calls` host calls, each marshaling a fresh shared string.
pub fn extern_fanout_module(calls: usize) -> MirModule {
    let mut values = Values(0);
    let mut acc = values.next();
    let mut instructions = vec![MirInst::Const {
        dest: acc,
        literal: MirLiteral::Int64(0),
    }];
    for index in 0..calls {
        let text = values.next();
        let next = values.next();
        instructions.push(MirInst::Const {
            dest: text,
            literal: MirLiteral::Str(format!("payload-{index}")),
        });
        instructions.push(MirInst::ExternCall {
            callee: sink_prototype(),
            args: vec![text, acc],
            result: Some(next),
        });
        acc = next;
    }
    entry_module(vec![], vec![sink_prototype()], instructions, acc)
}

/// Build and release `count` shared structs that each own a string.
pub fn struct_churn_module(count: usize) -> MirModule {
    let cargo = StructDef::immutable(
        "Cargo",
        vec![("weight", Reference::int32()), ("label", Reference::shared_str())],
    );
    let mut values = Values(0);
    let mut instructions = Vec::with_capacity(count * 4);
    for index in 0..count {
        let weight = values.next();
        let label = values.next();
        let obj = values.next();
        instructions.push(MirInst::Const {
            dest: weight,
            literal: MirLiteral::Int32(index as i32),
        });
        instructions.push(MirInst::Const {
            dest: label,
            literal: MirLiteral::Str("crate".to_string()),
        });
        instructions.push(MirInst::NewStruct {
            dest: obj,
            struct_name: "Cargo".to_string(),
            ownership: Ownership::Share,
            fields: vec![weight, label],
        });
        instructions.push(MirInst::Release { value: obj });
    }
    let ret = values.next();
    instructions.push(MirInst::Const {
        dest: ret,
        literal: MirLiteral::Int64(count as i64),
    });
    entry_module(vec![cargo], vec![], instructions, ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_mir::validate_module;

    #[test]
    fn synthetic_modules_validate() {
        for module in [
            arithmetic_chain_module(8),
            extern_fanout_module(8),
            struct_churn_module(8),
        ] {
            validate_module(&module).expect("synthetic module should be valid MIR");
        }
    }

    #[test]
    fn fanout_declares_its_sink_once() {
        let module = extern_fanout_module(4);
        assert_eq!(module.externs, vec![sink_prototype()]);
        assert_eq!(module.functions[0].blocks[0].instructions.len(), 9);
    }
}
