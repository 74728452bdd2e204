//! `int get(int *p) { return p[2]; }` lowers `p[2]` to pointer arithmetic:
//! the index is scaled by the pointee's size (4 bytes for `int`) before
//! being added to the base pointer.

mod support;

use irgen::ir::{BinOp, InstrKind, IrValue, Terminator};
use irgen::{lower_translation_unit, Options};

#[test]
fn array_subscript_scales_the_index_by_element_size() {
    let ast = vec![support::function_def(
        support::int_specifiers(),
        "get",
        vec![support::pointer_param("p")],
        support::compound(vec![support::ret(support::index(support::ident("p"), support::int_lit(2)))]),
    )];

    let tu = lower_translation_unit(&ast, Options::default()).expect("lowering should succeed");
    let func = &tu.functions[0];

    let scaled_offset = func.blocks[0].instrs.iter().find_map(|instr| match &instr.kind {
        InstrKind::Binary { op: BinOp::Mul, rhs, .. } => Some(rhs.clone()),
        _ => None,
    });
    assert_eq!(scaled_offset, Some(IrValue::const_int(8, irgen::ir::IrType::I64)));

    let offset_add = func
        .blocks[0]
        .instrs
        .iter()
        .any(|instr| matches!(&instr.kind, InstrKind::Binary { op: BinOp::Add, .. }));
    assert!(offset_add, "expected the scaled offset to be added to the base pointer");

    match &func.blocks[0].term {
        Some(Terminator::Ret(_)) => {}
        other => panic!("expected a value return, got {other:?}"),
    }
}
