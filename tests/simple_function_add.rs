//! `int add(int a, int b) { return a + b; }` lowers to a single function
//! with one entry block whose terminator returns the sum of its two bound
//! parameters.

mod support;

use irgen::ast::BinaryOp;
use irgen::ir::{IrType, Terminator};
use irgen::{lower_translation_unit, Options};

#[test]
fn add_two_parameters_and_returns_their_sum() {
    let ast = vec![support::function_def(
        support::int_specifiers(),
        "add",
        vec![support::simple_param("a"), support::simple_param("b")],
        support::compound(vec![support::ret(support::binary(
            BinaryOp::Add,
            support::ident("a"),
            support::ident("b"),
        ))]),
    )];

    let tu = lower_translation_unit(&ast, Options::default()).expect("lowering should succeed");

    assert_eq!(tu.functions.len(), 1);
    let func = &tu.functions[0];
    assert_eq!(func.name, "add");
    assert_eq!(func.params, vec![IrType::I32, IrType::I32]);
    assert_eq!(func.ret, IrType::I32);

    let entry = &func.blocks[0];
    match &entry.term {
        Some(Terminator::Ret(_)) => {}
        other => panic!("expected the entry block to end in a value return, got {other:?}"),
    }
}
