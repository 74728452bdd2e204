//! A function returning a struct by value is lowered under the sret
//! convention: it becomes IR-`void` with an implicit
//! first `Ptr` parameter, and `return p;` becomes a `memcpy` into that
//! pointer followed by `ret void`.

mod support;

use irgen::ir::{InstrKind, IrType, IrValue, Terminator};
use irgen::{lower_translation_unit, Options};

#[test]
fn struct_returning_function_uses_an_implicit_sret_pointer() {
    let pair_decl = support::struct_decl(
        "Pair",
        vec![("x", support::int_specifiers()), ("y", support::int_specifiers())],
    );

    let body = support::compound(vec![
        support::local_decl(support::struct_ref_specifiers("Pair"), "p", None),
        support::expr_stmt(support::assign(support::member(support::ident("p"), "x", false), support::int_lit(1))),
        support::expr_stmt(support::assign(support::member(support::ident("p"), "y", false), support::int_lit(2))),
        support::ret(support::ident("p")),
    ]);

    let make_def = support::function_def(support::struct_ref_specifiers("Pair"), "make", vec![], body);

    let ast = vec![pair_decl, make_def];
    let tu = lower_translation_unit(&ast, Options::default()).expect("lowering should succeed");

    let func = tu.functions.iter().find(|f| f.name == "make").unwrap();
    assert_eq!(func.ret, IrType::Void, "a struct-returning function is IR-void");
    assert_eq!(func.params, vec![IrType::Ptr], "the sret pointer is the sole IR parameter");

    let memcpy_to_sret = func.blocks.iter().flat_map(|b| &b.instrs).any(|instr| match &instr.kind {
        InstrKind::Call { callee: IrValue::GlobalAddr(name), args } => {
            name == "memcpy" && matches!(args.first(), Some(IrValue::Param(0)))
        }
        _ => false,
    });
    assert!(memcpy_to_sret, "return should memcpy into the implicit sret pointer (Param(0))");

    let last_block = func.blocks.last().unwrap();
    match &last_block.term {
        Some(Terminator::RetVoid) => {}
        other => panic!("expected ret void after the sret memcpy, got {other:?}"),
    }
}
