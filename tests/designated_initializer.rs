//! `struct P { int x, y, z; } p = { .z = 7, .x = 1 };` at file scope lowers
//! to a global constant whose field mirror fills in the untouched field
//! with the zero representation rather than leaving it unset
//!.

mod support;

use std::rc::Rc;

use irgen::ast::{Decl, Declarator, Designator, DirectDeclarator, InitDeclarator, Initializer, InitializerListItem, TopLevel};
use irgen::ir::{IrConst, IrType};
use irgen::{lower_translation_unit, Options};

#[test]
fn designated_initializer_zero_fills_the_untouched_field() {
    let pair_decl = support::struct_decl(
        "P",
        vec![
            ("x", support::int_specifiers()),
            ("y", support::int_specifiers()),
            ("z", support::int_specifiers()),
        ],
    );

    let global_decl = support::node(TopLevel::Decl(Decl {
        specifiers: support::struct_ref_specifiers("P"),
        init_declarators: vec![InitDeclarator {
            declarator: support::node(Declarator::Direct(DirectDeclarator::Identifier(Rc::from("p")))),
            initializer: Some(support::node(Initializer::List(vec![
                InitializerListItem {
                    designators: vec![Designator::Field(Rc::from("z"))],
                    initializer: support::node(Initializer::Expr(support::int_lit(7))),
                },
                InitializerListItem {
                    designators: vec![Designator::Field(Rc::from("x"))],
                    initializer: support::node(Initializer::Expr(support::int_lit(1))),
                },
            ]))),
        }],
    }));

    let ast = vec![pair_decl, global_decl];
    let tu = lower_translation_unit(&ast, Options::default()).expect("lowering should succeed");

    let global = tu.find_global("p").expect("global 'p' should be registered");
    let p = tu.global(global);
    match p.init.as_ref().expect("designated initializer should produce a constant") {
        IrConst::Struct(fields) => {
            assert_eq!(fields.len(), 3);
            assert_eq!(fields[0], IrConst::Int { value: 1, ty: IrType::I32 });
            assert_eq!(fields[1], IrConst::Zero(IrType::I32), "untouched field y should be zero-filled");
            assert_eq!(fields[2], IrConst::Int { value: 7, ty: IrType::I32 });
        }
        other => panic!("expected a struct constant, got {other:?}"),
    }
}
