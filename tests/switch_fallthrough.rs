//! `switch (x) { case 1: case 2: return 10; default: return 0; }` builds its
//! equality-compare chain only after the whole body (including the
//! fallthrough from `case 1` into `case 2`) has been lowered
//!.

mod support;

use irgen::ast::Statement;
use irgen::ir::{BlockId, CmpOp, Function, InstrKind, IrValue, Terminator};
use irgen::{lower_translation_unit, Options};

fn cmp_target(value: i128, op: CmpOp, func: &Function) -> Option<BlockId> {
    for block in &func.blocks {
        let cmp_result = block.instrs.iter().find_map(|instr| match &instr.kind {
            InstrKind::Cmp { op: o, rhs, .. } if *o == op && matches!(rhs, IrValue::ConstInt { value: v, .. } if *v == value) => {
                Some(instr.result)
            }
            _ => None,
        });
        if let Some(result) = cmp_result {
            if let Some(Terminator::CondBranch { cond: IrValue::Value(c), then_bb, .. }) = &block.term {
                if *c == result {
                    return Some(*then_bb);
                }
            }
        }
    }
    None
}

fn returns_constant(block_id: BlockId, value: i128, func: &Function) -> bool {
    let block = func.block(block_id);
    matches!(&block.term, Some(Terminator::Ret(IrValue::ConstInt { value: v, .. })) if *v == value)
}

fn branches_to(block_id: BlockId, func: &Function) -> Option<BlockId> {
    match &func.block(block_id).term {
        Some(Terminator::Branch(target)) => Some(*target),
        _ => None,
    }
}

#[test]
fn fallthrough_case_reaches_the_next_cases_return() {
    let switch_stmt = Statement::Switch {
        controlling: support::ident("x"),
        body: Box::new(support::node(Statement::Compound(vec![
            irgen::ast::BlockItem::Statement(support::node(Statement::Case {
                value: support::int_lit(1),
                body: Box::new(support::node(Statement::Case {
                    value: support::int_lit(2),
                    body: Box::new(support::node(support::ret(support::int_lit(10)))),
                })),
            })),
            irgen::ast::BlockItem::Statement(support::node(Statement::Default {
                body: Box::new(support::node(support::ret(support::int_lit(0)))),
            })),
        ]))),
    };

    let ast = vec![support::function_def(
        support::int_specifiers(),
        "classify",
        vec![support::simple_param("x")],
        support::compound(vec![switch_stmt]),
    )];

    let tu = lower_translation_unit(&ast, Options::default()).expect("lowering should succeed");
    let func = tu.functions.iter().find(|f| f.name == "classify").unwrap();

    let case1_target = cmp_target(1, CmpOp::Eq, func).expect("a compare against case value 1");
    let case2_target = cmp_target(2, CmpOp::Eq, func).expect("a compare against case value 2");

    assert!(!returns_constant(case1_target, 10, func), "case 1 falls through rather than returning directly");
    let fallthrough_target = branches_to(case1_target, func).expect("case 1's block falls through via an unconditional branch");
    assert_eq!(fallthrough_target, case2_target, "case 1 should fall through into case 2's block");
    assert!(returns_constant(case2_target, 10, func));

    let has_default_return_zero = func.blocks.iter().any(|b| matches!(&b.term, Some(Terminator::Ret(IrValue::ConstInt { value: 0, .. }))));
    assert!(has_default_return_zero, "expected a block returning the default case's value 0");
}
