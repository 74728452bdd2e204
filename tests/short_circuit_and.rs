//! `int both(int a, int b) { return a && b; }` short-circuits: when `a` is
//! zero the right-hand side is never evaluated and the result is `0`
//! directly; otherwise the result is whether `b` is nonzero. The lowered
//! form is a conditional branch into a `rhs` block, both paths merging into
//! an `end` block via a two-incoming-edge phi.

mod support;

use irgen::ir::{InstrKind, IrValue, Terminator};
use irgen::{lower_translation_unit, Options};

#[test]
fn short_circuit_and_merges_through_a_phi() {
    let ast = vec![support::function_def(
        support::int_specifiers(),
        "both",
        vec![support::simple_param("a"), support::simple_param("b")],
        support::compound(vec![support::ret(support::logical_and(
            support::ident("a"),
            support::ident("b"),
        ))]),
    )];

    let tu = lower_translation_unit(&ast, Options::default()).expect("lowering should succeed");
    let func = tu.functions.iter().find(|f| f.name == "both").unwrap();

    // The entry block evaluates `a`, compares it against zero, and branches
    // rather than falling straight through to a return.
    let entry = &func.blocks[0];
    match &entry.term {
        Some(Terminator::CondBranch { then_bb, else_bb, .. }) => {
            // The rhs block is only ever reached when `a` was truthy; the
            // other arm jumps straight to the merge block without touching
            // `b` at all, which is what makes this short-circuiting rather
            // than a plain `&`.
            assert_ne!(then_bb, else_bb);
        }
        other => panic!("expected the entry block to branch on `a`, got {other:?}"),
    }

    // Exactly one block contains a phi with two incoming values, and it is
    // reached by an unconditional branch from the rhs-evaluation block.
    let phi_block = func.blocks.iter().find(|b| {
        b.instrs
            .iter()
            .any(|instr| matches!(&instr.kind, InstrKind::Phi { incoming } if incoming.len() == 2))
    });
    assert!(phi_block.is_some(), "expected a merge block with a two-incoming-edge phi");

    let merge_id = phi_block.unwrap().id;
    let reached_by_branch = func
        .blocks
        .iter()
        .any(|b| matches!(&b.term, Some(Terminator::Branch(target)) if *target == merge_id));
    assert!(reached_by_branch, "the rhs block should fall into the merge block unconditionally");

    // One of the phi's incoming values is the short-circuit constant 0,
    // arriving from a block other than the rhs-evaluation block.
    let phi = phi_block.unwrap().instrs.iter().find_map(|instr| match &instr.kind {
        InstrKind::Phi { incoming } => Some(incoming),
        _ => None,
    }).unwrap();
    let has_short_circuit_zero = phi
        .iter()
        .flatten()
        .any(|(_, value)| matches!(value, IrValue::ConstInt { value: 0, .. }));
    assert!(has_short_circuit_zero, "the non-rhs edge should carry the short-circuit value 0");

    match &func.blocks.last().unwrap().term {
        Some(Terminator::Ret(_)) => {}
        other => panic!("expected the function to return the phi's value, got {other:?}"),
    }
}
