//! The statement lowerer and CFG builder.
//!
//! One lowering function per closed `Statement` variant, each building its
//! own little block diagram and leaving the builder's cursor on the block
//! where lowering should continue, generalized across C's full statement
//! grammar (`switch`, `goto`, labeled statements, the loop forms).

use std::rc::Rc;

use crate::ast::{BlockItem, ForInit, Node, Statement};
use crate::consteval::eval_const_expr;
use crate::env::Env;
use crate::error::{LowerError, LowerResult};
use crate::expr::{current_fn, lower_expr, truthy, ExprContext};
use crate::ir::{BlockId, FunctionId, IrType, IrValue, TransUnit};

/// Pre-pass: collects every label name a function body declares, so `goto`
/// always has a concrete branch target even before the labeled statement
/// itself has been lowered.
pub fn collect_labels(stmt: &Node<Statement>, out: &mut Vec<Rc<str>>) {
    match &stmt.node {
        Statement::Compound(items) => {
            for item in items {
                if let BlockItem::Statement(s) = item {
                    collect_labels(s, out);
                }
            }
        }
        Statement::If { then_branch, else_branch, .. } => {
            collect_labels(then_branch, out);
            if let Some(e) = else_branch {
                collect_labels(e, out);
            }
        }
        Statement::While { body, .. } | Statement::DoWhile { body, .. } | Statement::For { body, .. } => {
            collect_labels(body, out);
        }
        Statement::Switch { body, .. } | Statement::Case { body, .. } | Statement::Default { body } => {
            collect_labels(body, out);
        }
        Statement::Labeled { label, body } => {
            out.push(label.clone());
            collect_labels(body, out);
        }
        _ => {}
    }
}

fn branch_if_unterminated(tu: &mut TransUnit, fid: FunctionId, target: BlockId) {
    if !tu.function(fid).current_is_terminated() {
        tu.function_mut(fid).build_branch(target);
    }
}

/// Lowers one statement. The builder's current block on entry is where
/// straight-line code preceding this statement left off; on return, it is
/// wherever control falls through to once this statement completes
/// (possibly a fresh, still-empty block if the statement branched away).
pub fn lower_statement(env: &mut Env, tu: &mut TransUnit, stmt: &Node<Statement>) -> LowerResult<()> {
    match &stmt.node {
        Statement::Compound(items) => lower_compound(env, tu, items),
        Statement::Expr(e) => {
            if let Some(e) = e {
                lower_expr(env, tu, e, ExprContext::RValue)?;
            }
            Ok(())
        }
        Statement::If { condition, then_branch, else_branch } => {
            lower_if(env, tu, condition, then_branch, else_branch.as_deref())
        }
        Statement::While { condition, body } => lower_while(env, tu, condition, body),
        Statement::DoWhile { body, condition } => lower_do_while(env, tu, body, condition),
        Statement::For { init, condition, update, body } => {
            lower_for(env, tu, init, condition.as_ref(), update.as_ref(), body)
        }
        Statement::Switch { controlling, body } => lower_switch(env, tu, controlling, body, &stmt.position),
        Statement::Case { value, body } => lower_case(env, tu, value, body, &stmt.position),
        Statement::Default { body } => lower_default(env, tu, body, &stmt.position),
        Statement::Labeled { label, body } => lower_labeled(env, tu, label, body),
        Statement::Goto(name) => lower_goto(env, tu, name, &stmt.position),
        Statement::Continue => lower_continue(env, tu, &stmt.position),
        Statement::Break => lower_break(env, tu, &stmt.position),
        Statement::Return(value) => lower_return(env, tu, value.as_ref(), &stmt.position),
        Statement::Decl(decl) => crate::driver::lower_local_decl(env, tu, decl),
    }
}

fn lower_compound(env: &mut Env, tu: &mut TransUnit, items: &[BlockItem]) -> LowerResult<()> {
    env.scope.enter_scope();
    let result = (|| {
        for item in items {
            match item {
                BlockItem::Statement(s) => lower_statement(env, tu, s)?,
                BlockItem::Decl(d) => crate::driver::lower_local_decl(env, tu, d)?,
            }
        }
        Ok(())
    })();
    env.scope.exit_scope();
    result
}

fn lower_if(
    env: &mut Env,
    tu: &mut TransUnit,
    condition: &Node<crate::ast::Expr>,
    then_branch: &Node<Statement>,
    else_branch: Option<&Node<Statement>>,
) -> LowerResult<()> {
    let fid = current_fn(env);
    let cond_val = truthy(env, tu, condition)?;

    let then_bb = tu.function_mut(fid).add_block("if.then");
    let else_bb = else_branch.map(|_| tu.function_mut(fid).add_block("if.else"));
    let after_bb = tu.function_mut(fid).add_block("if.end");
    tu.function_mut(fid).build_cond(cond_val, then_bb, else_bb.unwrap_or(after_bb));

    tu.function_mut(fid).set_current_block(then_bb);
    lower_statement(env, tu, then_branch)?;
    branch_if_unterminated(tu, fid, after_bb);

    if let Some(else_branch) = else_branch {
        tu.function_mut(fid).set_current_block(else_bb.unwrap());
        lower_statement(env, tu, else_branch)?;
        branch_if_unterminated(tu, fid, after_bb);
    }

    tu.function_mut(fid).set_current_block(after_bb);
    Ok(())
}

fn lower_while(
    env: &mut Env,
    tu: &mut TransUnit,
    condition: &Node<crate::ast::Expr>,
    body: &Node<Statement>,
) -> LowerResult<()> {
    let fid = current_fn(env);
    let cond_bb = tu.function_mut(fid).add_block("while.cond");
    let body_bb = tu.function_mut(fid).add_block("while.body");
    let after_bb = tu.function_mut(fid).add_block("while.end");

    branch_if_unterminated(tu, fid, cond_bb);
    tu.function_mut(fid).set_current_block(cond_bb);
    let cond_val = truthy(env, tu, condition)?;
    tu.function_mut(fid).build_cond(cond_val, body_bb, after_bb);

    tu.function_mut(fid).set_current_block(body_bb);
    env.enter_loop(after_bb, cond_bb);
    lower_statement(env, tu, body)?;
    env.exit_loop();
    branch_if_unterminated(tu, fid, cond_bb);

    tu.function_mut(fid).set_current_block(after_bb);
    Ok(())
}

fn lower_do_while(
    env: &mut Env,
    tu: &mut TransUnit,
    body: &Node<Statement>,
    condition: &Node<crate::ast::Expr>,
) -> LowerResult<()> {
    let fid = current_fn(env);
    let body_bb = tu.function_mut(fid).add_block("do.body");
    let cond_bb = tu.function_mut(fid).add_block("do.cond");
    let after_bb = tu.function_mut(fid).add_block("do.end");

    branch_if_unterminated(tu, fid, body_bb);
    tu.function_mut(fid).set_current_block(body_bb);
    env.enter_loop(after_bb, cond_bb);
    lower_statement(env, tu, body)?;
    env.exit_loop();
    branch_if_unterminated(tu, fid, cond_bb);

    tu.function_mut(fid).set_current_block(cond_bb);
    let cond_val = truthy(env, tu, condition)?;
    tu.function_mut(fid).build_cond(cond_val, body_bb, after_bb);

    tu.function_mut(fid).set_current_block(after_bb);
    Ok(())
}

fn lower_for(
    env: &mut Env,
    tu: &mut TransUnit,
    init: &ForInit,
    condition: Option<&Node<crate::ast::Expr>>,
    update: Option<&Node<crate::ast::Expr>>,
    body: &Node<Statement>,
) -> LowerResult<()> {
    let fid = current_fn(env);
    env.scope.enter_scope();
    let result = (|| {
        match init {
            ForInit::Decl(d) => crate::driver::lower_local_decl(env, tu, d)?,
            ForInit::Expr(Some(e)) => {
                lower_expr(env, tu, e, ExprContext::RValue)?;
            }
            ForInit::Expr(None) => {}
        }

        let cond_bb = tu.function_mut(fid).add_block("for.cond");
        let body_bb = tu.function_mut(fid).add_block("for.body");
        let update_bb = tu.function_mut(fid).add_block("for.update");
        let after_bb = tu.function_mut(fid).add_block("for.end");

        branch_if_unterminated(tu, fid, cond_bb);
        tu.function_mut(fid).set_current_block(cond_bb);
        let cond_val = match condition {
            Some(c) => truthy(env, tu, c)?,
            None => IrValue::const_int(1, IrType::I32),
        };
        tu.function_mut(fid).build_cond(cond_val, body_bb, after_bb);

        tu.function_mut(fid).set_current_block(body_bb);
        env.enter_loop(after_bb, update_bb);
        lower_statement(env, tu, body)?;
        env.exit_loop();
        branch_if_unterminated(tu, fid, update_bb);

        tu.function_mut(fid).set_current_block(update_bb);
        if let Some(u) = update {
            lower_expr(env, tu, u, ExprContext::RValue)?;
        }
        branch_if_unterminated(tu, fid, cond_bb);

        tu.function_mut(fid).set_current_block(after_bb);
        Ok(())
    })();
    env.scope.exit_scope();
    result
}

/// `switch` defers building its compare chain until the body (and every
/// `case`/`default` it contains) has been lowered, since only then is the
/// full case list known. The controlling expression is computed
/// once, at the construct's entry block; the chain of equality compares is
/// built there only after the fact, by rewinding the builder's cursor back
/// to that same entry block.
fn lower_switch(
    env: &mut Env,
    tu: &mut TransUnit,
    controlling: &Node<crate::ast::Expr>,
    body: &Node<Statement>,
    position: &crate::error::Position,
) -> LowerResult<()> {
    let fid = current_fn(env);
    let (ctrl_val, ctrl_ty) = lower_expr(env, tu, controlling, ExprContext::RValue)?;
    let entry_bb = tu.function(fid).current_block_id();

    let body_bb = tu.function_mut(fid).add_block("switch.body");
    let after_bb = tu.function_mut(fid).add_block("switch.end");

    tu.function_mut(fid).set_current_block(body_bb);
    env.enter_switch(ctrl_ty, after_bb);
    lower_statement(env, tu, body)?;
    let ctx = env.exit_switch();
    branch_if_unterminated(tu, fid, after_bb);

    let ctrl_ir_ty = crate::expr::ir_type_of(env, tu, ctrl_ty)?;
    let unsigned = !env.types.is_signed(ctrl_ty);

    tu.function_mut(fid).set_current_block(entry_bb);
    if ctx.cases.is_empty() {
        tu.function_mut(fid).build_branch(ctx.default.unwrap_or(after_bb));
    } else {
        let mut cursor = entry_bb;
        for (i, (case_value, case_bb)) in ctx.cases.iter().enumerate() {
            tu.function_mut(fid).set_current_block(cursor);
            let const_val = IrValue::const_int(*case_value, ctrl_ir_ty.clone());
            let cmp = crate::expr::build_cmp(env, tu, crate::ir::CmpOp::Eq, ctrl_val.clone(), const_val, unsigned)?;
            let is_last = i + 1 == ctx.cases.len();
            let next = if is_last {
                ctx.default.unwrap_or(after_bb)
            } else {
                tu.function_mut(fid).add_block("switch.cmp")
            };
            tu.function_mut(fid).build_cond(cmp, *case_bb, next);
            cursor = next;
        }
    }
    let _ = position;

    tu.function_mut(fid).set_current_block(after_bb);
    Ok(())
}

fn lower_case(
    env: &mut Env,
    tu: &mut TransUnit,
    value: &Node<crate::ast::Expr>,
    body: &Node<Statement>,
    position: &crate::error::Position,
) -> LowerResult<()> {
    let fid = current_fn(env);
    let (const_val, _ty) = eval_const_expr(env, tu, value)?;
    let case_value = match const_val {
        IrValue::ConstInt { value, .. } => value,
        _ => {
            return Err(LowerError::ill_formed(
                "case label must be an integer constant",
                position.clone(),
            ))
        }
    };
    let case_bb = tu.function_mut(fid).add_block("switch.case");
    branch_if_unterminated(tu, fid, case_bb);
    tu.function_mut(fid).set_current_block(case_bb);

    env.current_switch_mut()
        .ok_or_else(|| LowerError::ill_formed("'case' outside a switch", position.clone()))?
        .cases
        .push((case_value, case_bb));

    lower_statement(env, tu, body)
}

fn lower_default(
    env: &mut Env,
    tu: &mut TransUnit,
    body: &Node<Statement>,
    position: &crate::error::Position,
) -> LowerResult<()> {
    let fid = current_fn(env);
    let default_bb = tu.function_mut(fid).add_block("switch.default");
    branch_if_unterminated(tu, fid, default_bb);
    tu.function_mut(fid).set_current_block(default_bb);

    let ctx = env
        .current_switch_mut()
        .ok_or_else(|| LowerError::ill_formed("'default' outside a switch", position.clone()))?;
    if ctx.default.is_some() {
        return Err(LowerError::ill_formed(
            "multiple 'default' labels in one switch",
            position.clone(),
        ));
    }
    ctx.default = Some(default_bb);

    lower_statement(env, tu, body)
}

fn lower_labeled(env: &mut Env, tu: &mut TransUnit, label: &Rc<str>, body: &Node<Statement>) -> LowerResult<()> {
    let fid = current_fn(env);
    let block = *env
        .labels
        .get(label)
        .expect("collect_labels pre-allocated a block for every label in this function");
    branch_if_unterminated(tu, fid, block);
    tu.function_mut(fid).set_current_block(block);
    lower_statement(env, tu, body)
}

fn lower_goto(
    env: &mut Env,
    tu: &mut TransUnit,
    name: &Rc<str>,
    position: &crate::error::Position,
) -> LowerResult<()> {
    let fid = current_fn(env);
    let target = *env
        .labels
        .get(name)
        .ok_or_else(|| LowerError::ill_formed(format!("use of undeclared label '{name}'"), position.clone()))?;
    tu.function_mut(fid).build_branch(target);
    let after = tu.function_mut(fid).add_block("goto.unreachable");
    tu.function_mut(fid).set_current_block(after);
    Ok(())
}

fn lower_break(env: &mut Env, tu: &mut TransUnit, position: &crate::error::Position) -> LowerResult<()> {
    let fid = current_fn(env);
    let target = env
        .break_target()
        .ok_or_else(|| LowerError::ill_formed("'break' outside a loop or switch", position.clone()))?;
    tu.function_mut(fid).build_branch(target);
    let after = tu.function_mut(fid).add_block("break.unreachable");
    tu.function_mut(fid).set_current_block(after);
    Ok(())
}

fn lower_continue(env: &mut Env, tu: &mut TransUnit, position: &crate::error::Position) -> LowerResult<()> {
    let fid = current_fn(env);
    let target = env
        .continue_target()
        .ok_or_else(|| LowerError::ill_formed("'continue' outside a loop", position.clone()))?;
    tu.function_mut(fid).build_branch(target);
    let after = tu.function_mut(fid).add_block("continue.unreachable");
    tu.function_mut(fid).set_current_block(after);
    Ok(())
}

fn lower_return(
    env: &mut Env,
    tu: &mut TransUnit,
    value: Option<&Node<crate::ast::Expr>>,
    position: &crate::error::Position,
) -> LowerResult<()> {
    let fid = current_fn(env);
    let ret_ty = env
        .current_return_ty
        .expect("a return statement is always lowered inside some function");

    match value {
        None => {
            if !env.types.is_void(ret_ty) {
                return Err(LowerError::ill_formed(
                    "non-void function must return a value",
                    position.clone(),
                ));
            }
            tu.function_mut(fid).build_ret_void();
        }
        Some(e) => {
            if env.types.is_void(ret_ty) {
                return Err(LowerError::ill_formed(
                    "void function should not return a value",
                    position.clone(),
                ));
            }
            let (value, from_ty) = lower_expr(env, tu, e, ExprContext::RValue)?;
            if env.sret_ptr.is_some() {
                let sret = env.sret_ptr.clone().unwrap();
                let pw = env.options.pointer_width;
                let size = env.types.size_of(ret_ty, pw)?;
                tu.function_mut(fid).builtin_memcpy(sret, value, IrValue::const_int(size as i128, IrType::I64));
                tu.function_mut(fid).build_ret_void();
            } else {
                let converted = crate::expr::convert_value(env, tu, value, from_ty, ret_ty, position)?;
                tu.function_mut(fid).build_ret(converted);
            }
        }
    }

    let after = tu.function_mut(fid).add_block("return.unreachable");
    tu.function_mut(fid).set_current_block(after);
    Ok(())
}
