//! The expression lowerer.
//!
//! One dispatch function per closed `Expr` variant, matched over in a
//! single `match`. Every expression shape lives in this one module rather
//! than split across files per shape — the operator set here is small
//! enough, and the bulk of the logic (arithmetic conversions, l-value/
//! address handling) is shared across variants anyway, that a per-file
//! split would mostly be ceremony around a few lines each.

use std::rc::Rc;

use crate::ast::{AssignOp, BinaryOp, Expr, Node, UnaryOp};
use crate::consteval::eval_const_expr;
use crate::env::Env;
use crate::error::{LowerError, LowerResult};
use crate::ir::{BinOp, CmpOp, ConvertOp, IrType, IrValue, TransUnit, UnOp};
use crate::resolver::resolve_type_name;
use crate::scope::Binding;
use crate::types::{CTypeKind, IntRank, TypeId};

/// Distinguishes the three lowering modes an expression may be lowered
/// under: as the target of an assignment/address-of (l-value, the
/// result is the object's address), as an ordinary value (r-value, the
/// result is the value itself, with array/function decay applied), or
/// inside a constant expression (r-value, but every operand must fold to a
/// compile-time constant — enforced by the caller in `consteval`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprContext {
    LValue,
    RValue,
    Const,
}

impl ExprContext {
    fn as_rvalue(self) -> ExprContext {
        match self {
            ExprContext::Const => ExprContext::Const,
            _ => ExprContext::RValue,
        }
    }
}

/// Lowers one expression, returning its IR value and C type. In
/// `LValue` context the value is the object's address (type `Ptr`, C type
/// is the *pointee*'s type, not a pointer type); otherwise it is the
/// value itself.
pub fn lower_expr(
    env: &mut Env,
    tu: &mut TransUnit,
    expr: &Node<Expr>,
    ctx: ExprContext,
) -> LowerResult<(IrValue, TypeId)> {
    match &expr.node {
        Expr::Ident(name) => lower_ident(env, tu, name, ctx, &expr.position),
        Expr::IntLiteral { value, suffix } => lower_int_literal(env, *value, *suffix),
        Expr::StringLiteral(bytes) => lower_string_literal(env, tu, bytes),
        Expr::CompoundLiteral {
            type_name,
            initializer,
        } => lower_compound_literal(env, tu, type_name, initializer, ctx, &expr.position),
        Expr::Cast { type_name, operand } => lower_cast(env, tu, type_name, operand, &expr.position),
        Expr::SizeofExpr(operand) => lower_sizeof_expr(env, tu, operand),
        Expr::SizeofType(type_name) => lower_sizeof_type(env, tu, type_name, &expr.position),
        Expr::Unary { op, operand } => lower_unary(env, tu, *op, operand, ctx, &expr.position),
        Expr::Binary { op, lhs, rhs } => lower_binary(env, tu, *op, lhs, rhs, &expr.position),
        Expr::LogicalAnd(lhs, rhs) => lower_logical(env, tu, true, lhs, rhs, ctx, &expr.position),
        Expr::LogicalOr(lhs, rhs) => lower_logical(env, tu, false, lhs, rhs, ctx, &expr.position),
        Expr::Assign { op, lhs, rhs } => lower_assign(env, tu, *op, lhs, rhs, &expr.position),
        Expr::Ternary {
            condition,
            then_expr,
            else_expr,
        } => lower_ternary(env, tu, condition, then_expr, else_expr, ctx, &expr.position),
        Expr::Comma(lhs, rhs) => {
            lower_expr(env, tu, lhs, ExprContext::RValue)?;
            lower_expr(env, tu, rhs, ctx)
        }
        Expr::Index { base, index } => lower_index(env, tu, base, index, ctx, &expr.position),
        Expr::Member { base, field, arrow } => {
            lower_member(env, tu, base, field, *arrow, ctx, &expr.position)
        }
        Expr::Call { callee, args } => lower_call(env, tu, callee, args, &expr.position),
        Expr::PreIncDec { inc, operand } => lower_incdec(env, tu, *inc, true, operand, &expr.position),
        Expr::PostIncDec { inc, operand } => lower_incdec(env, tu, *inc, false, operand, &expr.position),
    }
}

pub(crate) fn current_fn(env: &Env) -> crate::ir::FunctionId {
    env.current_function.expect("an expression is always lowered inside some function")
}

pub(crate) fn ir_type_of(env: &mut Env, tu: &mut TransUnit, ty: TypeId) -> LowerResult<IrType> {
    let pw = env.options.pointer_width;
    env.types.c_type_to_ir(ty, tu, pw)
}

/// Lowers `expr` as a branch condition: a pointer condition is first converted to a pointer-sized
/// integer, then compared against zero. Shared by the statement lowerer so
/// every construct tests truthiness the same way the `&&`/`||` short-circuit
/// lowering already does.
pub(crate) fn truthy(env: &mut Env, tu: &mut TransUnit, expr: &Node<Expr>) -> LowerResult<IrValue> {
    let (value, ty) = lower_expr(env, tu, expr, ExprContext::RValue)?;
    let (value, ty) = if env.types.is_pointer(ty) {
        let pd = env.types.ptrdiff_t();
        (convert_value(env, tu, value, ty, pd, &expr.position)?, pd)
    } else {
        (value, ty)
    };
    let zero = zero_value_for(env, tu, ty)?;
    let unsigned = !env.types.is_signed(ty);
    build_cmp(env, tu, CmpOp::Ne, value, zero, unsigned)
}

fn load_if_rvalue(
    env: &mut Env,
    tu: &mut TransUnit,
    ctx: ExprContext,
    addr: IrValue,
    ty: TypeId,
) -> LowerResult<(IrValue, TypeId)> {
    if ctx == ExprContext::LValue {
        return Ok((addr, ty));
    }
    // Arrays and functions never load: their r-value *is* their address,
    // decayed to a plain pointer.
    if env.types.is_aggregate(ty) && !matches!(env.types.kind(ty), CTypeKind::Struct(_)) {
        let decayed = env.types.decay(ty);
        return Ok((addr, decayed));
    }
    if env.types.is_function(ty) {
        return Ok((addr, env.types.decay(ty)));
    }
    if matches!(env.types.kind(ty), CTypeKind::Struct(_)) {
        // Struct r-values are passed around by address in this core; the
        // caller (assignment, return, argument passing) knows to `memcpy`.
        return Ok((addr, ty));
    }
    let ir_ty = ir_type_of(env, tu, ty)?;
    let value = tu.function_mut(current_fn(env)).build_load(addr, ir_ty);
    Ok((value, ty))
}

fn lower_ident(
    env: &mut Env,
    tu: &mut TransUnit,
    name: &Rc<str>,
    ctx: ExprContext,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let binding = env
        .scope
        .lookup(name)
        .ok_or_else(|| LowerError::ill_formed(format!("use of undeclared identifier '{name}'"), position.clone()))?
        .clone();
    match binding {
        Binding::Local { ty, slot } => load_if_rvalue(env, tu, ctx, IrValue::Value(slot), ty),
        Binding::Global { ty, id } => {
            let addr = IrValue::GlobalAddr(tu.global(id).name.clone());
            load_if_rvalue(env, tu, ctx, addr, ty)
        }
        Binding::Function { ty, id } => {
            let addr = IrValue::GlobalAddr(tu.function(id).name.clone());
            Ok((addr, ty))
        }
        Binding::EnumConst { value } => Ok((IrValue::const_int(value, IrType::I32), env_int_ty(env))),
        Binding::Typedef { .. } => Err(LowerError::ill_formed(
            format!("'{name}' names a type, not a value"),
            position.clone(),
        )),
    }
}

fn env_int_ty(env: &Env) -> TypeId {
    env.types.int()
}

fn lower_int_literal(env: &mut Env, value: i128, suffix: crate::ast::IntSuffix) -> LowerResult<(IrValue, TypeId)> {
    use crate::ast::IntSuffix as S;
    let int_max: i128 = i32::MAX as i128;
    let ty = match suffix {
        S::None => {
            if value <= int_max {
                env.types.int()
            } else {
                env.types.integer(IntRank::Long, true)
            }
        }
        S::Unsigned => env.types.integer(IntRank::Int, false),
        S::Long => env.types.integer(IntRank::Long, true),
        S::UnsignedLong => env.types.integer(IntRank::Long, false),
        S::LongLong => env.types.integer(IntRank::LongLong, true),
        S::UnsignedLongLong => env.types.integer(IntRank::LongLong, false),
    };
    let ir_ty = match env.types.kind(ty) {
        CTypeKind::Integer { rank, signed } => rank.ir_type(*signed),
        _ => unreachable!(),
    };
    Ok((IrValue::const_int(value, ir_ty), ty))
}

fn lower_string_literal(env: &mut Env, tu: &mut TransUnit, bytes: &Rc<[u8]>) -> LowerResult<(IrValue, TypeId)> {
    let name = tu.fresh_string_literal_name();
    let mut items: Vec<crate::ir::IrConst> = bytes.iter().map(|&b| tu.add_int_const(b as i128, IrType::I8)).collect();
    items.push(tu.add_int_const(0, IrType::I8));
    let init = tu.add_array_const(items);
    let ir_elem_ty = IrType::I8;
    let array_ty = IrType::Array {
        elem: Box::new(ir_elem_ty),
        len: Some(bytes.len() as u64 + 1),
    };
    tu.trans_unit_add_var(name.clone(), array_ty, crate::ir::Linkage::Local, false, Some(init));
    let char_ty = env.types.integer(IntRank::Char, env.options.char_signed);
    let array_c_ty = env.types.array_type(char_ty, Some(bytes.len() as u64 + 1));
    Ok((tu.add_global_const(name), array_c_ty))
}

fn lower_compound_literal(
    env: &mut Env,
    tu: &mut TransUnit,
    type_name: &crate::ast::TypeName,
    initializer: &[crate::ast::InitializerListItem],
    ctx: ExprContext,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let ty = resolve_type_name(env, tu, type_name, position)?;
    let ir_ty = ir_type_of(env, tu, ty)?;
    let addr = tu.function_mut(current_fn(env)).build_local(ir_ty);
    crate::init::lower_initializer_list_into(env, tu, addr, ty, initializer, position)?;
    load_if_rvalue(env, tu, ctx, addr, ty)
}

fn lower_cast(
    env: &mut Env,
    tu: &mut TransUnit,
    type_name: &crate::ast::TypeName,
    operand: &Node<Expr>,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let target = resolve_type_name(env, tu, type_name, position)?;
    let (value, from_ty) = lower_expr(env, tu, operand, ExprContext::RValue)?;
    if env.types.is_void(target) {
        return Ok((IrValue::ConstNull, target));
    }
    let converted = convert_value(env, tu, value, from_ty, target, position)?;
    Ok((converted, target))
}

fn lower_sizeof_expr(env: &mut Env, tu: &mut TransUnit, operand: &Node<Expr>) -> LowerResult<(IrValue, TypeId)> {
    // `sizeof` never evaluates its operand; only its static type
    // matters, so lowering happens in a scratch function.
    let ty = env.with_scratch(tu, |env, tu| -> LowerResult<TypeId> {
        let (_, ty) = lower_expr(env, tu, operand, ExprContext::RValue)?;
        Ok(ty)
    })?;
    sizeof_result(env, ty)
}

fn lower_sizeof_type(
    env: &mut Env,
    tu: &mut TransUnit,
    type_name: &crate::ast::TypeName,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let ty = resolve_type_name(env, tu, type_name, position)?;
    sizeof_result(env, ty)
}

fn sizeof_result(env: &mut Env, ty: TypeId) -> LowerResult<(IrValue, TypeId)> {
    let pw = env.options.pointer_width;
    let size = env.types.size_of(ty, pw)?;
    let size_t = env.types.size_t();
    Ok((IrValue::const_int(size as i128, IrType::U64), size_t))
}

fn lower_unary(
    env: &mut Env,
    tu: &mut TransUnit,
    op: UnaryOp,
    operand: &Node<Expr>,
    ctx: ExprContext,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    match op {
        UnaryOp::Address => {
            let (addr, ty) = lower_expr(env, tu, operand, ExprContext::LValue)?;
            let ptr_ty = env.types.pointer_type(ty);
            Ok((addr, ptr_ty))
        }
        UnaryOp::Deref => {
            let (value, ty) = lower_expr(env, tu, operand, ctx.as_rvalue())?;
            let pointee = env.types.pointee(ty).ok_or_else(|| {
                LowerError::ill_formed("indirection requires a pointer operand", position.clone())
            })?;
            load_if_rvalue(env, tu, ctx, value, pointee)
        }
        UnaryOp::Plus => {
            let (value, ty) = lower_expr(env, tu, operand, ExprContext::RValue)?;
            let promoted_ty = integer_promote(env, ty);
            let value = convert_value(env, tu, value, ty, promoted_ty, position)?;
            Ok((value, promoted_ty))
        }
        UnaryOp::Minus => {
            let (value, ty) = lower_expr(env, tu, operand, ExprContext::RValue)?;
            let promoted_ty = integer_promote(env, ty);
            let value = convert_value(env, tu, value, ty, promoted_ty, position)?;
            let ir_ty = ir_type_of(env, tu, promoted_ty)?;
            let result = if let IrValue::ConstInt { value, ty } = &value {
                IrValue::const_int(-*value, ty.clone())
            } else {
                tu.function_mut(current_fn(env)).build_unary_instr(UnOp::Neg, value, ir_ty)
            };
            Ok((result, promoted_ty))
        }
        UnaryOp::BitNot => {
            let (value, ty) = lower_expr(env, tu, operand, ExprContext::RValue)?;
            let promoted_ty = integer_promote(env, ty);
            let value = convert_value(env, tu, value, ty, promoted_ty, position)?;
            let ir_ty = ir_type_of(env, tu, promoted_ty)?;
            let result = if let IrValue::ConstInt { value, ty } = &value {
                IrValue::const_int(!*value, ty.clone())
            } else {
                tu.function_mut(current_fn(env)).build_unary_instr(UnOp::Not, value, ir_ty)
            };
            Ok((result, promoted_ty))
        }
        UnaryOp::LogicalNot => {
            let (value, ty) = lower_expr(env, tu, operand, ExprContext::RValue)?;
            let zero = zero_value_for(env, tu, ty)?;
            let result = build_cmp(env, tu, CmpOp::Eq, value, zero, !env.types.is_signed(ty))?;
            Ok((result, env.types.int()))
        }
    }
}

pub(crate) fn zero_value_for(env: &mut Env, tu: &mut TransUnit, ty: TypeId) -> LowerResult<IrValue> {
    let ir_ty = ir_type_of(env, tu, ty)?;
    if env.types.is_pointer(ty) {
        Ok(IrValue::ConstNull)
    } else {
        Ok(IrValue::const_int(0, ir_ty))
    }
}

/// Folds a comparison when both operands are constants, otherwise emits a
/// `build_cmp`. `unsigned` selects between the signed/unsigned variant of
/// the comparison operator.
pub(crate) fn build_cmp(
    env: &mut Env,
    tu: &mut TransUnit,
    op: CmpOp,
    lhs: IrValue,
    rhs: IrValue,
    unsigned: bool,
) -> LowerResult<IrValue> {
    let op = select_signedness(op, unsigned);
    if let (IrValue::ConstInt { value: l, .. }, IrValue::ConstInt { value: r, .. }) = (&lhs, &rhs) {
        let result = match op {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
            CmpOp::LtS | CmpOp::LtU => l < r,
            CmpOp::GtS | CmpOp::GtU => l > r,
            CmpOp::LeS | CmpOp::LeU => l <= r,
            CmpOp::GeS | CmpOp::GeU => l >= r,
        };
        return Ok(IrValue::const_int(result as i128, IrType::I32));
    }
    Ok(tu.function_mut(current_fn(env)).build_cmp(op, lhs, rhs))
}

fn select_signedness(op: CmpOp, unsigned: bool) -> CmpOp {
    if !unsigned {
        return op;
    }
    match op {
        CmpOp::LtS => CmpOp::LtU,
        CmpOp::GtS => CmpOp::GtU,
        CmpOp::LeS => CmpOp::LeU,
        CmpOp::GeS => CmpOp::GeU,
        other => other,
    }
}

/// Integer promotion: ranks below `int` promote to (signed) `int`.
pub(crate) fn integer_promote(env: &Env, ty: TypeId) -> TypeId {
    match env.types.kind(ty) {
        CTypeKind::Integer { rank, .. } if *rank < IntRank::Int => env.types.int(),
        _ => ty,
    }
}

/// Usual arithmetic conversions between two already-promoted integer
/// operands: higher rank wins; equal rank prefers unsigned.
fn usual_arithmetic_conversions(env: &Env, lhs: TypeId, rhs: TypeId) -> TypeId {
    let lhs = integer_promote(env, lhs);
    let rhs = integer_promote(env, rhs);
    if lhs == rhs {
        return lhs;
    }
    let (lr, ls) = match env.types.kind(lhs) {
        CTypeKind::Integer { rank, signed } => (*rank, *signed),
        _ => unreachable!("arithmetic conversion on a non-integer type"),
    };
    let (rr, rs) = match env.types.kind(rhs) {
        CTypeKind::Integer { rank, signed } => (*rank, *signed),
        _ => unreachable!("arithmetic conversion on a non-integer type"),
    };
    if lr == rr {
        env.types.integer(lr, ls && rs)
    } else if lr > rr {
        env.types.integer(lr, ls)
    } else {
        env.types.integer(rr, rs)
    }
}

pub(crate) fn convert_value(
    env: &mut Env,
    tu: &mut TransUnit,
    value: IrValue,
    from: TypeId,
    to: TypeId,
    position: &crate::error::Position,
) -> LowerResult<IrValue> {
    if from == to {
        return Ok(value);
    }
    let from_kind = env.types.kind(from).clone();
    let to_kind = env.types.kind(to).clone();
    match (from_kind, to_kind) {
        (CTypeKind::Void, _) | (_, CTypeKind::Void) => Ok(value),
        (CTypeKind::Integer { rank: fr, signed: fs }, CTypeKind::Integer { rank: tr, signed: ts }) => {
            let to_ir = ir_type_of(env, tu, to)?;
            if let IrValue::ConstInt { value, .. } = value {
                return Ok(IrValue::const_int(truncate_to(value, tr, ts), to_ir));
            }
            let op = if tr > fr {
                if fs {
                    ConvertOp::SExt
                } else {
                    ConvertOp::ZExt
                }
            } else if tr < fr {
                ConvertOp::Trunc
            } else {
                ConvertOp::Bitcast
            };
            Ok(tu.function_mut(current_fn(env)).build_type_instr(op, value, to_ir))
        }
        (CTypeKind::Integer { .. }, CTypeKind::Pointer { .. }) => {
            if let IrValue::ConstInt { value: 0, .. } = value {
                return Ok(IrValue::ConstNull);
            }
            Ok(tu.function_mut(current_fn(env)).build_type_instr(ConvertOp::IntToPtr, value, IrType::Ptr))
        }
        (CTypeKind::Pointer { .. }, CTypeKind::Integer { .. }) => {
            let to_ir = ir_type_of(env, tu, to)?;
            Ok(tu.function_mut(current_fn(env)).build_type_instr(ConvertOp::PtrToInt, value, to_ir))
        }
        (CTypeKind::Pointer { .. }, CTypeKind::Pointer { .. })
        | (CTypeKind::Function { .. }, CTypeKind::Pointer { .. })
        | (CTypeKind::Pointer { .. }, CTypeKind::Function { .. }) => Ok(value),
        _ => Err(LowerError::unimplemented(
            "conversion between these two types",
            position.clone(),
        )),
    }
}

fn truncate_to(value: i128, rank: IntRank, signed: bool) -> i128 {
    let bits = rank.size() * 8;
    let mask: u128 = if bits >= 128 { u128::MAX } else { (1u128 << bits) - 1 };
    let truncated = (value as i128 as u128) & mask;
    if signed && bits < 128 {
        let sign_bit = 1u128 << (bits - 1);
        if truncated & sign_bit != 0 {
            return (truncated as i128) - (1i128 << bits);
        }
    }
    truncated as i128
}

fn lower_binary(
    env: &mut Env,
    tu: &mut TransUnit,
    op: BinaryOp,
    lhs: &Node<Expr>,
    rhs: &Node<Expr>,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let (lval, lty) = lower_expr(env, tu, lhs, ExprContext::RValue)?;
    let (rval, rty) = lower_expr(env, tu, rhs, ExprContext::RValue)?;

    // Pointer arithmetic: `ptr + int`, `int + ptr`, `ptr - int`,
    // `ptr - ptr`.
    if env.types.is_pointer(lty) && env.types.is_integer(rty) && matches!(op, BinaryOp::Add | BinaryOp::Sub) {
        return lower_pointer_offset(env, tu, lval, lty, rval, rty, op == BinaryOp::Sub, position);
    }
    if env.types.is_integer(lty) && env.types.is_pointer(rty) && op == BinaryOp::Add {
        return lower_pointer_offset(env, tu, rval, rty, lval, lty, false, position);
    }
    if env.types.is_pointer(lty) && env.types.is_pointer(rty) && op == BinaryOp::Sub {
        return lower_pointer_diff(env, tu, lval, rval, lty, position);
    }
    if env.types.is_pointer(lty) || env.types.is_pointer(rty) {
        return lower_pointer_compare(env, tu, op, lval, rval, position);
    }

    let common = usual_arithmetic_conversions(env, lty, rty);
    let l = convert_value(env, tu, lval, lty, common, position)?;
    let r = convert_value(env, tu, rval, rty, common, position)?;
    let unsigned = !env.types.is_signed(common);
    let ir_ty = ir_type_of(env, tu, common)?;

    if let BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge = op {
        let cmp = cmp_op_for(op);
        let value = build_cmp(env, tu, cmp, l, r, unsigned)?;
        return Ok((value, env.types.int()));
    }

    if op == BinaryOp::Shl || op == BinaryOp::Shr {
        // Shift lowers based on the promoted
        // left operand's own signedness, independent of the right operand.
        let left_ty = usual_arithmetic_conversions(env, lty, lty);
        let l = convert_value(env, tu, lval, lty, left_ty, position)?;
        let left_ir = ir_type_of(env, tu, left_ty)?;
        let right_promoted = integer_promote(env, rty);
        let r = convert_value(env, tu, rval, rty, right_promoted, position)?;
        let bin_op = if op == BinaryOp::Shl {
            BinOp::Shl
        } else if env.types.is_signed(left_ty) {
            BinOp::AShr
        } else {
            BinOp::LShr
        };
        let value = build_binary(env, tu, bin_op, l, r, left_ir)?;
        return Ok((value, left_ty));
    }

    let bin_op = match op {
        BinaryOp::Add => BinOp::Add,
        BinaryOp::Sub => BinOp::Sub,
        BinaryOp::Mul => BinOp::Mul,
        BinaryOp::Div => {
            if unsigned {
                BinOp::DivU
            } else {
                BinOp::DivS
            }
        }
        BinaryOp::Mod => {
            if unsigned {
                BinOp::RemU
            } else {
                BinOp::RemS
            }
        }
        BinaryOp::BitAnd => BinOp::And,
        BinaryOp::BitOr => BinOp::Or,
        BinaryOp::BitXor => BinOp::Xor,
        BinaryOp::Shl | BinaryOp::Shr => unreachable!("handled above"),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
            unreachable!("handled above")
        }
    };
    let value = build_binary(env, tu, bin_op, l, r, ir_ty)?;
    Ok((value, common))
}

fn cmp_op_for(op: BinaryOp) -> CmpOp {
    match op {
        BinaryOp::Eq => CmpOp::Eq,
        BinaryOp::Ne => CmpOp::Ne,
        BinaryOp::Lt => CmpOp::LtS,
        BinaryOp::Gt => CmpOp::GtS,
        BinaryOp::Le => CmpOp::LeS,
        BinaryOp::Ge => CmpOp::GeS,
        _ => unreachable!(),
    }
}

fn build_binary(env: &mut Env, tu: &mut TransUnit, op: BinOp, lhs: IrValue, rhs: IrValue, ty: IrType) -> LowerResult<IrValue> {
    if let (IrValue::ConstInt { value: l, .. }, IrValue::ConstInt { value: r, .. }) = (&lhs, &rhs) {
        if let Some(folded) = fold_binary(op, *l, *r) {
            return Ok(IrValue::const_int(folded, ty));
        }
    }
    Ok(tu.function_mut(current_fn(env)).build_binary_instr(op, lhs, rhs, ty))
}

fn fold_binary(op: BinOp, l: i128, r: i128) -> Option<i128> {
    Some(match op {
        BinOp::Add => l + r,
        BinOp::Sub => l - r,
        BinOp::Mul => l * r,
        BinOp::DivS | BinOp::DivU => {
            if r == 0 {
                return None;
            }
            l / r
        }
        BinOp::RemS | BinOp::RemU => {
            if r == 0 {
                return None;
            }
            l % r
        }
        BinOp::Shl => l << r,
        BinOp::LShr => ((l as u128) >> r) as i128,
        BinOp::AShr => l >> r,
        BinOp::And => l & r,
        BinOp::Or => l | r,
        BinOp::Xor => l ^ r,
    })
}

fn lower_pointer_offset(
    env: &mut Env,
    tu: &mut TransUnit,
    ptr: IrValue,
    ptr_ty: TypeId,
    index: IrValue,
    index_ty: TypeId,
    negate: bool,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let pointee = env
        .types
        .pointee(ptr_ty)
        .ok_or_else(|| LowerError::internal("pointer arithmetic on a non-pointer"))?;
    let pw = env.options.pointer_width;
    let elem_size = env.types.size_of(pointee, pw)?;
    let offset_ty = env.types.ptrdiff_t();
    let index = convert_value(env, tu, index, index_ty, offset_ty, position)?;
    let scale = IrValue::const_int(elem_size as i128, IrType::I64);
    let mut byte_offset = build_binary(env, tu, BinOp::Mul, index, scale, IrType::I64)?;
    if negate {
        byte_offset = if let IrValue::ConstInt { value, ty } = byte_offset {
            IrValue::const_int(-value, ty)
        } else {
            tu.function_mut(current_fn(env)).build_unary_instr(UnOp::Neg, byte_offset, IrType::I64)
        };
    }
    let result = build_binary(env, tu, BinOp::Add, ptr, byte_offset, IrType::Ptr)?;
    Ok((result, ptr_ty))
}

fn lower_pointer_diff(
    env: &mut Env,
    tu: &mut TransUnit,
    lhs: IrValue,
    rhs: IrValue,
    ptr_ty: TypeId,
    _position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let pointee = env
        .types
        .pointee(ptr_ty)
        .ok_or_else(|| LowerError::internal("pointer difference on a non-pointer"))?;
    let pw = env.options.pointer_width;
    let elem_size = env.types.size_of(pointee, pw).unwrap_or(1).max(1);
    let raw = build_binary(env, tu, BinOp::Sub, lhs, rhs, IrType::I64)?;
    let scale = IrValue::const_int(elem_size as i128, IrType::I64);
    let value = build_binary(env, tu, BinOp::DivS, raw, scale, IrType::I64)?;
    Ok((value, env.types.ptrdiff_t()))
}

fn lower_pointer_compare(
    env: &mut Env,
    tu: &mut TransUnit,
    op: BinaryOp,
    lhs: IrValue,
    rhs: IrValue,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    if !matches!(op, BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge) {
        return Err(LowerError::ill_formed("invalid operator on pointer operands", position.clone()));
    }
    let value = build_cmp(env, tu, cmp_op_for(op), lhs, rhs, true)?;
    Ok((value, env.types.int()))
}

/// `&&`/`||`: short-circuit via real branches when lowering
/// into a live function; in `Const` context, fold directly since a
/// constant expression never needs control flow.
fn lower_logical(
    env: &mut Env,
    tu: &mut TransUnit,
    is_and: bool,
    lhs: &Node<Expr>,
    rhs: &Node<Expr>,
    ctx: ExprContext,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let int_ty = env.types.int();
    if ctx == ExprContext::Const {
        let (lval, _) = eval_const_expr(env, tu, lhs)?;
        let l_true = is_truthy_const(&lval);
        if is_and && !l_true {
            return Ok((IrValue::const_int(0, IrType::I32), int_ty));
        }
        if !is_and && l_true {
            return Ok((IrValue::const_int(1, IrType::I32), int_ty));
        }
        let (rval, _) = eval_const_expr(env, tu, rhs)?;
        let r_true = is_truthy_const(&rval);
        return Ok((IrValue::const_int(r_true as i128, IrType::I32), int_ty));
    }

    let fid = current_fn(env);
    let (lval, lty) = lower_expr(env, tu, lhs, ExprContext::RValue)?;
    let lzero = zero_value_for(env, tu, lty)?;
    let l_truth = build_cmp(env, tu, CmpOp::Ne, lval, lzero, true)?;

    let rhs_bb = tu.function_mut(fid).add_block(if is_and { "land.rhs" } else { "lor.rhs" });
    let merge_bb = tu.function_mut(fid).add_block(if is_and { "land.end" } else { "lor.end" });
    let short_circuit_value = IrValue::const_int(if is_and { 0 } else { 1 }, IrType::I32);

    if is_and {
        tu.function_mut(fid).build_cond(l_truth, rhs_bb, merge_bb);
    } else {
        tu.function_mut(fid).build_cond(l_truth, merge_bb, rhs_bb);
    }
    let entry_bb = tu.function(fid).current_block_id();

    tu.function_mut(fid).set_current_block(rhs_bb);
    let (rval, rty) = lower_expr(env, tu, rhs, ExprContext::RValue)?;
    let rzero = zero_value_for(env, tu, rty)?;
    let r_truth = build_cmp(env, tu, CmpOp::Ne, rval, rzero, true)?;
    let rhs_exit_bb = tu.function(fid).current_block_id();
    tu.function_mut(fid).build_branch(merge_bb);

    tu.function_mut(fid).set_current_block(merge_bb);
    let phi = tu.function_mut(fid).build_phi(IrType::I32, 2);
    tu.function_mut(fid).phi_set_param(phi.clone(), 0, entry_bb, short_circuit_value);
    tu.function_mut(fid).phi_set_param(phi.clone(), 1, rhs_exit_bb, r_truth);
    let _ = position;
    Ok((phi, int_ty))
}

fn is_truthy_const(value: &IrValue) -> bool {
    matches!(value, IrValue::ConstInt { value, .. } if *value != 0) || matches!(value, IrValue::GlobalAddr(_))
}

fn lower_assign(
    env: &mut Env,
    tu: &mut TransUnit,
    op: AssignOp,
    lhs: &Node<Expr>,
    rhs: &Node<Expr>,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let (addr, lty) = lower_expr(env, tu, lhs, ExprContext::LValue)?;
    if op == AssignOp::Assign {
        let (rval, rty) = lower_expr(env, tu, rhs, ExprContext::RValue)?;
        if matches!(env.types.kind(lty), CTypeKind::Struct(_)) {
            let size = env.types.size_of(lty, env.options.pointer_width)?;
            let fid = current_fn(env);
            tu.function_mut(fid).builtin_memcpy(addr, rval, IrValue::const_int(size as i128, IrType::I64));
            return Ok((addr, lty));
        }
        let converted = convert_value(env, tu, rval, rty, lty, position)?;
        tu.function_mut(current_fn(env)).build_store(addr, converted.clone());
        return Ok((converted, lty));
    }

    let bin_op = match op {
        AssignOp::Add => BinaryOp::Add,
        AssignOp::Sub => BinaryOp::Sub,
        AssignOp::Mul => BinaryOp::Mul,
        AssignOp::Div => BinaryOp::Div,
        AssignOp::Mod => BinaryOp::Mod,
        AssignOp::Shl => BinaryOp::Shl,
        AssignOp::Shr => BinaryOp::Shr,
        AssignOp::BitAnd => BinaryOp::BitAnd,
        AssignOp::BitOr => BinaryOp::BitOr,
        AssignOp::BitXor => BinaryOp::BitXor,
        AssignOp::Assign => unreachable!("handled above"),
    };

    let ir_lty = ir_type_of(env, tu, lty)?;
    let current = tu.function_mut(current_fn(env)).build_load(addr.clone(), ir_lty);
    let (rval, rty) = lower_expr(env, tu, rhs, ExprContext::RValue)?;

    let (result_value, result_ty) = if env.types.is_pointer(lty) && matches!(bin_op, BinaryOp::Add | BinaryOp::Sub) {
        lower_pointer_offset(env, tu, current, lty, rval, rty, bin_op == BinaryOp::Sub, position)?
    } else {
        let common = usual_arithmetic_conversions(env, lty, rty);
        let l = convert_value(env, tu, current, lty, common, position)?;
        let r = convert_value(env, tu, rval, rty, common, position)?;
        let unsigned = !env.types.is_signed(common);
        let ir_ty = ir_type_of(env, tu, common)?;
        let op = match bin_op {
            BinaryOp::Add => BinOp::Add,
            BinaryOp::Sub => BinOp::Sub,
            BinaryOp::Mul => BinOp::Mul,
            BinaryOp::Div => if unsigned { BinOp::DivU } else { BinOp::DivS },
            BinaryOp::Mod => if unsigned { BinOp::RemU } else { BinOp::RemS },
            BinaryOp::Shl => BinOp::Shl,
            BinaryOp::Shr => if unsigned { BinOp::LShr } else { BinOp::AShr },
            BinaryOp::BitAnd => BinOp::And,
            BinaryOp::BitOr => BinOp::Or,
            BinaryOp::BitXor => BinOp::Xor,
            _ => unreachable!(),
        };
        let value = build_binary(env, tu, op, l, r, ir_ty)?;
        (value, common)
    };

    let back = convert_value(env, tu, result_value, result_ty, lty, position)?;
    tu.function_mut(current_fn(env)).build_store(addr, back.clone());
    Ok((back, lty))
}

fn lower_ternary(
    env: &mut Env,
    tu: &mut TransUnit,
    condition: &Node<Expr>,
    then_expr: &Node<Expr>,
    else_expr: &Node<Expr>,
    ctx: ExprContext,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    if ctx == ExprContext::Const {
        let (cond, cty) = eval_const_expr(env, tu, condition)?;
        let _ = cty;
        return if is_truthy_const(&cond) {
            eval_const_expr(env, tu, then_expr)
        } else {
            eval_const_expr(env, tu, else_expr)
        };
    }

    let fid = current_fn(env);
    let (cond, cty) = lower_expr(env, tu, condition, ExprContext::RValue)?;
    let zero = zero_value_for(env, tu, cty)?;
    let truth = build_cmp(env, tu, CmpOp::Ne, cond, zero, true)?;

    let then_bb = tu.function_mut(fid).add_block("cond.then");
    let else_bb = tu.function_mut(fid).add_block("cond.else");
    let merge_bb = tu.function_mut(fid).add_block("cond.end");
    tu.function_mut(fid).build_cond(truth, then_bb, else_bb);

    tu.function_mut(fid).set_current_block(then_bb);
    let (then_val, then_ty) = lower_expr(env, tu, then_expr, ExprContext::RValue)?;
    let then_exit = tu.function(fid).current_block_id();

    tu.function_mut(fid).set_current_block(else_bb);
    let (else_val, else_ty) = lower_expr(env, tu, else_expr, ExprContext::RValue)?;
    let else_exit = tu.function(fid).current_block_id();

    let result_ty = if then_ty == else_ty {
        then_ty
    } else if env.types.is_integer(then_ty) && env.types.is_integer(else_ty) {
        usual_arithmetic_conversions(env, then_ty, else_ty)
    } else {
        then_ty
    };
    let result_ir_ty = ir_type_of(env, tu, result_ty)?;

    // Converting and branching happen at each arm's actual exit block
    // (which may differ from `then_bb`/`else_bb` if the arm itself
    // contained nested control flow), and only once both arms' types are
    // known, so the terminator is the last thing appended to each block.
    tu.function_mut(fid).set_current_block(then_exit);
    let then_converted = convert_value(env, tu, then_val, then_ty, result_ty, position)?;
    tu.function_mut(fid).build_branch(merge_bb);

    tu.function_mut(fid).set_current_block(else_exit);
    let else_converted = convert_value(env, tu, else_val, else_ty, result_ty, position)?;
    tu.function_mut(fid).build_branch(merge_bb);

    tu.function_mut(fid).set_current_block(merge_bb);
    let phi = tu.function_mut(fid).build_phi(result_ir_ty, 2);
    tu.function_mut(fid).phi_set_param(phi.clone(), 0, then_exit, then_converted);
    tu.function_mut(fid).phi_set_param(phi.clone(), 1, else_exit, else_converted);
    Ok((phi, result_ty))
}

fn lower_index(
    env: &mut Env,
    tu: &mut TransUnit,
    base: &Node<Expr>,
    index: &Node<Expr>,
    ctx: ExprContext,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let (base_val, base_ty) = lower_expr(env, tu, base, ExprContext::RValue)?;
    let (index_val, index_ty) = lower_expr(env, tu, index, ExprContext::RValue)?;
    let (addr, elem_ty) = lower_pointer_offset(env, tu, base_val, base_ty, index_val, index_ty, false, position)?;
    let elem_ty = env.types.pointee(elem_ty).unwrap_or(elem_ty);
    load_if_rvalue(env, tu, ctx, addr, elem_ty)
}

fn lower_member(
    env: &mut Env,
    tu: &mut TransUnit,
    base: &Node<Expr>,
    field: &Rc<str>,
    arrow: bool,
    ctx: ExprContext,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let (base_addr, struct_ty) = if arrow {
        let (ptr, ptr_ty) = lower_expr(env, tu, base, ExprContext::RValue)?;
        let pointee = env.types.pointee(ptr_ty).ok_or_else(|| {
            LowerError::ill_formed("'->' requires a pointer operand", position.clone())
        })?;
        (ptr, pointee)
    } else {
        lower_expr(env, tu, base, ExprContext::LValue)?
    };

    let struct_id = match env.types.kind(struct_ty) {
        CTypeKind::Struct(id) => *id,
        _ => return Err(LowerError::ill_formed("member reference on a non-struct type", position.clone())),
    };
    let def = env.types.struct_def(struct_id);
    let ordinal = def
        .fields
        .iter()
        .position(|f| f.name.as_ref() == field.as_ref())
        .ok_or_else(|| LowerError::ill_formed(format!("no member named '{field}'"), position.clone()))?;
    let field_ty = def.fields[ordinal].ty;

    let struct_ir_ty = ir_type_of(env, tu, struct_ty)?;
    let addr = tu.function_mut(current_fn(env)).build_field(base_addr, struct_ir_ty, ordinal as u64);
    load_if_rvalue(env, tu, ctx, addr, field_ty)
}

/// `__builtin_va_start`/`__builtin_va_end`/`__builtin_va_arg` are recognized
/// by callee identifier rather than through a declared function type:
/// a variadic function's parser never sees a prototype for them. `va_arg`'s
/// requested type has no slot in `Expr::Call`'s argument list, so it is
/// expected wrapped in the ordinary cast node instead — `(T)__builtin_va_arg(ap)`
/// — and the cast's existing `convert_value` machinery carries the result to
/// `T` once this call itself has produced the runtime helper's raw `u64`.
fn lower_builtin_va(
    env: &mut Env,
    tu: &mut TransUnit,
    name: &str,
    args: &[Node<Expr>],
    position: &crate::error::Position,
) -> Option<LowerResult<(IrValue, TypeId)>> {
    let fid = current_fn(env);
    match name {
        "__builtin_va_start" => Some((|| {
            let (ap, _) = lower_expr(env, tu, args.first().ok_or_else(|| {
                LowerError::ill_formed("__builtin_va_start expects an argument", position.clone())
            })?, ExprContext::RValue)?;
            tu.function_mut(fid).build_builtin_va_start(ap);
            Ok((IrValue::ConstNull, env.types.void()))
        })()),
        "__builtin_va_end" => Some((|| {
            let (ap, _) = lower_expr(env, tu, args.first().ok_or_else(|| {
                LowerError::ill_formed("__builtin_va_end expects an argument", position.clone())
            })?, ExprContext::RValue)?;
            let callee = IrValue::GlobalAddr("__builtin_va_end".to_string());
            tu.function_mut(fid).build_call(callee, IrType::Void, vec![ap]);
            Ok((IrValue::ConstNull, env.types.void()))
        })()),
        "__builtin_va_arg" => Some((|| {
            let (ap, _) = lower_expr(env, tu, args.first().ok_or_else(|| {
                LowerError::ill_formed("__builtin_va_arg expects an argument", position.clone())
            })?, ExprContext::RValue)?;
            let callee = IrValue::GlobalAddr("__builtin_va_arg_uint64".to_string());
            let value = tu.function_mut(fid).build_call(callee, IrType::U64, vec![ap]);
            let u64_ty = env.types.integer(IntRank::LongLong, false);
            Ok((value, u64_ty))
        })()),
        _ => None,
    }
}

fn lower_call(
    env: &mut Env,
    tu: &mut TransUnit,
    callee: &Node<Expr>,
    args: &[Node<Expr>],
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    if let Expr::Ident(name) = &callee.node {
        if let Some(result) = lower_builtin_va(env, tu, name, args, position) {
            return result;
        }
    }
    let (callee_val, callee_ty) = lower_expr(env, tu, callee, ExprContext::RValue)?;
    let fn_ty = env.types.pointee(callee_ty).unwrap_or(callee_ty);
    let (ret_ty, param_tys, variadic) = match env.types.kind(fn_ty) {
        CTypeKind::Function { ret, params, variadic } => (*ret, params.clone(), *variadic),
        _ => return Err(LowerError::ill_formed("called object is not a function", position.clone())),
    };

    let mut arg_values = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let (value, ty) = lower_expr(env, tu, arg, ExprContext::RValue)?;
        let value = if let Some(&param_ty) = param_tys.get(i) {
            convert_value(env, tu, value, ty, param_ty, position)?
        } else {
            // Variadic trailing argument: default argument promotion
            // (integer types below `int` are promoted; this core has no
            // floating-point types to additionally promote).
            if !variadic {
                return Err(LowerError::ill_formed("too many arguments to function call", position.clone()));
            }
            let promoted = integer_promote(env, ty);
            convert_value(env, tu, value, ty, promoted, position)?
        };
        arg_values.push(value);
    }

    let ret_ir = ir_type_of(env, tu, ret_ty)?;
    // A struct-returning callee is void in IR and takes an
    // implicit first pointer parameter the caller allocates; the call's
    // term is that local's address, matching how every other aggregate
    // l-value is carried.
    if matches!(env.types.kind(ret_ty), CTypeKind::Struct(_)) {
        let fid = current_fn(env);
        let sret_slot = tu.function_mut(fid).build_local(ret_ir);
        let mut call_args = Vec::with_capacity(arg_values.len() + 1);
        call_args.push(sret_slot.clone());
        call_args.extend(arg_values);
        tu.function_mut(fid).build_call(callee_val, IrType::Void, call_args);
        return Ok((sret_slot, ret_ty));
    }
    let value = tu.function_mut(current_fn(env)).build_call(callee_val, ret_ir, arg_values);
    Ok((value, ret_ty))
}

fn lower_incdec(
    env: &mut Env,
    tu: &mut TransUnit,
    inc: bool,
    is_pre: bool,
    operand: &Node<Expr>,
    position: &crate::error::Position,
) -> LowerResult<(IrValue, TypeId)> {
    let (addr, ty) = lower_expr(env, tu, operand, ExprContext::LValue)?;
    let ir_ty = ir_type_of(env, tu, ty)?;
    let old = tu.function_mut(current_fn(env)).build_load(addr.clone(), ir_ty.clone());

    let new = if env.types.is_pointer(ty) {
        let one = IrValue::const_int(1, IrType::I64);
        lower_pointer_offset(env, tu, old.clone(), ty, one, env.types.ptrdiff_t(), !inc, position)?.0
    } else {
        let one = IrValue::const_int(1, ir_ty.clone());
        let op = if inc { BinOp::Add } else { BinOp::Sub };
        build_binary(env, tu, op, old.clone(), one, ir_ty)?
    };
    tu.function_mut(current_fn(env)).build_store(addr, new.clone());

    Ok((if is_pre { new } else { old }, ty))
}
