//! The initializer compiler.
//!
//! An initializer is first folded into a `CInit` tree shaped like the
//! target type (one leaf per scalar, one `Aggregate` per struct/array
//! level), independent of whether the initializer ends up driving a static
//! `IrConst` or a sequence of runtime stores. Collecting into the tree
//! first and rendering it afterward keeps the designator-handling logic
//! free of any knowledge of which storage class it will end up feeding.

use crate::ast::{Designator, Expr, Initializer, InitializerListItem, Node};
use crate::consteval::eval_const_expr;
use crate::env::Env;
use crate::error::{LowerError, LowerResult, Position};
use crate::expr::{convert_value, current_fn, ir_type_of, lower_expr, ExprContext};
use crate::ir::{IrConst, IrType, IrValue, TransUnit};
use crate::types::{CTypeKind, IntRank, TypeId};

/// One initializer, folded against its target type. An `Aggregate`'s
/// `None` entries are slots the initializer never mentioned — the
/// zero-fill the brace-walk leaves behind.
pub enum CInit {
    Leaf(IrValue, TypeId),
    Aggregate(Vec<Option<CInit>>),
}

fn is_full(c: &CInit) -> bool {
    match c {
        CInit::Leaf(..) => true,
        CInit::Aggregate(children) => children
            .iter()
            .all(|slot| slot.as_ref().map(is_full).unwrap_or(false)),
    }
}

/// Builds a `CInit` tree for `init` against `ty`, returning the tree and
/// `ty` completed to a concrete size if it was an incomplete array.
/// `const_ctx` selects whether scalar leaves are evaluated as compile-time
/// constants (global/static storage) or as ordinary runtime expressions
/// (automatic storage).
pub fn make_c_initializer(
    env: &mut Env,
    tu: &mut TransUnit,
    ty: TypeId,
    init: &Node<Initializer>,
    const_ctx: bool,
) -> LowerResult<(CInit, TypeId)> {
    match &init.node {
        Initializer::List(items) => match env.types.kind(ty).clone() {
            CTypeKind::Struct(struct_id) => {
                let c = build_struct_aggregate(env, tu, struct_id, items, const_ctx)?;
                Ok((c, ty))
            }
            CTypeKind::Array { element, size } => {
                let (c, completed) = build_array_aggregate(env, tu, element, size, items, const_ctx)?;
                let new_ty = if size.is_none() {
                    env.types.array_type(element, Some(completed))
                } else {
                    ty
                };
                Ok((c, new_ty))
            }
            _ => {
                // C permits a lone pair of braces around a scalar initializer.
                if items.len() == 1 && items[0].designators.is_empty() {
                    make_c_initializer(env, tu, ty, &items[0].initializer, const_ctx)
                } else {
                    Err(LowerError::ill_formed(
                        "braces around scalar initializer",
                        init.position.clone(),
                    ))
                }
            }
        },
        Initializer::Expr(e) => build_scalar_or_string(env, tu, ty, e, const_ctx),
    }
}

/// Builds the sub-`CInit` a single (possibly multi-designator) initializer
/// list item contributes at type `ty`, peeling designators one at a time.
fn make_c_initializer_item(
    env: &mut Env,
    tu: &mut TransUnit,
    ty: TypeId,
    item: &InitializerListItem,
    const_ctx: bool,
) -> LowerResult<(CInit, usize)> {
    if item.designators.is_empty() {
        let (c, _) = make_c_initializer(env, tu, ty, &item.initializer, const_ctx)?;
        return Ok((c, 0));
    }
    let position = item.initializer.position.clone();
    match (&item.designators[0], env.types.kind(ty).clone()) {
        (Designator::Field(field_name), CTypeKind::Struct(struct_id)) => {
            let fields = env.types.struct_def(struct_id).fields.clone();
            let idx = fields
                .iter()
                .position(|f| f.name.as_ref() == field_name.as_ref())
                .ok_or_else(|| {
                    LowerError::ill_formed(format!("no field named '{field_name}'"), position.clone())
                })?;
            let rest = InitializerListItem {
                designators: item.designators[1..].to_vec(),
                initializer: item.initializer.clone(),
            };
            let (child, _) = make_c_initializer_item(env, tu, fields[idx].ty, &rest, const_ctx)?;
            let mut children: Vec<Option<CInit>> = (0..fields.len()).map(|_| None).collect();
            children[idx] = Some(child);
            Ok((CInit::Aggregate(children), idx))
        }
        (Designator::Index(expr), CTypeKind::Array { element, .. }) => {
            let idx = crate::consteval::eval_array_length(env, tu, expr)? as usize;
            let rest = InitializerListItem {
                designators: item.designators[1..].to_vec(),
                initializer: item.initializer.clone(),
            };
            let (child, _) = make_c_initializer_item(env, tu, element, &rest, const_ctx)?;
            let mut children: Vec<Option<CInit>> = (0..=idx).map(|_| None).collect();
            children[idx] = Some(child);
            Ok((CInit::Aggregate(children), idx))
        }
        (Designator::Field(_), _) => Err(LowerError::ill_formed(
            "field designator used on a non-struct type",
            position,
        )),
        (Designator::Index(_), _) => Err(LowerError::ill_formed(
            "array designator used on a non-array type",
            position,
        )),
    }
}

fn build_struct_aggregate(
    env: &mut Env,
    tu: &mut TransUnit,
    struct_id: crate::types::StructId,
    items: &[InitializerListItem],
    const_ctx: bool,
) -> LowerResult<CInit> {
    let fields = env.types.struct_def(struct_id).fields.clone();
    let mut children: Vec<Option<CInit>> = (0..fields.len()).map(|_| None).collect();
    let mut cursor = 0usize;
    for item in items {
        if !item.designators.is_empty() {
            match &item.designators[0] {
                Designator::Field(name) => {
                    cursor = fields
                        .iter()
                        .position(|f| f.name.as_ref() == name.as_ref())
                        .ok_or_else(|| {
                            LowerError::ill_formed(
                                format!("no field named '{name}'"),
                                item.initializer.position.clone(),
                            )
                        })?;
                }
                Designator::Index(_) => {
                    return Err(LowerError::ill_formed(
                        "array designator used to initialize a struct",
                        item.initializer.position.clone(),
                    ))
                }
            }
        }
        if cursor >= fields.len() {
            return Err(LowerError::ill_formed(
                "excess elements in struct initializer",
                item.initializer.position.clone(),
            ));
        }
        let child = if item.designators.len() > 1 {
            let rest = InitializerListItem {
                designators: item.designators[1..].to_vec(),
                initializer: item.initializer.clone(),
            };
            make_c_initializer_item(env, tu, fields[cursor].ty, &rest, const_ctx)?.0
        } else {
            make_c_initializer(env, tu, fields[cursor].ty, &item.initializer, const_ctx)?.0
        };
        children[cursor] = Some(child);
        cursor += 1;
    }
    Ok(CInit::Aggregate(children))
}

fn build_array_aggregate(
    env: &mut Env,
    tu: &mut TransUnit,
    element: TypeId,
    declared_size: Option<u64>,
    items: &[InitializerListItem],
    const_ctx: bool,
) -> LowerResult<(CInit, u64)> {
    let mut children: Vec<Option<CInit>> = match declared_size {
        Some(n) => (0..n).map(|_| None).collect(),
        None => Vec::new(),
    };
    let mut cursor = 0usize;
    let mut max_idx: i64 = -1;
    for item in items {
        if !item.designators.is_empty() {
            match &item.designators[0] {
                Designator::Index(expr) => {
                    cursor = crate::consteval::eval_array_length(env, tu, expr)? as usize;
                }
                Designator::Field(_) => {
                    return Err(LowerError::ill_formed(
                        "field designator used to initialize an array",
                        item.initializer.position.clone(),
                    ))
                }
            }
        }
        if let Some(n) = declared_size {
            if cursor >= n as usize {
                return Err(LowerError::ill_formed(
                    "excess elements in array initializer",
                    item.initializer.position.clone(),
                ));
            }
        }
        if cursor >= children.len() {
            children.resize_with(cursor + 1, || None);
        }
        let child = if item.designators.len() > 1 {
            let rest = InitializerListItem {
                designators: item.designators[1..].to_vec(),
                initializer: item.initializer.clone(),
            };
            make_c_initializer_item(env, tu, element, &rest, const_ctx)?.0
        } else {
            make_c_initializer(env, tu, element, &item.initializer, const_ctx)?.0
        };
        children[cursor] = Some(child);
        max_idx = max_idx.max(cursor as i64);
        cursor += 1;
    }
    let completed = declared_size.unwrap_or((max_idx + 1).max(0) as u64);
    if (children.len() as u64) < completed {
        children.resize_with(completed as usize, || None);
    }
    Ok((CInit::Aggregate(children), completed))
}

fn build_scalar_or_string(
    env: &mut Env,
    tu: &mut TransUnit,
    ty: TypeId,
    e: &Node<Expr>,
    const_ctx: bool,
) -> LowerResult<(CInit, TypeId)> {
    // An array of `char` initialized directly from a string literal expands
    // into one leaf per byte, including the terminating NUL.
    if let CTypeKind::Array { element, size } = env.types.kind(ty).clone() {
        if matches!(env.types.kind(element), CTypeKind::Integer { rank: IntRank::Char, .. }) {
            if let Expr::StringLiteral(bytes) = &e.node {
                let char_signed = env.options.char_signed;
                let ir_char = IntRank::Char.ir_type(char_signed);
                let needed = bytes.len() as u64 + 1;
                if let Some(n) = size {
                    if n < needed.saturating_sub(1) {
                        return Err(LowerError::ill_formed(
                            "initializer string is too long for the array",
                            e.position.clone(),
                        ));
                    }
                }
                let final_size = size.unwrap_or(needed);
                let mut children: Vec<Option<CInit>> = bytes
                    .iter()
                    .map(|&b| Some(CInit::Leaf(IrValue::const_int(b as i128, ir_char.clone()), element)))
                    .collect();
                if (children.len() as u64) < final_size {
                    children.push(Some(CInit::Leaf(IrValue::const_int(0, ir_char.clone()), element)));
                }
                children.resize_with(final_size as usize, || None);
                let new_ty = if size.is_none() {
                    env.types.array_type(element, Some(final_size))
                } else {
                    ty
                };
                return Ok((CInit::Aggregate(children), new_ty));
            }
        }
    }

    if const_ctx {
        let (value, from_ty) = eval_const_expr(env, tu, e)?;
        let converted = convert_value(env, tu, value, from_ty, ty, &e.position)?;
        Ok((CInit::Leaf(converted, ty), ty))
    } else {
        let (value, from_ty) = lower_expr(env, tu, e, ExprContext::RValue)?;
        let converted = if matches!(env.types.kind(ty), CTypeKind::Struct(_)) {
            // Whole-aggregate copy-initialization (`struct s a = b;`): the
            // r-value already is the source object's address.
            value
        } else {
            convert_value(env, tu, value, from_ty, ty, &e.position)?
        };
        Ok((CInit::Leaf(converted, ty), ty))
    }
}

/// Renders a fully-built `CInit` tree into the constant mirror a global or
/// `static` local's `IrConst` initializer needs, zero-filling unset slots
///.
pub fn const_gen(env: &mut Env, tu: &mut TransUnit, c: &CInit, ty: TypeId) -> LowerResult<IrConst> {
    match c {
        CInit::Leaf(value, leaf_ty) => leaf_to_const(value, *leaf_ty),
        CInit::Aggregate(children) => match env.types.kind(ty).clone() {
            CTypeKind::Struct(struct_id) => {
                let fields = env.types.struct_def(struct_id).fields.clone();
                let mut items = Vec::with_capacity(fields.len());
                for (i, field) in fields.iter().enumerate() {
                    let item = match children.get(i).and_then(|s| s.as_ref()) {
                        Some(child) => const_gen(env, tu, child, field.ty)?,
                        None => zero_const(env, tu, field.ty)?,
                    };
                    items.push(item);
                }
                Ok(tu.add_struct_const(items))
            }
            CTypeKind::Array { element, size } => {
                let n = size.unwrap_or(children.len() as u64);
                let mut items = Vec::with_capacity(n as usize);
                for i in 0..n as usize {
                    let item = match children.get(i).and_then(|s| s.as_ref()) {
                        Some(child) => const_gen(env, tu, child, element)?,
                        None => zero_const(env, tu, element)?,
                    };
                    items.push(item);
                }
                Ok(tu.add_array_const(items))
            }
            _ => Err(LowerError::internal(
                "aggregate CInit node against a non-aggregate type",
            )),
        },
    }
}

fn zero_const(env: &mut Env, tu: &mut TransUnit, ty: TypeId) -> LowerResult<IrConst> {
    let ir_ty = ir_type_of(env, tu, ty)?;
    Ok(IrConst::Zero(ir_ty))
}

fn leaf_to_const(value: &IrValue, leaf_ty: TypeId) -> LowerResult<IrConst> {
    let _ = leaf_ty;
    match value {
        IrValue::ConstInt { value, ty } => Ok(IrConst::Int { value: *value, ty: ty.clone() }),
        IrValue::ConstNull => Ok(IrConst::Zero(IrType::Ptr)),
        IrValue::GlobalAddr(name) => Ok(IrConst::GlobalAddr(name.clone())),
        IrValue::Value(_) | IrValue::Param(_) => Err(LowerError::internal(
            "non-constant leaf reached a static initializer",
        )),
    }
}

/// Emits the runtime stores (and, for a non-full initializer, a leading
/// `memset`) that materialize `c` into the object at `addr` of type `ty`
///.
pub fn emit_auto_init(
    env: &mut Env,
    tu: &mut TransUnit,
    addr: IrValue,
    c: &CInit,
    ty: TypeId,
    position: &Position,
) -> LowerResult<()> {
    if !is_full(c) {
        let pw = env.options.pointer_width;
        let size = env.types.size_of(ty, pw)?;
        let fid = current_fn(env);
        tu.function_mut(fid).builtin_memset(
            addr.clone(),
            IrValue::const_int(0, IrType::I8),
            IrValue::const_int(size as i128, IrType::I64),
        );
    }
    emit_stores(env, tu, addr, c, ty, position)
}

fn emit_stores(
    env: &mut Env,
    tu: &mut TransUnit,
    addr: IrValue,
    c: &CInit,
    ty: TypeId,
    position: &Position,
) -> LowerResult<()> {
    match c {
        CInit::Leaf(value, leaf_ty) => {
            let fid = current_fn(env);
            if matches!(env.types.kind(*leaf_ty), CTypeKind::Struct(_)) {
                let pw = env.options.pointer_width;
                let size = env.types.size_of(*leaf_ty, pw)?;
                tu.function_mut(fid).builtin_memcpy(
                    addr,
                    value.clone(),
                    IrValue::const_int(size as i128, IrType::I64),
                );
            } else {
                let converted = convert_value(env, tu, value.clone(), *leaf_ty, ty, position)?;
                tu.function_mut(fid).build_store(addr, converted);
            }
            Ok(())
        }
        CInit::Aggregate(children) => {
            let ir_ty = ir_type_of(env, tu, ty)?;
            match env.types.kind(ty).clone() {
                CTypeKind::Struct(struct_id) => {
                    let fields = env.types.struct_def(struct_id).fields.clone();
                    for (i, field) in fields.iter().enumerate() {
                        if let Some(child) = children.get(i).and_then(|s| s.as_ref()) {
                            let fid = current_fn(env);
                            let field_addr = tu.function_mut(fid).build_field(addr.clone(), ir_ty.clone(), i as u64);
                            emit_stores(env, tu, field_addr, child, field.ty, position)?;
                        }
                    }
                    Ok(())
                }
                CTypeKind::Array { element, .. } => {
                    for (i, slot) in children.iter().enumerate() {
                        if let Some(child) = slot {
                            let fid = current_fn(env);
                            let elem_addr = tu.function_mut(fid).build_field(addr.clone(), ir_ty.clone(), i as u64);
                            emit_stores(env, tu, elem_addr, child, element, position)?;
                        }
                    }
                    Ok(())
                }
                _ => Err(LowerError::internal(
                    "aggregate CInit node against a non-aggregate type",
                )),
            }
        }
    }
}

/// Builds and emits an initializer for an already-allocated object at
/// `addr`, returning `ty` completed to a concrete array size if needed.
/// Used for automatic-storage declarations, where the local's stack
/// slot is allocated only after the completed size is known.
pub fn lower_initializer_into(
    env: &mut Env,
    tu: &mut TransUnit,
    addr: IrValue,
    ty: TypeId,
    init: &Node<Initializer>,
    position: &Position,
) -> LowerResult<TypeId> {
    let (c, completed_ty) = make_c_initializer(env, tu, ty, init, false)?;
    emit_auto_init(env, tu, addr, &c, completed_ty, position)?;
    Ok(completed_ty)
}

/// Convenience entry point for a brace-list initializer whose target object
/// already exists at a fixed type.
pub fn lower_initializer_list_into(
    env: &mut Env,
    tu: &mut TransUnit,
    addr: IrValue,
    ty: TypeId,
    items: &[InitializerListItem],
    position: &Position,
) -> LowerResult<()> {
    let wrapped = Node::new(Initializer::List(items.to_vec()), position.clone());
    lower_initializer_into(env, tu, addr, ty, &wrapped, position)?;
    Ok(())
}
