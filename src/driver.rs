//! The top-level driver.
//!
//! Turns a parsed translation unit into a `TransUnit` by walking the whole
//! program's top-level items and driving the per-item passes underneath.
//! This module owns the parts those per-expression/per-statement passes
//! don't: registering every function/global prototype up front so forward
//! references resolve, deciding linkage from storage class, and running
//! the deferred-`inline` and `extern inline`-reactivation dance.

use std::rc::Rc;

use crate::ast::{
    Decl, Declarator, DirectDeclarator, FunctionDef, InitDeclarator, Node, ParamDecl, StorageClass, TopLevel,
    TranslationUnit,
};
use crate::env::{DeferredInline, Env, Options};
use crate::error::{LowerError, LowerResult, Position};
use crate::ir::{FunctionId, IrType, IrValue, Linkage, TransUnit};
use crate::resolver::{is_typedef, resolve_declarator, resolve_specifiers, resolve_decl};
use crate::scope::Binding;
use crate::types::{CTypeKind, TypeId};

/// Lowers a whole translation unit into a fresh `TransUnit`. This is the
/// crate's single public entry point: everything else is reached
/// only by walking from here.
pub fn lower_translation_unit(ast: &TranslationUnit, options: Options) -> LowerResult<TransUnit> {
    let mut tu = TransUnit::new();
    let mut env = Env::new(&mut tu, options);

    for item in ast {
        match &item.node {
            TopLevel::FunctionDef(def) => lower_function_def(&mut env, &mut tu, def, &item.position)?,
            TopLevel::Decl(decl) => lower_top_decl(&mut env, &mut tu, decl, &item.position)?,
        }
    }

    // Any inline function that never received a matching `extern inline`
    // redeclaration stays un-emitted, exactly like a real translation unit
    // that never forces it out of line.
    if !env.deferred_inlines.is_empty() {
        log::debug!(
            "{} inline function body(ies) were never activated by an extern redeclaration",
            env.deferred_inlines.len()
        );
    }

    Ok(tu)
}

fn declarator_name(d: &Declarator) -> Option<Rc<str>> {
    match d {
        Declarator::Pointer { pointee, .. } => declarator_name(&pointee.node),
        Declarator::Direct(dd) => direct_declarator_name(dd),
    }
}

fn direct_declarator_name(dd: &DirectDeclarator) -> Option<Rc<str>> {
    match dd {
        DirectDeclarator::Identifier(name) => Some(name.clone()),
        DirectDeclarator::Nested(inner) => declarator_name(&inner.node),
        DirectDeclarator::Array { element, .. } => direct_declarator_name(element),
        DirectDeclarator::Function { base, .. } => direct_declarator_name(base),
    }
}

fn find_function_params(declarator: &Declarator) -> Option<&[ParamDecl]> {
    match declarator {
        Declarator::Pointer { pointee, .. } => find_function_params(&pointee.node),
        Declarator::Direct(dd) => find_function_params_direct(dd),
    }
}

fn find_function_params_direct(dd: &DirectDeclarator) -> Option<&[ParamDecl]> {
    match dd {
        DirectDeclarator::Function { base, params, .. } => {
            find_function_params_direct(base).or(Some(params))
        }
        DirectDeclarator::Nested(inner) => find_function_params(&inner.node),
        DirectDeclarator::Array { element, .. } => find_function_params_direct(element),
        DirectDeclarator::Identifier(_) => None,
    }
}

fn param_names(declarator: &Node<Declarator>, position: &Position) -> LowerResult<Vec<Rc<str>>> {
    let params = find_function_params(&declarator.node).unwrap_or(&[]);
    params
        .iter()
        .map(|p| {
            p.declarator
                .as_ref()
                .and_then(|d| declarator_name(&d.node))
                .ok_or_else(|| {
                    LowerError::unimplemented("unnamed parameter in a function definition", position.clone())
                })
        })
        .collect()
}

fn linkage_of(storage: Option<&StorageClass>) -> Linkage {
    match storage {
        Some(StorageClass::Static) => Linkage::Local,
        _ => Linkage::Global,
    }
}

fn ir_signature(
    env: &mut Env,
    tu: &mut TransUnit,
    ret_ty: TypeId,
    param_tys: &[TypeId],
) -> LowerResult<(Vec<IrType>, IrType, bool)> {
    let sret = matches!(env.types.kind(ret_ty), CTypeKind::Struct(_));
    let pw = env.options.pointer_width;
    let mut ir_params = Vec::with_capacity(param_tys.len() + sret as usize);
    if sret {
        ir_params.push(IrType::Ptr);
    }
    for &p in param_tys {
        ir_params.push(env.types.c_type_to_ir(p, tu, pw)?);
    }
    let ir_ret = if sret { IrType::Void } else { env.types.c_type_to_ir(ret_ty, tu, pw)? };
    Ok((ir_params, ir_ret, sret))
}

/// Registers (or reuses) a function's prototype and binds its name,
/// without touching its body. Used for both a `FunctionDef`'s own
/// declarator and a plain function-declaring `Decl`.
fn register_function_prototype(
    env: &mut Env,
    tu: &mut TransUnit,
    name: &Rc<str>,
    fn_ty: TypeId,
    ret_ty: TypeId,
    param_tys: &[TypeId],
    variadic: bool,
    storage: Option<&StorageClass>,
) -> LowerResult<FunctionId> {
    let (ir_params, ir_ret, _sret) = ir_signature(env, tu, ret_ty, param_tys)?;
    let function_id = match tu.find_function(name) {
        Some(id) => id,
        None => tu.trans_unit_add_function(name.to_string(), ir_params, ir_ret, variadic, linkage_of(storage)),
    };
    if env.scope.is_file_scope() {
        env.scope.bind(name.clone(), Binding::Function { ty: fn_ty, id: function_id });
    }
    Ok(function_id)
}

fn lower_function_def(env: &mut Env, tu: &mut TransUnit, def: &FunctionDef, position: &Position) -> LowerResult<()> {
    let (resolved, base) = resolve_decl(env, tu, &def.specifiers, &def.declarator)?;
    let name = resolved
        .name
        .clone()
        .ok_or_else(|| LowerError::ill_formed("function definition is missing a name", position.clone()))?;

    let (ret_ty, param_tys, variadic) = match env.types.kind(resolved.ty).clone() {
        CTypeKind::Function { ret, params, variadic } => (ret, params, variadic),
        _ => {
            return Err(LowerError::ill_formed(
                format!("'{name}' is declared with a function body but is not a function"),
                position.clone(),
            ))
        }
    };

    let function_id = register_function_prototype(
        env,
        tu,
        &name,
        resolved.ty,
        ret_ty,
        &param_tys,
        variadic,
        base.storage.as_ref(),
    )?;

    if base.is_inline && !matches!(base.storage, Some(StorageClass::Extern)) {
        env.deferred_inlines.push(DeferredInline {
            function_id,
            body: def.body.clone(),
            return_ty: ret_ty,
            param_names: param_names(&def.declarator, position)?,
            param_tys,
        });
        return Ok(());
    }

    let names = param_names(&def.declarator, position)?;
    emit_function_body(env, tu, function_id, ret_ty, &param_tys, &names, &def.body)
}

fn bind_params(
    env: &mut Env,
    tu: &mut TransUnit,
    function_id: FunctionId,
    param_tys: &[TypeId],
    names: &[Rc<str>],
    sret: bool,
) -> LowerResult<()> {
    let arg_offset = if sret {
        env.sret_ptr = Some(IrValue::Param(0));
        1
    } else {
        0
    };
    let pw = env.options.pointer_width;
    for (i, ty) in param_tys.iter().enumerate() {
        let ir_ty = env.types.c_type_to_ir(*ty, tu, pw)?;
        let slot = tu.function_mut(function_id).build_local(ir_ty);
        tu.function_mut(function_id).build_store(slot.clone(), IrValue::Param((i + arg_offset) as u32));
        if let (IrValue::Value(slot_id), Some(name)) = (&slot, names.get(i)) {
            env.scope.bind(name.clone(), Binding::Local { ty: *ty, slot: *slot_id });
        }
    }
    Ok(())
}

fn emit_function_body(
    env: &mut Env,
    tu: &mut TransUnit,
    function_id: FunctionId,
    ret_ty: TypeId,
    param_tys: &[TypeId],
    names: &[Rc<str>],
    body: &Node<crate::ast::Statement>,
) -> LowerResult<()> {
    let sret = matches!(env.types.kind(ret_ty), CTypeKind::Struct(_));

    env.scope.enter_scope();
    let entry = tu.function_mut(function_id).add_block("entry");
    tu.function_mut(function_id).set_current_block(entry);
    env.current_function = Some(function_id);
    env.current_return_ty = Some(ret_ty);

    let result = (|| {
        bind_params(env, tu, function_id, param_tys, names, sret)?;

        let mut label_names = Vec::new();
        crate::stmt::collect_labels(body, &mut label_names);
        for label in label_names {
            let block = tu.function_mut(function_id).add_block(label.to_string());
            env.labels.insert(label, block);
        }

        crate::stmt::lower_statement(env, tu, body)?;

        if !tu.function(function_id).current_is_terminated() {
            tu.function_mut(function_id).build_ret_void();
        }

        Ok(())
    })();

    tu.add_init_to_function(function_id, entry);
    env.scope.exit_scope();
    env.current_function = None;
    env.current_return_ty = None;
    env.sret_ptr = None;
    env.labels.clear();

    result
}

fn try_activate_deferred_inline(env: &mut Env, tu: &mut TransUnit, function_id: FunctionId) -> LowerResult<()> {
    let Some(idx) = env.deferred_inlines.iter().position(|d| d.function_id == function_id) else {
        return Ok(());
    };
    let deferred = env.deferred_inlines.remove(idx);
    emit_function_body(
        env,
        tu,
        deferred.function_id,
        deferred.return_ty,
        &deferred.param_tys,
        &deferred.param_names,
        &deferred.body,
    )
}

fn lower_top_decl(env: &mut Env, tu: &mut TransUnit, decl: &Decl, position: &Position) -> LowerResult<()> {
    let base = resolve_specifiers(env, tu, &decl.specifiers, position)?;

    if is_typedef(decl) {
        for id in &decl.init_declarators {
            let resolved = resolve_declarator(env, tu, &id.declarator.node, base.ty, position)?;
            let name = resolved
                .name
                .clone()
                .ok_or_else(|| LowerError::ill_formed("typedef requires a name", position.clone()))?;
            env.scope.bind(name, Binding::Typedef { ty: resolved.ty });
        }
        return Ok(());
    }

    for id in &decl.init_declarators {
        lower_global_init_declarator(env, tu, &base, id, position)?;
    }
    Ok(())
}

fn lower_global_init_declarator(
    env: &mut Env,
    tu: &mut TransUnit,
    base: &crate::resolver::BaseSpec,
    id: &InitDeclarator,
    position: &Position,
) -> LowerResult<()> {
    let resolved = resolve_declarator(env, tu, &id.declarator.node, base.ty, position)?;
    let name = resolved
        .name
        .clone()
        .ok_or_else(|| LowerError::ill_formed("declaration requires a name", position.clone()))?;

    if env.types.is_function(resolved.ty) {
        let (ret_ty, param_tys, variadic) = match env.types.kind(resolved.ty).clone() {
            CTypeKind::Function { ret, params, variadic } => (ret, params, variadic),
            _ => unreachable!(),
        };
        let function_id = register_function_prototype(
            env,
            tu,
            &name,
            resolved.ty,
            ret_ty,
            &param_tys,
            variadic,
            base.storage.as_ref(),
        )?;
        if matches!(base.storage, Some(StorageClass::Extern)) {
            try_activate_deferred_inline(env, tu, function_id)?;
        }
        return Ok(());
    }

    let is_extern = matches!(base.storage, Some(StorageClass::Extern));
    let linkage = linkage_of(base.storage.as_ref());
    let pw = env.options.pointer_width;

    let (final_ty, init_const) = match &id.initializer {
        Some(init_node) => {
            let (cinit, completed_ty) = crate::init::make_c_initializer(env, tu, resolved.ty, init_node, true)?;
            let const_val = crate::init::const_gen(env, tu, &cinit, completed_ty)?;
            (completed_ty, Some(const_val))
        }
        None if is_extern => (resolved.ty, None),
        None => {
            let ir_ty = env.types.c_type_to_ir(resolved.ty, tu, pw)?;
            (resolved.ty, Some(crate::ir::IrConst::Zero(ir_ty)))
        }
    };
    let final_ir_ty = env.types.c_type_to_ir(final_ty, tu, pw)?;

    let global_id = match tu.find_global(&name) {
        Some(existing) => {
            if init_const.is_some() {
                tu.global_mut(existing).init = init_const;
            }
            existing
        }
        None => tu.trans_unit_add_var(name.clone(), final_ir_ty, linkage, is_extern, init_const),
    };
    env.scope.bind(name, Binding::Global { ty: final_ty, id: global_id });
    Ok(())
}

/// Lowers one local declaration inside a function body: a
/// `typedef`, a `static` local (hoisted into a hidden file-scope global), a
/// nested function prototype, or an ordinary automatic-storage variable.
pub fn lower_local_decl(env: &mut Env, tu: &mut TransUnit, decl: &Decl) -> LowerResult<()> {
    let position = decl
        .init_declarators
        .first()
        .map(|d| d.declarator.position.clone())
        .unwrap_or_else(|| Position::new("<local-declaration>", 0, 0));
    let base = resolve_specifiers(env, tu, &decl.specifiers, &position)?;

    if is_typedef(decl) {
        for id in &decl.init_declarators {
            let resolved = resolve_declarator(env, tu, &id.declarator.node, base.ty, &position)?;
            let name = resolved
                .name
                .clone()
                .ok_or_else(|| LowerError::ill_formed("typedef requires a name", position.clone()))?;
            env.scope.bind(name, Binding::Typedef { ty: resolved.ty });
        }
        return Ok(());
    }

    for id in &decl.init_declarators {
        let item_position = id.declarator.position.clone();
        let resolved = resolve_declarator(env, tu, &id.declarator.node, base.ty, &item_position)?;
        let name = resolved
            .name
            .clone()
            .ok_or_else(|| LowerError::ill_formed("declaration requires a name", item_position.clone()))?;

        if env.types.is_function(resolved.ty) {
            let (ret_ty, param_tys, variadic) = match env.types.kind(resolved.ty).clone() {
                CTypeKind::Function { ret, params, variadic } => (ret, params, variadic),
                _ => unreachable!(),
            };
            register_function_prototype(
                env,
                tu,
                &name,
                resolved.ty,
                ret_ty,
                &param_tys,
                variadic,
                base.storage.as_ref(),
            )?;
            continue;
        }

        if matches!(base.storage, Some(StorageClass::Static)) {
            let pw = env.options.pointer_width;
            let (final_ty, init_const) = match &id.initializer {
                Some(init_node) => {
                    let (cinit, completed_ty) =
                        crate::init::make_c_initializer(env, tu, resolved.ty, init_node, true)?;
                    (completed_ty, crate::init::const_gen(env, tu, &cinit, completed_ty)?)
                }
                None => {
                    let ir_ty = env.types.c_type_to_ir(resolved.ty, tu, pw)?;
                    (resolved.ty, crate::ir::IrConst::Zero(ir_ty))
                }
            };
            let ir_ty = env.types.c_type_to_ir(final_ty, tu, pw)?;
            let mangled = env.fresh_static_local_name(&name);
            let global_id = tu.trans_unit_add_var(mangled, ir_ty, Linkage::Local, false, Some(init_const));
            env.scope.bind(name, Binding::Global { ty: final_ty, id: global_id });
            continue;
        }

        if env.scope.contains_in_current_scope(&name) {
            return Err(LowerError::ill_formed(
                format!("redefinition of '{name}'"),
                item_position,
            ));
        }

        let fid = env
            .current_function
            .expect("a local declaration is always lowered inside some function");
        match &id.initializer {
            Some(init_node) => {
                // The completed type (for an incomplete-array target) is
                // known only once the initializer tree is built, so the
                // stack slot is allocated after that, not before.
                let (cinit, completed_ty) = crate::init::make_c_initializer(env, tu, resolved.ty, init_node, false)?;
                let ir_ty = env.types.c_type_to_ir(completed_ty, tu, env.options.pointer_width)?;
                let slot = tu.function_mut(fid).build_local(ir_ty);
                crate::init::emit_auto_init(env, tu, slot.clone(), &cinit, completed_ty, &item_position)?;
                if let IrValue::Value(slot_id) = slot {
                    env.scope.bind(name, Binding::Local { ty: completed_ty, slot: slot_id });
                }
            }
            None => {
                if let CTypeKind::Array { size: None, .. } = env.types.kind(resolved.ty) {
                    return Err(LowerError::ill_formed(
                        "array size is missing and no initializer provides one",
                        item_position,
                    ));
                }
                let ir_ty = env.types.c_type_to_ir(resolved.ty, tu, env.options.pointer_width)?;
                let slot = tu.function_mut(fid).build_local(ir_ty);
                if let IrValue::Value(slot_id) = slot {
                    env.scope.bind(name, Binding::Local { ty: resolved.ty, slot: slot_id });
                }
            }
        }
    }
    Ok(())
}
