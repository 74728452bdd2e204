//! The declarator resolver: turns a specifier list
//! plus a declarator into a `CType` and a name, following C's "read the
//! declarator right-then-left around the identifier" composition rule.
//!
//! The specifier-classification step matches against C's combinable
//! specifier set (`unsigned long long int`, ...) the same way `types.rs`
//! matches a closed enum, one inherent constructor per shape.

use std::rc::Rc;

use crate::ast::{
    Decl, DeclSpecifier, Declarator, DirectDeclarator, FunctionSpecifier, Node, ParamDecl,
    StorageClass, StructFieldDecl, StructOrUnionSpec, TypeName, TypeQualifier, TypeSpecifier,
};
use crate::consteval::eval_array_length;
use crate::env::Env;
use crate::error::{LowerError, LowerResult, Position};
use crate::ir::TransUnit;
use crate::scope::Binding;
use crate::types::TypeId;

/// The classified result of a declaration's specifier list, independent of
/// any particular declarator.
pub struct BaseSpec {
    pub ty: TypeId,
    pub storage: Option<StorageClass>,
    pub is_inline: bool,
}

/// One resolved declarator: the name it declares (absent for abstract
/// declarators in a `TypeName`) and its full composed type.
pub struct ResolvedDeclarator {
    pub name: Option<Rc<str>>,
    pub ty: TypeId,
}

/// Classifies a declaration's specifier list into a base type plus storage
/// class and `inline` flag. Struct/union/enum specifiers with a
/// body are registered into the type environment as a side effect.
pub fn resolve_specifiers(
    env: &mut Env,
    tu: &mut TransUnit,
    specifiers: &[Node<DeclSpecifier>],
    position: &Position,
) -> LowerResult<BaseSpec> {
    let mut storage = None;
    let mut is_inline = false;

    let mut void_count = 0u32;
    let mut char_count = 0u32;
    let mut short_count = 0u32;
    let mut int_count = 0u32;
    let mut long_count = 0u32;
    let mut signed_count = 0u32;
    let mut unsigned_count = 0u32;
    let mut typedef_name: Option<Rc<str>> = None;
    let mut tagged_ty: Option<TypeId> = None;

    for spec in specifiers {
        match &spec.node {
            DeclSpecifier::StorageClass(sc) => {
                if storage.is_some() {
                    return Err(LowerError::ill_formed(
                        "multiple storage-class specifiers",
                        spec.position.clone(),
                    ));
                }
                storage = Some(sc.clone());
            }
            DeclSpecifier::TypeQualifier(_) => {
                // `const`/`restrict`/`volatile` are tracked on the
                // declarator's use sites elsewhere; the base type itself is
                // qualifier-agnostic in this core.
            }
            DeclSpecifier::FunctionSpecifier(FunctionSpecifier::Inline) => {
                is_inline = true;
            }
            DeclSpecifier::TypeSpecifier(ts) => match ts {
                TypeSpecifier::Void => void_count += 1,
                TypeSpecifier::Char => char_count += 1,
                TypeSpecifier::Short => short_count += 1,
                TypeSpecifier::Int => int_count += 1,
                TypeSpecifier::Long => long_count += 1,
                TypeSpecifier::Signed => signed_count += 1,
                TypeSpecifier::Unsigned => unsigned_count += 1,
                TypeSpecifier::TypedefName(name) => typedef_name = Some(name.clone()),
                TypeSpecifier::Struct(spec) => {
                    tagged_ty = Some(resolve_struct_or_union(env, tu, spec, false, position)?);
                }
                TypeSpecifier::Union(spec) => {
                    tagged_ty = Some(resolve_struct_or_union(env, tu, spec, true, position)?);
                }
                TypeSpecifier::Enum(spec) => {
                    tagged_ty = Some(resolve_enum(env, tu, spec, position)?);
                }
            },
        }
    }

    let ty = if let Some(ty) = tagged_ty {
        ty
    } else if let Some(name) = typedef_name {
        match env.scope.lookup(&name) {
            Some(Binding::Typedef { ty }) => *ty,
            _ => {
                return Err(LowerError::ill_formed(
                    format!("'{name}' does not name a type"),
                    position.clone(),
                ))
            }
        }
    } else if void_count > 0 {
        env.types.void()
    } else if char_count > 0 {
        let signed = if unsigned_count > 0 {
            false
        } else if signed_count > 0 {
            true
        } else {
            env.options.char_signed
        };
        env.types.integer(crate::types::IntRank::Char, signed)
    } else if short_count > 0 {
        env.types
            .integer(crate::types::IntRank::Short, unsigned_count == 0)
    } else if long_count >= 2 {
        env.types
            .integer(crate::types::IntRank::LongLong, unsigned_count == 0)
    } else if long_count == 1 {
        env.types
            .integer(crate::types::IntRank::Long, unsigned_count == 0)
    } else {
        env.types
            .integer(crate::types::IntRank::Int, unsigned_count == 0)
    };

    Ok(BaseSpec {
        ty,
        storage,
        is_inline,
    })
}

fn resolve_struct_or_union(
    env: &mut Env,
    tu: &mut TransUnit,
    spec: &StructOrUnionSpec,
    is_union: bool,
    position: &Position,
) -> LowerResult<TypeId> {
    let ty = match &spec.tag {
        Some(tag) => env.types.declare_tag(tag.clone(), is_union),
        None => env.types.new_anonymous_struct(is_union),
    };

    if let Some(field_decls) = &spec.fields {
        let mut fields = Vec::new();
        for field in field_decls {
            let base = resolve_specifiers(env, tu, &field.specifiers, position)?;
            for declarator in &field.declarators {
                let resolved = resolve_declarator(env, tu, &declarator.node, base.ty, position)?;
                let name = resolved.name.ok_or_else(|| {
                    LowerError::ill_formed("struct field must have a name", position.clone())
                })?;
                fields.push((name, resolved.ty));
            }
        }
        env.types
            .complete_struct(ty, fields, spec.packed, position)?;
    }

    Ok(ty)
}

fn resolve_enum(
    env: &mut Env,
    tu: &mut TransUnit,
    spec: &crate::ast::EnumSpec,
    position: &Position,
) -> LowerResult<TypeId> {
    // Enum types are aliases of `int`; enumerators are bound
    // as `int`-valued constants in the identifier namespace.
    let _ = position;
    if let Some(enumerators) = &spec.enumerators {
        let mut next_value: i128 = 0;
        for enumerator in enumerators {
            let value = match &enumerator.value {
                Some(expr) => eval_array_length(env, tu, expr)? as i128,
                None => next_value,
            };
            next_value = value + 1;
            env.scope
                .bind(enumerator.name.clone(), Binding::EnumConst { value });
        }
    }
    Ok(env.types.int())
}

/// Composes a base type with a declarator, following C's right-left
/// reading rule: a `Pointer` node transforms the accumulated base type
/// *before* descending further; an `Array`/`Function` suffix does the
/// same. This is what makes `int *x[3]` resolve as "array of pointer" (the
/// `*` updates the base the array suffix then wraps) rather than "pointer
/// to array".
pub fn resolve_declarator(
    env: &mut Env,
    tu: &mut TransUnit,
    declarator: &Declarator,
    base: TypeId,
    position: &Position,
) -> LowerResult<ResolvedDeclarator> {
    match declarator {
        Declarator::Pointer { pointee, .. } => {
            let new_base = env.types.pointer_type(base);
            resolve_declarator(env, tu, &pointee.node, new_base, position)
        }
        Declarator::Direct(dd) => resolve_direct(env, tu, dd, base, position),
    }
}

fn resolve_direct(
    env: &mut Env,
    tu: &mut TransUnit,
    dd: &DirectDeclarator,
    base: TypeId,
    position: &Position,
) -> LowerResult<ResolvedDeclarator> {
    match dd {
        DirectDeclarator::Identifier(name) => Ok(ResolvedDeclarator {
            name: Some(name.clone()),
            ty: base,
        }),
        DirectDeclarator::Nested(inner) => resolve_declarator(env, tu, &inner.node, base, position),
        DirectDeclarator::Array { element, length } => {
            let size = match length {
                Some(expr) => Some(eval_array_length(env, tu, expr)?),
                None => None,
            };
            let new_base = env.types.array_type(base, size);
            resolve_direct(env, tu, &element.node, new_base, position)
        }
        DirectDeclarator::Function {
            base: inner,
            params,
            variadic,
        } => {
            let param_tys = resolve_param_types(env, tu, params, position)?;
            let new_base = env.types.function_type(base, param_tys, *variadic);
            resolve_direct(env, tu, &inner.node, new_base, position)
        }
    }
}

/// Resolves a parameter list, applying array-to-pointer and
/// function-to-pointer adjustment to each parameter's type ("a
/// parameter declared as an array of T is adjusted to a pointer to T").
fn resolve_param_types(
    env: &mut Env,
    tu: &mut TransUnit,
    params: &[ParamDecl],
    position: &Position,
) -> LowerResult<Vec<TypeId>> {
    let mut tys = Vec::with_capacity(params.len());
    for param in params {
        let base = resolve_specifiers(env, tu, &param.specifiers, position)?;
        let ty = match &param.declarator {
            Some(d) => resolve_declarator(env, tu, &d.node, base.ty, position)?.ty,
            None => base.ty,
        };
        tys.push(env.types.decay(ty));
    }
    Ok(tys)
}

/// Resolves the full specifier+declarator pair of one `InitDeclarator`'s
/// declarator or a top-level `FunctionDef`'s declarator.
pub fn resolve_decl(
    env: &mut Env,
    tu: &mut TransUnit,
    specifiers: &[Node<DeclSpecifier>],
    declarator: &Node<Declarator>,
) -> LowerResult<(ResolvedDeclarator, BaseSpec)> {
    let base = resolve_specifiers(env, tu, specifiers, &declarator.position)?;
    let resolved = resolve_declarator(env, tu, &declarator.node, base.ty, &declarator.position)?;
    Ok((resolved, base))
}

/// Resolves a `TypeName` (the abstract declarator used by `sizeof(T)`,
/// casts, and compound literals — no identifier is ever bound).
pub fn resolve_type_name(
    env: &mut Env,
    tu: &mut TransUnit,
    type_name: &TypeName,
    position: &Position,
) -> LowerResult<TypeId> {
    let base = resolve_specifiers(env, tu, &type_name.specifiers, position)?;
    match &type_name.declarator {
        Some(d) => Ok(resolve_declarator(env, tu, &d.node, base.ty, position)?.ty),
        None => Ok(base.ty),
    }
}

/// Binds every init-declarator of a (non-initializing) declaration as a
/// `typedef` name when the declaration's storage class is `typedef`
///.
pub fn is_typedef(decl: &Decl) -> bool {
    decl.specifiers
        .iter()
        .any(|s| matches!(&s.node, DeclSpecifier::StorageClass(StorageClass::Typedef)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, Options};
    use crate::ir::TransUnit;
    use crate::types::CTypeKind;

    fn pos() -> Position {
        Position::new("<test>", 1, 1)
    }

    fn node<T>(n: T) -> Node<T> {
        Node::new(n, pos())
    }

    fn int_specifiers() -> Vec<Node<DeclSpecifier>> {
        vec![node(DeclSpecifier::TypeSpecifier(TypeSpecifier::Int))]
    }

    /// `int *x[3]` declares `x` as "array of 3 pointers to int", not
    /// "pointer to array" — the `*` rewrites the base before the `[3]`
    /// suffix wraps it.
    #[test]
    fn pointer_then_array_declares_array_of_pointers() {
        let mut tu = TransUnit::new();
        let mut env = Env::new(&mut tu, Options::default());

        let declarator = Declarator::Pointer {
            qualifiers: vec![],
            pointee: Box::new(node(Declarator::Direct(DirectDeclarator::Array {
                element: Box::new(node(DirectDeclarator::Identifier(Rc::from("x")))),
                length: None,
            }))),
        };
        // Length omitted to avoid needing a full expression lowerer in this
        // fixture; only the element type's shape is under test here.
        let base = resolve_specifiers(&mut env, &mut tu, &int_specifiers(), &pos()).unwrap();
        let resolved = resolve_declarator(&mut env, &mut tu, &declarator, base.ty, &pos()).unwrap();
        match env.types.kind(resolved.ty) {
            CTypeKind::Array { element, .. } => {
                assert!(env.types.is_pointer(*element));
                assert_eq!(env.types.pointee(*element), Some(base.ty));
            }
            other => panic!("expected array type, got {other:?}"),
        }
    }

    #[test]
    fn array_parameter_decays_to_pointer() {
        let mut tu = TransUnit::new();
        let mut env = Env::new(&mut tu, Options::default());
        let base = resolve_specifiers(&mut env, &mut tu, &int_specifiers(), &pos()).unwrap();

        let params = vec![ParamDecl {
            specifiers: int_specifiers(),
            declarator: Some(node(Declarator::Direct(DirectDeclarator::Array {
                element: Box::new(node(DirectDeclarator::Identifier(Rc::from("buf")))),
                length: None,
            }))),
        }];
        let tys = resolve_param_types(&mut env, &mut tu, &params, &pos()).unwrap();
        assert_eq!(tys.len(), 1);
        assert!(env.types.is_pointer(tys[0]));
        assert_eq!(env.types.pointee(tys[0]), Some(base.ty));
    }

    #[test]
    fn typedef_name_resolves_through_scope_binding() {
        let mut tu = TransUnit::new();
        let mut env = Env::new(&mut tu, Options::default());
        let base = resolve_specifiers(&mut env, &mut tu, &int_specifiers(), &pos()).unwrap();
        let uint_ty = env.types.pointer_type(base.ty);
        env.scope
            .bind(Rc::from("intptr"), crate::scope::Binding::Typedef { ty: uint_ty });

        let specifiers = vec![node(DeclSpecifier::TypeSpecifier(TypeSpecifier::TypedefName(
            Rc::from("intptr"),
        )))];
        let resolved = resolve_specifiers(&mut env, &mut tu, &specifiers, &pos()).unwrap();
        assert_eq!(resolved.ty, uint_ty);
    }

    #[test]
    fn unknown_typedef_name_is_ill_formed() {
        let mut tu = TransUnit::new();
        let mut env = Env::new(&mut tu, Options::default());
        let specifiers = vec![node(DeclSpecifier::TypeSpecifier(TypeSpecifier::TypedefName(
            Rc::from("nope"),
        )))];
        assert!(resolve_specifiers(&mut env, &mut tu, &specifiers, &pos()).is_err());
    }

    #[test]
    fn anonymous_struct_with_one_field_resolves() {
        let mut tu = TransUnit::new();
        let mut env = Env::new(&mut tu, Options::default());
        let spec = StructOrUnionSpec {
            tag: None,
            packed: false,
            fields: Some(vec![StructFieldDecl {
                specifiers: int_specifiers(),
                declarators: vec![node(Declarator::Direct(DirectDeclarator::Identifier(Rc::from(
                    "x",
                ))))],
            }]),
        };
        let ty = resolve_struct_or_union(&mut env, &mut tu, &spec, false, &pos()).unwrap();
        match env.types.kind(ty) {
            CTypeKind::Struct(sid) => {
                let def = env.types.struct_def(*sid);
                assert_eq!(def.fields.len(), 1);
                assert_eq!(&*def.fields[0].name, "x");
                assert!(!def.incomplete);
            }
            other => panic!("expected struct type, got {other:?}"),
        }
    }

    #[test]
    fn redeclaring_a_tagged_struct_reuses_the_same_type() {
        let mut tu = TransUnit::new();
        let mut env = Env::new(&mut tu, Options::default());
        let forward = env.types.declare_tag(Rc::from("Point"), false);
        let again = env.types.declare_tag(Rc::from("Point"), false);
        assert_eq!(forward, again);
    }

    #[test]
    fn enum_without_explicit_values_counts_up_from_zero() {
        let mut tu = TransUnit::new();
        let mut env = Env::new(&mut tu, Options::default());
        let spec = crate::ast::EnumSpec {
            tag: None,
            enumerators: Some(vec![
                crate::ast::Enumerator {
                    name: Rc::from("RED"),
                    value: None,
                },
                crate::ast::Enumerator {
                    name: Rc::from("GREEN"),
                    value: None,
                },
            ]),
        };
        let ty = resolve_enum(&mut env, &mut tu, &spec, &pos()).unwrap();
        assert_eq!(ty, env.types.int());
        match env.scope.lookup("RED") {
            Some(crate::scope::Binding::EnumConst { value }) => assert_eq!(*value, 0),
            other => panic!("expected RED bound as an enum constant, got {other:?}"),
        }
        match env.scope.lookup("GREEN") {
            Some(crate::scope::Binding::EnumConst { value }) => assert_eq!(*value, 1),
            other => panic!("expected GREEN bound as an enum constant, got {other:?}"),
        }
    }
}
