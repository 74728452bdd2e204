//! Shared AST-fixture builders for the scenario tests in `tests/*.rs`.
//!
//! Hand-building a small `TranslationUnit` here stands in for what a real
//! parser would hand `irgen::lower_translation_unit`; each scenario test
//! only has to describe the C construct it cares about, not how to use
//! these builders.

use std::rc::Rc;

use irgen::ast::*;
use irgen::error::Position;

pub fn pos() -> Position {
    Position::new("<test>", 1, 1)
}

pub fn node<T>(n: T) -> Node<T> {
    Node::new(n, pos())
}

pub fn ident(name: &str) -> Node<Expr> {
    node(Expr::Ident(Rc::from(name)))
}

pub fn int_lit(value: i128) -> Node<Expr> {
    node(Expr::IntLiteral {
        value,
        suffix: IntSuffix::None,
    })
}

pub fn type_spec(ts: TypeSpecifier) -> Vec<Node<DeclSpecifier>> {
    vec![node(DeclSpecifier::TypeSpecifier(ts))]
}

pub fn int_specifiers() -> Vec<Node<DeclSpecifier>> {
    type_spec(TypeSpecifier::Int)
}

pub fn named_param(specifiers: Vec<Node<DeclSpecifier>>, declarator: Declarator) -> ParamDecl {
    ParamDecl {
        specifiers,
        declarator: Some(node(declarator)),
    }
}

pub fn simple_param(name: &str) -> ParamDecl {
    named_param(int_specifiers(), Declarator::Direct(DirectDeclarator::Identifier(Rc::from(name))))
}

pub fn pointer_param(name: &str) -> ParamDecl {
    named_param(
        int_specifiers(),
        Declarator::Pointer {
            qualifiers: vec![],
            pointee: Box::new(node(Declarator::Direct(DirectDeclarator::Identifier(Rc::from(name))))),
        },
    )
}

/// Builds `ret_specifiers name(params) { body }` as a `FunctionDef`.
pub fn function_def(
    ret_specifiers: Vec<Node<DeclSpecifier>>,
    name: &str,
    params: Vec<ParamDecl>,
    body: Statement,
) -> Node<TopLevel> {
    let declarator = Declarator::Direct(DirectDeclarator::Function {
        base: Box::new(node(DirectDeclarator::Identifier(Rc::from(name)))),
        params,
        variadic: false,
    });
    node(TopLevel::FunctionDef(FunctionDef {
        specifiers: ret_specifiers,
        declarator: node(declarator),
        body: node(body),
    }))
}

pub fn compound(stmts: Vec<Statement>) -> Statement {
    Statement::Compound(stmts.into_iter().map(|s| BlockItem::Statement(node(s))).collect())
}

pub fn ret(e: Node<Expr>) -> Statement {
    Statement::Return(Some(e))
}

pub fn binary(op: BinaryOp, lhs: Node<Expr>, rhs: Node<Expr>) -> Node<Expr> {
    node(Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

pub fn index(base: Node<Expr>, idx: Node<Expr>) -> Node<Expr> {
    node(Expr::Index {
        base: Box::new(base),
        index: Box::new(idx),
    })
}

pub fn member(base: Node<Expr>, field: &str, arrow: bool) -> Node<Expr> {
    node(Expr::Member {
        base: Box::new(base),
        field: Rc::from(field),
        arrow,
    })
}

pub fn assign(lhs: Node<Expr>, rhs: Node<Expr>) -> Node<Expr> {
    node(Expr::Assign {
        op: AssignOp::Assign,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

pub fn logical_and(lhs: Node<Expr>, rhs: Node<Expr>) -> Node<Expr> {
    node(Expr::LogicalAnd(Box::new(lhs), Box::new(rhs)))
}

/// `struct tag { field_specs... };` as a standalone file-scope `Decl` that
/// declares the tag without declaring any variable of it.
pub fn struct_decl(tag: &str, fields: Vec<(&str, Vec<Node<DeclSpecifier>>)>) -> Node<TopLevel> {
    let field_decls = fields
        .into_iter()
        .map(|(name, specifiers)| StructFieldDecl {
            specifiers,
            declarators: vec![node(Declarator::Direct(DirectDeclarator::Identifier(Rc::from(name))))],
        })
        .collect();
    let spec = StructOrUnionSpec {
        tag: Some(Rc::from(tag)),
        fields: Some(field_decls),
        packed: false,
    };
    node(TopLevel::Decl(Decl {
        specifiers: vec![node(DeclSpecifier::TypeSpecifier(TypeSpecifier::Struct(spec)))],
        init_declarators: vec![],
    }))
}

/// `struct tag` used as a type specifier for a later declaration (no body).
pub fn struct_ref_specifiers(tag: &str) -> Vec<Node<DeclSpecifier>> {
    type_spec(TypeSpecifier::Struct(StructOrUnionSpec {
        tag: Some(Rc::from(tag)),
        fields: None,
        packed: false,
    }))
}

pub fn local_decl(specifiers: Vec<Node<DeclSpecifier>>, name: &str, initializer: Option<Node<Initializer>>) -> Statement {
    Statement::Decl(Decl {
        specifiers,
        init_declarators: vec![InitDeclarator {
            declarator: node(Declarator::Direct(DirectDeclarator::Identifier(Rc::from(name)))),
            initializer,
        }],
    })
}

pub fn expr_stmt(e: Node<Expr>) -> Statement {
    Statement::Expr(Some(e))
}
