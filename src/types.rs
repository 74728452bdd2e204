//! The C type system: an interned, arena-backed type graph.
//!
//! Types are referenced by a stable handle (`TypeId`) into a `TypeEnv`
//! arena rather than by reference-counted pointer: C's pointer-type
//! caching produces cycles (a function type can point back to a
//! pointer-to-itself through a typedef), and handles sidestep that instead
//! of fighting it with `Rc`/`Weak`. The canonical builtin/pointer-type
//! tables are lazily populated `once_cell` statics.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{LowerError, LowerResult, Position};
use crate::ir::{IrType, StructId as IrStructId, TransUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntRank {
    Char,
    Short,
    Int,
    Long,
    LongLong,
}

impl IntRank {
    /// Size in bytes, fixed regardless of target.
    pub fn size(self) -> u64 {
        match self {
            IntRank::Char => 1,
            IntRank::Short => 2,
            IntRank::Int => 4,
            IntRank::Long | IntRank::LongLong => 8,
        }
    }

    pub fn ir_type(self, signed: bool) -> IrType {
        match (self, signed) {
            (IntRank::Char, true) => IrType::I8,
            (IntRank::Char, false) => IrType::U8,
            (IntRank::Short, true) => IrType::I16,
            (IntRank::Short, false) => IrType::U16,
            (IntRank::Int, true) => IrType::I32,
            (IntRank::Int, false) => IrType::U32,
            (IntRank::Long, true) | (IntRank::LongLong, true) => IrType::I64,
            (IntRank::Long, false) | (IntRank::LongLong, false) => IrType::U64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

#[derive(Debug, Clone)]
pub enum CTypeKind {
    Void,
    Integer { rank: IntRank, signed: bool },
    Pointer { pointee: TypeId },
    Array { element: TypeId, size: Option<u64> },
    Struct(StructId),
    Function {
        ret: TypeId,
        params: Vec<TypeId>,
        variadic: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructId(pub u32);

#[derive(Debug, Clone)]
pub struct StructField {
    pub name: Rc<str>,
    pub ty: TypeId,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub tag: Option<Rc<str>>,
    pub fields: Vec<StructField>,
    pub align: u64,
    pub size: u64,
    pub incomplete: bool,
    pub packed: bool,
    pub is_union: bool,
    ir_cache: Option<IrStructId>,
}

fn align_to(offset: u64, align: u64) -> u64 {
    if align == 0 {
        return offset;
    }
    (offset + align - 1) / align * align
}

/// The full catalog of C types for one translation unit, plus the canonical
/// pointer/array/function tables that make `pointer_type(pointer_type(T))`
/// requests idempotent.
pub struct TypeEnv {
    pool: Vec<CTypeKind>,
    structs: Vec<StructDef>,
    pointer_cache: HashMap<TypeId, TypeId>,
    array_cache: HashMap<(TypeId, Option<u64>), TypeId>,
    function_cache: HashMap<(TypeId, Vec<TypeId>, bool), TypeId>,
    integer_cache: HashMap<(IntRank, bool), TypeId>,
    tag_structs: HashMap<Rc<str>, TypeId>,
    tag_unions: HashMap<Rc<str>, TypeId>,
    void_id: TypeId,
}

impl TypeEnv {
    pub fn new() -> Self {
        let mut env = TypeEnv {
            pool: Vec::new(),
            structs: Vec::new(),
            pointer_cache: HashMap::new(),
            array_cache: HashMap::new(),
            function_cache: HashMap::new(),
            integer_cache: HashMap::new(),
            tag_structs: HashMap::new(),
            tag_unions: HashMap::new(),
            void_id: TypeId(0),
        };
        env.void_id = env.push(CTypeKind::Void);
        for rank in [
            IntRank::Char,
            IntRank::Short,
            IntRank::Int,
            IntRank::Long,
            IntRank::LongLong,
        ] {
            for signed in [true, false] {
                let id = env.push(CTypeKind::Integer { rank, signed });
                env.integer_cache.insert((rank, signed), id);
            }
        }
        env
    }

    fn push(&mut self, kind: CTypeKind) -> TypeId {
        let id = TypeId(self.pool.len() as u32);
        self.pool.push(kind);
        id
    }

    pub fn kind(&self, id: TypeId) -> &CTypeKind {
        &self.pool[id.0 as usize]
    }

    pub fn void(&self) -> TypeId {
        self.void_id
    }

    pub fn integer(&self, rank: IntRank, signed: bool) -> TypeId {
        *self
            .integer_cache
            .get(&(rank, signed))
            .expect("all rank/signedness combinations are pre-interned")
    }

    pub fn int(&self) -> TypeId {
        self.integer(IntRank::Int, true)
    }

    /// `size_t` analogue used for `sizeof`, array lengths, and the result
    /// of pointer-difference's scaling divisor.
    pub fn size_t(&self) -> TypeId {
        self.integer(IntRank::LongLong, false)
    }

    /// `ptrdiff_t` analogue used as the result type of pointer subtraction.
    pub fn ptrdiff_t(&self) -> TypeId {
        self.integer(IntRank::LongLong, true)
    }

    /// Repeated requests for "pointer to T" return the same handle.
    pub fn pointer_type(&mut self, pointee: TypeId) -> TypeId {
        if let Some(&id) = self.pointer_cache.get(&pointee) {
            return id;
        }
        let id = self.push(CTypeKind::Pointer { pointee });
        self.pointer_cache.insert(pointee, id);
        id
    }

    pub fn array_type(&mut self, element: TypeId, size: Option<u64>) -> TypeId {
        let key = (element, size);
        if let Some(&id) = self.array_cache.get(&key) {
            return id;
        }
        let id = self.push(CTypeKind::Array { element, size });
        self.array_cache.insert(key, id);
        id
    }

    pub fn function_type(&mut self, ret: TypeId, params: Vec<TypeId>, variadic: bool) -> TypeId {
        let key = (ret, params.clone(), variadic);
        if let Some(&id) = self.function_cache.get(&key) {
            return id;
        }
        let id = self.push(CTypeKind::Function {
            ret,
            params,
            variadic,
        });
        self.function_cache.insert(key, id);
        id
    }

    /// Looks up an existing tag, or creates a fresh incomplete struct/union
    /// type for it.
    pub fn declare_tag(&mut self, tag: Rc<str>, is_union: bool) -> TypeId {
        let table = if is_union {
            &self.tag_unions
        } else {
            &self.tag_structs
        };
        if let Some(&id) = table.get(&tag) {
            return id;
        }
        let struct_id = StructId(self.structs.len() as u32);
        self.structs.push(StructDef {
            tag: Some(tag.clone()),
            fields: Vec::new(),
            align: 1,
            size: 0,
            incomplete: true,
            packed: false,
            is_union,
            ir_cache: None,
        });
        let id = self.push(CTypeKind::Struct(struct_id));
        if is_union {
            self.tag_unions.insert(tag, id);
        } else {
            self.tag_structs.insert(tag, id);
        }
        id
    }

    /// Creates a fresh anonymous (untagged) struct/union type.
    pub fn new_anonymous_struct(&mut self, is_union: bool) -> TypeId {
        let struct_id = StructId(self.structs.len() as u32);
        self.structs.push(StructDef {
            tag: None,
            fields: Vec::new(),
            align: 1,
            size: 0,
            incomplete: true,
            packed: false,
            is_union,
            ir_cache: None,
        });
        self.push(CTypeKind::Struct(struct_id))
    }

    pub fn struct_def(&self, id: StructId) -> &StructDef {
        &self.structs[id.0 as usize]
    }

    fn struct_id_of(&self, id: TypeId, position: &Position) -> LowerResult<StructId> {
        match self.kind(id) {
            CTypeKind::Struct(s) => Ok(*s),
            _ => Err(LowerError::internal(format!(
                "expected a struct/union type at {position}"
            ))),
        }
    }

    /// Completes an incomplete struct/union type's body. Errors if
    /// the tag already names a complete type (redefinition).
    pub fn complete_struct(
        &mut self,
        type_id: TypeId,
        fields: Vec<(Rc<str>, TypeId)>,
        packed: bool,
        position: &Position,
    ) -> LowerResult<()> {
        let struct_id = self.struct_id_of(type_id, position)?;
        if !self.struct_def(struct_id).incomplete {
            let tag = self
                .struct_def(struct_id)
                .tag
                .clone()
                .unwrap_or_else(|| "<anonymous>".into());
            return Err(LowerError::ill_formed(
                format!("redefinition of '{tag}'"),
                position.clone(),
            ));
        }

        let is_union = self.struct_def(struct_id).is_union;
        let mut laid_out = Vec::with_capacity(fields.len());
        let mut current: u64 = 0;
        let mut max_align: u64 = 1;

        for (name, field_ty) in fields {
            let field_size = self.size_of(field_ty, 8)?;
            let field_align = if packed { 1 } else { self.align_of(field_ty, 8)? };
            max_align = max_align.max(field_align);

            let offset = if is_union {
                0
            } else {
                align_to(current, field_align)
            };
            laid_out.push(StructField {
                name,
                ty: field_ty,
                offset,
            });
            current = if is_union {
                current.max(field_size)
            } else {
                offset + field_size
            };
        }

        let align = if packed { 1 } else { max_align };
        let size = if is_union {
            current
        } else if packed {
            current
        } else {
            align_to(current, align)
        };

        let def = &mut self.structs[struct_id.0 as usize];
        def.fields = laid_out;
        def.align = align.max(1);
        def.size = size;
        def.incomplete = false;
        def.packed = packed;
        Ok(())
    }

    pub fn is_scalar(&self, id: TypeId) -> bool {
        matches!(
            self.kind(id),
            CTypeKind::Integer { .. } | CTypeKind::Pointer { .. }
        )
    }

    pub fn is_integer(&self, id: TypeId) -> bool {
        matches!(self.kind(id), CTypeKind::Integer { .. })
    }

    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.kind(id), CTypeKind::Pointer { .. })
    }

    pub fn is_aggregate(&self, id: TypeId) -> bool {
        matches!(self.kind(id), CTypeKind::Struct(_) | CTypeKind::Array { .. })
    }

    pub fn is_function(&self, id: TypeId) -> bool {
        matches!(self.kind(id), CTypeKind::Function { .. })
    }

    pub fn is_void(&self, id: TypeId) -> bool {
        matches!(self.kind(id), CTypeKind::Void)
    }

    pub fn is_signed(&self, id: TypeId) -> bool {
        matches!(self.kind(id), CTypeKind::Integer { signed: true, .. })
    }

    pub fn rank(&self, id: TypeId) -> Option<IntRank> {
        match self.kind(id) {
            CTypeKind::Integer { rank, .. } => Some(*rank),
            _ => None,
        }
    }

    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match self.kind(id) {
            CTypeKind::Pointer { pointee } => Some(*pointee),
            _ => None,
        }
    }

    /// Array-to-pointer / function-to-pointer decay.
    pub fn decay(&mut self, id: TypeId) -> TypeId {
        match self.kind(id).clone() {
            CTypeKind::Array { element, .. } => self.pointer_type(element),
            CTypeKind::Function { .. } => self.pointer_type(id),
            _ => id,
        }
    }

    pub fn size_of(&self, id: TypeId, pointer_width: u64) -> LowerResult<u64> {
        match self.kind(id) {
            CTypeKind::Void => Ok(0),
            CTypeKind::Integer { rank, .. } => Ok(rank.size()),
            CTypeKind::Pointer { .. } => Ok(pointer_width),
            CTypeKind::Array { element, size } => {
                let size = size.ok_or_else(|| {
                    LowerError::ill_formed(
                        "sizeof applied to incomplete array type",
                        Position::new("<internal>", 0, 0),
                    )
                })?;
                Ok(self.size_of(*element, pointer_width)? * size)
            }
            CTypeKind::Struct(s) => {
                let def = self.struct_def(*s);
                if def.incomplete {
                    return Err(LowerError::ill_formed(
                        "sizeof applied to incomplete type",
                        Position::new("<internal>", 0, 0),
                    ));
                }
                Ok(def.size)
            }
            CTypeKind::Function { .. } => Err(LowerError::ill_formed(
                "sizeof applied to function type",
                Position::new("<internal>", 0, 0),
            )),
        }
    }

    pub fn align_of(&self, id: TypeId, pointer_width: u64) -> LowerResult<u64> {
        match self.kind(id) {
            CTypeKind::Array { element, .. } => self.align_of(*element, pointer_width),
            CTypeKind::Struct(s) => Ok(self.struct_def(*s).align),
            _ => self.size_of(id, pointer_width).map(|s| s.max(1)),
        }
    }

    /// Converts a `CType` to its backing `IrType`, lazily registering
    /// struct layouts into the translation unit the first time they are
    /// needed.
    pub fn c_type_to_ir(
        &mut self,
        id: TypeId,
        tu: &mut TransUnit,
        pointer_width: u64,
    ) -> LowerResult<IrType> {
        match self.kind(id).clone() {
            CTypeKind::Void => Ok(IrType::Void),
            CTypeKind::Integer { rank, signed } => Ok(rank.ir_type(signed)),
            CTypeKind::Pointer { .. } => Ok(IrType::Ptr),
            CTypeKind::Array { element, size } => {
                let elem_ir = self.c_type_to_ir(element, tu, pointer_width)?;
                Ok(IrType::Array {
                    elem: Box::new(elem_ir),
                    len: size,
                })
            }
            CTypeKind::Function { .. } => Ok(IrType::Ptr),
            CTypeKind::Struct(struct_id) => {
                if let Some(cached) = self.struct_def(struct_id).ir_cache {
                    return Ok(IrType::Struct(cached));
                }
                let def = self.struct_def(struct_id).clone_shallow();
                let mut field_tys = Vec::with_capacity(def.fields.len());
                for field in &def.fields {
                    field_tys.push(self.c_type_to_ir(field.ty, tu, pointer_width)?);
                }
                let name = def
                    .tag
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| format!("anon{}", struct_id.0));
                let ir_id = tu.trans_unit_add_struct(name, field_tys, def.size, def.align);
                self.structs[struct_id.0 as usize].ir_cache = Some(ir_id);
                Ok(IrType::Struct(ir_id))
            }
        }
    }
}

impl StructDef {
    /// Shallow clone used only to release the borrow on `self.structs`
    /// while recursively converting field types above.
    fn clone_shallow(&self) -> StructDef {
        StructDef {
            tag: self.tag.clone(),
            fields: self.fields.clone(),
            align: self.align,
            size: self.size,
            incomplete: self.incomplete,
            packed: self.packed,
            is_union: self.is_union,
            ir_cache: self.ir_cache,
        }
    }
}

impl Default for TypeEnv {
    fn default() -> Self {
        TypeEnv::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_type_is_cached() {
        let mut env = TypeEnv::new();
        let int = env.int();
        let p1 = env.pointer_type(int);
        let p2 = env.pointer_type(int);
        assert_eq!(p1, p2);
    }

    #[test]
    fn array_type_is_cached_per_element_and_size() {
        let mut env = TypeEnv::new();
        let int = env.int();
        let a1 = env.array_type(int, Some(4));
        let a2 = env.array_type(int, Some(4));
        let a3 = env.array_type(int, Some(8));
        assert_eq!(a1, a2);
        assert_ne!(a1, a3);
    }

    #[test]
    fn struct_layout_inserts_padding_for_alignment() {
        // struct { char c; int i; } on LP64: c@0, 3 bytes padding, i@4, size 8.
        let mut env = TypeEnv::new();
        let char_ty = env.integer(IntRank::Char, true);
        let int_ty = env.int();
        let tag: Rc<str> = Rc::from("S");
        let id = env.declare_tag(tag, false);
        env.complete_struct(
            id,
            vec![("c".into(), char_ty), ("i".into(), int_ty)],
            false,
            &Position::new("<test>", 1, 1),
        )
        .unwrap();
        let struct_id = match env.kind(id) {
            CTypeKind::Struct(s) => *s,
            _ => unreachable!(),
        };
        let def = env.struct_def(struct_id);
        assert_eq!(def.fields[0].offset, 0);
        assert_eq!(def.fields[1].offset, 4);
        assert_eq!(def.size, 8);
        assert_eq!(def.align, 4);
    }

    #[test]
    fn union_layout_overlaps_fields_at_offset_zero() {
        let mut env = TypeEnv::new();
        let char_ty = env.integer(IntRank::Char, true);
        let int_ty = env.int();
        let id = env.declare_tag(Rc::from("U"), true);
        env.complete_struct(
            id,
            vec![("c".into(), char_ty), ("i".into(), int_ty)],
            false,
            &Position::new("<test>", 1, 1),
        )
        .unwrap();
        let struct_id = match env.kind(id) {
            CTypeKind::Struct(s) => *s,
            _ => unreachable!(),
        };
        let def = env.struct_def(struct_id);
        assert_eq!(def.fields[0].offset, 0);
        assert_eq!(def.fields[1].offset, 0);
        assert_eq!(def.size, 4);
    }

    #[test]
    fn sizeof_incomplete_array_is_an_error() {
        let mut env = TypeEnv::new();
        let int = env.int();
        let arr = env.array_type(int, None);
        assert!(env.size_of(arr, 8).is_err());
    }

    #[test]
    fn redefining_a_complete_struct_tag_errors() {
        let mut env = TypeEnv::new();
        let int = env.int();
        let id = env.declare_tag(Rc::from("S"), false);
        env.complete_struct(id, vec![("x".into(), int)], false, &Position::new("<test>", 1, 1))
            .unwrap();
        let err = env.complete_struct(id, vec![("y".into(), int)], false, &Position::new("<test>", 2, 1));
        assert!(err.is_err());
    }

    #[test]
    fn decay_turns_array_and_function_into_pointer() {
        let mut env = TypeEnv::new();
        let int = env.int();
        let arr = env.array_type(int, Some(3));
        let decayed = env.decay(arr);
        assert_eq!(env.pointee(decayed), Some(int));

        let fn_ty = env.function_type(int, vec![int], false);
        let decayed_fn = env.decay(fn_ty);
        assert!(env.is_pointer(decayed_fn));
    }
}
