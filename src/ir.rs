//! The downstream IR container and builder primitives.
//!
//! A real build of the toolchain hands this data to the backend code
//! generator, which is out of scope for this crate; what is in scope is
//! the *shape* the backend is contracted to accept and the handful of
//! builder methods the lowering engine drives it through. The instruction
//! set is a closed, renderless sum type, and functions collect their
//! instructions into blocks, with terminators and phis tracked explicitly
//! so the statement lowerer can build a real CFG instead of straight-line
//! code.

use std::fmt;

use serde::Serialize;

/// A type in the backend's type system. Struct/union payloads are handles
/// into `TransUnit::structs`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum IrType {
    Void,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    /// Untyped data pointer; the backend does not distinguish pointee types.
    Ptr,
    Array { elem: Box<IrType>, len: Option<u64> },
    Struct(StructId),
}

impl IrType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            IrType::I8
                | IrType::I16
                | IrType::I32
                | IrType::I64
                | IrType::U8
                | IrType::U16
                | IrType::U32
                | IrType::U64
        )
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Void => write!(f, "void"),
            IrType::I8 => write!(f, "i8"),
            IrType::I16 => write!(f, "i16"),
            IrType::I32 => write!(f, "i32"),
            IrType::I64 => write!(f, "i64"),
            IrType::U8 => write!(f, "u8"),
            IrType::U16 => write!(f, "u16"),
            IrType::U32 => write!(f, "u32"),
            IrType::U64 => write!(f, "u64"),
            IrType::Ptr => write!(f, "ptr"),
            IrType::Array { elem, len } => match len {
                Some(len) => write!(f, "[{elem} x {len}]"),
                None => write!(f, "[{elem} x ?]"),
            },
            IrType::Struct(id) => write!(f, "%struct.{}", id.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StructId(pub u32);

#[derive(Debug, Clone)]
pub struct StructIrDef {
    pub name: String,
    pub fields: Vec<IrType>,
    pub size: u64,
    pub align: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FunctionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GlobalId(pub u32);

/// An operand: either a value produced by a previous instruction in the
/// current function, or a constant known at lowering time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum IrValue {
    Value(ValueId),
    /// The function's `n`th incoming argument.
    Param(u32),
    ConstInt { value: i128, ty: IrType },
    ConstNull,
    GlobalAddr(String),
}

impl IrValue {
    pub fn const_int(value: i128, ty: IrType) -> Self {
        IrValue::ConstInt { value, ty }
    }

    /// A compile-time-constant value is one the constant evaluator
    /// is allowed to fold without touching the current function's blocks.
    pub fn is_compile_time_constant(&self) -> bool {
        matches!(
            self,
            IrValue::ConstInt { .. } | IrValue::ConstNull | IrValue::GlobalAddr(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CmpOp {
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConvertOp {
    Trunc,
    ZExt,
    SExt,
    IntToPtr,
    PtrToInt,
    Bitcast,
}

#[derive(Debug, Clone, Serialize)]
pub enum InstrKind {
    Local { ty: IrType },
    Load { ptr: IrValue, ty: IrType },
    Store { ptr: IrValue, value: IrValue },
    Binary { op: BinOp, lhs: IrValue, rhs: IrValue },
    Unary { op: UnOp, operand: IrValue },
    Convert { op: ConvertOp, operand: IrValue },
    Cmp { op: CmpOp, lhs: IrValue, rhs: IrValue },
    /// Address of a field/element: `aggregate_ptr + offset(index)`.
    Field {
        aggregate: IrValue,
        aggregate_ty: IrType,
        index: u64,
    },
    Call {
        callee: IrValue,
        args: Vec<IrValue>,
    },
    Phi {
        incoming: Vec<Option<(BlockId, IrValue)>>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Instr {
    pub result: ValueId,
    pub ty: IrType,
    pub kind: InstrKind,
}

#[derive(Debug, Clone, Serialize)]
pub enum Terminator {
    Ret(IrValue),
    RetVoid,
    Branch(BlockId),
    CondBranch {
        cond: IrValue,
        then_bb: BlockId,
        else_bb: BlockId,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    pub instrs: Vec<Instr>,
    pub term: Option<Terminator>,
}

impl Block {
    /// Every basic block must end in exactly one terminator.
    pub fn is_terminated(&self) -> bool {
        self.term.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Linkage {
    Global,
    Local,
    External,
}

#[derive(Debug, Clone, Serialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<IrType>,
    pub ret: IrType,
    pub variadic: bool,
    pub linkage: Linkage,
    /// `None` for a prototype with no body yet (an un-emitted inline
    /// function, or a plain forward declaration).
    pub blocks: Vec<Block>,
    next_value: u32,
    next_block: u32,
    current_block: Option<BlockId>,
}

impl Function {
    fn new_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    fn block_mut(&mut self, id: BlockId) -> &mut Block {
        self.blocks
            .iter_mut()
            .find(|b| b.id == id)
            .expect("block id valid within its own function")
    }

    pub fn block(&self, id: BlockId) -> &Block {
        self.blocks
            .iter()
            .find(|b| b.id == id)
            .expect("block id valid within its own function")
    }

    pub fn current_block_id(&self) -> BlockId {
        self.current_block.expect("a current block is set")
    }

    pub fn current_block(&self) -> &Block {
        self.block(self.current_block_id())
    }

    pub fn current_is_terminated(&self) -> bool {
        self.current_block().is_terminated()
    }

    /// Append a new basic block to the current function.
    /// The block is appended to emission order immediately; callers that
    /// need a forward-referenced target (loop `after`, switch `default`)
    /// allocate it here and only move the builder's cursor to it later.
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.push(Block {
            id,
            name: name.into(),
            instrs: Vec::new(),
            term: None,
        });
        id
    }

    pub fn set_current_block(&mut self, id: BlockId) {
        self.current_block = Some(id);
    }

    fn push(&mut self, ty: IrType, kind: InstrKind) -> IrValue {
        let result = self.new_value();
        let cur = self.current_block_id();
        self.block_mut(cur).instrs.push(Instr { result, ty, kind });
        IrValue::Value(result)
    }

    /// Allocate a stack slot, yield its pointer value.
    pub fn build_local(&mut self, ty: IrType) -> IrValue {
        self.push(IrType::Ptr, InstrKind::Local { ty })
    }

    pub fn build_load(&mut self, ptr: IrValue, ty: IrType) -> IrValue {
        self.push(ty.clone(), InstrKind::Load { ptr, ty })
    }

    pub fn build_store(&mut self, ptr: IrValue, value: IrValue) {
        let cur = self.current_block_id();
        let result = self.new_value();
        self.block_mut(cur).instrs.push(Instr {
            result,
            ty: IrType::Void,
            kind: InstrKind::Store { ptr, value },
        });
    }

    pub fn build_binary_instr(&mut self, op: BinOp, lhs: IrValue, rhs: IrValue, ty: IrType) -> IrValue {
        self.push(ty, InstrKind::Binary { op, lhs, rhs })
    }

    pub fn build_unary_instr(&mut self, op: UnOp, operand: IrValue, ty: IrType) -> IrValue {
        self.push(ty, InstrKind::Unary { op, operand })
    }

    pub fn build_type_instr(&mut self, op: ConvertOp, operand: IrValue, ty: IrType) -> IrValue {
        self.push(ty, InstrKind::Convert { op, operand })
    }

    /// Comparisons produce a boolean, represented as `i32` (the type `==`,
    /// `<`, ... yield in C before any further usual-arithmetic conversion).
    pub fn build_cmp(&mut self, op: CmpOp, lhs: IrValue, rhs: IrValue) -> IrValue {
        self.push(IrType::I32, InstrKind::Cmp { op, lhs, rhs })
    }

    /// Address of a field/element of an aggregate.
    pub fn build_field(&mut self, aggregate: IrValue, aggregate_ty: IrType, index: u64) -> IrValue {
        self.push(
            IrType::Ptr,
            InstrKind::Field {
                aggregate,
                aggregate_ty,
                index,
            },
        )
    }

    pub fn build_call(&mut self, callee: IrValue, ret_ty: IrType, args: Vec<IrValue>) -> IrValue {
        self.push(ret_ty, InstrKind::Call { callee, args })
    }

    /// Allocate a phi with `arity` empty
    /// incoming slots, to be filled in one predecessor block at a time.
    pub fn build_phi(&mut self, ty: IrType, arity: usize) -> IrValue {
        self.push(
            ty,
            InstrKind::Phi {
                incoming: vec![None; arity],
            },
        )
    }

    pub fn phi_set_param(&mut self, phi: IrValue, index: usize, block: BlockId, value: IrValue) {
        let IrValue::Value(id) = phi else {
            panic!("phi_set_param given a non-instruction value");
        };
        let cur = self.current_block_id();
        // Phis are always built in the merge block itself, so search there
        // first, then fall back to a full scan (a phi may be referenced
        // from a predecessor emitted before the merge block in source
        // order).
        let instr = self
            .block_mut(cur)
            .instrs
            .iter_mut()
            .find(|i| i.result == id)
            .or_else(|| {
                self.blocks
                    .iter_mut()
                    .flat_map(|b| b.instrs.iter_mut())
                    .find(|i| i.result == id)
            })
            .expect("phi value exists");
        let InstrKind::Phi { incoming } = &mut instr.kind else {
            panic!("phi_set_param given a non-phi instruction");
        };
        incoming[index] = Some((block, value));
    }

    pub fn build_branch(&mut self, target: BlockId) {
        let cur = self.current_block_id();
        self.block_mut(cur).term = Some(Terminator::Branch(target));
    }

    pub fn build_cond(&mut self, cond: IrValue, then_bb: BlockId, else_bb: BlockId) {
        let cur = self.current_block_id();
        self.block_mut(cur).term = Some(Terminator::CondBranch {
            cond,
            then_bb,
            else_bb,
        });
    }

    pub fn build_ret(&mut self, value: IrValue) {
        let cur = self.current_block_id();
        self.block_mut(cur).term = Some(Terminator::Ret(value));
    }

    pub fn build_ret_void(&mut self) {
        let cur = self.current_block_id();
        self.block_mut(cur).term = Some(Terminator::RetVoid);
    }

    /// `__builtin_memcpy`/`__builtin_memset`: lowered as plain calls to the
    /// runtime helper symbols the backend links in.
    pub fn builtin_memcpy(&mut self, dst: IrValue, src: IrValue, len: IrValue) {
        let callee = IrValue::GlobalAddr("memcpy".to_string());
        self.build_call(callee, IrType::Ptr, vec![dst, src, len]);
    }

    pub fn builtin_memset(&mut self, dst: IrValue, value: IrValue, len: IrValue) {
        let callee = IrValue::GlobalAddr("memset".to_string());
        self.build_call(callee, IrType::Ptr, vec![dst, value, len]);
    }

    /// `__builtin_va_start`: a no-op marker call; the exact ABI is left to
    /// the backend.
    pub fn build_builtin_va_start(&mut self, va_list_ptr: IrValue) {
        let callee = IrValue::GlobalAddr("__builtin_va_start".to_string());
        self.build_call(callee, IrType::Void, vec![va_list_ptr]);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum IrConst {
    Int { value: i128, ty: IrType },
    Array(Vec<IrConst>),
    Struct(Vec<IrConst>),
    GlobalAddr(String),
    Zero(IrType),
}

#[derive(Debug, Clone, Serialize)]
pub struct Global {
    pub name: String,
    pub ty: IrType,
    pub linkage: Linkage,
    pub is_extern: bool,
    pub init: Option<IrConst>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransUnit {
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    #[serde(skip)]
    pub structs: Vec<StructIrDef>,
    string_literal_count: u32,
}

impl TransUnit {
    pub fn new() -> Self {
        TransUnit::default()
    }

    /// Register a function prototype. The
    /// body (if any) is attached later via `add_init_to_function`, once
    /// the statement lowerer has built its blocks — this lets the driver
    /// register every global function binding (for forward references)
    /// before lowering any body.
    pub fn trans_unit_add_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<IrType>,
        ret: IrType,
        variadic: bool,
        linkage: Linkage,
    ) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(Function {
            name: name.into(),
            params,
            ret,
            variadic,
            linkage,
            blocks: Vec::new(),
            next_value: 0,
            next_block: 0,
            current_block: None,
        });
        id
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn find_function(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FunctionId(i as u32))
    }

    /// Attaches the blocks built by the statement lowerer to a previously
    /// registered function.
    pub fn add_init_to_function(&mut self, id: FunctionId, entry: BlockId) {
        self.function_mut(id).set_current_block(entry);
    }

    pub fn trans_unit_add_var(
        &mut self,
        name: impl Into<String>,
        ty: IrType,
        linkage: Linkage,
        is_extern: bool,
        init: Option<IrConst>,
    ) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(Global {
            name: name.into(),
            ty,
            linkage,
            is_extern,
            init,
        });
        id
    }

    pub fn find_global(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| g.name == name)
            .map(|i| GlobalId(i as u32))
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut Global {
        &mut self.globals[id.0 as usize]
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.0 as usize]
    }

    pub fn trans_unit_add_struct(
        &mut self,
        name: impl Into<String>,
        fields: Vec<IrType>,
        size: u64,
        align: u64,
    ) -> StructId {
        let id = StructId(self.structs.len() as u32);
        self.structs.push(StructIrDef {
            name: name.into(),
            fields,
            size,
            align,
        });
        id
    }

    pub fn struct_def(&self, id: StructId) -> &StructIrDef {
        &self.structs[id.0 as usize]
    }

    pub fn add_int_const(&self, value: i128, ty: IrType) -> IrConst {
        IrConst::Int { value, ty }
    }

    pub fn add_array_const(&self, items: Vec<IrConst>) -> IrConst {
        IrConst::Array(items)
    }

    pub fn add_struct_const(&self, items: Vec<IrConst>) -> IrConst {
        IrConst::Struct(items)
    }

    pub fn add_global_const(&self, name: impl Into<String>) -> IrConst {
        IrConst::GlobalAddr(name.into())
    }

    /// Completes an incomplete array type's length.
    pub fn set_array_type_length(&self, ty: &IrType, len: u64) -> IrType {
        match ty {
            IrType::Array { elem, .. } => IrType::Array {
                elem: elem.clone(),
                len: Some(len),
            },
            other => other.clone(),
        }
    }

    pub fn size_of_ir_type(&self, ty: &IrType, pointer_width: u64) -> u64 {
        match ty {
            IrType::Void => 0,
            IrType::I8 | IrType::U8 => 1,
            IrType::I16 | IrType::U16 => 2,
            IrType::I32 | IrType::U32 => 4,
            IrType::I64 | IrType::U64 => 8,
            IrType::Ptr => pointer_width,
            IrType::Array { elem, len } => {
                self.size_of_ir_type(elem, pointer_width) * len.unwrap_or(0)
            }
            IrType::Struct(id) => self.struct_def(*id).size,
        }
    }

    pub fn align_of_ir_type(&self, ty: &IrType, pointer_width: u64) -> u64 {
        match ty {
            IrType::Array { elem, .. } => self.align_of_ir_type(elem, pointer_width),
            IrType::Struct(id) => self.struct_def(*id).align,
            other => self.size_of_ir_type(other, pointer_width).max(1),
        }
    }

    /// Symbol naming for synthesized string-literal globals.
    pub fn fresh_string_literal_name(&mut self) -> String {
        let name = format!("__string_literal_{:x}", self.string_literal_count);
        self.string_literal_count += 1;
        name
    }
}
