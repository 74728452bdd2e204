//! The mutable lowering environment.
//!
//! Bundles every piece of state the lowering passes thread through by
//! `&mut` reference instead of reaching for globals: the builder cursor,
//! the scope stack, and the auxiliary tables (labels, switch cases,
//! deferred inline bodies) each pass needs.

use std::collections::HashMap;
use std::rc::Rc;

use log::trace;

use crate::ast::{Node, Statement};
use crate::ir::{BlockId, FunctionId, IrValue, TransUnit};
use crate::scope::Scope;
use crate::types::TypeId;

/// Target-configuration knobs this core needs. A real
/// toolchain would read these from a triple; here they default to a plain
/// LP64 target, the only configuration this core is asked to support.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub pointer_width: u64,
    pub char_signed: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            pointer_width: 8,
            char_signed: true,
        }
    }
}

/// One nested loop's break/continue targets.
#[derive(Debug, Clone, Copy)]
pub struct LoopCtx {
    pub break_target: BlockId,
    pub continue_target: BlockId,
}

/// One nested `switch`'s accumulated case list, built while its body is
/// lowered and only turned into a compare chain once the body is fully
/// walked.
pub struct SwitchCtx {
    pub controlling_ty: TypeId,
    pub cases: Vec<(i128, BlockId)>,
    pub default: Option<BlockId>,
    pub break_target: BlockId,
}

/// A single entry on the breakable-construct stack. `break` always targets
/// the top entry regardless of its kind; `continue` skips `Switch` entries
/// and targets the nearest `Loop` below them, matching C's rule that a
/// `switch` does not intercept `continue` from its body.
enum Breakable {
    Loop(LoopCtx),
    Switch(SwitchCtx),
}

/// A function whose body lowering was deferred because it is `inline`:
/// the driver lowers these only after every other top-level declaration
/// so mutually-inlining functions can still forward-reference each
/// other's prototypes.
pub struct DeferredInline {
    pub function_id: FunctionId,
    pub body: Node<Statement>,
    pub return_ty: TypeId,
    pub param_names: Vec<Rc<str>>,
    pub param_tys: Vec<TypeId>,
}

/// The full mutable lowering state threaded through every pass.
pub struct Env {
    pub scope: Scope,
    pub types: crate::types::TypeEnv,
    pub options: Options,

    /// The function currently being lowered into, and its C return type
    /// (used to convert the operand of every `return` to the right type).
    pub current_function: Option<FunctionId>,
    pub current_return_ty: Option<TypeId>,

    /// The implicit sret pointer (`Param(0)`) of the function currently
    /// being lowered, when its return type is a struct. `return expr;` memcpy's into this instead of
    /// building a value return.
    pub sret_ptr: Option<IrValue>,

    /// Disambiguates the hidden global symbol generated for each `static`
    /// local variable, since two different functions may each declare a
    /// local named `count`.
    static_local_count: u32,

    breakables: Vec<Breakable>,

    /// Pre-allocated block per label name in the function currently being
    /// lowered, populated by a pre-pass over the body before statement
    /// lowering starts. A
    /// `goto` always has a concrete branch target to build against, even
    /// before the labeled statement itself has been lowered.
    pub labels: HashMap<Rc<str>, BlockId>,

    pub deferred_inlines: Vec<DeferredInline>,

    /// A scratch function used by the constant-expression evaluator and by
    /// `sizeof`'s operand-typing pass: instructions may be
    /// built against it to discover a sub-expression's type, then thrown
    /// away, without touching the real function under construction.
    scratch: FunctionId,
}

impl Env {
    pub fn new(tu: &mut TransUnit, options: Options) -> Self {
        let scratch = tu.trans_unit_add_function(
            "__scratch",
            Vec::new(),
            crate::ir::IrType::Void,
            false,
            crate::ir::Linkage::Local,
        );
        let entry = tu.function_mut(scratch).add_block("scratch");
        tu.function_mut(scratch).set_current_block(entry);

        Env {
            scope: Scope::new(),
            types: crate::types::TypeEnv::new(),
            options,
            current_function: None,
            current_return_ty: None,
            sret_ptr: None,
            static_local_count: 0,
            breakables: Vec::new(),
            labels: HashMap::new(),
            deferred_inlines: Vec::new(),
            scratch,
        }
    }

    pub fn scratch_function(&self) -> FunctionId {
        self.scratch
    }

    /// A fresh, unique symbol name for a `static` local variable named
    /// `base`.
    pub fn fresh_static_local_name(&mut self, base: &str) -> String {
        let n = self.static_local_count;
        self.static_local_count += 1;
        format!("{base}.{n}")
    }

    /// Runs `f` with the current function swapped for the scratch function,
    /// for sandboxed type-only lowering. Each run gets a fresh block of
    /// the scratch function so earlier sandbox runs cannot interfere with
    /// later ones within the same translation unit; the scratch function
    /// itself is never part of the emitted output (the driver drops it).
    pub fn with_scratch<T>(
        &mut self,
        tu: &mut TransUnit,
        f: impl FnOnce(&mut Env, &mut TransUnit) -> T,
    ) -> T {
        let saved_function = self.current_function;
        let fresh = tu.function_mut(self.scratch).add_block("scratch");
        tu.function_mut(self.scratch).set_current_block(fresh);
        self.current_function = Some(self.scratch);
        let result = f(self, tu);
        self.current_function = saved_function;
        result
    }

    pub fn enter_loop(&mut self, break_target: BlockId, continue_target: BlockId) {
        trace!("enter_loop break={break_target:?} continue={continue_target:?}");
        self.breakables.push(Breakable::Loop(LoopCtx {
            break_target,
            continue_target,
        }));
    }

    pub fn exit_loop(&mut self) {
        match self.breakables.pop() {
            Some(Breakable::Loop(_)) => {}
            _ => panic!("exit_loop called without a matching enter_loop"),
        }
    }

    pub fn enter_switch(&mut self, controlling_ty: TypeId, break_target: BlockId) {
        self.breakables.push(Breakable::Switch(SwitchCtx {
            controlling_ty,
            cases: Vec::new(),
            default: None,
            break_target,
        }));
    }

    pub fn exit_switch(&mut self) -> SwitchCtx {
        match self.breakables.pop() {
            Some(Breakable::Switch(ctx)) => ctx,
            _ => panic!("exit_switch called without a matching enter_switch"),
        }
    }

    pub fn current_switch_mut(&mut self) -> Option<&mut SwitchCtx> {
        self.breakables.iter_mut().rev().find_map(|b| match b {
            Breakable::Switch(ctx) => Some(ctx),
            Breakable::Loop(_) => None,
        })
    }

    /// `break`'s target: the nearest enclosing loop or switch, whichever is
    /// innermost by lowering order.
    pub fn break_target(&self) -> Option<BlockId> {
        self.breakables.last().map(|b| match b {
            Breakable::Loop(l) => l.break_target,
            Breakable::Switch(s) => s.break_target,
        })
    }

    /// `continue`'s target: the nearest enclosing loop, skipping over any
    /// intervening `switch` (a `switch` body does not intercept `continue`).
    pub fn continue_target(&self) -> Option<BlockId> {
        self.breakables.iter().rev().find_map(|b| match b {
            Breakable::Loop(l) => Some(l.continue_target),
            Breakable::Switch(_) => None,
        })
    }
}
