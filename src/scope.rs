//! Lexical scoping for identifiers.
//!
//! A stack of frames searched back-to-front via `enter_scope`/`exit_scope`,
//! with a `contains_in_current_scope` check for catching duplicate
//! declarations within the same block.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ir::{FunctionId, GlobalId, ValueId};
use crate::types::TypeId;

/// What an identifier resolves to once bound.
#[derive(Debug, Clone)]
pub enum Binding {
    /// A local variable or parameter: its C type, and the IR pointer value
    /// of the stack slot `build_local` allocated for it.
    Local { ty: TypeId, slot: ValueId },
    /// A file-scope variable, referenced by its global symbol.
    Global { ty: TypeId, id: GlobalId },
    /// A function, referenced by its registered prototype.
    Function { ty: TypeId, id: FunctionId },
    /// An enumerator constant: not an lvalue, just an `int` value.
    EnumConst { value: i128 },
    /// A `typedef` name, resolving to the type it stands for.
    Typedef { ty: TypeId },
}

pub struct Scope {
    frames: Vec<HashMap<Rc<str>, Binding>>,
}

impl Scope {
    pub fn new() -> Self {
        Scope {
            frames: vec![HashMap::new()],
        }
    }

    pub fn enter_scope(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub fn exit_scope(&mut self) {
        self.frames.pop();
        debug_assert!(!self.frames.is_empty(), "popped the file-scope frame");
    }

    /// Binds `name` in the current (innermost) frame. Returns `false` if
    /// `name` is already bound in this same frame (a redeclaration error at
    /// the call site), matching C's one-binding-per-block-scope rule.
    pub fn bind(&mut self, name: Rc<str>, binding: Binding) -> bool {
        let frame = self.frames.last_mut().expect("at least one frame");
        if frame.contains_key(&name) {
            return false;
        }
        frame.insert(name, binding);
        true
    }

    pub fn contains_in_current_scope(&self, name: &str) -> bool {
        self.frames
            .last()
            .expect("at least one frame")
            .contains_key(name)
    }

    /// Searches frames innermost-first, matching normal C shadowing rules.
    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    pub fn is_file_scope(&self) -> bool {
        self.frames.len() == 1
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeId;

    fn local(n: u32) -> Binding {
        Binding::Local {
            ty: TypeId(0),
            slot: ValueId(n),
        }
    }

    #[test]
    fn inner_scope_shadows_outer_binding() {
        let mut scope = Scope::new();
        assert!(scope.bind(Rc::from("x"), local(1)));
        scope.enter_scope();
        assert!(scope.bind(Rc::from("x"), local(2)));
        match scope.lookup("x") {
            Some(Binding::Local { slot, .. }) => assert_eq!(*slot, ValueId(2)),
            other => panic!("expected inner binding, got {other:?}"),
        }
        scope.exit_scope();
        match scope.lookup("x") {
            Some(Binding::Local { slot, .. }) => assert_eq!(*slot, ValueId(1)),
            other => panic!("expected outer binding restored, got {other:?}"),
        }
    }

    #[test]
    fn rebinding_in_same_frame_is_rejected() {
        let mut scope = Scope::new();
        assert!(scope.bind(Rc::from("x"), local(1)));
        assert!(!scope.bind(Rc::from("x"), local(2)));
    }

    #[test]
    fn contains_in_current_scope_ignores_outer_frames() {
        let mut scope = Scope::new();
        scope.bind(Rc::from("x"), local(1));
        scope.enter_scope();
        assert!(!scope.contains_in_current_scope("x"));
        scope.bind(Rc::from("y"), local(2));
        assert!(scope.contains_in_current_scope("y"));
    }

    #[test]
    fn file_scope_flag_tracks_frame_depth() {
        let mut scope = Scope::new();
        assert!(scope.is_file_scope());
        scope.enter_scope();
        assert!(!scope.is_file_scope());
        scope.exit_scope();
        assert!(scope.is_file_scope());
    }
}
