//! Error types for the IR-generation core.
//!
//! The core distinguishes three failure classes : a
//! program that violates C's static semantics, a C feature this core does
//! not implement, and an internal consistency violation (a bug in the core
//! itself, never a property of the input program).

use std::fmt;

/// Best-effort source location, copied verbatim from the AST node that
/// triggered an error. The core never synthesizes a position of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Position {
    pub file: std::rc::Rc<str>,
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(file: impl Into<std::rc::Rc<str>>, line: usize, column: usize) -> Self {
        Position {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    /// The program is ill-formed: duplicate identifier, unknown identifier,
    /// incompatible types, use of an incomplete type where a size is
    /// required, redefinition of a complete tagged type, etc.
    #[error("{message} ({position})")]
    IllFormed { message: String, position: Position },

    /// A real C construct the core does not implement (bit-fields,
    /// `_Complex`, VLA-scoped goto, unsupported comparison shapes, ...).
    #[error("unimplemented: {construct} ({position})")]
    Unimplemented {
        construct: String,
        position: Position,
    },

    /// The core violated one of its own invariants (missing terminator,
    /// phi/predecessor mismatch, arena exhaustion). Always a bug.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl LowerError {
    pub fn ill_formed(message: impl Into<String>, position: Position) -> Self {
        LowerError::IllFormed {
            message: message.into(),
            position,
        }
    }

    pub fn unimplemented(construct: impl Into<String>, position: Position) -> Self {
        LowerError::Unimplemented {
            construct: construct.into(),
            position,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        LowerError::Internal {
            message: message.into(),
        }
    }
}

pub type LowerResult<T> = Result<T, LowerError>;
