#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

use crate::query::term::Var;

/// Row-level expression evaluation failures.
///
/// A filter stage treats any of these as "drop the row"; assignment,
/// ordering, and aggregation treat them as "leave unbound".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// Expression referenced a variable the row does not bind.
    #[error("variable {var} is unbound")]
    Unbound { var: Var },
    /// Operand types do not support the operator.
    #[error("type error: {context}")]
    TypeMismatch { context: &'static str },
    /// Term has no effective boolean value.
    #[error("no effective boolean value for {term}")]
    NoBooleanValue { term: String },
    /// Integer division by zero.
    #[error("division by zero")]
    DivideByZero,
    /// Integer arithmetic overflowed.
    #[error("arithmetic overflow")]
    Overflow,
    /// Function IRI is not registered.
    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },
    /// Function was called with the wrong number of arguments.
    #[error("function '{name}' expects {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },
}

impl EvalError {
    /// Builds an [`EvalError::Unbound`] for `var`.
    pub fn unbound(var: &Var) -> Self {
        EvalError::Unbound { var: var.clone() }
    }

    /// Builds an [`EvalError::TypeMismatch`].
    pub fn type_mismatch(context: &'static str) -> Self {
        EvalError::TypeMismatch { context }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            EvalError::Unbound { .. } => "Unbound",
            EvalError::TypeMismatch { .. } => "TypeMismatch",
            EvalError::NoBooleanValue { .. } => "TypeMismatch",
            EvalError::DivideByZero => "DivideByZero",
            EvalError::Overflow => "Overflow",
            EvalError::UnknownFunction { .. } => "UnknownFunction",
            EvalError::Arity { .. } => "Arity",
        }
    }
}

/// Convenience wrapper that formats evaluation errors with their codes.
pub struct EvalErrorWithCode<'a>(pub &'a EvalError);

impl fmt::Display for EvalErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}
