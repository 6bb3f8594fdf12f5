#![forbid(unsafe_code)]

//! Crate-wide error and result types.

/// Errors raised while compiling or driving a physical plan.
#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    /// Structurally invalid input.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Algebra construct the compiler deliberately does not lower.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    /// Extension operator declined to evaluate.
    #[error("encountered unsupported extension operator: {name}")]
    UnsupportedExtension {
        /// Identifying name reported by the extension.
        name: String,
    },
    /// Procedure or property function name has no registered factory.
    #[error("no such procedure: {name}")]
    UnknownProcedure {
        /// Procedure IRI.
        name: String,
    },
    /// Procedure failed while building or applying to a binding.
    #[error("procedure {name} failed: {message}")]
    Procedure {
        /// Procedure IRI.
        name: String,
        /// Failure description.
        message: String,
    },
    /// Remote or federated evaluation failed.
    #[error("service {endpoint} failed: {message}")]
    Service {
        /// Endpoint the sub-query was sent to.
        endpoint: String,
        /// Failure description.
        message: String,
    },
    /// Cancellation token was raised while a stage was working.
    #[error("query cancelled")]
    Cancelled,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SombraError>;
