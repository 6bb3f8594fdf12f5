#![forbid(unsafe_code)]

//! SPARQL algebra compilation and execution.
//!
//! An algebra tree ([`algebra::Op`]) is lowered by [`compiler::OpCompiler`]
//! into a tree of pull-based binding streams ([`stream::BindingStream`]).
//! Everything is evaluated against an in-memory [`dataset::Dataset`] held by
//! the query's [`context::ExecutionContext`].

/// Algebra operators, patterns and tables.
pub mod algebra;

/// Variable-to-term solution rows.
pub mod binding;

/// Streamability analysis for join and left-join operands.
pub mod classify;

/// Algebra-to-stream lowering.
pub mod compiler;

/// Compiler configuration and its TOML file format.
pub mod config;

/// Query-scoped state shared by every stage.
pub mod context;

/// Triples, graphs and datasets.
pub mod dataset;

/// Expression evaluation errors.
pub mod errors;

/// Compile-and-drain entry point.
pub mod executor;

/// Plan explanation trees.
pub mod explain;

/// Filter and assignment expressions.
pub mod expr;

/// Join, left-join, minus and optional-index stages.
pub mod join;

/// Basic graph pattern and property path matching.
pub mod pattern;

/// Procedures and property functions.
pub mod procedure;

/// Performance profiling for query operations.
///
/// Collects timing and count statistics to identify performance bottlenecks.
pub mod profile;

/// Filters, projections and solution modifiers.
pub mod relational;

/// Per-binding re-evaluation: union, GRAPH and the shared repeat loop.
pub mod repeat;

/// SERVICE evaluation.
pub mod service;

/// Binding stream contract and leaf streams.
pub mod stream;

/// RDF terms and variables.
pub mod term;

pub use algebra::Op;
pub use binding::Binding;
pub use compiler::{compile, compile_with_input, OpCompiler};
pub use config::CompilerConfig;
pub use context::ExecutionContext;
pub use executor::{Executor, QueryResult, ResultStream};

/// Execution plan output with explanation capabilities.
pub use explain::{explain, PlanExplain};
