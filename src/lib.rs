//! Sombra algebra engine: compiles SPARQL algebra trees into pull-based
//! binding streams and evaluates them over in-memory RDF datasets.

#![warn(missing_docs)]

pub mod query;
pub mod types;
