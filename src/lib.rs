//! Lambdaquery: compiles predicate and selector closures into document-store query pipelines.
//!
//! Callers hand over the decoded instruction stream of a small closure such as
//! `lambda x: x.gpa >= 10 and x.last_name == "Fenske"`. The crate rebuilds the
//! closure's expression tree from those instructions and translates it into the
//! operator documents an aggregation-pipeline engine understands.
//!
//! # Architecture
//! - Instruction decoding (`instruction`, `listing`)
//! - Instruction stack machine (`stack`)
//! - Bytecode decompilation into an expression AST (`decompiler`, `ast`)
//! - Translation of the AST into query representations (`translator`, `compiler`)
//! - Pipeline stage builders and fluent querying (`pipeline`, `query`)
//! - Collection models and an in-memory executor (`model`, `memory`)

mod ast;
mod compiler;
mod decompiler;
mod instruction;
mod listing;
mod memory;
mod model;
mod pipeline;
mod query;
mod stack;
mod translator;
mod types;

pub use ast::*;
pub use compiler::*;
pub use decompiler::*;
pub use instruction::*;
pub use listing::*;
pub use memory::*;
pub use model::*;
pub use pipeline::*;
pub use query::*;
pub use stack::*;
pub use translator::*;
pub use types::*;

use thiserror::Error;

/// Unified error type for Lambdaquery operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LambdaQueryError {
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),
    #[error("Unsupported projection: {0}")]
    UnsupportedProjection(String),
    #[error("Malformed closure: {0}")]
    MalformedClosure(String),
    #[error("Unsupported expression: {0}")]
    UnsupportedExpression(String),
    #[error("Listing error: {0}")]
    ListingError(String),
    #[error("Invalid model: {0}")]
    InvalidModel(String),
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("Sequence contains no elements")]
    NoElements,
    #[error("Sequence contains more than one matching element")]
    MoreThanOneElement,
}
