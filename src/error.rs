//! Error taxonomy for the execution engine.
//!
//! Every variant is local to a step or a case: the runner turns them into
//! failed results instead of aborting the run. Transport failures are kept
//! apart in [`TransportError`] because they are captured per call and
//! decide whether the rest of a case short-circuits.

use thiserror::Error;

use crate::model::CaseId;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Malformed `${name(args)}` expression.
    #[error("parse error in '{input}': {message}")]
    Parse { input: String, message: String },

    #[error("variable '${name}' is not defined in scope")]
    UnresolvedVariable { name: String },

    #[error("function '{name}' is not registered")]
    UnknownFunction { name: String },

    /// A registered function was found but failed while running.
    #[error("function '{name}' failed: {message}")]
    FunctionCall { name: String, message: String },

    #[error("cyclic case reference: {}", format_chain(chain))]
    CyclicReference { chain: Vec<CaseId> },

    #[error("case {id} does not exist")]
    UnknownCase { id: CaseId },

    #[error("script '{name}' is not available")]
    UnknownScript { name: String },

    /// A script resource failed to compile.
    #[error("script '{namespace}' failed to compile: {message}")]
    Script { namespace: String, message: String },

    #[error("unsupported expected type '{name}'")]
    DeclaredType { name: String },

    #[error("cannot coerce {value} to {expected_type}: {message}")]
    Coercion {
        value: String,
        expected_type: String,
        message: String,
    },

    /// A `skip_if` predicate could not be evaluated.
    #[error("predicate '{expr}' failed: {message}")]
    Predicate { expr: String, message: String },

    #[error("extraction of '{name}' failed: {message}")]
    Extraction { name: String, message: String },

    /// A request could not be assembled from the substituted step.
    #[error("cannot build request: {message}")]
    Build { message: String },
}

impl EngineError {
    pub(crate) fn parse(
        input: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Parse {
            input: input.into(),
            message: message.into(),
        }
    }

    pub(crate) fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
        }
    }
}

fn format_chain(chain: &[CaseId]) -> String {
    chain
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failure to complete a network call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request timed out after {timeout_secs}s: {message}")]
    Timeout { timeout_secs: u64, message: String },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("cannot read file '{path}' for field '{field}': {message}")]
    File {
        field: String,
        path: String,
        message: String,
    },

    #[error("request failed: {0}")]
    Other(String),
}
