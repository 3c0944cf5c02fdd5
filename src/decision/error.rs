//! Error definitions for decision models and their evaluation

use thiserror::Error;

/// Errors raised while loading or evaluating decision models
#[derive(Debug, Error)]
pub enum DecisionError {
    /// The model file could not be read
    #[error("Model I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The model file is not valid TOML or does not match the model layout
    #[error("Model parse error: {0}")]
    ModelParse(String),

    /// A rule cell could not be parsed as a unary test
    #[error("Invalid unary test '{expression}': {reason}")]
    InvalidUnaryTest { expression: String, reason: String },

    /// Structural problem in a decision table (arity, empty clauses, ...)
    #[error("Invalid decision table '{table}': {reason}")]
    InvalidTable { table: String, reason: String },

    /// Two model files declare the same namespace and name
    #[error("Duplicate decision model: {0}")]
    DuplicateModel(String),

    /// An input value does not match the declared type of its clause
    #[error("Input '{input}' expected {expected}, got {actual}")]
    InputType {
        input: String,
        expected: String,
        actual: String,
    },

    /// Matching rules violate the table's hit policy
    #[error("Hit policy violation in '{table}': {reason}")]
    HitPolicyViolation { table: String, reason: String },

    /// The result context lacks the requested output
    #[error("Decision output '{0}' is missing or null")]
    MissingOutput(String),

    /// The requested output exists but cannot be used as a classification
    #[error("Decision output '{name}' is unusable: {reason}")]
    InvalidOutput { name: String, reason: String },

    /// Any other failure raised by an evaluator backend
    #[error("Evaluation error: {0}")]
    Evaluation(String),
}
