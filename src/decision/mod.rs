//! Decision evaluation for sensor readings.
//!
//! The relay only sees [`DecisionEvaluator`]: named inputs in, named outputs
//! out. The bundled backend evaluates decision tables read from TOML model
//! files; plain closures work as well, which keeps tests and alternative
//! backends out of the relay.
//!
//! ```text
//! decision/
//! ├── feel.rs     - unary tests used in rule input entries
//! ├── table.rs    - decision tables and hit policies
//! ├── model.rs    - one model file = ordered set of tables
//! ├── runtime.rs  - model registry keyed by namespace and name
//! └── error.rs
//! ```

pub mod error;
pub mod feel;
pub mod model;
pub mod runtime;
pub mod table;

pub use error::DecisionError;
pub use model::{DecisionModel, ModelKey};
pub use runtime::DecisionRuntime;
pub use table::{DecisionTable, HitPolicy};

use serde_json::Value;
use std::collections::BTreeMap;

/// Named values passed into and returned from an evaluation
pub type DecisionContext = BTreeMap<String, Value>;

/// Backend that turns named inputs into named outputs
pub trait DecisionEvaluator: Send + Sync + 'static {
    fn evaluate(&self, inputs: &DecisionContext) -> Result<DecisionContext, DecisionError>;

    /// Human readable identification for logs
    fn describe(&self) -> String {
        "decision evaluator".to_string()
    }
}

impl<F> DecisionEvaluator for F
where
    F: Fn(&DecisionContext) -> Result<DecisionContext, DecisionError> + Send + Sync + 'static,
{
    fn evaluate(&self, inputs: &DecisionContext) -> Result<DecisionContext, DecisionError> {
        self(inputs)
    }

    fn describe(&self) -> String {
        "function evaluator".to_string()
    }
}
