//! Decision models: a named set of decision tables loaded from one TOML file

use super::table::{DecisionTable, DecisionTableDef};
use super::{DecisionContext, DecisionError, DecisionEvaluator};
use serde::Deserialize;
use std::fmt;
use tracing::debug;

/// Identifies a model the same way the model file does
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    pub namespace: String,
    pub name: String,
}

impl ModelKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.namespace, self.name)
    }
}

#[derive(Debug, Deserialize)]
struct DecisionModelDef {
    namespace: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "decision", default)]
    decisions: Vec<DecisionTableDef>,
}

#[derive(Debug, Clone)]
pub struct DecisionModel {
    key: ModelKey,
    description: Option<String>,
    decisions: Vec<DecisionTable>,
}

impl DecisionModel {
    /// Parses and validates a model file.
    ///
    /// Every rule cell is parsed up front so a broken table fails at startup
    /// instead of on the first message.
    pub fn from_toml(content: &str) -> Result<Self, DecisionError> {
        let def: DecisionModelDef =
            toml::from_str(content).map_err(|e| DecisionError::ModelParse(e.to_string()))?;

        if def.namespace.trim().is_empty() || def.name.trim().is_empty() {
            return Err(DecisionError::ModelParse(
                "model namespace and name must not be empty".to_string(),
            ));
        }
        if def.decisions.is_empty() {
            return Err(DecisionError::ModelParse(format!(
                "model '{}' declares no decisions",
                def.name
            )));
        }

        let decisions = def
            .decisions
            .into_iter()
            .map(DecisionTable::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            key: ModelKey::new(def.namespace, def.name),
            description: def.description,
            decisions,
        })
    }

    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn decision_names(&self) -> Vec<&str> {
        self.decisions.iter().map(DecisionTable::name).collect()
    }

    /// Evaluates every decision in file order.
    ///
    /// Each result is stored under the decision's name, so later tables can use
    /// earlier results as inputs. Returns the complete context.
    pub fn evaluate_all(&self, inputs: &DecisionContext) -> Result<DecisionContext, DecisionError> {
        let mut context = inputs.clone();
        for decision in &self.decisions {
            let result = decision.evaluate(&context)?;
            debug!(
                "Decision '{}' ({}) -> {}",
                decision.name(),
                decision.hit_policy(),
                result
            );
            context.insert(decision.name().to_string(), result);
        }
        Ok(context)
    }
}

impl DecisionEvaluator for DecisionModel {
    fn evaluate(&self, inputs: &DecisionContext) -> Result<DecisionContext, DecisionError> {
        self.evaluate_all(inputs)
    }

    fn describe(&self) -> String {
        self.key.to_string()
    }
}
