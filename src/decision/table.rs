//! Decision tables: rule matching and hit policy resolution

use super::feel::UnaryTests;
use super::{DecisionContext, DecisionError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::debug;

/// How a table resolves several matching rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HitPolicy {
    /// At most one rule may match
    #[default]
    Unique,
    /// First matching rule in table order wins
    First,
    /// Several rules may match as long as their outputs agree
    Any,
    /// Outputs of all matching rules, in table order
    RuleOrder,
    /// Outputs of all matching rules
    Collect,
}

impl fmt::Display for HitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HitPolicy::Unique => write!(f, "UNIQUE"),
            HitPolicy::First => write!(f, "FIRST"),
            HitPolicy::Any => write!(f, "ANY"),
            HitPolicy::RuleOrder => write!(f, "RULE ORDER"),
            HitPolicy::Collect => write!(f, "COLLECT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeRef {
    Number,
    String,
    Boolean,
}

impl TypeRef {
    fn accepts(self, value: &Value) -> bool {
        match self {
            TypeRef::Number => value.is_number(),
            TypeRef::String => value.is_string(),
            TypeRef::Boolean => value.is_boolean(),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Number => write!(f, "number"),
            TypeRef::String => write!(f, "string"),
            TypeRef::Boolean => write!(f, "boolean"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InputClause {
    pub name: String,
    #[serde(default)]
    pub type_ref: Option<TypeRef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutputClause {
    pub name: String,
    #[serde(default)]
    pub default: Option<Value>,
}

/// Rule as written in a model file
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuleDef {
    pub when: Vec<String>,
    pub then: Vec<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Decision table as written in a model file
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DecisionTableDef {
    pub name: String,
    #[serde(default)]
    pub hit_policy: HitPolicy,
    pub inputs: Vec<InputClause>,
    pub outputs: Vec<OutputClause>,
    #[serde(default)]
    pub rules: Vec<RuleDef>,
}

#[derive(Debug, Clone)]
struct Rule {
    input_entries: Vec<UnaryTests>,
    output_entries: Vec<Value>,
    description: Option<String>,
}

/// A validated decision table with pre-parsed input entries
#[derive(Debug, Clone)]
pub struct DecisionTable {
    name: String,
    hit_policy: HitPolicy,
    inputs: Vec<InputClause>,
    outputs: Vec<OutputClause>,
    rules: Vec<Rule>,
}

impl TryFrom<DecisionTableDef> for DecisionTable {
    type Error = DecisionError;

    fn try_from(def: DecisionTableDef) -> Result<Self, Self::Error> {
        let invalid = |reason: String| DecisionError::InvalidTable {
            table: def.name.clone(),
            reason,
        };

        if def.name.trim().is_empty() {
            return Err(invalid("table name is empty".to_string()));
        }
        if def.outputs.is_empty() {
            return Err(invalid("table declares no outputs".to_string()));
        }

        let mut rules = Vec::with_capacity(def.rules.len());
        for (index, rule) in def.rules.iter().enumerate() {
            if rule.when.len() != def.inputs.len() {
                return Err(invalid(format!(
                    "rule {} has {} input entries, table has {} inputs",
                    index + 1,
                    rule.when.len(),
                    def.inputs.len()
                )));
            }
            if rule.then.len() != def.outputs.len() {
                return Err(invalid(format!(
                    "rule {} has {} output entries, table has {} outputs",
                    index + 1,
                    rule.then.len(),
                    def.outputs.len()
                )));
            }
            let input_entries = rule
                .when
                .iter()
                .map(|entry| entry.parse::<UnaryTests>())
                .collect::<Result<Vec<_>, _>>()?;
            rules.push(Rule {
                input_entries,
                output_entries: rule.then.clone(),
                description: rule.description.clone(),
            });
        }

        Ok(Self {
            name: def.name,
            hit_policy: def.hit_policy,
            inputs: def.inputs,
            outputs: def.outputs,
            rules,
        })
    }
}

impl DecisionTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hit_policy(&self) -> HitPolicy {
        self.hit_policy
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluates the table against `context`.
    ///
    /// Single-output tables yield the bare value, multi-output tables an object
    /// keyed by output name. `RULE_ORDER` and `COLLECT` wrap the results in a list.
    pub fn evaluate(&self, context: &DecisionContext) -> Result<Value, DecisionError> {
        let mut values = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let value = context.get(&input.name).cloned().unwrap_or(Value::Null);
            if let Some(type_ref) = input.type_ref {
                if !value.is_null() && !type_ref.accepts(&value) {
                    return Err(DecisionError::InputType {
                        input: input.name.clone(),
                        expected: type_ref.to_string(),
                        actual: value.to_string(),
                    });
                }
            }
            values.push(value);
        }

        let matched: Vec<(usize, &Rule)> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| {
                rule.input_entries
                    .iter()
                    .zip(&values)
                    .all(|(test, value)| test.matches(value))
            })
            .collect();

        debug!(
            "Table '{}' ({}): {} of {} rules matched",
            self.name,
            self.hit_policy,
            matched.len(),
            self.rules.len()
        );

        if matched.is_empty() {
            return Ok(self.default_result());
        }

        match self.hit_policy {
            HitPolicy::Unique => {
                if matched.len() > 1 {
                    let rule_numbers: Vec<String> =
                        matched.iter().map(|(i, _)| (i + 1).to_string()).collect();
                    return Err(self.violation(format!(
                        "rules {} all match",
                        rule_numbers.join(", ")
                    )));
                }
                Ok(self.rule_result(matched[0].1))
            }
            HitPolicy::First => Ok(self.rule_result(matched[0].1)),
            HitPolicy::Any => {
                let first = self.rule_result(matched[0].1);
                for (index, rule) in matched.iter().skip(1) {
                    if self.rule_result(rule) != first {
                        return Err(self.violation(format!(
                            "rule {} disagrees with rule {}",
                            index + 1,
                            matched[0].0 + 1
                        )));
                    }
                }
                Ok(first)
            }
            HitPolicy::RuleOrder | HitPolicy::Collect => Ok(Value::Array(
                matched
                    .iter()
                    .map(|(_, rule)| self.rule_result(rule))
                    .collect(),
            )),
        }
    }

    fn rule_result(&self, rule: &Rule) -> Value {
        if let Some(description) = &rule.description {
            debug!("Table '{}' hit rule: {}", self.name, description);
        }
        self.shape(rule.output_entries.iter().cloned())
    }

    fn default_result(&self) -> Value {
        let defaults = self
            .outputs
            .iter()
            .map(|o| o.default.clone().unwrap_or(Value::Null));
        let result = self.shape(defaults);
        match self.hit_policy {
            HitPolicy::RuleOrder | HitPolicy::Collect if result.is_null() => {
                Value::Array(Vec::new())
            }
            _ => result,
        }
    }

    fn shape(&self, values: impl Iterator<Item = Value>) -> Value {
        if self.outputs.len() == 1 {
            return values.into_iter().next().unwrap_or(Value::Null);
        }
        let object: Map<String, Value> = self
            .outputs
            .iter()
            .map(|o| o.name.clone())
            .zip(values)
            .collect();
        Value::Object(object)
    }

    fn violation(&self, reason: String) -> DecisionError {
        DecisionError::HitPolicyViolation {
            table: self.name.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(hit_policy: HitPolicy, rules: &[(&str, Value)]) -> DecisionTable {
        DecisionTable::try_from(DecisionTableDef {
            name: "warningState".to_string(),
            hit_policy,
            inputs: vec![InputClause {
                name: "currentTemp".to_string(),
                type_ref: Some(TypeRef::Number),
            }],
            outputs: vec![OutputClause {
                name: "warningState".to_string(),
                default: None,
            }],
            rules: rules
                .iter()
                .map(|(when, then)| RuleDef {
                    when: vec![when.to_string()],
                    then: vec![then.clone()],
                    description: None,
                })
                .collect(),
        })
        .expect("table should build")
    }

    fn temp(value: Value) -> DecisionContext {
        DecisionContext::from([("currentTemp".to_string(), value)])
    }

    #[test]
    fn unique_table_classifies_thresholds() {
        let t = table(
            HitPolicy::Unique,
            &[(">= 80", json!("ALERT")), ("< 80", json!("OK"))],
        );
        assert_eq!(t.evaluate(&temp(json!(85))).unwrap(), json!("ALERT"));
        assert_eq!(t.evaluate(&temp(json!(20))).unwrap(), json!("OK"));
        assert_eq!(t.rule_count(), 2);
        assert_eq!(t.hit_policy(), HitPolicy::Unique);
    }

    #[test]
    fn unique_rejects_overlapping_rules() {
        let t = table(
            HitPolicy::Unique,
            &[(">= 50", json!("WARN")), (">= 80", json!("ALERT"))],
        );
        let err = t.evaluate(&temp(json!(90))).unwrap_err();
        assert!(matches!(err, DecisionError::HitPolicyViolation { .. }));
    }

    #[test]
    fn first_takes_earliest_rule() {
        let t = table(
            HitPolicy::First,
            &[(">= 80", json!("ALERT")), (">= 50", json!("WARN")), ("-", json!("OK"))],
        );
        assert_eq!(t.hit_policy(), HitPolicy::First);
        assert_eq!(t.evaluate(&temp(json!(90))).unwrap(), json!("ALERT"));
        assert_eq!(t.evaluate(&temp(json!(60))).unwrap(), json!("WARN"));
        assert_eq!(t.evaluate(&temp(json!(10))).unwrap(), json!("OK"));
    }

    #[test]
    fn any_requires_agreeing_outputs() {
        let agreeing = table(
            HitPolicy::Any,
            &[(">= 80", json!("ALERT")), ("> 100", json!("ALERT"))],
        );
        assert_eq!(agreeing.evaluate(&temp(json!(120))).unwrap(), json!("ALERT"));

        let disagreeing = table(
            HitPolicy::Any,
            &[(">= 80", json!("ALERT")), ("> 100", json!("SHUTDOWN"))],
        );
        assert!(disagreeing.evaluate(&temp(json!(120))).is_err());
    }

    #[test]
    fn collecting_policies_return_lists() {
        let t = table(
            HitPolicy::RuleOrder,
            &[(">= 50", json!("WARN")), (">= 80", json!("ALERT"))],
        );
        assert_eq!(
            t.evaluate(&temp(json!(90))).unwrap(),
            json!(["WARN", "ALERT"])
        );
        assert_eq!(t.evaluate(&temp(json!(10))).unwrap(), json!([]));
    }

    #[test]
    fn no_match_yields_default_or_null() {
        let t = table(HitPolicy::Unique, &[(">= 80", json!("ALERT"))]);
        assert_eq!(t.evaluate(&temp(json!(20))).unwrap(), Value::Null);

        let mut def = DecisionTableDef {
            name: "warningState".to_string(),
            hit_policy: HitPolicy::Unique,
            inputs: vec![InputClause {
                name: "currentTemp".to_string(),
                type_ref: None,
            }],
            outputs: vec![OutputClause {
                name: "warningState".to_string(),
                default: Some(json!("OK")),
            }],
            rules: vec![RuleDef {
                when: vec![">= 80".to_string()],
                then: vec![json!("ALERT")],
                description: Some("too hot".to_string()),
            }],
        };
        let with_default = DecisionTable::try_from(def.clone()).unwrap();
        assert_eq!(with_default.evaluate(&temp(json!(20))).unwrap(), json!("OK"));

        def.rules[0].when.push("-".to_string());
        assert!(matches!(
            DecisionTable::try_from(def),
            Err(DecisionError::InvalidTable { .. })
        ));
    }

    #[test]
    fn multi_output_rules_become_objects() {
        let t = DecisionTable::try_from(DecisionTableDef {
            name: "action".to_string(),
            hit_policy: HitPolicy::First,
            inputs: vec![InputClause {
                name: "currentTemp".to_string(),
                type_ref: None,
            }],
            outputs: vec![
                OutputClause {
                    name: "warningState".to_string(),
                    default: None,
                },
                OutputClause {
                    name: "pulses".to_string(),
                    default: None,
                },
            ],
            rules: vec![RuleDef {
                when: vec!["-".to_string()],
                then: vec![json!("ALERT"), json!(3)],
                description: None,
            }],
        })
        .unwrap();
        assert_eq!(
            t.evaluate(&temp(json!(1))).unwrap(),
            json!({"warningState": "ALERT", "pulses": 3})
        );
    }

    #[test]
    fn typed_inputs_reject_wrong_values() {
        let t = table(HitPolicy::Unique, &[(">= 80", json!("ALERT"))]);
        let err = t.evaluate(&temp(json!("hot"))).unwrap_err();
        assert!(matches!(err, DecisionError::InputType { .. }));
    }
}
