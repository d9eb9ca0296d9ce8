use serde::{Deserialize, Serialize};

/// Regulates if the action is allowed to be executed during movement
/// and/or parallel to other actions (§3 Action, §GLOSSARY "Blocking
/// type").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockingType {
    /// Action can happen in parallel with others, including movement.
    None,
    /// Action can happen simultaneously with others, but not while moving.
    Soft,
    /// No other actions can be performed while this action is running.
    Hard,
}

/// A key/value parameter handed to an action (§3).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionParameter {
    pub key: String,
    pub value: ActionParameterValue,
}

/// The possible shapes of an action parameter's value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ActionParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<ActionParameterValue>),
}

impl ActionParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ActionParameterValue::Int(i) => Some(*i as f64),
            ActionParameterValue::Float(f) => Some(*f),
            ActionParameterValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ActionParameterValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// A node/edge/instant action (§3 Action). Scope is implicit from the
/// location it was attached to (node, edge, or an `instantActions`
/// batch) — this struct itself carries no scope tag.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub action_type: String,
    pub action_id: String,
    pub action_description: Option<String>,
    pub blocking_type: BlockingType,
    pub action_parameters: Option<Vec<ActionParameter>>,
}

impl Action {
    pub fn parameter(&self, key: &str) -> Option<&ActionParameterValue> {
        self.action_parameters
            .as_ref()
            .and_then(|params| params.iter().find(|p| p.key == key))
            .map(|p| &p.value)
    }
}
