use serde::{Deserialize, Serialize};

use super::action::Action;

/// The headerless body of an `instantActions` message: actions the AGV is
/// to execute immediately, independent of the current order (§3, §GLOSSARY
/// "Instant action").
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstantActionsBody {
    pub actions: Vec<Action>,
}
