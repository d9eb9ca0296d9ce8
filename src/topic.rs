use std::fmt;

/// The closed set of VDA 5050 topics plus an open extension tag (§3).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Order,
    InstantActions,
    State,
    Visualization,
    Connection,
    Factsheet,
    Extension(String),
}

impl Topic {
    pub fn as_str(&self) -> &str {
        match self {
            Topic::Order => "order",
            Topic::InstantActions => "instantActions",
            Topic::State => "state",
            Topic::Visualization => "visualization",
            Topic::Connection => "connection",
            Topic::Factsheet => "factsheet",
            Topic::Extension(name) => name,
        }
    }

    pub fn parse(s: &str) -> Option<Topic> {
        if s.is_empty() {
            return None;
        }
        Some(match s {
            "order" => Topic::Order,
            "instantActions" => Topic::InstantActions,
            "state" => Topic::State,
            "visualization" => Topic::Visualization,
            "connection" => Topic::Connection,
            "factsheet" => Topic::Factsheet,
            other => Topic::Extension(other.to_string()),
        })
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration record for an extension topic (§4.2
/// `registerExtensionTopic`).
#[derive(Clone, Debug)]
pub struct ExtensionTopicRegistration {
    pub name: String,
    pub inbound: bool,
    pub outbound: bool,
}
