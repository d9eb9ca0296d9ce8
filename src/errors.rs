use thiserror::Error;

/// Programming errors: the caller misused the API. These always fail
/// synchronously, before any network operation is attempted (§7.1).
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("topic `{0}` is empty")]
    EmptyTopic(String),
    #[error("topic `{0}` contains a forbidden character")]
    ForbiddenTopicChar(String),
    #[error("topic exceeds the maximum encoded length of {max} bytes: {actual}")]
    TopicTooLong { max: usize, actual: usize },
    #[error("agv id field `{0}` is empty")]
    EmptyAgvIdField(&'static str),
    #[error("agv id field `{field}` contains forbidden character(s): `{value}`")]
    ForbiddenAgvIdChar { field: &'static str, value: String },
    #[error("extension topic `{0}` is not registered")]
    UnknownExtensionTopic(String),
    #[error("extension topic `{0}` is not registered for {direction}")]
    WrongDirection { topic: String, direction: &'static str },
    #[error("payload failed schema validation for topic `{0}`: {1}")]
    SchemaValidation(String, String),
    #[error("payload is not serializable: {0}")]
    NotSerializable(String),
}

impl ValidationError {
    pub fn wrong_direction(topic: impl Into<String>, direction: &'static str) -> Self {
        ValidationError::WrongDirection { topic: topic.into(), direction }
    }
}

/// Subscription manager construction/lookup errors (§4.1).
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("topic format must contain the %topic% placeholder")]
    MissingTopicPlaceholder,
    #[error("unknown placeholder `{0}` in topic format")]
    UnknownPlaceholder(String),
    #[error("placeholder `{0}` appears more than once in topic format")]
    DuplicatePlaceholder(String),
    #[error("resolved topic exceeds the maximum encoded length of {max} bytes: {actual}")]
    ResolvedTopicTooLong { max: usize, actual: usize },
    #[error("no subscription with id {0}")]
    UnknownSubscription(uuid::Uuid),
}

/// Operational errors: the broker/transport failed to carry out a
/// requested, syntactically valid operation (§7.2).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("client is not started")]
    NotStarted,
    #[error("start() is already in progress")]
    StartInProgress,
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("mqtt operation failed: {0}")]
    Mqtt(#[from] paho_mqtt::Error),
    #[error("failed to decode configuration: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration file: {0}")]
    Load(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
