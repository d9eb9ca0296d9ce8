use serde::{Deserialize, Serialize};

/// AGV connection state reported as a last will message and retained on
/// the AGV's own `connection` topic (§3, §6). If the AGV disconnects
/// unexpectedly the broker delivers `ConnectionBroken` on its behalf.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Online,
    Offline,
    ConnectionBroken,
}

/// The headerless body of a `connection` message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionBody {
    pub connection_state: ConnectionState,
}
