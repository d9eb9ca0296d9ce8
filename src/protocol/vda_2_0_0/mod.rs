pub mod action;
pub mod connection;
pub mod instant_actions;
pub mod order;
pub mod state;
pub mod visualization;

pub use action::{Action, ActionParameter, ActionParameterValue, BlockingType};
pub use connection::{ConnectionBody, ConnectionState};
pub use instant_actions::InstantActionsBody;
pub use order::{Edge, Node, OrderBody};
pub use state::{
    ActionState, ActionStatus, BatteryState, EStop, EdgeState, NodeState, OperatingMode,
    SafetyState, StateBody,
};
pub use visualization::VisualizationBody;

/// Protocol version string this module implements (§6).
pub const VERSION: &str = "2.0.0";
pub const MAJOR_VERSION: &str = "v2";
