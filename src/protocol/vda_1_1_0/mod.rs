//! VDA 5050 1.1 support.
//!
//! The 1.1 and 2.0 wire shapes are identical for every field the master
//! controller and virtual AGV engines read or write (§3: "we only specify
//! the semantic fields the engines require"); factsheet-level schema
//! differences between the two versions are out of scope (§1). This
//! module therefore re-exports the 2.0.0 types and only supplies its own
//! version markers, rather than duplicating six structs verbatim — see
//! DESIGN.md for the rationale.

pub use super::vda_2_0_0::{
    action, connection, instant_actions, order, state, visualization, Action, ActionParameter,
    ActionParameterValue, ActionState, ActionStatus, BatteryState, BlockingType, ConnectionBody,
    ConnectionState, EStop, Edge, EdgeState, InstantActionsBody, Node, NodeState, OperatingMode,
    OrderBody, SafetyState, StateBody, VisualizationBody,
};

pub const VERSION: &str = "1.1.0";
pub const MAJOR_VERSION: &str = "v1";
