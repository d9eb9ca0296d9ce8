//! VDA 5050 master control / AGV protocol runtime over MQTT.
//!
//! `client`/`agv_client`/`master_control_client` implement the wire
//! session (C1-C4); `subscription` and `header` back it; `master_controller`
//! (C5) correlates State snapshots into order/action events for a
//! coordinator; `agv_controller` (C6) plus `virtual_agv` (C7) implement
//! the vehicle side, including the bundled simulator.

pub mod agv_client;
pub mod agv_controller;
pub mod agv_id;
pub mod client;
pub mod config;
pub mod errors;
pub mod header;
pub mod master_control_client;
pub mod master_controller;
pub mod mqtt_utils;
pub mod protocol;
pub mod subscription;
pub mod topic;
pub mod utils;
pub mod virtual_agv;
