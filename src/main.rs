use std::sync::Arc;
use std::time::Duration;

use vda5050::agv_client::AgvClient;
use vda5050::agv_controller::AgvController;
use vda5050::agv_id::AgvId;
use vda5050::client::{ClientConfig, MqttProtocolVersion};
use vda5050::config::{self, Config};
use vda5050::protocol::ProtocolVersion;
use vda5050::virtual_agv::VirtualAgv;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = config::load_config("config.toml").expect("failed to load config.toml");

    for robot_index in 0..config.settings.robot_count {
        spawn_vehicle(config.clone(), robot_index).await;
    }

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

/// Builds and starts one vehicle's `AgvClient`/`VirtualAgv`/`AgvController`
/// trio, suffixing the serial number by `robot_index` for `robot_count > 1`
/// fleets.
async fn spawn_vehicle(config: Config, robot_index: u32) {
    let serial_number = format!("{}{}", config.vehicle.serial_number, robot_index + 1);
    let agv_id = AgvId::new(config.vehicle.manufacturer.clone(), serial_number.clone())
        .expect("vehicle manufacturer/serialNumber must use the allowed charset");

    let protocol_version = match config.vehicle.vda_version.as_str() {
        "1.1" | "1.1.0" => ProtocolVersion::V1_1_0,
        _ => ProtocolVersion::V2_0_0,
    };

    let client_config = ClientConfig {
        interface_name: config.mqtt_broker.vda_interface.clone(),
        topic_format: "%interfaceName%/%majorVersion%/%manufacturer%/%serialNumber%/%topic%".into(),
        protocol_version,
        mqtt_protocol_version: MqttProtocolVersion::V5,
        broker_uri: config.mqtt_broker.broker_uri(),
        connect_timeout: Duration::from_secs(10),
        inbound_message_channel_capacity: 64,
    };

    let agv_client = AgvClient::new(agv_id, client_config, None, None).expect("failed to construct agv client");

    let virtual_agv = Arc::new(VirtualAgv::new(config.virtual_agv.clone()));
    let initial_position = virtual_agv.initial_agv_position();

    let controller = AgvController::new(agv_client, virtual_agv.clone());
    controller
        .set_initial_position("", 0, Some(initial_position))
        .await;

    if let Err(e) = controller.start().await {
        tracing::error!(serial_number, error = %e, "failed to start agv controller");
        return;
    }

    virtual_agv.spawn_tick_loop();
    tracing::info!(manufacturer = %config.vehicle.manufacturer, serial_number, "vehicle started");
}
