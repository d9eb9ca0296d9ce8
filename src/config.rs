//! Configuration recognized by the crate (§6): broker/vehicle/settings
//! plus the transport/validation/virtual-AGV sections, loaded from a TOML
//! file with `config-file`.

use config_file::FromConfigFile;
use serde::Deserialize;

use crate::errors::ConfigError;

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    Config::from_config_file(path).map_err(|e| ConfigError::Load(e.to_string()))
}

#[derive(Deserialize, Clone, Debug)]
pub struct MqttBrokerConfig {
    pub host: String,
    pub port: String,
    pub vda_interface: String,
}

impl MqttBrokerConfig {
    pub fn broker_uri(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct VehicleConfig {
    pub manufacturer: String,
    pub serial_number: String,
    pub vda_version: String,
    pub vda_full_version: String,
}

fn default_protocol_version() -> String {
    "5".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_reconnect_period_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// `transport.*` (§6).
#[derive(Deserialize, Clone, Debug)]
pub struct TransportConfig {
    pub broker_url: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reconnect_period_secs")]
    pub reconnect_period_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub tls: Option<TlsOptions>,
    #[serde(default)]
    pub ws: Option<WsOptions>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TlsOptions {
    pub ca_file: Option<String>,
    pub client_cert_file: Option<String>,
    pub client_key_file: Option<String>,
    #[serde(default)]
    pub verify_server: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct WsOptions {
    pub path: Option<String>,
}

/// `topicObjectValidation.{inbound,outbound}` (§6).
#[derive(Deserialize, Clone, Debug, Default)]
pub struct TopicObjectValidation {
    #[serde(default)]
    pub inbound: bool,
    #[serde(default)]
    pub outbound: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct InitialPosition {
    pub map_id: String,
    pub x: f32,
    pub y: f32,
    pub theta: f32,
}

fn default_deviation_xy() -> f32 {
    0.5
}

fn default_deviation_theta() -> f32 {
    0.349
}

fn default_vehicle_speed() -> f32 {
    2.0
}

fn default_battery_capacity() -> f32 {
    100.0
}

fn default_battery_max_reach() -> f32 {
    28800.0
}

fn default_initial_battery_charge() -> f32 {
    100.0
}

fn default_full_battery_charge_time_hours() -> f32 {
    1.0
}

fn default_low_battery_threshold() -> f32 {
    1.0
}

fn default_tick_rate() -> f32 {
    5.0
}

fn default_time_lapse() -> f32 {
    1.0
}

/// A target-speed distribution: picks a value in `[min, max]` each time a
/// new edge traversal begins (§4.7.2, §4.7.6).
#[derive(Deserialize, Clone, Debug)]
pub struct SpeedDistribution {
    pub min: f32,
    pub max: f32,
}

impl SpeedDistribution {
    pub fn mean(&self) -> f32 {
        (self.min + self.max) / 2.0
    }

    pub fn sample(&self) -> f32 {
        if self.max <= self.min {
            return self.min;
        }
        self.min + rand::random::<f32>() * (self.max - self.min)
    }
}

/// A target-duration distribution: the edge is to be traversed in
/// `[min, max]` seconds regardless of its length (§4.7.2, §4.7.6).
#[derive(Deserialize, Clone, Debug)]
pub struct TimeDistribution {
    pub min_secs: f32,
    pub max_secs: f32,
}

/// Mutually exclusive vehicle speed selection (§4.7.2): a constant speed,
/// a speed distribution, or a time distribution.
#[derive(Clone, Debug)]
pub enum SpeedSelection {
    Constant(f32),
    Speed(SpeedDistribution),
    Time(TimeDistribution),
}

/// Virtual AGV kinematics/battery/tick settings (§6).
#[derive(Deserialize, Clone, Debug)]
pub struct VirtualAgvConfig {
    pub initial_position: Option<InitialPosition>,
    #[serde(default = "default_deviation_xy")]
    pub agv_normal_deviation_xy_tolerance: f32,
    #[serde(default = "default_deviation_theta")]
    pub agv_normal_deviation_theta_tolerance: f32,
    #[serde(default = "default_vehicle_speed")]
    pub vehicle_speed: f32,
    pub vehicle_speed_distribution: Option<SpeedDistribution>,
    pub vehicle_time_distribution: Option<TimeDistribution>,
    #[serde(default = "default_battery_capacity")]
    pub battery_capacity: f32,
    #[serde(default = "default_battery_max_reach")]
    pub battery_max_reach: f32,
    #[serde(default = "default_initial_battery_charge")]
    pub initial_battery_charge: f32,
    #[serde(default = "default_full_battery_charge_time_hours")]
    pub full_battery_charge_time_hours: f32,
    #[serde(default = "default_low_battery_threshold")]
    pub low_battery_charge_threshold: f32,
    #[serde(default = "default_tick_rate")]
    pub tick_rate: f32,
    #[serde(default = "default_time_lapse")]
    pub time_lapse: f32,
}

impl VirtualAgvConfig {
    pub fn speed_selection(&self) -> SpeedSelection {
        if let Some(time) = &self.vehicle_time_distribution {
            SpeedSelection::Time(time.clone())
        } else if let Some(speed) = &self.vehicle_speed_distribution {
            SpeedSelection::Speed(speed.clone())
        } else {
            SpeedSelection::Constant(self.vehicle_speed)
        }
    }
}

impl Default for VirtualAgvConfig {
    fn default() -> Self {
        Self {
            initial_position: None,
            agv_normal_deviation_xy_tolerance: default_deviation_xy(),
            agv_normal_deviation_theta_tolerance: default_deviation_theta(),
            vehicle_speed: default_vehicle_speed(),
            vehicle_speed_distribution: None,
            vehicle_time_distribution: None,
            battery_capacity: default_battery_capacity(),
            battery_max_reach: default_battery_max_reach(),
            initial_battery_charge: default_initial_battery_charge(),
            full_battery_charge_time_hours: default_full_battery_charge_time_hours(),
            low_battery_charge_threshold: default_low_battery_threshold(),
            tick_rate: default_tick_rate(),
            time_lapse: default_time_lapse(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    pub robot_count: u32,
    pub state_frequency: u64,
    pub visualization_frequency: u64,
    pub map_id: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub mqtt_broker: MqttBrokerConfig,
    pub vehicle: VehicleConfig,
    pub settings: Settings,
    #[serde(default)]
    pub transport: Option<TransportConfig>,
    #[serde(default)]
    pub topic_object_validation: TopicObjectValidation,
    #[serde(default)]
    pub virtual_agv: VirtualAgvConfig,
}
