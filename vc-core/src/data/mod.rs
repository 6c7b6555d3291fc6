//! Data types, configuration, telemetry parsing and validation

mod config;
mod telemetry;
mod types;
mod validation;

pub use config::{
    get_config_path, load_config, ActionSettings, ControlSettings, EngineConfig, FanConfig,
    RestartSettings, TelemetrySettings,
};
pub use telemetry::{parse_telemetry_line, SensorFrame};
pub use types::{
    select_reading, FanMode, PublicFanState, PublicState, SafetyAction, SafetySettings,
    TelemetrySnapshot, TempSource, TemperatureThreshold,
};
pub use validation::{
    validate_fan_name, validate_file_size, validate_manual_speed, validate_safety_settings,
    validate_thresholds,
};
