//! Vortec Core Library
//!
//! Decision logic for the Vortec fan control engine, free of I/O and async:
//!
//! - `data/` - telemetry snapshots, settings, configuration loading, validation
//! - `engine/` - the hysteresis ladder and the critical temperature policy
//! - `display` - formatting for logs and text clients
//!
//! # Example
//!
//! ```
//! use vc_core::{evaluate, TemperatureThreshold};
//!
//! let ladder = vec![TemperatureThreshold::new(40.0, 45.0, 30)];
//! let sel = evaluate(Some(47.0), &ladder, None, 0);
//! assert_eq!(sel.band, Some(0));
//! assert_eq!(sel.fan_speed, 30);
//! ```

// Grouped modules
pub mod data;
pub mod engine;

// Standalone modules
pub mod constants;
pub mod display;
pub mod error;

// Re-export primary types from data/
pub use data::{
    select_reading, FanMode, PublicFanState, PublicState, SafetyAction, SafetySettings,
    TelemetrySnapshot, TempSource, TemperatureThreshold,
};

// Re-export config types and functions from data/
pub use data::{
    get_config_path, load_config, ActionSettings, ControlSettings, EngineConfig, FanConfig,
    RestartSettings, TelemetrySettings,
};

// Re-export telemetry parsing
pub use data::{parse_telemetry_line, SensorFrame};

// Re-export validation functions from data/
pub use data::{
    validate_fan_name, validate_file_size, validate_manual_speed, validate_safety_settings,
    validate_thresholds,
};

// Re-export error types
pub use error::{Result, VortecError};

// Re-export engine types
pub use engine::{evaluate, evaluate_safety, speed_for, BandSelection, SafetyEvent, SafetyState};

// Re-export display formatting functions
pub use display::{
    format_fan, format_mode, format_percent, format_percent_optional, format_rpm_optional,
    format_state_summary, format_temp, format_temp_precise,
};
