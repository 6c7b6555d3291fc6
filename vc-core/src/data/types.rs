//! Core data types for Vortec
//!
//! Telemetry snapshots and safety policy types. Value types shared with
//! socket clients (modes, thresholds, public state) live in vc-protocol and
//! are re-exported from here.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub use vc_protocol::{FanMode, PublicFanState, PublicState, TempSource, TemperatureThreshold};

use crate::constants::safety;

/// One reading cycle from the telemetry sidecar
///
/// Fields are `None` when the sensor is unavailable or reported a
/// non-finite value.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    pub system_temp: Option<f32>,
    pub gpu_temp: Option<f32>,
    pub timestamp: SystemTime,
    /// Assigned by the telemetry adapter, strictly increasing per process
    pub sequence: u64,
}

impl TelemetrySnapshot {
    pub fn new(system_temp: Option<f32>, gpu_temp: Option<f32>) -> Self {
        Self {
            system_temp,
            gpu_temp,
            timestamp: SystemTime::now(),
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Reading selected by `source`; `Hottest` is the max of present values
    pub fn reading(&self, source: TempSource) -> Option<f32> {
        select_reading(self.system_temp, self.gpu_temp, source)
    }
}

/// Pick a reading from a system/GPU pair
pub fn select_reading(system: Option<f32>, gpu: Option<f32>, source: TempSource) -> Option<f32> {
    match source {
        TempSource::System => system,
        TempSource::Gpu => gpu,
        TempSource::Hottest => match (system, gpu) {
            (Some(s), Some(g)) => Some(s.max(g)),
            (s, g) => s.or(g),
        },
    }
}

/// Action taken once when safety engages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SafetyAction {
    /// Force all fans to full speed
    MaxSpeed,
    /// Force all fans and hand fan control back to firmware
    #[default]
    BiosControl,
    /// Force all fans and request an operating system shutdown
    Shutdown,
}

impl SafetyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyAction::MaxSpeed => "max_speed",
            SafetyAction::BiosControl => "bios_control",
            SafetyAction::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for SafetyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Critical-temperature policy, read-only to the engine between updates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetySettings {
    #[serde(default = "default_critical_temp")]
    pub critical_temp: f32,
    #[serde(default)]
    pub safety_action: SafetyAction,
    #[serde(default)]
    pub enable_critical_temp_recovery: bool,
    #[serde(default = "default_recovery_delta")]
    pub critical_temp_recovery_delta: f32,
    /// Reading the policy watches
    #[serde(default)]
    pub safety_sensor: TempSource,
}

fn default_critical_temp() -> f32 {
    safety::DEFAULT_CRITICAL_TEMP
}

fn default_recovery_delta() -> f32 {
    safety::DEFAULT_RECOVERY_DELTA
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            critical_temp: default_critical_temp(),
            safety_action: SafetyAction::default(),
            enable_critical_temp_recovery: false,
            critical_temp_recovery_delta: default_recovery_delta(),
            safety_sensor: TempSource::default(),
        }
    }
}

impl SafetySettings {
    /// Temperature at or below which an engaged state may recover
    pub fn recovery_temp(&self) -> f32 {
        self.critical_temp - self.critical_temp_recovery_delta
    }
}
