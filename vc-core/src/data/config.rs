//! Configuration file loading and validation
//!
//! The configuration is a single JSON document. Every section except `fans`
//! has defaults. Validation is strict: a file that violates an invariant is
//! rejected as a whole, both at startup and on reload.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::constants::{control, limits, paths, safety, telemetry};
use crate::data::types::{FanMode, SafetySettings, TempSource, TemperatureThreshold};
use crate::data::validation::{
    validate_fan_name, validate_file_size, validate_safety_settings, validate_thresholds,
};
use crate::error::{Result, VortecError};

/// Complete daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub settings: SafetySettings,
    #[serde(default)]
    pub control: ControlSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub actions: ActionSettings,
    pub fans: Vec<FanConfig>,
}

fn default_model_name() -> String {
    "Generic".to_string()
}

/// Tick timing and fallback speeds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlSettings {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,
    #[serde(default = "default_stale_tick_limit")]
    pub stale_tick_limit: u32,
    #[serde(default = "default_idle_speed")]
    pub idle_speed: u8,
    #[serde(default = "default_degraded_speed")]
    pub degraded_speed: u8,
}

fn default_tick_interval_ms() -> u64 { control::DEFAULT_TICK_INTERVAL_MS }
fn default_stale_timeout_ms() -> u64 { control::DEFAULT_STALE_TIMEOUT_MS }
fn default_stale_tick_limit() -> u32 { control::DEFAULT_STALE_TICK_LIMIT }
fn default_idle_speed() -> u8 { control::DEFAULT_IDLE_SPEED }
fn default_degraded_speed() -> u8 { control::DEFAULT_DEGRADED_SPEED }

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            stale_timeout_ms: default_stale_timeout_ms(),
            stale_tick_limit: default_stale_tick_limit(),
            idle_speed: default_idle_speed(),
            degraded_speed: default_degraded_speed(),
        }
    }
}

impl ControlSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// How long the engine waits for a snapshot before running a stale tick
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }
}

/// Telemetry sidecar launch and supervision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySettings {
    #[serde(default = "default_program")]
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default)]
    pub restart: RestartSettings,
}

fn default_program() -> PathBuf {
    PathBuf::from(paths::DEFAULT_TELEMETRY_PROGRAM)
}

fn default_stop_grace_ms() -> u64 {
    telemetry::DEFAULT_STOP_GRACE_MS
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            stop_grace_ms: default_stop_grace_ms(),
            restart: RestartSettings::default(),
        }
    }
}

impl TelemetrySettings {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Restart budget for the telemetry sidecar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartSettings {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_window_ms")]
    pub restart_window_ms: u64,
}

fn default_initial_backoff_ms() -> u64 { telemetry::restart::INITIAL_BACKOFF_MS }
fn default_max_backoff_ms() -> u64 { telemetry::restart::MAX_BACKOFF_MS }
fn default_stability_window_ms() -> u64 { telemetry::restart::STABILITY_WINDOW_MS }
fn default_max_restarts() -> u32 { telemetry::restart::MAX_RESTARTS }
fn default_restart_window_ms() -> u64 { telemetry::restart::RESTART_WINDOW_MS }

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            stability_window_ms: default_stability_window_ms(),
            max_restarts: default_max_restarts(),
            restart_window_ms: default_restart_window_ms(),
        }
    }
}

/// How the daemon carries out safety actions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionSettings {
    /// Program and arguments run by the `shutdown` safety action
    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: Vec<String>,
}

fn default_shutdown_command() -> Vec<String> {
    safety::DEFAULT_SHUTDOWN_COMMAND.iter().map(|s| s.to_string()).collect()
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            shutdown_command: default_shutdown_command(),
        }
    }
}

/// Per-fan configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanConfig {
    pub name: String,
    #[serde(default)]
    pub mode: FanMode,
    #[serde(default = "default_manual_speed")]
    pub manual_speed: u8,
    #[serde(default)]
    pub temp_source: TempSource,
    #[serde(default)]
    pub thresholds: Vec<TemperatureThreshold>,
}

fn default_manual_speed() -> u8 {
    control::DEFAULT_MANUAL_SPEED
}

impl FanConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: FanMode::default(),
            manual_speed: default_manual_speed(),
            temp_source: TempSource::default(),
            thresholds: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: FanMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_manual_speed(mut self, speed: u8) -> Self {
        self.manual_speed = speed;
        self
    }

    pub fn with_temp_source(mut self, source: TempSource) -> Self {
        self.temp_source = source;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Vec<TemperatureThreshold>) -> Self {
        self.thresholds = thresholds;
        self
    }
}

impl EngineConfig {
    /// Minimal configuration with the given fans and all defaults
    pub fn with_fans(fans: Vec<FanConfig>) -> Self {
        Self {
            model_name: default_model_name(),
            settings: SafetySettings::default(),
            control: ControlSettings::default(),
            telemetry: TelemetrySettings::default(),
            actions: ActionSettings::default(),
            fans,
        }
    }

    /// Parse and validate a configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn fan(&self, name: &str) -> Option<&FanConfig> {
        self.fans.iter().find(|f| f.name == name)
    }

    /// Check every invariant the engine relies on
    pub fn validate(&self) -> Result<()> {
        validate_safety_settings(&self.settings)?;
        self.validate_control()?;
        self.validate_telemetry()?;

        if self.actions.shutdown_command.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(VortecError::invalid_config(
                "actions.shutdown_command",
                "must name a program",
            ));
        }

        if self.fans.is_empty() {
            return Err(VortecError::invalid_config("fans", "at least one fan is required"));
        }
        if self.fans.len() > limits::MAX_FANS {
            return Err(VortecError::invalid_config(
                "fans",
                format!("{} fans configured (max {})", self.fans.len(), limits::MAX_FANS),
            ));
        }

        let mut seen = HashSet::new();
        for fan in &self.fans {
            validate_fan_name(&fan.name)?;
            if !seen.insert(fan.name.as_str()) {
                return Err(VortecError::invalid_config(
                    "fans.name",
                    format!("duplicate fan name '{}'", fan.name),
                ));
            }
            if fan.manual_speed > 100 {
                return Err(VortecError::invalid_config(
                    format!("fans[{}].manual_speed", fan.name),
                    format!("{} exceeds 100", fan.manual_speed),
                ));
            }
            validate_thresholds(&fan.thresholds).map_err(|e| {
                VortecError::invalid_config(format!("fans[{}].thresholds", fan.name), e.to_string())
            })?;
        }

        Ok(())
    }

    fn validate_control(&self) -> Result<()> {
        let c = &self.control;
        if c.tick_interval_ms == 0 {
            return Err(VortecError::invalid_config("control.tick_interval_ms", "must be greater than 0"));
        }
        if c.stale_timeout_ms < c.tick_interval_ms {
            return Err(VortecError::invalid_config(
                "control.stale_timeout_ms",
                format!("{} is shorter than tick_interval_ms {}", c.stale_timeout_ms, c.tick_interval_ms),
            ));
        }
        if c.stale_tick_limit == 0 {
            return Err(VortecError::invalid_config("control.stale_tick_limit", "must be greater than 0"));
        }
        if c.idle_speed > 100 {
            return Err(VortecError::invalid_config("control.idle_speed", format!("{} exceeds 100", c.idle_speed)));
        }
        if c.degraded_speed > 100 {
            return Err(VortecError::invalid_config(
                "control.degraded_speed",
                format!("{} exceeds 100", c.degraded_speed),
            ));
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let t = &self.telemetry;
        if t.program.as_os_str().is_empty() {
            return Err(VortecError::invalid_config("telemetry.program", "must not be empty"));
        }
        let r = &t.restart;
        if r.initial_backoff_ms == 0 || r.max_backoff_ms < r.initial_backoff_ms {
            return Err(VortecError::invalid_config(
                "telemetry.restart",
                "backoff must be positive and max_backoff_ms >= initial_backoff_ms",
            ));
        }
        if r.max_restarts == 0 || r.restart_window_ms == 0 {
            return Err(VortecError::invalid_config(
                "telemetry.restart",
                "max_restarts and restart_window_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Locate the configuration file
///
/// `$VORTEC_CONFIG` wins when set. Otherwise the per-user file is used if it
/// exists, falling back to the system-wide path.
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(paths::CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(user) = paths::user_config_file() {
        if user.exists() {
            return user;
        }
    }

    PathBuf::from(paths::SYSTEM_CONFIG)
}

/// Load and validate the configuration at `path`
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    validate_file_size(path)?;

    let contents = fs::read_to_string(path).map_err(|e| VortecError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config = EngineConfig::from_json(&contents)?;

    debug!(
        "Config: tick={}ms stale_limit={} telemetry={:?}",
        config.control.tick_interval_ms,
        config.control.stale_tick_limit,
        config.telemetry.program
    );
    info!("Loaded {} fans from {:?}", config.fans.len(), path);
    Ok(config)
}
