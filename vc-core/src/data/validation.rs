//! Input validation for commands and configuration
//!
//! Every check returns a specific error kind. Values are never clamped:
//! out-of-range input is rejected and state is left untouched.

use std::path::Path;

use crate::constants::limits;
use crate::data::types::{SafetySettings, TemperatureThreshold};
use crate::error::{Result, VortecError};

/// Validates a manual speed percentage, narrowing it to `u8`
pub fn validate_manual_speed(value: i64) -> Result<u8> {
    vc_protocol::validate_percent(value).map_err(|_| VortecError::invalid_percent("manual_speed", value))
}

/// Validates a threshold ladder
pub fn validate_thresholds(thresholds: &[TemperatureThreshold]) -> Result<()> {
    vc_protocol::validate_thresholds(thresholds).map_err(VortecError::InvalidThresholds)
}

/// Validates a fan name
pub fn validate_fan_name(name: &str) -> Result<()> {
    vc_protocol::validate_fan_name(name).map_err(|reason| VortecError::invalid_config("fans.name", reason))
}

/// Validates the critical-temperature policy
pub fn validate_safety_settings(settings: &SafetySettings) -> Result<()> {
    if !settings.critical_temp.is_finite() {
        return Err(VortecError::invalid_config(
            "critical_temp",
            "must be a finite temperature",
        ));
    }
    if settings.critical_temp <= 0.0 || settings.critical_temp > limits::MAX_CRITICAL_TEMP {
        return Err(VortecError::invalid_config(
            "critical_temp",
            format!("{} is outside 0-{}", settings.critical_temp, limits::MAX_CRITICAL_TEMP),
        ));
    }
    let delta = settings.critical_temp_recovery_delta;
    if !delta.is_finite() || delta < 0.0 {
        return Err(VortecError::invalid_config(
            "critical_temp_recovery_delta",
            format!("{} must be finite and non-negative", delta),
        ));
    }
    Ok(())
}

/// Validates that a file does not exceed the configuration size limit
pub fn validate_file_size(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| VortecError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    if metadata.len() > limits::MAX_CONFIG_FILE_SIZE {
        return Err(VortecError::FileTooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            max_size: limits::MAX_CONFIG_FILE_SIZE,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_manual_speed() {
        assert_eq!(validate_manual_speed(0).unwrap(), 0);
        assert_eq!(validate_manual_speed(100).unwrap(), 100);
        let err = validate_manual_speed(101).unwrap_err();
        assert_eq!(err.kind(), "invalid_range");
        assert!(validate_manual_speed(-1).is_err());
    }

    #[test]
    fn test_validate_thresholds_kind() {
        let bad = vec![TemperatureThreshold::new(50.0, 40.0, 30)];
        assert_eq!(validate_thresholds(&bad).unwrap_err().kind(), "invalid_thresholds");
    }

    #[test]
    fn test_validate_safety_settings() {
        assert!(validate_safety_settings(&SafetySettings::default()).is_ok());

        let mut s = SafetySettings::default();
        s.critical_temp = f32::INFINITY;
        assert!(validate_safety_settings(&s).is_err());

        let mut s = SafetySettings::default();
        s.critical_temp_recovery_delta = -1.0;
        assert_eq!(validate_safety_settings(&s).unwrap_err().kind(), "invalid_config");

        // zero delta is allowed: recovery happens at the critical temperature
        let mut s = SafetySettings::default();
        s.critical_temp_recovery_delta = 0.0;
        assert!(validate_safety_settings(&s).is_ok());
    }

    #[test]
    fn test_validate_fan_name() {
        assert!(validate_fan_name("CPU Fan").is_ok());
        assert!(validate_fan_name("").is_err());
        assert!(validate_fan_name("   ").is_err());
    }

    #[test]
    fn test_validate_file_size() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"{}").unwrap();
        assert!(validate_file_size(file.path()).is_ok());
        assert!(validate_file_size(Path::new("/nonexistent/vortec.json")).is_err());
    }
}
