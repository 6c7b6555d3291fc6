//! Telemetry line parsing
//!
//! The sensor sidecar writes one JSON object per line. Every object and
//! field may be missing or `null`; non-finite temperatures are dropped here
//! so nothing downstream has to re-check them.

use serde::Deserialize;

use crate::constants::telemetry::MAX_LINE_BYTES;
use crate::data::types::TelemetrySnapshot;
use crate::error::{Result, VortecError};

/// Raw frame as written by the sidecar
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SensorFrame {
    #[serde(default)]
    pub cpu: Option<CpuFrame>,
    #[serde(default)]
    pub gpu: Option<GpuFrame>,
    #[serde(default)]
    pub ram: Option<RamFrame>,
    #[serde(default)]
    pub battery: Option<BatteryFrame>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuFrame {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub package_temp: Option<f64>,
    #[serde(default)]
    pub total_load: Option<f64>,
    #[serde(default)]
    pub package_power: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuFrame {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub temp: Option<f64>,
    #[serde(default)]
    pub load: Option<f64>,
    #[serde(default)]
    pub memory_used: Option<f64>,
    #[serde(default)]
    pub memory_total: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RamFrame {
    #[serde(default)]
    pub used: Option<f64>,
    #[serde(default)]
    pub available: Option<f64>,
    #[serde(default)]
    pub total: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryFrame {
    #[serde(default)]
    pub charge_level: Option<f64>,
    #[serde(default)]
    pub voltage: Option<f64>,
    #[serde(default)]
    pub wear_level: Option<f64>,
}

impl SensorFrame {
    pub fn system_temp(&self) -> Option<f32> {
        self.cpu.as_ref().and_then(|c| finite(c.package_temp))
    }

    pub fn gpu_temp(&self) -> Option<f32> {
        self.gpu.as_ref().and_then(|g| finite(g.temp))
    }

    pub fn into_snapshot(self) -> TelemetrySnapshot {
        TelemetrySnapshot::new(self.system_temp(), self.gpu_temp())
    }
}

fn finite(value: Option<f64>) -> Option<f32> {
    value
        .map(|v| v as f32)
        .filter(|v| v.is_finite())
}

/// Parse one line of sidecar output
///
/// Returns `Ok(None)` for blank lines. The caller assigns the sequence number.
pub fn parse_telemetry_line(line: &str) -> Result<Option<TelemetrySnapshot>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > MAX_LINE_BYTES {
        return Err(VortecError::TelemetryParse(format!(
            "line of {} bytes exceeds {} byte limit",
            trimmed.len(),
            MAX_LINE_BYTES
        )));
    }

    let frame: SensorFrame = serde_json::from_str(trimmed)
        .map_err(|e| VortecError::TelemetryParse(e.to_string()))?;

    Ok(Some(frame.into_snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_frame() {
        let line = r#"{"cpu":{"name":"Ryzen","packageTemp":61.5,"totalLoad":12.0,"packagePower":15.2},
            "gpu":{"name":"RTX","temp":48.0,"load":3.0,"memoryUsed":512,"memoryTotal":8192},
            "ram":{"used":8.1,"available":7.9,"total":16.0},
            "battery":{"chargeLevel":80,"voltage":12.1,"wearLevel":4}}"#
            .replace('\n', "");
        let snap = parse_telemetry_line(&line).unwrap().unwrap();
        assert_eq!(snap.system_temp, Some(61.5));
        assert_eq!(snap.gpu_temp, Some(48.0));
    }

    #[test]
    fn test_missing_and_null_sections() {
        let snap = parse_telemetry_line(r#"{"cpu":{"packageTemp":55}}"#).unwrap().unwrap();
        assert_eq!(snap.system_temp, Some(55.0));
        assert_eq!(snap.gpu_temp, None);

        let snap = parse_telemetry_line(r#"{"cpu":null,"gpu":{"temp":null}}"#).unwrap().unwrap();
        assert_eq!(snap.system_temp, None);
        assert_eq!(snap.gpu_temp, None);

        let snap = parse_telemetry_line("{}").unwrap().unwrap();
        assert_eq!(snap.system_temp, None);
    }

    #[test]
    fn test_blank_line_skipped() {
        assert!(parse_telemetry_line("").unwrap().is_none());
        assert!(parse_telemetry_line("   \r").unwrap().is_none());
    }

    #[test]
    fn test_malformed_line_is_parse_error() {
        let err = parse_telemetry_line("{\"cpu\": {").unwrap_err();
        assert_eq!(err.kind(), "telemetry_parse");

        let err = parse_telemetry_line("42").unwrap_err();
        assert_eq!(err.kind(), "telemetry_parse");
    }

    #[test]
    fn test_oversized_temperature_dropped() {
        // 1e300 overflows f32 to infinity
        let snap = parse_telemetry_line(r#"{"cpu":{"packageTemp":1e300}}"#).unwrap().unwrap();
        assert_eq!(snap.system_temp, None);
    }
}
