use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global request ID counter for correlation
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maximum message size for IPC (8KB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Maximum fan name length
const MAX_FAN_NAME_LENGTH: usize = 64;

/// Maximum number of rungs in a threshold ladder
pub const MAX_THRESHOLDS: usize = 32;

/// Generate a unique request ID for correlation
pub fn generate_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// ============================================================================
// Shared value types
// ============================================================================

/// Operating mode of a single fan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    /// Fan follows its threshold ladder
    #[default]
    Automatic,
    /// Fan runs at the user-supplied manual speed
    Manual,
}

/// Which temperature reading drives a decision
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TempSource {
    /// CPU package / system temperature
    System,
    /// GPU temperature
    Gpu,
    /// Highest of the available readings
    #[default]
    Hottest,
}

/// One rung of a fan's threshold ladder
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TemperatureThreshold {
    /// Temperature at or above which this rung is entered (°C)
    pub up_threshold: f32,
    /// Temperature below which this rung is left (°C)
    pub down_threshold: f32,
    /// Fan speed for this rung (percent)
    pub fan_speed: u8,
}

impl TemperatureThreshold {
    pub fn new(down_threshold: f32, up_threshold: f32, fan_speed: u8) -> Self {
        Self {
            up_threshold,
            down_threshold,
            fan_speed,
        }
    }
}

/// Per-fan view handed to consumers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicFanState {
    pub name: String,
    pub mode: FanMode,
    pub manual_speed: u8,
    pub target_speed_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_speed_percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_rpm: Option<u32>,
    pub temp_source: TempSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_band: Option<usize>,
    pub thresholds: Vec<TemperatureThreshold>,
    /// Last automatic evaluation had no fresh reading
    #[serde(default)]
    pub stale: bool,
}

/// Aggregated engine snapshot, regenerated every tick
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PublicState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_temp: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_temp: Option<f32>,
    pub fans: Vec<PublicFanState>,
    pub model_name: String,
    pub safety_engaged: bool,
    /// Unix time in milliseconds of the last Normal -> Engaged transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_triggered_at: Option<u64>,
    /// Telemetry has been missing long enough to force the safe fan state
    pub telemetry_unavailable: bool,
    /// This tick reused the previous snapshot
    pub stale: bool,
    /// Number of ticks completed since the engine started
    pub tick: u64,
}

impl PublicState {
    pub fn fan(&self, name: &str) -> Option<&PublicFanState> {
        self.fans.iter().find(|f| f.name == name)
    }
}

// ============================================================================
// Request / Response
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation and debugging
    pub id: u64,
    /// The actual request
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self {
            id: generate_request_id(),
            request,
        }
    }

    pub fn with_id(request: Request, id: u64) -> Self {
        Self { id, request }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    Ping,
    Version,
    GetState,
    GetFan { fan: String },
    SetMode { fan: String, mode: FanMode },
    /// Percent is signed on the wire so out-of-range values reach validation
    SetManualSpeed { fan: String, percent: i64 },
    SetThresholds { fan: String, thresholds: Vec<TemperatureThreshold> },
    ReloadConfig,
}

impl Request {
    /// Validate request parameters before handing them to the engine
    ///
    /// Only checks shape (name syntax, list length). Range and ladder
    /// validation belongs to the engine so the error kinds stay specific.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Ping | Request::Version | Request::GetState | Request::ReloadConfig => Ok(()),
            Request::GetFan { fan } => validate_fan_name(fan),
            Request::SetMode { fan, mode: _ } => validate_fan_name(fan),
            Request::SetManualSpeed { fan, percent: _ } => validate_fan_name(fan),
            Request::SetThresholds { fan, thresholds } => {
                validate_fan_name(fan)?;
                if thresholds.len() > MAX_THRESHOLDS {
                    return Err(format!("Too many thresholds (max {})", MAX_THRESHOLDS));
                }
                Ok(())
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Version => "Version",
            Request::GetState => "GetState",
            Request::GetFan { .. } => "GetFan",
            Request::SetMode { .. } => "SetMode",
            Request::SetManualSpeed { .. } => "SetManualSpeed",
            Request::SetThresholds { .. } => "SetThresholds",
            Request::ReloadConfig => "ReloadConfig",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to
    pub id: u64,
    /// The actual response
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, response }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponseData),
    #[serde(rename = "error")]
    Error { kind: String, message: String },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(ResponseData::none())
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

/// Response data - only the field relevant to the request is populated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PublicState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan: Option<PublicFanState>,
}

impl ResponseData {
    pub fn none() -> Self { Self::default() }
    pub fn string(v: String) -> Self { Self { value: Some(v), ..Self::default() } }
    pub fn state(s: PublicState) -> Self { Self { state: Some(s), ..Self::default() } }
    pub fn fan(f: PublicFanState) -> Self { Self { fan: Some(f), ..Self::default() } }
}

// ============================================================================
// Validation helpers
// ============================================================================

/// Validate a fan name for use in requests and configuration
pub fn validate_fan_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Fan name cannot be empty".into());
    }
    if name.len() > MAX_FAN_NAME_LENGTH {
        return Err(format!("Fan name too long (max {} bytes)", MAX_FAN_NAME_LENGTH));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err("Fan name contains control characters".into());
    }
    Ok(())
}

/// Validate a percentage received on the wire, returning it narrowed
pub fn validate_percent(value: i64) -> Result<u8, String> {
    if !(0..=100).contains(&value) {
        return Err(format!("Percent out of range: {} (must be 0-100)", value));
    }
    Ok(value as u8)
}

/// Validate a threshold ladder
///
/// Rungs must be ordered by strictly increasing `up_threshold`, each rung
/// must satisfy `down_threshold <= up_threshold`, and `down_threshold` must
/// never decrease from one rung to the next. An empty ladder is valid.
pub fn validate_thresholds(thresholds: &[TemperatureThreshold]) -> Result<(), String> {
    if thresholds.len() > MAX_THRESHOLDS {
        return Err(format!("Too many thresholds (max {})", MAX_THRESHOLDS));
    }

    for (i, t) in thresholds.iter().enumerate() {
        if !t.up_threshold.is_finite() || !t.down_threshold.is_finite() {
            return Err(format!("Threshold {} has a non-finite temperature", i));
        }
        if t.down_threshold > t.up_threshold {
            return Err(format!(
                "Threshold {}: down_threshold {} exceeds up_threshold {}",
                i, t.down_threshold, t.up_threshold
            ));
        }
        if t.fan_speed > 100 {
            return Err(format!("Threshold {}: fan_speed {} exceeds 100", i, t.fan_speed));
        }
    }

    for (i, pair) in thresholds.windows(2).enumerate() {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.up_threshold <= prev.up_threshold {
            return Err(format!(
                "Thresholds not sorted: up_threshold {} at {} follows {}",
                next.up_threshold,
                i + 1,
                prev.up_threshold
            ));
        }
        if next.down_threshold < prev.down_threshold {
            return Err(format!(
                "Threshold {}: down_threshold {} is below previous {}",
                i + 1,
                next.down_threshold,
                prev.down_threshold
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> Vec<TemperatureThreshold> {
        vec![
            TemperatureThreshold::new(40.0, 45.0, 30),
            TemperatureThreshold::new(50.0, 55.0, 70),
        ]
    }

    #[test]
    fn test_valid_ladder() {
        assert!(validate_thresholds(&ladder()).is_ok());
        assert!(validate_thresholds(&[]).is_ok());
    }

    #[test]
    fn test_unsorted_ladder_rejected() {
        let mut t = ladder();
        t.reverse();
        assert!(validate_thresholds(&t).is_err());
    }

    #[test]
    fn test_inverted_band_rejected() {
        let t = vec![TemperatureThreshold::new(50.0, 45.0, 30)];
        assert!(validate_thresholds(&t).is_err());
    }

    #[test]
    fn test_overlapping_down_rejected() {
        let t = vec![
            TemperatureThreshold::new(40.0, 45.0, 30),
            TemperatureThreshold::new(35.0, 55.0, 70),
        ];
        assert!(validate_thresholds(&t).is_err());
    }

    #[test]
    fn test_speed_over_100_rejected() {
        let t = vec![TemperatureThreshold::new(40.0, 45.0, 101)];
        assert!(validate_thresholds(&t).is_err());
    }

    #[test]
    fn test_non_finite_rejected() {
        let t = vec![TemperatureThreshold::new(f32::NAN, 45.0, 30)];
        assert!(validate_thresholds(&t).is_err());
    }

    #[test]
    fn test_percent_validation() {
        assert_eq!(validate_percent(0), Ok(0));
        assert_eq!(validate_percent(100), Ok(100));
        assert!(validate_percent(-1).is_err());
        assert!(validate_percent(101).is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let req = RequestEnvelope::with_id(
            Request::SetMode { fan: "CPU Fan".into(), mode: FanMode::Manual },
            7,
        );
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"id":7,"cmd":"SetMode","data":{"fan":"CPU Fan","mode":"manual"}}"#
        );

        let parsed: RequestEnvelope = serde_json::from_str(r#"{"id":3,"cmd":"GetState"}"#).unwrap();
        assert_eq!(parsed.id, 3);
        assert!(matches!(parsed.request, Request::GetState));
    }

    #[test]
    fn test_error_response_wire_format() {
        let resp = ResponseEnvelope::new(9, Response::error("unknown_fan", "Unknown fan: x"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""status":"error""#));
        assert!(json.contains(r#""kind":"unknown_fan""#));
    }

    #[test]
    fn test_request_validation() {
        assert!(Request::GetFan { fan: "".into() }.validate().is_err());
        assert!(Request::SetManualSpeed { fan: "CPU".into(), percent: 500 }.validate().is_ok());
    }
}
