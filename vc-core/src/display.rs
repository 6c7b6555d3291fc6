//! Display formatting helpers
//!
//! Frontend-agnostic formatting of temperatures, speeds and the aggregated
//! public state. Used for log lines and by any text client.

use crate::data::{FanMode, PublicFanState, PublicState};

/// Format an optional temperature, e.g. "45°C" or "--°C"
pub fn format_temp(temp_celsius: Option<f32>) -> String {
    match temp_celsius {
        Some(t) if t.is_finite() => format!("{:.0}°C", t),
        _ => "--°C".to_string(),
    }
}

/// Format a temperature with one decimal place
pub fn format_temp_precise(temp_celsius: f32) -> String {
    format!("{:.1}°C", temp_celsius)
}

/// Format a speed percentage
pub fn format_percent(percent: u8) -> String {
    format!("{}%", percent)
}

/// Format an optional read-back percentage
pub fn format_percent_optional(percent: Option<u8>) -> String {
    match percent {
        Some(p) => format!("{}%", p),
        None => "--%".to_string(),
    }
}

/// Format RPM value with optional suffix
pub fn format_rpm_optional(rpm: Option<u32>) -> String {
    match rpm {
        Some(r) => format!("{} RPM", r),
        None => "-- RPM".to_string(),
    }
}

pub fn format_mode(mode: FanMode) -> &'static str {
    match mode {
        FanMode::Automatic => "auto",
        FanMode::Manual => "manual",
    }
}

/// One-line summary of a fan, e.g. "CPU Fan auto band=1 70% (68%, 3100 RPM)"
pub fn format_fan(fan: &PublicFanState) -> String {
    let band = match fan.current_band {
        Some(b) => b.to_string(),
        None => "-".to_string(),
    };
    format!(
        "{} {} band={} {} ({}, {}){}",
        fan.name,
        format_mode(fan.mode),
        band,
        format_percent(fan.target_speed_percent),
        format_percent_optional(fan.read_speed_percent),
        format_rpm_optional(fan.current_rpm),
        if fan.stale { " stale" } else { "" }
    )
}

/// One-line summary of the whole engine state
pub fn format_state_summary(state: &PublicState) -> String {
    let mut flags = Vec::new();
    if state.safety_engaged {
        flags.push("SAFETY");
    }
    if state.telemetry_unavailable {
        flags.push("DEGRADED");
    } else if state.stale {
        flags.push("stale");
    }

    let fans: Vec<String> = state.fans.iter().map(format_fan).collect();
    let mut line = format!(
        "#{} cpu={} gpu={} | {}",
        state.tick,
        format_temp(state.system_temp),
        format_temp(state.gpu_temp),
        fans.join(" | ")
    );
    if !flags.is_empty() {
        line.push_str(&format!(" [{}]", flags.join(",")));
    }
    line
}
