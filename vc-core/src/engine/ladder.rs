//! Hysteresis ladder for automatic fan control
//!
//! A fan owns an ordered list of rungs. Each rung is entered when the
//! temperature reaches its `up_threshold` and left only once the temperature
//! drops below its `down_threshold`, so readings between the two never make
//! the fan speed oscillate.
//!
//! The current band is threaded through explicitly: callers keep the
//! returned band and pass it back on the next evaluation.

use crate::data::TemperatureThreshold;

/// Result of one ladder evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandSelection {
    /// Active rung, `None` below the first rung
    pub band: Option<usize>,
    /// Target speed percent for the band
    pub fan_speed: u8,
    /// No usable reading; the previous band was kept
    pub stale: bool,
}

/// Evaluate the ladder for one reading
///
/// `previous` indices past the end of `thresholds` are treated as `None`,
/// which happens after the list was replaced. Non-finite readings count as
/// missing.
pub fn evaluate(
    reading: Option<f32>,
    thresholds: &[TemperatureThreshold],
    previous: Option<usize>,
    idle_speed: u8,
) -> BandSelection {
    let reading = reading.filter(|r| r.is_finite());
    let stale = reading.is_none();

    if thresholds.is_empty() {
        return BandSelection { band: None, fan_speed: idle_speed, stale };
    }

    let current = previous.filter(|&b| b < thresholds.len());

    let band = match reading {
        None => current,
        Some(temp) => next_band(temp, thresholds, current),
    };

    BandSelection {
        band,
        fan_speed: speed_for(band, thresholds, idle_speed),
        stale,
    }
}

fn next_band(temp: f32, thresholds: &[TemperatureThreshold], current: Option<usize>) -> Option<usize> {
    // Rising: jump straight to the highest rung whose up threshold is met
    if let Some(highest) = thresholds.iter().rposition(|t| temp >= t.up_threshold) {
        if current.map_or(true, |c| highest > c) {
            return Some(highest);
        }
    }

    // Falling: retreat below the current rung only once we cross its down threshold
    if let Some(c) = current {
        if temp < thresholds[c].down_threshold {
            return thresholds[..c].iter().rposition(|t| t.down_threshold <= temp);
        }
    }

    current
}

/// Speed for a band, or the idle speed below the first rung
pub fn speed_for(band: Option<usize>, thresholds: &[TemperatureThreshold], idle_speed: u8) -> u8 {
    band.and_then(|b| thresholds.get(b))
        .map_or(idle_speed, |t| t.fan_speed)
}
