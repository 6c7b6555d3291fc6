//! Critical temperature policy
//!
//! Two states, Normal and Engaged. Engaging emits the configured action
//! exactly once. Leaving Engaged requires recovery to be enabled and a
//! present reading at or below `critical_temp - critical_temp_recovery_delta`;
//! without that the engaged state lasts for the lifetime of the engine.

use std::time::SystemTime;

use crate::data::{SafetyAction, SafetySettings};

/// Engine-wide safety state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyState {
    pub engaged: bool,
    /// Time of the most recent Normal -> Engaged transition, kept after recovery
    pub triggered_at: Option<SystemTime>,
}

/// What changed during one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyEvent {
    /// Normal -> Engaged; the action must be carried out once
    Engaged(SafetyAction),
    /// Engaged -> Normal
    Recovered,
}

/// Advance the safety state for one tick
///
/// `reading` is the watched temperature for this tick, `None` when stale or
/// unavailable. A missing reading can neither engage nor recover.
pub fn evaluate_safety(
    state: SafetyState,
    reading: Option<f32>,
    settings: &SafetySettings,
    now: SystemTime,
) -> (SafetyState, Option<SafetyEvent>) {
    let Some(temp) = reading.filter(|t| t.is_finite()) else {
        return (state, None);
    };

    if !state.engaged {
        if temp >= settings.critical_temp {
            let next = SafetyState {
                engaged: true,
                triggered_at: Some(now),
            };
            return (next, Some(SafetyEvent::Engaged(settings.safety_action)));
        }
        return (state, None);
    }

    if settings.enable_critical_temp_recovery && temp <= settings.recovery_temp() {
        let next = SafetyState {
            engaged: false,
            triggered_at: state.triggered_at,
        };
        return (next, Some(SafetyEvent::Recovered));
    }

    (state, None)
}
