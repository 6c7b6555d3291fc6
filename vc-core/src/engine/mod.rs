//! Control decisions
//!
//! Pure functions only: the hysteresis ladder and the safety state machine.
//! The daemon owns the state they operate on.

mod ladder;
mod safety;

pub use ladder::{evaluate, speed_for, BandSelection};
pub use safety::{evaluate_safety, SafetyEvent, SafetyState};
