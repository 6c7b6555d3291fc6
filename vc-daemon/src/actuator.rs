//! Fan actuation
//!
//! The engine only computes target percentages. Writing them to hardware is
//! delegated to a `FanActuator`, which also reports what the fan is actually
//! doing. Actuator failures are logged by the engine and never stop it.
//!
//! `release` hands a fan back to firmware control. The engine calls it for
//! the `bios_control` safety action and when it stops.

use std::collections::HashMap;
use tracing::{debug, info};

use vc_core::Result;

/// Observed state of a fan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanReadback {
    pub percent: Option<u8>,
    pub rpm: Option<u32>,
}

/// Applies fan speed commands
#[cfg_attr(test, mockall::automock)]
pub trait FanActuator: Send {
    /// Command `fan` to run at `percent` (0-100)
    fn apply(&mut self, fan: &str, percent: u8) -> Result<()>;

    /// Last observed speed of `fan`, if the hardware reports one
    fn read_back(&self, fan: &str) -> Option<FanReadback>;

    /// Return `fan` to firmware control until the next `apply`
    fn release(&mut self, fan: &str) -> Result<()>;
}

/// Actuator that records commands without touching hardware
///
/// Read-back echoes the last applied percentage and reports no RPM, or
/// nothing once the fan has been released.
#[derive(Debug, Default)]
pub struct LoggingActuator {
    applied: HashMap<String, u8>,
}

impl LoggingActuator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FanActuator for LoggingActuator {
    fn apply(&mut self, fan: &str, percent: u8) -> Result<()> {
        let previous = self.applied.insert(fan.to_string(), percent);
        if previous != Some(percent) {
            debug!(fan = %fan, percent, "Fan target changed");
        }
        Ok(())
    }

    fn read_back(&self, fan: &str) -> Option<FanReadback> {
        self.applied.get(fan).map(|&p| FanReadback {
            percent: Some(p),
            rpm: None,
        })
    }

    fn release(&mut self, fan: &str) -> Result<()> {
        if self.applied.remove(fan).is_some() {
            info!(fan = %fan, "Fan released to firmware control");
        }
        Ok(())
    }
}
