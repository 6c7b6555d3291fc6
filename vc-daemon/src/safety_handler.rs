//! Safety action execution
//!
//! Forcing fans to full speed, and the firmware hand-off for `bios_control`,
//! are done by the engine before the handler runs. The handler carries out
//! whatever the configured action needs beyond that. It runs on a blocking
//! thread under a timeout; a failing or hung handler is fatal for the engine.

use std::process::Command;
use tracing::{error, warn};

use vc_core::{format_temp_precise, Result, SafetyAction, VortecError};

/// Carries out the side effects of a safety action
#[cfg_attr(test, mockall::automock)]
pub trait SafetyHandler: Send {
    fn execute(&mut self, action: SafetyAction, temperature: f32) -> Result<()>;
}

/// Production handler
///
/// `max_speed` and `bios_control` only log. `shutdown` runs the configured
/// command and waits for it, failing if it cannot be started or exits non-zero.
#[derive(Debug, Clone)]
pub struct SystemSafetyHandler {
    shutdown_command: Vec<String>,
}

impl SystemSafetyHandler {
    pub fn new(shutdown_command: Vec<String>) -> Self {
        Self { shutdown_command }
    }

    fn run_shutdown(&self) -> Result<()> {
        let (program, args) = self.shutdown_command.split_first().ok_or_else(|| {
            VortecError::SafetyActionFailed {
                action: SafetyAction::Shutdown.to_string(),
                reason: "no shutdown command configured".into(),
            }
        })?;

        let status = Command::new(program).args(args).status().map_err(|e| {
            VortecError::SafetyActionFailed {
                action: SafetyAction::Shutdown.to_string(),
                reason: format!("failed to run {}: {}", program, e),
            }
        })?;

        if !status.success() {
            return Err(VortecError::SafetyActionFailed {
                action: SafetyAction::Shutdown.to_string(),
                reason: format!("{} exited with {}", program, status),
            });
        }
        Ok(())
    }
}

impl SafetyHandler for SystemSafetyHandler {
    fn execute(&mut self, action: SafetyAction, temperature: f32) -> Result<()> {
        let temp = format_temp_precise(temperature);
        match action {
            SafetyAction::MaxSpeed => {
                warn!("SAFETY: {} reached critical temperature, all fans forced to maximum", temp);
                Ok(())
            }
            SafetyAction::BiosControl => {
                warn!("SAFETY: {} reached critical temperature, fans forced and handed to firmware", temp);
                Ok(())
            }
            SafetyAction::Shutdown => {
                error!("SAFETY: {} reached critical temperature, requesting system shutdown", temp);
                self.run_shutdown()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(cmd: &[&str]) -> SystemSafetyHandler {
        SystemSafetyHandler::new(cmd.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_non_shutdown_actions_succeed() {
        let mut h = handler(&["/bin/false"]);
        assert!(h.execute(SafetyAction::MaxSpeed, 95.0).is_ok());
        assert!(h.execute(SafetyAction::BiosControl, 95.0).is_ok());
    }

    #[test]
    fn test_shutdown_runs_command() {
        let mut h = handler(&["/bin/sh", "-c", "exit 0"]);
        assert!(h.execute(SafetyAction::Shutdown, 95.0).is_ok());
    }

    #[test]
    fn test_shutdown_failure_reported() {
        let mut h = handler(&["/bin/sh", "-c", "exit 3"]);
        let err = h.execute(SafetyAction::Shutdown, 95.0).unwrap_err();
        assert_eq!(err.kind(), "safety_action_failed");

        let mut h = handler(&["/nonexistent/poweroff"]);
        assert!(h.execute(SafetyAction::Shutdown, 95.0).is_err());

        let mut h = handler(&[]);
        assert!(h.execute(SafetyAction::Shutdown, 95.0).is_err());
    }
}
