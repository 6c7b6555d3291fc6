//! Vortec daemon library
//!
//! The runtime half of Vortec: the telemetry sidecar supervisor, the fan
//! control engine actor, state publication, and the command socket. The
//! `vortecd` binary wires these together.

pub mod actuator;
pub mod fan_control;
pub mod publisher;
pub mod safety_handler;
pub mod server;
pub mod telemetry;

pub use actuator::{FanActuator, FanReadback, LoggingActuator};
pub use fan_control::{EngineHandle, FanControlEngine};
pub use publisher::{StatePublisher, StateReader};
pub use safety_handler::{SafetyHandler, SystemSafetyHandler};
pub use server::run_server;
pub use telemetry::{
    FeedStatus, RestartBudget, RestartPolicy, TelemetryFeed, TelemetrySource, TelemetrySupervisor,
};
