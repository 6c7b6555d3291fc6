//! Constants and configuration defaults for Vortec
//!
//! Centralizes all magic numbers, paths, and configuration defaults.
//! Never use magic numbers in other files - add them here first.

use std::time::Duration;

/// Filesystem locations
pub mod paths {
    use std::path::PathBuf;

    /// Environment variable that overrides the configuration file location
    pub const CONFIG_ENV: &str = "VORTEC_CONFIG";

    /// Directory name under the user config dir
    pub const CONFIG_DIR_NAME: &str = "vortec";

    /// Configuration file name
    pub const CONFIG_FILE: &str = "config.json";

    /// System-wide configuration file
    pub const SYSTEM_CONFIG: &str = "/etc/vortec/config.json";

    /// Default command socket path
    pub const DEFAULT_SOCKET: &str = "/run/vortec.sock";

    /// Default telemetry sidecar executable
    pub const DEFAULT_TELEMETRY_PROGRAM: &str = "/usr/lib/vortec/vortsensors";

    /// Per-user configuration file, if a config directory can be determined
    pub fn user_config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(CONFIG_FILE))
    }
}

/// Control loop timing and fallback speeds
pub mod control {
    use super::Duration;

    /// Nominal tick period, and the cadence of stale ticks once telemetry stops
    pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

    /// Time without a snapshot before the first stale tick runs
    ///
    /// Twice the tick interval, so a 1 Hz sidecar arriving a few ms late
    /// never produces a stale tick.
    pub const DEFAULT_STALE_TIMEOUT_MS: u64 = 2000;

    /// Consecutive stale ticks before the engine enters degraded mode
    pub const DEFAULT_STALE_TICK_LIMIT: u32 = 5;

    /// Target for automatic fans below the first rung
    pub const DEFAULT_IDLE_SPEED: u8 = 0;

    /// Target for every fan while telemetry is unavailable
    pub const DEFAULT_DEGRADED_SPEED: u8 = 100;

    /// Initial manual speed for fans that do not configure one
    pub const DEFAULT_MANUAL_SPEED: u8 = 50;

    /// Command queue depth between clients and the engine actor
    pub const COMMAND_QUEUE_DEPTH: usize = 32;

    /// Log every Nth repeated actuator failure
    pub const ERROR_LOG_EVERY: u32 = 10;

    pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(DEFAULT_TICK_INTERVAL_MS);
}

/// Safety policy defaults
pub mod safety {
    /// Temperature at which safety engages (°C)
    pub const DEFAULT_CRITICAL_TEMP: f32 = 80.0;

    /// Recovery margin below the critical temperature (°C)
    pub const DEFAULT_RECOVERY_DELTA: f32 = 10.0;

    /// Speed every fan is forced to while safety is engaged
    pub const FORCED_SPEED: u8 = 100;

    /// Upper bound on one safety handler invocation
    pub const ACTION_TIMEOUT_MS: u64 = 30_000;

    /// Command run by the `shutdown` action
    pub const DEFAULT_SHUTDOWN_COMMAND: &[&str] = &["systemctl", "poweroff"];
}

/// Telemetry subprocess supervision
pub mod telemetry {
    /// Wait after closing stdin before SIGTERM
    pub const DEFAULT_STOP_GRACE_MS: u64 = 2000;

    /// Wait after SIGTERM before SIGKILL
    pub const TERM_GRACE_MS: u64 = 1000;

    /// Bound on reaping the child's exit status after its stdout closes
    pub const REAP_TIMEOUT_MS: u64 = 500;

    /// Longest accepted telemetry line
    pub const MAX_LINE_BYTES: usize = 64 * 1024;

    pub mod restart {
        pub const INITIAL_BACKOFF_MS: u64 = 1000;
        pub const MAX_BACKOFF_MS: u64 = 30_000;
        /// A run longer than this resets the backoff
        pub const STABILITY_WINDOW_MS: u64 = 10_000;
        pub const MAX_RESTARTS: u32 = 5;
        pub const RESTART_WINDOW_MS: u64 = 60_000;
    }
}

/// Input limits
pub mod limits {
    /// Maximum configuration file size (1 MB)
    pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

    /// Maximum number of fans in a configuration
    pub const MAX_FANS: usize = 16;

    /// Highest accepted critical temperature (°C)
    pub const MAX_CRITICAL_TEMP: f32 = 150.0;
}
