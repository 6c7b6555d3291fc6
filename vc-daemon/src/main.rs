//! Vortec Daemon (vortecd)
//!
//! Runs the fan control engine: supervises the telemetry sidecar, computes
//! fan targets every tick, enforces the critical temperature policy, and
//! serves commands on a Unix domain socket.
//!
//! # Startup
//! Startup refuses to continue when the configuration is invalid or the
//! telemetry sidecar cannot be launched at all. Everything after that is
//! recoverable at runtime.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use vc_core::constants::paths;
use vc_daemon::{
    run_server, FanControlEngine, LoggingActuator, SystemSafetyHandler, TelemetrySupervisor,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// CLI
// ============================================================================

struct Options {
    config_path: Option<PathBuf>,
    socket_path: PathBuf,
}

fn print_help() {
    eprintln!("vortecd {} - Vortec fan control daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    vortecd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Configuration file");
    eprintln!("    -s, --socket PATH   Socket path (default {})", paths::DEFAULT_SOCKET);
    eprintln!("    -f, --foreground    Run in foreground (always on)");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    VORTEC_LOG          Log filter (trace, debug, info, warn, error)");
    eprintln!("    VORTEC_CONFIG       Configuration file if --config is not given");
}

fn print_version() {
    println!("vortecd {}", VERSION);
}

/// Parse arguments; `None` means the process should exit successfully
fn parse_args() -> Option<Options> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        config_path: None,
        socket_path: PathBuf::from(paths::DEFAULT_SOCKET),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return None;
            }
            "-v" | "--version" => {
                print_version();
                return None;
            }
            "-f" | "--foreground" => {
                // Foreground mode is always on (no daemonization implemented)
            }
            flag @ ("-c" | "--config" | "-s" | "--socket") => {
                i += 1;
                let Some(value) = args.get(i) else {
                    eprintln!("Error: {} requires a path argument", flag);
                    std::process::exit(1);
                };
                if flag == "-c" || flag == "--config" {
                    options.config_path = Some(PathBuf::from(value));
                } else {
                    options.socket_path = PathBuf::from(value);
                }
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    Some(options)
}

// ============================================================================
// Logging
// ============================================================================

/// Install the global subscriber; true if logging to the systemd journal
fn init_logging(log_level: &str) -> bool {
    use tracing_subscriber::prelude::*;

    if std::path::Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(log_level))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(log_level)
        .init();
    false
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let Some(options) = parse_args() else {
        return Ok(());
    };

    let log_level = std::env::var("VORTEC_LOG").unwrap_or_else(|_| "info".to_string());
    let use_journald = init_logging(&log_level);

    info!("STARTUP: vortecd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stdout" });

    // PHASE 1: Configuration (fatal if invalid)
    let config_path = options.config_path.unwrap_or_else(vc_core::get_config_path);
    info!("STARTUP: Config: {:?}", config_path);
    let config = vc_core::load_config(&config_path)
        .with_context(|| format!("invalid configuration {:?}", config_path))?;

    // PHASE 2: Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = shutdown_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("SIGNAL: Received SIGINT/SIGTERM - initiating shutdown");
        signal_tx.send_replace(true);
    }) {
        warn!("Failed to set signal handler: {}. Shutdown via signals may not work cleanly.", e);
    }

    // PHASE 3: Telemetry sidecar (fatal if it cannot be launched)
    let (feed, telemetry_handle) = TelemetrySupervisor::spawn(&config.telemetry, shutdown_rx.clone())
        .context("cannot start telemetry sidecar")?;

    // PHASE 4: Engine
    let engine = FanControlEngine::new(
        &config,
        Box::new(LoggingActuator::new()),
        Box::new(SystemSafetyHandler::new(config.actions.shutdown_command.clone())),
    )?;
    let (handle, engine_task) = engine.spawn(feed, shutdown_rx.clone());
    info!("STARTUP: Fan control engine started ({} fans)", config.fans.len());

    // PHASE 5: Command socket
    info!("STARTUP: Socket path: {:?}", options.socket_path);
    let socket_path = options.socket_path.clone();
    let server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        run_server(&socket_path, handle, config_path, server_shutdown).await
    });

    // The engine ends on shutdown or on a fatal safety failure; either way
    // everything else follows it down.
    let engine_result = match engine_task.await {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(e) => Err(anyhow::anyhow!("engine task panicked: {}", e)),
    };
    shutdown_tx.send_replace(true);

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
    }
    if let Err(e) = telemetry_handle.await {
        error!("Telemetry supervisor failed: {}", e);
    }

    info!("SHUTDOWN: vortecd stopped");
    engine_result
}
