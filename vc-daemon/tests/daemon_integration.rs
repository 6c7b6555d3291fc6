/*
 * Integration tests for the Vortec daemon
 *
 * These run the real telemetry supervisor against small shell sidecars and
 * drive the engine and socket server the way vortecd wires them together.
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use vc_core::{
    ControlSettings, EngineConfig, FanConfig, FanMode, PublicState, RestartSettings,
    TelemetrySettings, TemperatureThreshold,
};
use vc_daemon::{
    run_server, EngineHandle, FanControlEngine, LoggingActuator, StateReader, SystemSafetyHandler,
    TelemetrySupervisor,
};
use vc_protocol::{Request, RequestEnvelope, Response, ResponseEnvelope};

const WAIT: Duration = Duration::from_secs(5);
const DEGRADED: u8 = 90;

// Test utilities

fn sidecar(script: &str) -> TelemetrySettings {
    TelemetrySettings {
        program: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), script.to_string()],
        stop_grace_ms: 200,
        restart: RestartSettings {
            initial_backoff_ms: 20,
            max_backoff_ms: 100,
            stability_window_ms: 10_000,
            max_restarts: 3,
            restart_window_ms: 60_000,
        },
    }
}

fn test_config(telemetry: TelemetrySettings) -> EngineConfig {
    let mut config = EngineConfig::with_fans(vec![FanConfig::new("CPU Fan").with_thresholds(vec![
        TemperatureThreshold::new(40.0, 50.0, 30),
        TemperatureThreshold::new(60.0, 70.0, 60),
        TemperatureThreshold::new(75.0, 85.0, 100),
    ])]);
    config.control = ControlSettings {
        tick_interval_ms: 50,
        stale_timeout_ms: 100,
        stale_tick_limit: 100,
        idle_speed: 0,
        degraded_speed: DEGRADED,
    };
    config.telemetry = telemetry;
    config.actions.shutdown_command = vec!["true".to_string()];
    config
}

struct Daemon {
    handle: EngineHandle,
    reader: StateReader,
    shutdown: watch::Sender<bool>,
    engine_task: JoinHandle<vc_core::Result<()>>,
    telemetry_task: JoinHandle<()>,
}

impl Daemon {
    fn start(config: &EngineConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (feed, telemetry_task) =
            TelemetrySupervisor::spawn(&config.telemetry, shutdown_rx.clone()).unwrap();
        let engine = FanControlEngine::new(
            config,
            Box::new(LoggingActuator::new()),
            Box::new(SystemSafetyHandler::new(config.actions.shutdown_command.clone())),
        )
        .unwrap();
        let reader = engine.state_reader();
        let (handle, engine_task) = engine.spawn(feed, shutdown_rx);
        Self { handle, reader, shutdown, engine_task, telemetry_task }
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        let result = tokio::time::timeout(WAIT, self.engine_task).await.unwrap().unwrap();
        assert!(result.is_ok());
        tokio::time::timeout(WAIT, self.telemetry_task).await.unwrap().unwrap();
    }
}

async fn wait_for(
    reader: &mut StateReader,
    what: &str,
    predicate: impl Fn(&PublicState) -> bool,
) -> PublicState {
    let waited = tokio::time::timeout(WAIT, async {
        loop {
            let state = reader.snapshot();
            if predicate(&state) {
                return state;
            }
            if reader.changed().await.is_err() {
                panic!("engine stopped while waiting for {}", what);
            }
        }
    })
    .await;
    waited.unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

fn cpu_target(state: &PublicState) -> Option<u8> {
    state.fan("CPU Fan").map(|f| f.target_speed_percent)
}

fn emitting(temp: u32) -> String {
    format!("while true; do printf '{{\"cpu\":{{\"packageTemp\":{}}}}}\\n'; sleep 0.05; done", temp)
}

// Telemetry to engine

#[tokio::test]
async fn test_engine_follows_telemetry() {
    let config = test_config(sidecar(
        "printf '{\"cpu\":{\"packageTemp\":55}}\\n'; sleep 0.2; \
         printf '{\"cpu\":{\"packageTemp\":72}}\\n'; exec sleep 30",
    ));
    let mut daemon = Daemon::start(&config);

    let state = wait_for(&mut daemon.reader, "first band", |s| s.system_temp == Some(55.0)).await;
    assert_eq!(cpu_target(&state), Some(30));

    let state = wait_for(&mut daemon.reader, "second band", |s| s.system_temp == Some(72.0)).await;
    assert_eq!(cpu_target(&state), Some(60));
    assert_eq!(state.fan("CPU Fan").unwrap().current_band, Some(1));
    assert!(!state.safety_engaged);

    daemon.stop().await;
}

#[tokio::test]
async fn test_malformed_line_is_skipped() {
    let config = test_config(sidecar(
        "printf 'not json\\n\\n{\"cpu\":{\"packageTemp\":72}}\\n'; exec sleep 30",
    ));
    let mut daemon = Daemon::start(&config);

    let state = wait_for(&mut daemon.reader, "reading after garbage", |s| s.system_temp.is_some()).await;
    assert_eq!(state.system_temp, Some(72.0));
    assert_eq!(cpu_target(&state), Some(60));

    daemon.stop().await;
}

#[tokio::test]
async fn test_malformed_line_keeps_band() {
    let config = test_config(sidecar(
        "printf '{\"cpu\":{\"packageTemp\":72}}\\n'; sleep 0.3; \
         printf 'garbage\\n'; sleep 0.3; \
         printf '{\"cpu\":{\"packageTemp\":62}}\\n'; exec sleep 30",
    ));
    let mut daemon = Daemon::start(&config);

    let before = wait_for(&mut daemon.reader, "upper band", |s| s.system_temp == Some(72.0)).await;
    assert_eq!(before.fan("CPU Fan").unwrap().current_band, Some(1));

    // 62 only holds band 1 through hysteresis; a reset ladder would pick band 0
    let after = wait_for(&mut daemon.reader, "reading after garbage", |s| {
        s.system_temp == Some(62.0)
    })
    .await;
    assert_eq!(after.fan("CPU Fan").unwrap().current_band, Some(1));
    assert_eq!(cpu_target(&after), Some(60));

    daemon.stop().await;
}

#[tokio::test]
async fn test_sidecar_restart_resumes_feed() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("started");
    let script = format!(
        "if [ -e '{marker}' ]; then {live}; else touch '{marker}'; \
         printf '{{\"cpu\":{{\"packageTemp\":55}}}}\\n'; exit 1; fi",
        marker = marker.display(),
        live = emitting(72)
    );
    let mut daemon = Daemon::start(&test_config(sidecar(&script)));

    let state = wait_for(&mut daemon.reader, "reading from restarted sidecar", |s| {
        s.system_temp == Some(72.0) && !s.stale
    })
    .await;
    assert!(!state.telemetry_unavailable);
    assert_eq!(cpu_target(&state), Some(60));
    assert!(marker.exists());

    daemon.stop().await;
}

#[tokio::test]
async fn test_restart_budget_exhaustion_degrades() {
    let mut telemetry = sidecar("exit 1");
    telemetry.restart.initial_backoff_ms = 10;
    telemetry.restart.max_backoff_ms = 20;
    telemetry.restart.max_restarts = 2;
    let mut daemon = Daemon::start(&test_config(telemetry));

    let state = wait_for(&mut daemon.reader, "degraded mode", |s| s.telemetry_unavailable).await;
    assert_eq!(cpu_target(&state), Some(DEGRADED));
    assert!(!state.safety_engaged);

    daemon.stop().await;
}

#[tokio::test]
async fn test_launch_failure_is_fatal() {
    let mut telemetry = sidecar("");
    telemetry.program = PathBuf::from("/nonexistent/vortsensors");
    let (_shutdown, shutdown_rx) = watch::channel(false);

    let err = TelemetrySupervisor::spawn(&telemetry, shutdown_rx).unwrap_err();
    assert_eq!(err.kind(), "telemetry_launch");
}

#[tokio::test]
async fn test_safety_engages_from_live_telemetry() {
    let mut daemon = Daemon::start(&test_config(sidecar(&emitting(92))));

    let state = wait_for(&mut daemon.reader, "safety", |s| s.safety_engaged).await;
    assert!(state.safety_triggered_at.is_some());
    assert_eq!(cpu_target(&state), Some(100));

    daemon.stop().await;
}

// Commands

#[tokio::test]
async fn test_commands_rejected_after_shutdown() {
    let config = test_config(sidecar("exec sleep 30"));
    let daemon = Daemon::start(&config);
    let handle = daemon.handle.clone();

    handle.set_mode("CPU Fan", FanMode::Manual).await.unwrap();
    daemon.stop().await;

    let err = handle.set_manual_speed("CPU Fan", 40).await.unwrap_err();
    assert_eq!(err.kind(), "shutting_down");
    assert_eq!(handle.state().await.unwrap_err().kind(), "shutting_down");
}

#[tokio::test]
async fn test_commands_served_during_restart_backoff() {
    let mut telemetry = sidecar("exit 1");
    telemetry.restart.initial_backoff_ms = 2000;
    telemetry.restart.max_backoff_ms = 4000;
    let daemon = Daemon::start(&test_config(telemetry));

    // the supervisor is now waiting out its first backoff
    tokio::time::sleep(Duration::from_millis(200)).await;

    let quick = Duration::from_millis(500);
    tokio::time::timeout(quick, daemon.handle.set_mode("CPU Fan", FanMode::Manual))
        .await
        .expect("set_mode stalled during backoff")
        .unwrap();
    let state = tokio::time::timeout(quick, daemon.handle.state())
        .await
        .expect("state stalled during backoff")
        .unwrap();
    assert_eq!(state.fan("CPU Fan").unwrap().mode, FanMode::Manual);
    assert!(!state.telemetry_unavailable);

    daemon.stop().await;
}

// Socket

async fn connect(path: &Path) -> UnixStream {
    let connected = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(stream) = UnixStream::connect(path).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    connected.expect("server did not come up")
}

async fn roundtrip(
    reader: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    request: Request,
) -> Response {
    let envelope = RequestEnvelope::new(request);
    let mut line = serde_json::to_string(&envelope).unwrap();
    line.push('\n');
    writer.write_all(line.as_bytes()).await.unwrap();

    let reply = tokio::time::timeout(WAIT, reader.next_line()).await.unwrap().unwrap().unwrap();
    let response: ResponseEnvelope = serde_json::from_str(&reply).unwrap();
    assert_eq!(response.id, envelope.id);
    response.response
}

fn error_kind(response: &Response) -> &str {
    match response {
        Response::Error { kind, .. } => kind,
        Response::Ok(_) => panic!("expected an error response"),
    }
}

#[tokio::test]
async fn test_socket_commands() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("vortec.sock");
    let config_path = dir.path().join("config.json");
    let config = test_config(sidecar(&emitting(55)));
    std::fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();

    let daemon = Daemon::start(&config);
    let server_path = socket_path.clone();
    let server_handle = daemon.handle.clone();
    let server_shutdown = daemon.shutdown.subscribe();
    let server = tokio::spawn(async move {
        run_server(&server_path, server_handle, config_path, server_shutdown).await
    });

    let (read_half, mut writer) = connect(&socket_path).await.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let pong = roundtrip(&mut lines, &mut writer, Request::Ping).await;
    match pong {
        Response::Ok(data) => assert_eq!(data.value.as_deref(), Some("pong")),
        other => panic!("unexpected response: {:?}", other),
    }

    let unknown = roundtrip(&mut lines, &mut writer, Request::GetFan { fan: "Rear".into() }).await;
    assert_eq!(error_kind(&unknown), "unknown_fan");

    let too_fast = roundtrip(
        &mut lines,
        &mut writer,
        Request::SetManualSpeed { fan: "CPU Fan".into(), percent: 150 },
    )
    .await;
    assert_eq!(error_kind(&too_fast), "invalid_range");

    let set = roundtrip(
        &mut lines,
        &mut writer,
        Request::SetManualSpeed { fan: "CPU Fan".into(), percent: 40 },
    )
    .await;
    assert!(set.is_ok());
    let manual = roundtrip(
        &mut lines,
        &mut writer,
        Request::SetMode { fan: "CPU Fan".into(), mode: FanMode::Manual },
    )
    .await;
    assert!(manual.is_ok());

    match roundtrip(&mut lines, &mut writer, Request::GetFan { fan: "CPU Fan".into() }).await {
        Response::Ok(data) => {
            let fan = data.fan.expect("fan state");
            assert_eq!(fan.mode, FanMode::Manual);
            assert_eq!(fan.manual_speed, 40);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    let reload = roundtrip(&mut lines, &mut writer, Request::ReloadConfig).await;
    assert!(reload.is_ok());

    match roundtrip(&mut lines, &mut writer, Request::GetState).await {
        Response::Ok(data) => {
            let state = data.state.expect("state");
            assert_eq!(state.fans.len(), 1);
            assert_eq!(state.model_name, "Generic");
        }
        other => panic!("unexpected response: {:?}", other),
    }

    drop(writer);
    daemon.shutdown.send_replace(true);
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap().unwrap();
    assert!(!socket_path.exists());
    daemon.stop().await;
}
