//! Fan Control Engine
//!
//! A single tokio task owns every fan and the safety state. Telemetry
//! arrives through a watch channel, commands through a bounded mpsc queue
//! with a oneshot reply each, so a command always lands strictly between
//! two ticks.
//!
//! # Tick
//! 1. Take the fresh snapshot, or reuse the last one and mark the tick stale
//!    when none arrived within `stale_timeout_ms` (then every tick interval).
//! 2. Advance the safety state (stale ticks carry no reading).
//! 3. Compute each fan's target: safety override, then degraded speed,
//!    then manual speed, then the threshold ladder.
//! 4. Push targets to the actuator and collect read-back.
//! 5. Publish the new `PublicState`.
//! 6. If safety just engaged, run the safety handler on a blocking thread,
//!    bounded by `ACTION_TIMEOUT_MS`. The fans are already forced by then.
//!
//! # Safety Features
//! - **Degraded mode**: after `stale_tick_limit` stale ticks, or when the
//!   telemetry supervisor gives up, every fan runs at `degraded_speed`
//! - **Critical override**: while safety is engaged every fan runs at 100%;
//!   with `bios_control` the fans are forced once, then released to firmware
//!   until safety recovers
//! - **Fatal handler failure**: if the safety action fails or times out the
//!   engine stops with an error, after the forced state was applied
//! - **Release on exit**: every fan is handed back to firmware when the
//!   engine stops

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use vc_core::constants::{control, safety as safety_const};
use vc_core::{
    evaluate, evaluate_safety, format_temp, select_reading, validate_manual_speed,
    validate_safety_settings, validate_thresholds, ControlSettings, EngineConfig, FanConfig,
    FanMode, PublicFanState, PublicState, Result, SafetyAction, SafetyEvent, SafetySettings,
    SafetyState, TelemetrySnapshot, TempSource, TemperatureThreshold, VortecError,
};

use crate::actuator::{FanActuator, FanReadback};
use crate::publisher::{StatePublisher, StateReader};
use crate::safety_handler::SafetyHandler;
use crate::telemetry::{FeedStatus, TelemetryFeed};

// ============================================================================
// Fan runtime
// ============================================================================

/// Engine-owned state of one fan
#[derive(Debug, Clone)]
struct FanRuntime {
    name: String,
    mode: FanMode,
    manual_speed: u8,
    temp_source: TempSource,
    thresholds: Vec<TemperatureThreshold>,
    band: Option<usize>,
    target: u8,
    stale: bool,
    readback: Option<FanReadback>,
    actuator_errors: u32,
}

impl FanRuntime {
    fn from_config(config: &FanConfig) -> Self {
        Self {
            name: config.name.clone(),
            mode: config.mode,
            manual_speed: config.manual_speed,
            temp_source: config.temp_source,
            thresholds: config.thresholds.clone(),
            band: None,
            target: 0,
            stale: false,
            readback: None,
            actuator_errors: 0,
        }
    }

    fn apply_config(&mut self, config: &FanConfig) {
        self.mode = config.mode;
        self.manual_speed = config.manual_speed;
        self.temp_source = config.temp_source;
        if self.thresholds != config.thresholds {
            self.thresholds = config.thresholds.clone();
            self.band = None;
        }
    }

    fn public(&self) -> PublicFanState {
        PublicFanState {
            name: self.name.clone(),
            mode: self.mode,
            manual_speed: self.manual_speed,
            target_speed_percent: self.target,
            read_speed_percent: self.readback.and_then(|r| r.percent),
            current_rpm: self.readback.and_then(|r| r.rpm),
            temp_source: self.temp_source,
            current_band: self.band,
            thresholds: self.thresholds.clone(),
            stale: self.stale,
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    SetMode { fan: String, mode: FanMode, reply: Reply<()> },
    SetManualSpeed { fan: String, percent: i64, reply: Reply<()> },
    SetThresholds { fan: String, thresholds: Vec<TemperatureThreshold>, reply: Reply<()> },
    GetFan { fan: String, reply: Reply<PublicFanState> },
    UpdateSettings { settings: SafetySettings, reply: Reply<()> },
    Reload { config: Box<EngineConfig>, reply: Reply<()> },
    State { reply: Reply<PublicState> },
}

impl Command {
    fn reject(self) {
        // receivers may already be gone
        match self {
            Command::SetMode { reply, .. }
            | Command::SetManualSpeed { reply, .. }
            | Command::SetThresholds { reply, .. }
            | Command::UpdateSettings { reply, .. }
            | Command::Reload { reply, .. } => {
                let _ = reply.send(Err(VortecError::ShuttingDown));
            }
            Command::GetFan { reply, .. } => {
                let _ = reply.send(Err(VortecError::ShuttingDown));
            }
            Command::State { reply } => {
                let _ = reply.send(Err(VortecError::ShuttingDown));
            }
        }
    }
}

/// Cloneable async handle to a running engine
///
/// Every call fails with `ShuttingDown` once the engine has stopped.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| VortecError::ShuttingDown)?;
        rx.await.map_err(|_| VortecError::ShuttingDown)?
    }

    pub async fn set_mode(&self, fan: &str, mode: FanMode) -> Result<()> {
        let fan = fan.to_string();
        self.request(|reply| Command::SetMode { fan, mode, reply }).await
    }

    /// Takes a signed value so out-of-range input is rejected, never wrapped
    pub async fn set_manual_speed(&self, fan: &str, percent: i64) -> Result<()> {
        let fan = fan.to_string();
        self.request(|reply| Command::SetManualSpeed { fan, percent, reply }).await
    }

    pub async fn set_thresholds(&self, fan: &str, thresholds: Vec<TemperatureThreshold>) -> Result<()> {
        let fan = fan.to_string();
        self.request(|reply| Command::SetThresholds { fan, thresholds, reply }).await
    }

    pub async fn get_fan(&self, fan: &str) -> Result<PublicFanState> {
        let fan = fan.to_string();
        self.request(|reply| Command::GetFan { fan, reply }).await
    }

    pub async fn update_settings(&self, settings: SafetySettings) -> Result<()> {
        self.request(|reply| Command::UpdateSettings { settings, reply }).await
    }

    pub async fn reload(&self, config: EngineConfig) -> Result<()> {
        let config = Box::new(config);
        self.request(|reply| Command::Reload { config, reply }).await
    }

    pub async fn state(&self) -> Result<PublicState> {
        self.request(|reply| Command::State { reply }).await
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct FanControlEngine {
    model_name: String,
    settings: SafetySettings,
    control: ControlSettings,
    fans: Vec<FanRuntime>,
    safety: SafetyState,
    last_snapshot: Option<TelemetrySnapshot>,
    last_sequence: u64,
    stale_ticks: u32,
    stale: bool,
    telemetry_unavailable: bool,
    tick_count: u64,
    /// Fans handed to firmware by `bios_control`; no writes until recovery
    released: bool,
    actuator: Box<dyn FanActuator>,
    /// Taken while the handler runs on a blocking thread
    safety_handler: Option<Box<dyn SafetyHandler>>,
    action_timeout: Duration,
    publisher: StatePublisher,
}

impl FanControlEngine {
    /// Build an engine from a configuration, validating it first
    pub fn new(
        config: &EngineConfig,
        actuator: Box<dyn FanActuator>,
        safety_handler: Box<dyn SafetyHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let engine = Self {
            model_name: config.model_name.clone(),
            settings: config.settings.clone(),
            control: config.control.clone(),
            fans: config.fans.iter().map(FanRuntime::from_config).collect(),
            safety: SafetyState::default(),
            last_snapshot: None,
            last_sequence: 0,
            stale_ticks: 0,
            stale: false,
            telemetry_unavailable: false,
            tick_count: 0,
            released: false,
            actuator,
            safety_handler: Some(safety_handler),
            action_timeout: Duration::from_millis(safety_const::ACTION_TIMEOUT_MS),
            publisher: StatePublisher::new(PublicState::default()),
        };
        engine.publish();
        Ok(engine)
    }

    pub fn state_reader(&self) -> StateReader {
        self.publisher.subscribe()
    }

    /// Run the engine on its own task
    ///
    /// The task ends when `shutdown` becomes true (or its sender is dropped),
    /// or with `SafetyActionFailed` if a safety action cannot be carried out.
    pub fn spawn(
        self,
        feed: watch::Receiver<TelemetryFeed>,
        shutdown: watch::Receiver<bool>,
    ) -> (EngineHandle, JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel(control::COMMAND_QUEUE_DEPTH);
        let handle = tokio::spawn(self.run(rx, feed, shutdown));
        (EngineHandle { tx }, handle)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut feed: watch::Receiver<TelemetryFeed>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            "Fan control engine starting: {} fans, tick {}ms, critical {}",
            self.fans.len(),
            self.control.tick_interval_ms,
            format_temp(Some(self.settings.critical_temp))
        );

        let mut commands_open = true;
        let mut feed_open = true;
        let mut deadline = Instant::now() + self.control.stale_timeout();

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => commands_open = false,
                },
                changed = feed.changed(), if feed_open => {
                    if changed.is_err() {
                        warn!("Telemetry feed closed, continuing on stale ticks");
                        feed_open = false;
                        continue;
                    }
                    let current = feed.borrow_and_update().clone();
                    match self.on_feed(current).await {
                        Ok(true) => deadline = Instant::now() + self.control.stale_timeout(),
                        Ok(false) => {}
                        Err(e) => break Err(e),
                    }
                }
                _ = sleep_until(deadline) => {
                    if let Err(e) = self.step(None).await {
                        break Err(e);
                    }
                    deadline = Instant::now() + self.control.tick_interval();
                }
            }
        };

        self.release_all();

        // reject everything still queued, and everything sent from now on
        commands.close();
        while let Ok(cmd) = commands.try_recv() {
            cmd.reject();
        }

        match &result {
            Ok(()) => info!("Fan control engine stopped after {} ticks", self.tick_count),
            Err(e) => error!("Fan control engine stopped: {}", e),
        }
        result
    }

    /// React to a feed update; true if a tick ran
    async fn on_feed(&mut self, feed: TelemetryFeed) -> Result<bool> {
        if let Some(snapshot) = feed.snapshot {
            if snapshot.sequence > self.last_sequence {
                self.step(Some(snapshot)).await?;
                return Ok(true);
            }
        }

        if feed.status == FeedStatus::Unavailable && !self.telemetry_unavailable {
            warn!("Telemetry unavailable, forcing fans to {}%", self.control.degraded_speed);
            self.telemetry_unavailable = true;
            self.step(None).await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Run one control cycle, then the safety action if safety just engaged
    async fn step(&mut self, fresh: Option<TelemetrySnapshot>) -> Result<()> {
        match self.tick(fresh) {
            Some((action, temp)) => self.run_safety_action(action, temp).await,
            None => Ok(()),
        }
    }

    /// Compute, apply and publish one control cycle
    ///
    /// `fresh` is `None` for a stale tick, which reuses the last snapshot for
    /// display but hands no reading to the ladder or the safety policy.
    /// Returns the safety action to carry out when safety engaged on this tick.
    fn tick(&mut self, fresh: Option<TelemetrySnapshot>) -> Option<(SafetyAction, f32)> {
        self.tick_count += 1;

        let (system, gpu) = match fresh {
            Some(snapshot) => {
                if self.telemetry_unavailable {
                    info!("Telemetry resumed after {} stale ticks", self.stale_ticks);
                }
                self.last_sequence = self.last_sequence.max(snapshot.sequence);
                self.stale_ticks = 0;
                self.stale = false;
                self.telemetry_unavailable = false;
                let readings = (snapshot.system_temp, snapshot.gpu_temp);
                self.last_snapshot = Some(snapshot);
                readings
            }
            None => {
                self.stale_ticks = self.stale_ticks.saturating_add(1);
                self.stale = true;
                if self.stale_ticks >= self.control.stale_tick_limit && !self.telemetry_unavailable {
                    warn!(
                        "No telemetry for {} ticks, forcing fans to {}%",
                        self.stale_ticks, self.control.degraded_speed
                    );
                    self.telemetry_unavailable = true;
                } else {
                    debug!("Stale tick (count: {})", self.stale_ticks);
                }
                (None, None)
            }
        };

        // safety precedes per-fan computation
        let watched = select_reading(system, gpu, self.settings.safety_sensor);
        let (next, event) = evaluate_safety(self.safety, watched, &self.settings, SystemTime::now());
        self.safety = next;

        let mut pending = None;
        match event {
            Some(SafetyEvent::Engaged(action)) => {
                let temp = watched.unwrap_or(self.settings.critical_temp);
                error!(
                    temp = %format_temp(Some(temp)),
                    critical = %format_temp(Some(self.settings.critical_temp)),
                    action = %action,
                    "CRITICAL: temperature limit reached, safety engaged"
                );
                pending = Some((action, temp));
            }
            Some(SafetyEvent::Recovered) => {
                info!(
                    temp = %format_temp(watched),
                    "Temperature recovered below {}, safety released",
                    format_temp(Some(self.settings.recovery_temp()))
                );
                if self.released {
                    info!("Taking fan control back from firmware");
                    self.released = false;
                }
            }
            None => {}
        }

        self.compute_targets(system, gpu);
        // forced targets reach the fans before any safety action runs
        self.actuate();
        if let Some((SafetyAction::BiosControl, _)) = pending {
            self.release_all();
            self.released = true;
        }
        self.publish();

        pending
    }

    /// Carry out a safety action without blocking the runtime
    async fn run_safety_action(&mut self, action: SafetyAction, temp: f32) -> Result<()> {
        let Some(mut handler) = self.safety_handler.take() else {
            return Err(VortecError::SafetyActionFailed {
                action: action.to_string(),
                reason: "safety handler unavailable".into(),
            });
        };

        let task = tokio::task::spawn_blocking(move || {
            let result = handler.execute(action, temp);
            (handler, result)
        });

        let result = match timeout(self.action_timeout, task).await {
            Ok(Ok((handler, result))) => {
                self.safety_handler = Some(handler);
                result
            }
            Ok(Err(e)) => Err(VortecError::generic(format!("safety handler panicked: {}", e))),
            Err(_) => Err(VortecError::Timeout(format!(
                "safety action still running after {:?}",
                self.action_timeout
            ))),
        };

        result.map_err(|e| {
            error!("Safety action '{}' failed: {}", action, e);
            VortecError::SafetyActionFailed {
                action: action.to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn compute_targets(&mut self, system: Option<f32>, gpu: Option<f32>) {
        let engaged = self.safety.engaged;
        let degraded = self.telemetry_unavailable;
        let control = &self.control;

        for fan in &mut self.fans {
            fan.target = if engaged {
                safety_const::FORCED_SPEED
            } else if degraded {
                control.degraded_speed
            } else {
                match fan.mode {
                    FanMode::Manual => {
                        fan.stale = false;
                        fan.manual_speed
                    }
                    FanMode::Automatic => {
                        let reading = select_reading(system, gpu, fan.temp_source);
                        let sel = evaluate(reading, &fan.thresholds, fan.band, control.idle_speed);
                        if sel.band != fan.band {
                            debug!(fan = %fan.name, from = ?fan.band, to = ?sel.band, "Band changed");
                        }
                        fan.band = sel.band;
                        fan.stale = sel.stale;
                        sel.fan_speed
                    }
                }
            };
        }
    }

    fn actuate(&mut self) {
        for fan in &mut self.fans {
            if self.released {
                fan.readback = self.actuator.read_back(&fan.name);
                continue;
            }
            match self.actuator.apply(&fan.name, fan.target) {
                Ok(()) => {
                    if fan.actuator_errors > 0 {
                        debug!(fan = %fan.name, "Actuator recovered after {} errors", fan.actuator_errors);
                        fan.actuator_errors = 0;
                    }
                }
                Err(e) => {
                    fan.actuator_errors += 1;
                    if fan.actuator_errors == 1 || fan.actuator_errors % control::ERROR_LOG_EVERY == 0 {
                        warn!(fan = %fan.name, "Failed to apply {}% (count: {}): {}", fan.target, fan.actuator_errors, e);
                    }
                }
            }
            fan.readback = self.actuator.read_back(&fan.name);
        }
    }

    /// Hand every fan back to firmware control
    fn release_all(&mut self) {
        for fan in &mut self.fans {
            if let Err(e) = self.actuator.release(&fan.name) {
                warn!(fan = %fan.name, "Failed to release fan to firmware: {}", e);
            }
            fan.readback = self.actuator.read_back(&fan.name);
        }
        info!("Released {} fans to firmware control", self.fans.len());
    }

    fn public_state(&self) -> PublicState {
        let (system_temp, gpu_temp) = self
            .last_snapshot
            .as_ref()
            .map_or((None, None), |s| (s.system_temp, s.gpu_temp));

        PublicState {
            system_temp,
            gpu_temp,
            fans: self.fans.iter().map(FanRuntime::public).collect(),
            model_name: self.model_name.clone(),
            safety_engaged: self.safety.engaged,
            safety_triggered_at: self.safety.triggered_at.and_then(unix_millis),
            telemetry_unavailable: self.telemetry_unavailable,
            stale: self.stale,
            tick: self.tick_count,
        }
    }

    fn publish(&self) {
        self.publisher.publish(self.public_state());
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetMode { fan, mode, reply } => {
                let _ = reply.send(self.set_mode(&fan, mode));
            }
            Command::SetManualSpeed { fan, percent, reply } => {
                let _ = reply.send(self.set_manual_speed(&fan, percent));
            }
            Command::SetThresholds { fan, thresholds, reply } => {
                let _ = reply.send(self.set_thresholds(&fan, thresholds));
            }
            Command::GetFan { fan, reply } => {
                let _ = reply.send(self.fan(&fan).map(FanRuntime::public));
            }
            Command::UpdateSettings { settings, reply } => {
                let _ = reply.send(self.update_settings(settings));
            }
            Command::Reload { config, reply } => {
                let _ = reply.send(self.reload(&config));
            }
            Command::State { reply } => {
                let _ = reply.send(Ok(self.public_state()));
            }
        }
    }

    fn fan(&self, name: &str) -> Result<&FanRuntime> {
        self.fans
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| VortecError::UnknownFan(name.to_string()))
    }

    fn fan_mut(&mut self, name: &str) -> Result<&mut FanRuntime> {
        self.fans
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| VortecError::UnknownFan(name.to_string()))
    }

    fn set_mode(&mut self, name: &str, mode: FanMode) -> Result<()> {
        let fan = self.fan_mut(name)?;
        if fan.mode != mode {
            info!(fan = %name, "Mode set to {:?}", mode);
        }
        fan.mode = mode;
        Ok(())
    }

    fn set_manual_speed(&mut self, name: &str, percent: i64) -> Result<()> {
        let fan = self.fan_mut(name)?;
        fan.manual_speed = validate_manual_speed(percent)?;
        info!(fan = %name, "Manual speed set to {}%", fan.manual_speed);
        Ok(())
    }

    fn set_thresholds(&mut self, name: &str, thresholds: Vec<TemperatureThreshold>) -> Result<()> {
        validate_thresholds(&thresholds)?;
        let fan = self.fan_mut(name)?;
        info!(fan = %name, "Threshold ladder replaced ({} rungs)", thresholds.len());
        fan.thresholds = thresholds;
        fan.band = None;
        Ok(())
    }

    fn update_settings(&mut self, settings: SafetySettings) -> Result<()> {
        validate_safety_settings(&settings)?;
        info!(
            "Safety settings updated: critical {}, action {}, recovery {}",
            format_temp(Some(settings.critical_temp)),
            settings.safety_action,
            if settings.enable_critical_temp_recovery { "on" } else { "off" }
        );
        self.settings = settings;
        Ok(())
    }

    /// Apply a whole configuration, or nothing if it is invalid
    fn reload(&mut self, config: &EngineConfig) -> Result<()> {
        config.validate()?;

        for fan_config in &config.fans {
            match self.fans.iter_mut().find(|f| f.name == fan_config.name) {
                Some(fan) => fan.apply_config(fan_config),
                None => warn!(fan = %fan_config.name, "Reload: unknown fan skipped"),
            }
        }
        for fan in &self.fans {
            if config.fan(&fan.name).is_none() {
                warn!(fan = %fan.name, "Reload: fan missing from configuration, left unchanged");
            }
        }

        self.settings = config.settings.clone();
        self.control = config.control.clone();
        self.model_name = config.model_name.clone();

        info!("Configuration reloaded ({} fans)", config.fans.len());
        Ok(())
    }
}

fn unix_millis(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_millis() as u64)
}
