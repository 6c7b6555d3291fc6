//! Telemetry subprocess adapter and supervisor
//!
//! `TelemetrySource` owns one sensor sidecar process and turns its stdout
//! into `TelemetrySnapshot`s. `TelemetrySupervisor` keeps a source running:
//! it pumps snapshots into a watch channel, restarts the sidecar with
//! exponential backoff, and reports `Unavailable` when the restart budget
//! is spent.
//!
//! # Shutdown
//! Stopping closes the child's stdin first (the sidecar exits on EOF), then
//! sends SIGTERM after the grace period, then kills.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use vc_core::constants::{control, telemetry as limits};
use vc_core::{
    parse_telemetry_line, RestartSettings, Result, TelemetrySettings, TelemetrySnapshot,
    VortecError,
};

// ============================================================================
// Feed
// ============================================================================

/// Supervisor status as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedStatus {
    #[default]
    Starting,
    Live,
    Restarting,
    /// Restart budget exhausted; the engine should run degraded
    Unavailable,
}

/// Latest value handed from the supervisor to the engine
#[derive(Debug, Clone, Default)]
pub struct TelemetryFeed {
    pub snapshot: Option<TelemetrySnapshot>,
    pub status: FeedStatus,
}

// ============================================================================
// Line reader
// ============================================================================

/// One line read from the sidecar
#[derive(Debug, PartialEq, Eq)]
enum FrameLine {
    Text(Vec<u8>),
    /// Line longer than the limit; its bytes were discarded, not buffered
    Oversize(usize),
}

/// Newline-delimited reader that never buffers more than `max_len` bytes
///
/// Partial state lives in the struct, so `next_line` is cancel safe.
struct BoundedLines<R> {
    reader: R,
    buf: Vec<u8>,
    overflow: usize,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> BoundedLines<R> {
    fn new(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            overflow: 0,
            max_len,
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<FrameLine>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() && self.overflow == 0 {
                    return Ok(None);
                }
                // unterminated last line
                return Ok(Some(self.finish()));
            }

            let (take_len, found_newline) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            let content = &available[..if found_newline { take_len - 1 } else { take_len }];

            if self.overflow > 0 || self.buf.len() + content.len() > self.max_len {
                self.overflow += self.buf.len() + content.len();
                self.buf.clear();
            } else {
                self.buf.extend_from_slice(content);
            }
            self.reader.consume(take_len);

            if found_newline {
                return Ok(Some(self.finish()));
            }
        }
    }

    fn finish(&mut self) -> FrameLine {
        if self.overflow > 0 {
            let len = std::mem::take(&mut self.overflow);
            self.buf.clear();
            FrameLine::Oversize(len)
        } else {
            FrameLine::Text(std::mem::take(&mut self.buf))
        }
    }
}

// ============================================================================
// Source
// ============================================================================

/// One supervised sidecar process
pub struct TelemetrySource {
    program: PathBuf,
    args: Vec<String>,
    stop_grace: Duration,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    lines: Option<BoundedLines<BufReader<ChildStdout>>>,
    /// Survives restarts so sequence numbers stay strictly increasing
    sequence: u64,
}

impl TelemetrySource {
    pub fn new(settings: &TelemetrySettings) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            stop_grace: settings.stop_grace(),
            child: None,
            stdin: None,
            lines: None,
            sequence: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Spawn the sidecar with piped stdin/stdout
    pub fn start(&mut self) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VortecError::TelemetryLaunch {
                program: self.program.clone(),
                source: e,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            VortecError::generic("telemetry child has no stdout pipe")
        })?;
        self.stdin = child.stdin.take();
        self.lines = Some(BoundedLines::new(BufReader::new(stdout), limits::MAX_LINE_BYTES));

        info!(
            "Telemetry sidecar started: {:?} (pid {})",
            self.program,
            child.id().map_or_else(|| "?".to_string(), |p| p.to_string())
        );
        self.child = Some(child);
        Ok(())
    }

    /// Wait for the next snapshot
    ///
    /// Blank lines are skipped. A malformed or oversize line yields
    /// `TelemetryParse` and the stream stays usable; end of output yields
    /// `TelemetryStreamClosed`.
    /// Cancel safe: no line is lost if the future is dropped.
    pub async fn next(&mut self) -> Result<TelemetrySnapshot> {
        let lines = self.lines.as_mut().ok_or(VortecError::TelemetryStreamClosed)?;
        loop {
            let bytes = match lines.next_line().await? {
                Some(FrameLine::Text(bytes)) => bytes,
                Some(FrameLine::Oversize(len)) => {
                    return Err(VortecError::TelemetryParse(format!(
                        "line of {} bytes exceeds {} byte limit",
                        len,
                        limits::MAX_LINE_BYTES
                    )));
                }
                None => return Err(VortecError::TelemetryStreamClosed),
            };
            let line = String::from_utf8(bytes)
                .map_err(|e| VortecError::TelemetryParse(format!("invalid UTF-8: {}", e)))?;
            if let Some(snapshot) = parse_telemetry_line(&line)? {
                self.sequence += 1;
                return Ok(snapshot.with_sequence(self.sequence));
            }
        }
    }

    /// Collect the exit status of a child whose output has ended
    ///
    /// Falls back to `stop()` if it has not exited within a short bound.
    pub async fn reap(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match timeout(Duration::from_millis(limits::REAP_TIMEOUT_MS), child.wait()).await {
            Ok(Ok(status)) => {
                self.release();
                Some(status)
            }
            Ok(Err(e)) => {
                warn!("Failed to reap telemetry sidecar: {}", e);
                self.release();
                None
            }
            Err(_) => {
                debug!("Telemetry sidecar closed stdout but is still running, stopping it");
                self.stop().await
            }
        }
    }

    /// Stop the sidecar: close stdin, SIGTERM after the grace period, then kill
    pub async fn stop(&mut self) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        // stdin EOF is the cooperative cancel signal
        drop(self.stdin.take());

        let status = match timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("Error waiting for telemetry sidecar: {}", e);
                None
            }
            Err(_) => terminate(&mut child).await,
        };

        self.release();
        if let Some(status) = status {
            info!("Telemetry sidecar stopped: {}", status);
        }
        status
    }

    fn release(&mut self) {
        self.child = None;
        self.stdin = None;
        self.lines = None;
    }
}

/// SIGTERM, bounded wait, then SIGKILL
async fn terminate(child: &mut Child) -> Option<ExitStatus> {
    if let Some(pid) = child.id() {
        debug!("Sending SIGTERM to telemetry sidecar (pid {})", pid);
        // SAFETY: kill has no memory safety requirements; pid belongs to our
        // own un-reaped child so it cannot have been recycled.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if let Ok(Ok(status)) =
            timeout(Duration::from_millis(limits::TERM_GRACE_MS), child.wait()).await
        {
            return Some(status);
        }
    }

    warn!("Telemetry sidecar ignored SIGTERM, killing it");
    if let Err(e) = child.kill().await {
        warn!("Failed to kill telemetry sidecar: {}", e);
    }
    child.try_wait().ok().flatten()
}

// ============================================================================
// Restart budget
// ============================================================================

/// Restart timing, derived from `RestartSettings`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub stability_window: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
}

impl From<&RestartSettings> for RestartPolicy {
    fn from(s: &RestartSettings) -> Self {
        Self {
            initial_backoff: Duration::from_millis(s.initial_backoff_ms),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
            stability_window: Duration::from_millis(s.stability_window_ms),
            max_restarts: s.max_restarts,
            restart_window: Duration::from_millis(s.restart_window_ms),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&RestartSettings::default())
    }
}

/// Exponential backoff with a rolling restart limit
#[derive(Debug)]
pub struct RestartBudget {
    policy: RestartPolicy,
    backoff: Duration,
    restarts: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            backoff: policy.initial_backoff,
            restarts: VecDeque::new(),
        }
    }

    /// Record how long the last run lasted; a stable run resets the backoff
    pub fn record_run(&mut self, run_time: Duration) {
        if run_time >= self.policy.stability_window {
            self.backoff = self.policy.initial_backoff;
        }
    }

    /// Delay before the next restart, or `None` if the budget is spent
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        while let Some(&oldest) = self.restarts.front() {
            if now.duration_since(oldest) >= self.policy.restart_window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        if self.restarts.len() >= self.policy.max_restarts as usize {
            return None;
        }

        self.restarts.push_back(now);
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.policy.max_backoff);
        Some(delay)
    }

    /// Forget history, as after waiting out an exhausted budget
    pub fn reset(&mut self) {
        self.backoff = self.policy.initial_backoff;
        self.restarts.clear();
    }
}

// ============================================================================
// Supervisor
// ============================================================================

enum PumpEnd {
    Shutdown,
    Closed,
}

/// Keeps the sidecar running and publishes its snapshots
pub struct TelemetrySupervisor {
    source: TelemetrySource,
    budget: RestartBudget,
    restart_window: Duration,
    feed: watch::Sender<TelemetryFeed>,
    shutdown: watch::Receiver<bool>,
}

impl TelemetrySupervisor {
    /// Launch the sidecar and start supervising it
    ///
    /// The first launch happens before this returns: failing to start the
    /// sidecar at all is an error for the caller. Later launch failures are
    /// counted against the restart budget.
    pub fn spawn(
        settings: &TelemetrySettings,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(watch::Receiver<TelemetryFeed>, JoinHandle<()>)> {
        let mut source = TelemetrySource::new(settings);
        source.start()?;

        let policy = RestartPolicy::from(&settings.restart);
        let (feed, feed_rx) = watch::channel(TelemetryFeed::default());
        let supervisor = Self {
            source,
            budget: RestartBudget::new(policy),
            restart_window: policy.restart_window,
            feed,
            shutdown,
        };

        Ok((feed_rx, tokio::spawn(supervisor.run())))
    }

    async fn run(mut self) {
        'supervise: loop {
            let started = Instant::now();
            if let PumpEnd::Shutdown = self.pump().await {
                break;
            }

            match self.source.reap().await {
                Some(status) => warn!("Telemetry sidecar exited: {}", status),
                None => warn!("Telemetry sidecar exited"),
            }
            self.budget.record_run(started.elapsed());

            // restart attempts until one launches or shutdown is requested
            loop {
                match self.budget.next_delay(Instant::now()) {
                    Some(delay) => {
                        self.set_status(FeedStatus::Restarting);
                        info!("Restarting telemetry sidecar in {:?}", delay);
                        if !self.sleep_or_shutdown(delay).await {
                            break 'supervise;
                        }
                        match self.source.start() {
                            Ok(()) => continue 'supervise,
                            Err(e) => {
                                error!("Telemetry restart failed: {}", e);
                                self.budget.record_run(Duration::ZERO);
                            }
                        }
                    }
                    None => {
                        let err = VortecError::TelemetryUnavailable(format!(
                            "restart budget exhausted, retrying in {:?}",
                            self.restart_window
                        ));
                        error!("{}", err);
                        self.set_status(FeedStatus::Unavailable);
                        if !self.sleep_or_shutdown(self.restart_window).await {
                            break 'supervise;
                        }
                        self.budget.reset();
                    }
                }
            }
        }

        self.source.stop().await;
        info!("Telemetry supervisor stopped");
    }

    /// Forward snapshots until the stream ends or shutdown is requested
    async fn pump(&mut self) -> PumpEnd {
        let mut parse_errors: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                return PumpEnd::Shutdown;
            }
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return PumpEnd::Shutdown;
                    }
                }
                next = self.source.next() => match next {
                    Ok(snapshot) => {
                        parse_errors = 0;
                        self.feed.send_replace(TelemetryFeed {
                            snapshot: Some(snapshot),
                            status: FeedStatus::Live,
                        });
                    }
                    Err(VortecError::TelemetryParse(reason)) => {
                        parse_errors += 1;
                        if parse_errors == 1 || parse_errors % control::ERROR_LOG_EVERY == 0 {
                            warn!("Skipping malformed telemetry line (count: {}): {}", parse_errors, reason);
                        }
                    }
                    Err(e) => {
                        debug!("Telemetry stream ended: {}", e);
                        return PumpEnd::Closed;
                    }
                },
            }
        }
    }

    fn set_status(&self, status: FeedStatus) {
        self.feed.send_modify(|feed| feed.status = status);
    }

    /// Sleep for `duration`; false if shutdown was requested meanwhile
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if *self.shutdown.borrow() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            stability_window: Duration::from_secs(10),
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
        }
    }

    fn sh(script: &str) -> TelemetrySettings {
        TelemetrySettings {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            stop_grace_ms: 200,
            ..TelemetrySettings::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut budget = RestartBudget::new(RestartPolicy {
            max_restarts: 100,
            ..policy()
        });
        let now = Instant::now();
        let delays: Vec<u64> = (0..7)
            .map(|i| budget.next_delay(now + Duration::from_millis(i)).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_stable_run_resets_backoff() {
        let mut budget = RestartBudget::new(policy());
        let now = Instant::now();
        budget.next_delay(now);
        budget.next_delay(now);
        budget.record_run(Duration::from_secs(3));
        assert_eq!(budget.next_delay(now), Some(Duration::from_secs(4)));

        budget.record_run(Duration::from_secs(11));
        assert_eq!(budget.next_delay(now), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_budget_exhaustion_and_window() {
        let mut budget = RestartBudget::new(policy());
        let start = Instant::now();
        for _ in 0..5 {
            assert!(budget.next_delay(start).is_some());
        }
        assert_eq!(budget.next_delay(start + Duration::from_secs(30)), None);
        // entries age out of the rolling window
        assert!(budget.next_delay(start + Duration::from_secs(61)).is_some());
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut budget = RestartBudget::new(policy());
        let now = Instant::now();
        for _ in 0..5 {
            budget.next_delay(now);
        }
        assert!(budget.next_delay(now).is_none());
        budget.reset();
        assert_eq!(budget.next_delay(now), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_source_reads_and_skips() {
        let mut source = TelemetrySource::new(&sh(
            r#"echo '{"cpu":{"packageTemp":47}}'; echo; echo 'not json'; echo '{"gpu":{"temp":61}}'"#,
        ));
        source.start().unwrap();

        let first = source.next().await.unwrap();
        assert_eq!(first.system_temp, Some(47.0));
        assert_eq!(first.sequence, 1);

        assert_eq!(source.next().await.unwrap_err().kind(), "telemetry_parse");

        let second = source.next().await.unwrap();
        assert_eq!(second.gpu_temp, Some(61.0));
        assert_eq!(second.sequence, 2);

        assert_eq!(source.next().await.unwrap_err().kind(), "telemetry_stream_closed");
        assert!(source.reap().await.is_some());
        assert!(!source.is_running());
    }

    #[tokio::test]
    async fn test_bounded_lines_discards_oversize() {
        let data: &[u8] = b"{\"a\":1}\nxxxxxxxxxxxxxxxx\n{\"b\":2}\ntail";
        let mut lines = BoundedLines::new(BufReader::with_capacity(4, data), 8);

        assert_eq!(lines.next_line().await.unwrap(), Some(FrameLine::Text(b"{\"a\":1}".to_vec())));
        assert_eq!(lines.next_line().await.unwrap(), Some(FrameLine::Oversize(16)));
        // never held more than the limit while skipping
        assert!(lines.buf.capacity() <= 16);
        assert_eq!(lines.next_line().await.unwrap(), Some(FrameLine::Text(b"{\"b\":2}".to_vec())));
        assert_eq!(lines.next_line().await.unwrap(), Some(FrameLine::Text(b"tail".to_vec())));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_source_skips_oversize_line() {
        let mut source = TelemetrySource::new(&sh(
            r#"head -c 200000 /dev/zero | tr '\0' x; echo; echo '{"cpu":{"packageTemp":72}}'"#,
        ));
        source.start().unwrap();

        let err = source.next().await.unwrap_err();
        assert_eq!(err.kind(), "telemetry_parse");
        assert!(err.to_string().contains("200000 bytes"));

        let snapshot = source.next().await.unwrap();
        assert_eq!(snapshot.system_temp, Some(72.0));
        assert_eq!(snapshot.sequence, 1);
        source.stop().await;
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let mut source = TelemetrySource::new(&TelemetrySettings {
            program: PathBuf::from("/nonexistent/vortsensors"),
            ..TelemetrySettings::default()
        });
        assert_eq!(source.start().unwrap_err().kind(), "telemetry_launch");
    }

    #[tokio::test]
    async fn test_stop_on_stdin_eof() {
        // exits on its own once stdin closes
        let mut source = TelemetrySource::new(&sh("cat > /dev/null"));
        source.start().unwrap();
        let status = source.stop().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigterm() {
        let mut source = TelemetrySource::new(&sh("exec sleep 30"));
        source.start().unwrap();
        let started = Instant::now();
        let status = source.stop().await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
