//! Gateway process supervisor
//!
//! Owns at most one live gateway process at a time. Startup is resolved by a
//! single race: the readiness marker scanned from the child's stdout, a fixed
//! startup timeout, early process exit, or a spawn error — whichever fires
//! first decides that attempt's outcome, and late signals are ignored
//! (generation-guarded). Every stderr line of the child is forwarded verbatim
//! to error subscribers without touching the state machine.

use crate::config::{SupervisorConfig, PACKAGED_ENV, RESOURCES_ENV};
use crate::server::READY_MARKER;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Externally visible gateway lifecycle status. The supervisor is the sole
/// writer; everyone else reads or subscribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    /// No gateway process is live
    Stopped,
    /// Spawned, waiting for the readiness marker
    Starting,
    /// Readiness observed, both listeners serving
    Active,
    /// Startup failed or the process died abnormally
    Error,
}

/// Handle to the live gateway process, held inside the supervisor state.
struct LiveGateway {
    pid: Option<u32>,
    /// Start-attempt generation this handle belongs to
    generation: u64,
    /// Signals the monitor task to terminate the child gracefully
    stop_tx: watch::Sender<bool>,
}

struct State {
    status: GatewayStatus,
    live: Option<LiveGateway>,
    generation: u64,
    /// Outcome channel of the in-flight start attempt, for joining callers
    startup: Option<watch::Receiver<Option<bool>>>,
}

struct Inner {
    config: SupervisorConfig,
    state: Mutex<State>,
    status_tx: watch::Sender<GatewayStatus>,
    error_tx: broadcast::Sender<String>,
}

impl Inner {
    /// Must be called with the state lock held.
    fn set_status(&self, state: &mut State, status: GatewayStatus) {
        if state.status != status {
            debug!(from = ?state.status, to = ?status, "Gateway status transition");
            state.status = status;
            let _ = self.status_tx.send(status);
        }
    }
}

/// Supervisor for the gateway process lifecycle.
///
/// Cheap to clone; all clones share one state machine. State mutation is
/// serialized through a single mutex, so transitions are never lost between
/// the timer, the stream-reading path and the exit observer.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

enum Attempt {
    /// Already resolved without spawning
    Done(bool),
    /// A start attempt is in flight; await its outcome
    Join(watch::Receiver<Option<bool>>),
    /// This caller leads a fresh attempt
    Lead {
        generation: u64,
        outcome_tx: watch::Sender<Option<bool>>,
        stop_rx: watch::Receiver<bool>,
    },
}

enum Resolved {
    Ready,
    EarlyExit,
    Timeout,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (status_tx, _) = watch::channel(GatewayStatus::Stopped);
        let (error_tx, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    status: GatewayStatus::Stopped,
                    live: None,
                    generation: 0,
                    startup: None,
                }),
                status_tx,
                error_tx,
            }),
        }
    }

    /// Current status, without side effects.
    pub fn status(&self) -> GatewayStatus {
        self.inner.state.lock().status
    }

    /// Pid of the live gateway process, if any.
    pub fn pid(&self) -> Option<u32> {
        self.inner.state.lock().live.as_ref().and_then(|l| l.pid)
    }

    /// Subscribe to status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<GatewayStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to forwarded gateway error lines.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.inner.error_tx.subscribe()
    }

    /// Enable or disable the gateway.
    pub async fn toggle(&self, enable: bool) -> bool {
        if enable {
            self.start().await
        } else {
            self.stop()
        }
    }

    /// Start the gateway process and wait for it to become ready.
    ///
    /// Idempotent: with a gateway already Active this returns true
    /// immediately, and callers arriving while an attempt is in flight join
    /// it and observe the same outcome. Exactly one gateway process exists
    /// per attempt.
    pub async fn start(&self) -> bool {
        let attempt = {
            let mut state = self.inner.state.lock();
            match state.status {
                GatewayStatus::Active => Attempt::Done(true),
                GatewayStatus::Starting => match state.startup.clone() {
                    Some(rx) => Attempt::Join(rx),
                    None => Attempt::Done(false),
                },
                GatewayStatus::Stopped | GatewayStatus::Error => {
                    // A failed attempt may still be reaping; make sure it dies
                    if let Some(stale) = state.live.take() {
                        let _ = stale.stop_tx.send(true);
                    }

                    state.generation += 1;
                    let generation = state.generation;
                    let (outcome_tx, outcome_rx) = watch::channel(None);
                    let (stop_tx, stop_rx) = watch::channel(false);
                    state.startup = Some(outcome_rx);
                    state.live = Some(LiveGateway {
                        pid: None,
                        generation,
                        stop_tx,
                    });
                    self.inner.set_status(&mut state, GatewayStatus::Starting);

                    Attempt::Lead {
                        generation,
                        outcome_tx,
                        stop_rx,
                    }
                }
            }
        };

        match attempt {
            Attempt::Done(result) => result,
            Attempt::Join(mut outcome_rx) => outcome_rx
                .wait_for(|outcome| outcome.is_some())
                .await
                .map(|outcome| outcome.unwrap_or(false))
                .unwrap_or(false),
            Attempt::Lead {
                generation,
                outcome_tx,
                stop_rx,
            } => {
                self.run_start_attempt(generation, outcome_tx, stop_rx)
                    .await
            }
        }
    }

    /// Stop the gateway. A no-op success when nothing is live. Marks the
    /// status Stopped immediately and terminates the child in the background
    /// (SIGTERM, grace period, SIGKILL).
    pub fn stop(&self) -> bool {
        let live = {
            let mut state = self.inner.state.lock();
            let live = state.live.take();
            state.startup = None;
            self.inner.set_status(&mut state, GatewayStatus::Stopped);
            live
        };

        if let Some(live) = live {
            info!(pid = ?live.pid, "Stopping gateway");
            let _ = live.stop_tx.send(true);
        }
        true
    }

    async fn run_start_attempt(
        &self,
        generation: u64,
        outcome_tx: watch::Sender<Option<bool>>,
        stop_rx: watch::Receiver<bool>,
    ) -> bool {
        let inner = &self.inner;
        let command_path = inner.config.resolve_gateway_command();

        let mut cmd = Command::new(&command_path);
        cmd.args(&inner.config.gateway_args);
        cmd.env(RESOURCES_ENV, &inner.config.resources_root);
        if inner.config.packaged {
            cmd.env(PACKAGED_ENV, "1");
        }
        cmd.current_dir(&inner.config.resources_root);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!(
                    "Failed to spawn gateway {}: {}",
                    command_path.display(),
                    e
                );
                error!(command = %command_path.display(), error = %e, "Gateway spawn failed");
                let _ = inner.error_tx.send(message);

                let mut state = inner.state.lock();
                if state.generation == generation {
                    state.live = None;
                    state.startup = None;
                    // Spawn failure leaves the supervisor Stopped
                    inner.set_status(&mut state, GatewayStatus::Stopped);
                }
                drop(state);

                let _ = outcome_tx.send(Some(false));
                return false;
            }
        };

        let pid = child.id();
        info!(?pid, command = %command_path.display(), "Gateway process spawned");
        {
            let mut state = inner.state.lock();
            if state.generation == generation {
                if let Some(live) = state.live.as_mut() {
                    live.pid = pid;
                }
            }
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (ready_tx, ready_rx) = oneshot::channel();
        if let Some(stdout) = stdout {
            tokio::spawn(scan_stdout(stdout, ready_tx));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(stderr, inner.error_tx.clone()));
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(monitor_child(
            Arc::clone(inner),
            child,
            generation,
            stop_rx,
            exit_tx,
        ));

        let timeout = inner.config.startup_timeout();
        let resolved = tokio::select! {
            result = ready_rx => match result {
                Ok(true) => Resolved::Ready,
                // stdout closed without the marker: the process is going away
                _ => Resolved::EarlyExit,
            },
            _ = exit_rx => Resolved::EarlyExit,
            _ = tokio::time::sleep(timeout) => Resolved::Timeout,
        };

        let success = matches!(resolved, Resolved::Ready);
        {
            let mut state = inner.state.lock();
            if state.generation == generation && state.status == GatewayStatus::Starting {
                state.startup = None;
                if success {
                    inner.set_status(&mut state, GatewayStatus::Active);
                } else {
                    inner.set_status(&mut state, GatewayStatus::Error);
                    // Kill the child on timeout instead of orphaning it
                    if let Some(live) = state.live.take() {
                        let _ = live.stop_tx.send(true);
                    }
                }
            }
        }

        match resolved {
            Resolved::Ready => info!("Gateway is ready"),
            Resolved::Timeout => {
                let message = format!(
                    "Gateway produced no readiness marker within {}s",
                    timeout.as_secs()
                );
                warn!(timeout_secs = timeout.as_secs(), "Gateway startup timed out");
                let _ = inner.error_tx.send(message);
            }
            Resolved::EarlyExit => {
                let message = "Gateway exited before signalling readiness".to_string();
                warn!("Gateway exited before signalling readiness");
                let _ = inner.error_tx.send(message);
            }
        }

        let _ = outcome_tx.send(Some(success));
        success
    }
}

/// Scan child stdout line by line for the readiness marker. Unrelated log
/// lines are expected and skipped. Sends `true` on the first marker, `false`
/// once at EOF if no marker was seen.
async fn scan_stdout(stdout: ChildStdout, ready_tx: oneshot::Sender<bool>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut ready_tx = Some(ready_tx);

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(line = %line, "gateway stdout");
                if line.contains(READY_MARKER) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(true);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "gateway stdout read error");
                break;
            }
        }
    }

    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(false);
    }
}

/// Forward every stderr line verbatim to error subscribers. A running
/// gateway may emit warnings without leaving the Active state.
async fn forward_stderr(stderr: ChildStderr, error_tx: broadcast::Sender<String>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(line = %line, "gateway stderr");
        let _ = error_tx.send(line);
    }
}

/// Own the child until it exits. A stop request (or the supervisor dropping
/// its handle) triggers the SIGTERM / grace period / SIGKILL ladder. The exit
/// is reported to the startup race and reflected in the status when the
/// gateway was Active.
async fn monitor_child(
    inner: Arc<Inner>,
    mut child: Child,
    generation: u64,
    mut stop_rx: watch::Receiver<bool>,
    exit_tx: oneshot::Sender<()>,
) {
    let grace = inner.config.shutdown_grace_period();

    let exit_status = tokio::select! {
        result = child.wait() => result,
        _ = stop_rx.changed() => terminate(&mut child, grace).await,
    };

    let _ = exit_tx.send(());

    let (clean, description) = match &exit_status {
        Ok(status) => (status.success(), status.to_string()),
        Err(e) => (false, format!("wait failed: {}", e)),
    };

    let mut state = inner.state.lock();
    let is_current = state
        .live
        .as_ref()
        .map(|l| l.generation == generation)
        .unwrap_or(false);
    if is_current {
        state.live = None;
    }

    if is_current && state.status == GatewayStatus::Active {
        if clean {
            warn!(exit = %description, "Gateway exited");
            inner.set_status(&mut state, GatewayStatus::Stopped);
        } else {
            error!(exit = %description, "Gateway exited abnormally");
            inner.set_status(&mut state, GatewayStatus::Error);
            let _ = inner
                .error_tx
                .send(format!("Gateway exited unexpectedly: {}", description));
        }
    } else {
        debug!(exit = %description, generation, "Gateway process reaped");
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<std::process::ExitStatus> {
    if let Some(pid) = child.id() {
        info!(pid, "Sending SIGTERM to gateway");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
            child.wait().await
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn script_supervisor(script: &str, startup_timeout_secs: u64) -> Supervisor {
        let config = SupervisorConfig {
            gateway_command: Some("/bin/sh".to_string()),
            gateway_args: vec!["-c".to_string(), script.to_string()],
            resources_root: std::env::temp_dir(),
            startup_timeout_secs,
            shutdown_grace_period_secs: 1,
            ..SupervisorConfig::default()
        };
        Supervisor::new(config)
    }

    async fn wait_for_status(
        rx: &mut watch::Receiver<GatewayStatus>,
        wanted: GatewayStatus,
        timeout: Duration,
    ) -> bool {
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == wanted))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_start_resolves_on_ready_marker() {
        let supervisor = script_supervisor("echo '[gateway] server ready'; sleep 30", 10);

        assert!(supervisor.start().await);
        assert_eq!(supervisor.status(), GatewayStatus::Active);
        assert!(supervisor.pid().is_some());

        assert!(supervisor.stop());
        assert_eq!(supervisor.status(), GatewayStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_tolerates_interleaved_output() {
        let supervisor = script_supervisor(
            "echo 'booting'; echo 'loading certs'; echo 'x server ready x'; sleep 30",
            10,
        );

        assert!(supervisor.start().await);
        assert_eq!(supervisor.status(), GatewayStatus::Active);
        supervisor.stop();
    }

    #[tokio::test]
    async fn test_startup_timeout_resolves_false() {
        let supervisor = script_supervisor("sleep 30", 1);

        assert!(!supervisor.start().await);
        assert_eq!(supervisor.status(), GatewayStatus::Error);
        // The timed-out child is terminated, not orphaned
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_stays_stopped() {
        let config = SupervisorConfig {
            gateway_command: Some("/nonexistent/launchgate-gateway".to_string()),
            resources_root: std::env::temp_dir(),
            startup_timeout_secs: 5,
            ..SupervisorConfig::default()
        };
        let supervisor = Supervisor::new(config);
        let mut errors = supervisor.subscribe_errors();

        assert!(!supervisor.start().await);
        assert_eq!(supervisor.status(), GatewayStatus::Stopped);

        let reported = tokio::time::timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reported.contains("Failed to spawn gateway"));
    }

    #[tokio::test]
    async fn test_early_exit_resolves_false() {
        let supervisor = script_supervisor("exit 7", 10);

        assert!(!supervisor.start().await);
        assert_eq!(supervisor.status(), GatewayStatus::Error);
    }

    #[tokio::test]
    async fn test_stderr_lines_forwarded_verbatim() {
        let supervisor =
            script_supervisor("echo 'cert warning' >&2; echo 'server ready'; sleep 30", 10);
        let mut errors = supervisor.subscribe_errors();

        assert!(supervisor.start().await);

        let line = tokio::time::timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "cert warning");

        supervisor.stop();
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_one_attempt() {
        let supervisor = script_supervisor("sleep 0.2; echo 'server ready'; sleep 30", 10);

        let (a, b) = tokio::join!(supervisor.start(), supervisor.start());
        assert!(a);
        assert!(b);
        assert_eq!(supervisor.status(), GatewayStatus::Active);

        supervisor.stop();
    }

    #[tokio::test]
    async fn test_start_after_active_is_noop_success() {
        let supervisor = script_supervisor("echo 'server ready'; sleep 30", 10);

        assert!(supervisor.start().await);
        let pid = supervisor.pid();
        assert!(supervisor.start().await);
        assert_eq!(supervisor.pid(), pid);

        supervisor.stop();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop_success() {
        let supervisor = script_supervisor("echo 'server ready'; sleep 30", 10);

        assert!(supervisor.stop());
        assert_eq!(supervisor.status(), GatewayStatus::Stopped);
    }

    #[tokio::test]
    async fn test_restart_spawns_fresh_process() {
        let supervisor = script_supervisor("echo 'server ready'; sleep 30", 10);

        assert!(supervisor.start().await);
        let first_pid = supervisor.pid().unwrap();

        assert!(supervisor.stop());
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(supervisor.start().await);
        let second_pid = supervisor.pid().unwrap();
        assert_ne!(first_pid, second_pid);

        supervisor.stop();
    }

    #[tokio::test]
    async fn test_clean_exit_while_active_transitions_to_stopped() {
        let supervisor = script_supervisor("echo 'server ready'; sleep 1", 10);
        let mut status_rx = supervisor.subscribe_status();

        assert!(supervisor.start().await);
        assert!(
            wait_for_status(&mut status_rx, GatewayStatus::Stopped, Duration::from_secs(5)).await
        );
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_abnormal_exit_while_active_transitions_to_error() {
        let supervisor = script_supervisor("echo 'server ready'; sleep 1; exit 3", 10);
        let mut status_rx = supervisor.subscribe_status();
        let mut errors = supervisor.subscribe_errors();

        assert!(supervisor.start().await);
        assert!(
            wait_for_status(&mut status_rx, GatewayStatus::Error, Duration::from_secs(5)).await
        );

        let reported = tokio::time::timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reported.contains("exited unexpectedly"));
    }

    #[tokio::test]
    async fn test_start_again_after_error() {
        let supervisor = script_supervisor("echo 'server ready'; sleep 30", 10);

        // Sabotage the first attempt with a short-lived script is not
        // possible per-call, so drive the state machine directly: a timeout
        // attempt followed by a normal one.
        let failing = script_supervisor("sleep 30", 1);
        assert!(!failing.start().await);
        assert_eq!(failing.status(), GatewayStatus::Error);

        assert!(supervisor.start().await);
        assert_eq!(supervisor.status(), GatewayStatus::Active);
        supervisor.stop();
    }
}
