use crate::connection::BackendHealth;
use crate::error::SupervisionError;
use crate::logsink::{forward_output, BackendEvent, LogSink, LogWatcher, OutputStream};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READY_POLL: Duration = Duration::from_millis(100);
/// Probe interval once the initial readiness window has passed.
const READY_RETRY: Duration = Duration::from_secs(1);

/// Restart delay policy: start small, double per consecutive failure,
/// never exceed `cap`. A run that lasted at least `reset_after` counts as
/// healthy and starts the sequence over.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    reset_after: Duration,
    current: Option<Duration>,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration, reset_after: Duration) -> Self {
        Self {
            initial,
            cap,
            reset_after,
            current: None,
            failures: 0,
        }
    }

    /// Delay before the next start, given how long the last run lasted.
    pub fn next_delay(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.reset_after {
            self.reset();
        }
        self.failures += 1;
        let delay = match self.current {
            None => self.initial.min(self.cap),
            Some(prev) => prev.saturating_mul(2).min(self.cap),
        };
        self.current = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }
}

/// Everything needed to run the backend.
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
    pub backoff_reset_after: Duration,
    /// Grace between SIGTERM and SIGKILL on shutdown.
    pub stop_timeout: Duration,
    /// Loopback listeners the backend must open before it counts as ready.
    pub ready_addrs: Vec<SocketAddr>,
    pub ready_timeout: Duration,
}

/// Lifecycle notifications, mostly for observers and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started { pid: Option<u32> },
    Ready,
    Exited { reason: String, uptime: Duration },
    BackingOff { delay: Duration, consecutive_failures: u32 },
    Stopped,
}

/// The running child and its restart bookkeeping.
#[derive(Debug)]
struct SupervisedProcess {
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
}

enum Outcome {
    Exited(String),
    Shutdown,
}

/// Owns the backend child for the whole process lifetime.
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    health: Arc<BackendHealth>,
    sink: Arc<LogSink>,
    watcher: Arc<LogWatcher>,
    backend_events: Option<mpsc::UnboundedSender<BackendEvent>>,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings, health: Arc<BackendHealth>, sink: Arc<LogSink>) -> Self {
        Self {
            settings,
            health,
            sink,
            watcher: Arc::new(LogWatcher::default()),
            backend_events: None,
            events: None,
        }
    }

    /// Report lines of backend output that match `watcher` on `tx`.
    pub fn with_watcher(
        mut self,
        watcher: LogWatcher,
        tx: mpsc::UnboundedSender<BackendEvent>,
    ) -> Self {
        self.watcher = Arc::new(watcher);
        self.backend_events = Some(tx);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Keep the backend running until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(
            self.settings.backoff_initial,
            self.settings.backoff_cap,
            self.settings.backoff_reset_after,
        );

        while !shutdown.is_cancelled() {
            info!("Starting backend {}", self.settings.executable.display());
            let started_at = Instant::now();

            let reason = match self.spawn() {
                Ok(mut process) => {
                    self.emit(SupervisorEvent::Started { pid: process.pid });
                    let outcome = self.watch(&mut process, &shutdown).await;
                    self.health.set_ready(false);
                    match outcome {
                        Outcome::Exited(reason) => reason,
                        Outcome::Shutdown => {
                            self.terminate(process).await;
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!("{}", e);
                    e.to_string()
                }
            };

            if shutdown.is_cancelled() {
                break;
            }

            let uptime = started_at.elapsed();
            let delay = backoff.next_delay(uptime);
            warn!(
                "Backend exited ({}) after {:.1}s, restarting in {}s (consecutive failures: {})",
                reason,
                uptime.as_secs_f64(),
                delay.as_secs(),
                backoff.consecutive_failures()
            );
            self.emit(SupervisorEvent::Exited { reason, uptime });
            self.emit(SupervisorEvent::BackingOff {
                delay,
                consecutive_failures: backoff.consecutive_failures(),
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.health.set_ready(false);
        info!("Backend supervisor stopped");
        self.emit(SupervisorEvent::Stopped);
    }

    fn spawn(&self) -> Result<SupervisedProcess, SupervisionError> {
        let mut cmd = Command::new(&self.settings.executable);
        cmd.args(&self.settings.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SupervisionError::SpawnFailed {
            program: self.settings.executable.clone(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(
                stdout,
                OutputStream::Stdout,
                self.sink.clone(),
                self.watcher.clone(),
                self.backend_events.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(
                stderr,
                OutputStream::Stderr,
                self.sink.clone(),
                self.watcher.clone(),
                self.backend_events.clone(),
            ));
        }

        let pid = child.id();
        info!("Backend running (pid={:?})", pid);
        Ok(SupervisedProcess {
            child,
            pid,
            started_at: Instant::now(),
        })
    }

    async fn watch(&self, process: &mut SupervisedProcess, shutdown: &CancellationToken) -> Outcome {
        let addrs = &self.settings.ready_addrs;
        let timeout = self.settings.ready_timeout;
        let probe = wait_ready(addrs, timeout, READY_POLL);
        tokio::pin!(probe);
        let mut probing = true;
        let mut timed_out = false;

        loop {
            tokio::select! {
                status = process.child.wait() => {
                    return Outcome::Exited(describe_exit(status));
                }
                _ = shutdown.cancelled() => return Outcome::Shutdown,
                ready = &mut probe, if probing => {
                    if ready {
                        probing = false;
                        info!(
                            "Backend ready after {:.1}s",
                            process.started_at.elapsed().as_secs_f64()
                        );
                        self.health.set_ready(true);
                        self.emit(SupervisorEvent::Ready);
                    } else {
                        // Slow binders still get marked ready once they listen.
                        if !timed_out {
                            warn!(
                                "Backend listeners not reachable after {}s, still probing",
                                timeout.as_secs()
                            );
                            timed_out = true;
                        }
                        probe.set(wait_ready(addrs, timeout, READY_RETRY));
                    }
                }
            }
        }
    }

    /// SIGTERM, wait for the exit, SIGKILL if the grace runs out.
    async fn terminate(&self, mut process: SupervisedProcess) {
        let Some(pid) = process.pid else {
            let _ = process.child.wait().await;
            return;
        };
        info!("Stopping backend (pid={})", pid);

        let sent = i32::try_from(pid)
            .ok()
            .map(|raw| kill(Pid::from_raw(raw), Signal::SIGTERM));
        if let Some(Err(e)) = sent {
            debug!("SIGTERM to {} failed: {}", pid, e);
        }

        match tokio::time::timeout(self.settings.stop_timeout, process.child.wait()).await {
            Ok(Ok(status)) => info!("Backend stopped ({})", status),
            Ok(Err(e)) => warn!("Waiting for backend failed: {}", e),
            Err(_) => {
                warn!(
                    "Backend did not exit within {}s, killing",
                    self.settings.stop_timeout.as_secs()
                );
                if let Err(e) = process.child.kill().await {
                    warn!("Killing backend failed: {}", e);
                }
            }
        }
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => SupervisionError::UnexpectedExit(status.to_string()).to_string(),
        Err(e) => SupervisionError::UnexpectedExit(format!("wait failed: {e}")).to_string(),
    }
}

/// Poll every address until all accept a TCP connection or time runs out.
async fn wait_ready(addrs: &[SocketAddr], timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut pending = addrs.to_vec();

    loop {
        let mut still_pending = Vec::new();
        for addr in pending {
            if TcpStream::connect(addr).await.is_err() {
                still_pending.push(addr);
            }
        }
        if still_pending.is_empty() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        pending = still_pending;
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn settings(program: &str, script: &str) -> SupervisorSettings {
        SupervisorSettings {
            executable: PathBuf::from(program),
            args: vec!["-c".to_string(), script.to_string()],
            backoff_initial: ms(10),
            backoff_cap: ms(40),
            backoff_reset_after: secs(300),
            stop_timeout: secs(5),
            ready_addrs: Vec::new(),
            ready_timeout: secs(5),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> SupervisorEvent {
        tokio::time::timeout(secs(10), rx.recv())
            .await
            .expect("supervisor event")
            .expect("channel open")
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(secs(2), secs(30), secs(300));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay(secs(1)).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(backoff.consecutive_failures(), 7);
    }

    #[test]
    fn backoff_resets_after_long_healthy_run() {
        let mut backoff = Backoff::new(secs(2), secs(30), secs(300));
        for _ in 0..5 {
            backoff.next_delay(secs(1));
        }
        assert_eq!(backoff.next_delay(secs(301)), secs(2));
        assert_eq!(backoff.consecutive_failures(), 1);
        assert_eq!(backoff.next_delay(secs(1)), secs(4));
    }

    #[tokio::test]
    async fn crash_loop_delays_are_non_decreasing_and_capped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(
            settings("/bin/sh", "exit 3"),
            BackendHealth::new(),
            Arc::new(LogSink::console()),
        )
        .with_events(tx);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        let mut delays = Vec::new();
        while delays.len() < 6 {
            match next_event(&mut rx).await {
                SupervisorEvent::BackingOff { delay, .. } => delays.push(delay),
                SupervisorEvent::Exited { reason, .. } => assert!(reason.contains("3"), "{reason}"),
                _ => {}
            }
        }
        shutdown.cancel();
        tokio::time::timeout(secs(5), handle).await.unwrap().unwrap();

        assert_eq!(delays, vec![ms(10), ms(20), ms(40), ms(40), ms(40), ms(40)]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_exit_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = settings("/nonexistent/backend", "");
        s.args.clear();
        let supervisor = ProcessSupervisor::new(s, BackendHealth::new(), Arc::new(LogSink::console()))
            .with_events(tx);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        match next_event(&mut rx).await {
            SupervisorEvent::Exited { reason, .. } => assert!(reason.contains("failed to spawn")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            next_event(&mut rx).await,
            SupervisorEvent::BackingOff { consecutive_failures: 1, .. }
        ));

        shutdown.cancel();
        tokio::time::timeout(secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_terminates_running_child_and_clears_health() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut s = settings("/bin/sh", "exec sleep 30");
        s.ready_addrs = vec![listener.local_addr().unwrap()];

        let health = BackendHealth::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor =
            ProcessSupervisor::new(s, health.clone(), Arc::new(LogSink::console())).with_events(tx);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        let pid = match next_event(&mut rx).await {
            SupervisorEvent::Started { pid } => pid.expect("pid"),
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(next_event(&mut rx).await, SupervisorEvent::Ready);
        assert!(health.is_ready());

        shutdown.cancel();
        tokio::time::timeout(secs(5), handle)
            .await
            .expect("supervisor stops promptly")
            .unwrap();

        assert_eq!(next_event(&mut rx).await, SupervisorEvent::Stopped);
        assert!(!health.is_ready());
        assert!(!crate::lock::is_process_alive(pid));
    }

    #[tokio::test]
    async fn late_listener_still_marks_backend_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut s = settings("/bin/sh", "exec sleep 30");
        s.ready_addrs = vec![addr];
        s.ready_timeout = ms(300);

        let health = BackendHealth::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor =
            ProcessSupervisor::new(s, health.clone(), Arc::new(LogSink::console())).with_events(tx);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        assert!(matches!(next_event(&mut rx).await, SupervisorEvent::Started { .. }));
        tokio::time::sleep(ms(600)).await;
        assert!(!health.is_ready());

        let _late = TcpListener::bind(addr).await.unwrap();
        assert_eq!(next_event(&mut rx).await, SupervisorEvent::Ready);
        assert!(health.is_ready());

        shutdown.cancel();
        tokio::time::timeout(secs(5), handle).await.unwrap().unwrap();
        assert_eq!(next_event(&mut rx).await, SupervisorEvent::Stopped);
    }
}
