use super::process::{stop_gracefully, TunnelProcess};
use super::{TunnelError, TunnelStatus, TunnelStatusChange};
use crate::docker::prober::HostTunnelProbe;
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const MONITOR_TASK_NAME: &str = "tunnel_monitor";

/// Consecutive failed ticks before `up` transitions to `down`.
const FAILURE_THRESHOLD: u32 = 3;

/// Restart delays; the last level repeats until recovery.
const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
];

const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Liveness ping seam. The production pinger hits the tunnel binary's
/// local readiness endpoint.
#[async_trait]
pub trait TunnelPinger: Send + Sync {
    async fn ping(&self) -> Result<(), String>;
}

pub struct HttpPinger {
    url: String,
    http: reqwest::Client,
}

impl HttpPinger {
    pub fn new(metrics_port: u16) -> Result<Self, TunnelError> {
        let http = reqwest::Client::builder()
            .timeout(PING_TIMEOUT)
            .build()
            .map_err(|err| TunnelError::Spawn(err.to_string()))?;
        Ok(Self {
            url: format!("http://127.0.0.1:{metrics_port}/ready"),
            http,
        })
    }
}

#[async_trait]
impl TunnelPinger for HttpPinger {
    async fn ping(&self) -> Result<(), String> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("readiness endpoint returned {}", response.status()))
        }
    }
}

/// Read-only view of the monitor state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelStatusReport {
    pub status: TunnelStatus,
    pub uptime_s: u64,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

/// Subscriber list for status change fan-out. Every subscriber holds its
/// own channel and sees every change delivered after it subscribed;
/// subscribers that went away are dropped on the next delivery.
#[derive(Default)]
struct StatusSubscriptions {
    senders: Mutex<Vec<Sender<TunnelStatusChange>>>,
}

impl StatusSubscriptions {
    fn subscribe(&self) -> Receiver<TunnelStatusChange> {
        let (tx, rx) = unbounded();
        self.senders
            .lock()
            .expect("failed to acquire the lock")
            .push(tx);
        rx
    }

    fn deliver(&self, change: TunnelStatusChange) {
        let mut senders = self.senders.lock().expect("failed to acquire the lock");
        senders.retain(|subscriber| subscriber.send(change.clone()).is_ok());
    }
}

#[derive(Debug)]
struct MonitorState {
    status: TunnelStatus,
    consecutive_failures: u32,
    restart_count: u32,
    backoff_level: usize,
    started_at: Instant,
    next_restart_at: Option<Instant>,
    last_error: Option<String>,
    /// Whether the current `restarting` phase came from failure recovery
    /// (counted) rather than a reload (not counted).
    counting_recovery: bool,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            status: TunnelStatus::Up,
            consecutive_failures: 0,
            restart_count: 0,
            backoff_level: 0,
            started_at: Instant::now(),
            next_restart_at: None,
            last_error: None,
            counting_recovery: false,
        }
    }
}

/// Owns the tunnel process and its recovery state machine. Transitions
/// are serialized through the internal lock; observers read snapshots or
/// subscribe to status change events.
pub struct TunnelMonitor {
    process: Arc<dyn TunnelProcess>,
    pinger: Arc<dyn TunnelPinger>,
    store: Store,
    subscriptions: StatusSubscriptions,
    state: Mutex<MonitorState>,
    check_interval: Duration,
    backoff_schedule: Vec<Duration>,
}

impl TunnelMonitor {
    pub fn new(
        process: Arc<dyn TunnelProcess>,
        pinger: Arc<dyn TunnelPinger>,
        store: Store,
        check_interval: Duration,
    ) -> Self {
        Self {
            process,
            pinger,
            store,
            subscriptions: StatusSubscriptions::default(),
            state: Mutex::new(MonitorState::default()),
            check_interval,
            backoff_schedule: BACKOFF_SCHEDULE.to_vec(),
        }
    }

    /// Overrides the restart delay ladder. The last level repeats until
    /// recovery.
    pub fn with_backoff_schedule(mut self, schedule: Vec<Duration>) -> Self {
        if !schedule.is_empty() {
            self.backoff_schedule = schedule;
        }
        self
    }

    /// Spawns the tunnel binary and starts optimistic; the first ticks
    /// confirm or correct.
    pub fn start(&self) -> Result<(), TunnelError> {
        self.process.spawn()?;
        let mut state = self.state.lock().expect("failed to acquire the lock");
        state.started_at = Instant::now();
        state.status = TunnelStatus::Up;
        Ok(())
    }

    pub fn subscribe(&self) -> Receiver<TunnelStatusChange> {
        self.subscriptions.subscribe()
    }

    pub fn status(&self) -> TunnelStatusReport {
        let state = self.state.lock().expect("failed to acquire the lock");
        TunnelStatusReport {
            status: state.status,
            uptime_s: state.started_at.elapsed().as_secs(),
            restart_count: state.restart_count,
            last_error: state.last_error.clone(),
        }
    }

    pub fn spawn_loop(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    _ = shutdown.changed() => {
                        debug!(task = MONITOR_TASK_NAME, "stopping");
                        if let Err(err) = stop_gracefully(self.process.as_ref()).await {
                            warn!(error_msg = %err, "stopping tunnel process");
                        }
                        break;
                    }
                }
            }
        })
    }

    /// One monitor tick: liveness check, state machine step, snapshot.
    pub async fn tick(&self) {
        let process_alive = self.process.is_running();
        let ping = if process_alive {
            self.pinger.ping().await
        } else {
            Err("tunnel process is not running".to_string())
        };
        let alive = process_alive && ping.is_ok();
        let failure = ping.err();

        let restart_due = self.step(alive, failure);
        if restart_due {
            self.attempt_restart().await;
        }

        self.snapshot().await;
    }

    /// Applies one observation to the state machine. Returns true when a
    /// restart attempt is due now.
    fn step(&self, alive: bool, failure: Option<String>) -> bool {
        let mut state = self.state.lock().expect("failed to acquire the lock");
        match state.status {
            TunnelStatus::Up => {
                if alive {
                    state.consecutive_failures = 0;
                    return false;
                }
                state.consecutive_failures += 1;
                state.last_error = failure;
                if state.consecutive_failures < FAILURE_THRESHOLD {
                    return false;
                }
                warn!(
                    failures = state.consecutive_failures,
                    "tunnel declared down"
                );
                state.status = TunnelStatus::Down;
                state.next_restart_at =
                    Some(Instant::now() + self.backoff_schedule[state.backoff_level]);
                self.emit(&state);
                false
            }
            TunnelStatus::Down => state
                .next_restart_at
                .is_some_and(|at| Instant::now() >= at),
            TunnelStatus::Restarting => {
                if alive {
                    info!("tunnel recovered");
                    state.status = TunnelStatus::Up;
                    if state.counting_recovery {
                        state.restart_count += 1;
                    }
                    state.counting_recovery = false;
                    state.consecutive_failures = 0;
                    state.backoff_level = 0;
                    state.next_restart_at = None;
                    state.started_at = Instant::now();
                    state.last_error = None;
                    self.emit(&state);
                } else {
                    state.last_error = failure;
                    state.status = TunnelStatus::Down;
                    state.backoff_level =
                        (state.backoff_level + 1).min(self.backoff_schedule.len() - 1);
                    state.next_restart_at =
                        Some(Instant::now() + self.backoff_schedule[state.backoff_level]);
                    self.emit(&state);
                }
                false
            }
        }
    }

    async fn attempt_restart(&self) {
        {
            let mut state = self.state.lock().expect("failed to acquire the lock");
            state.status = TunnelStatus::Restarting;
            state.counting_recovery = true;
            state.next_restart_at = None;
            self.emit(&state);
        }

        if let Err(err) = stop_gracefully(self.process.as_ref()).await {
            warn!(error_msg = %err, "stopping tunnel before restart");
        }
        if let Err(err) = self.process.spawn() {
            error!(error_msg = %err, "tunnel restart attempt failed");
            let mut state = self.state.lock().expect("failed to acquire the lock");
            state.last_error = Some(err.to_string());
        }
    }

    /// Lighter path than a recovery restart: in-place reload when the
    /// binary supports it, restart otherwise. Not counted as a recovery.
    pub async fn reload(&self) -> Result<(), TunnelError> {
        {
            let mut state = self.state.lock().expect("failed to acquire the lock");
            state.status = TunnelStatus::Restarting;
            state.counting_recovery = false;
            self.emit(&state);
        }

        match self.process.reload() {
            Ok(true) => {
                debug!("tunnel configuration reload signalled");
                Ok(())
            }
            Ok(false) | Err(_) => {
                info!("tunnel binary does not support in-place reload, restarting");
                stop_gracefully(self.process.as_ref()).await?;
                self.process.spawn()
            }
        }
    }

    fn emit(&self, state: &MonitorState) {
        self.subscriptions.deliver(TunnelStatusChange {
            status: state.status,
            restart_count: state.restart_count,
            last_error: state.last_error.clone(),
            at: Utc::now(),
        });
    }

    async fn snapshot(&self) {
        let report = self.status();
        if let Err(err) = self
            .store
            .record_tunnel_health(
                report.status,
                report.uptime_s as i64,
                report.restart_count as i64,
                report.last_error.as_deref(),
            )
            .await
        {
            warn!(error_msg = %err, "persisting tunnel health snapshot");
        }
    }
}

impl HostTunnelProbe for TunnelMonitor {
    fn tunnel_process_running(&self) -> bool {
        self.process.is_running()
    }
}
