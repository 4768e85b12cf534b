use crate::config::{ProcessSpec, SupervisorSettings};
use crate::error::{ProcwardError, Result};
use crate::logs::{LogRedirector, LogSink};
use crate::process::monitor::{spawn_monitor, BreachGuard, MonitorHandle, MonitorOptions};
use crate::process::restart::{RestartDecision, RestartPolicy, RestartTracker};
use crate::process::spawner::{parse_signal, signal_group, spawn_process, SpawnedProcess};
use crate::process::types::{ExitInfo, ProcessHandle, ProcessStatus};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long to wait for the group to die after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Tuning shared by every controller of a supervisor
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// How long log pumps may keep draining after the child exits
    pub log_drain_grace: Duration,
    pub monitor: MonitorOptions,
}

impl ControllerOptions {
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            log_drain_grace: settings.log_drain_grace,
            monitor: MonitorOptions::new(settings.monitor_interval, settings.breach_cooldown),
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from_settings(&SupervisorSettings::default())
    }
}

/// Why a run is being launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchReason {
    Start,
    AutoRestart,
    ManualRestart,
    MemoryRestart,
}

impl LaunchReason {
    fn counts_as_restart(self) -> bool {
        self != LaunchReason::Start
    }
}

/// One live OS process and the tasks attached to it
struct ActiveRun {
    generation: u64,
    pid: u32,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    /// Owns the child; detached on teardown
    _waiter: JoinHandle<()>,
    logs: LogRedirector,
    monitor: Option<MonitorHandle>,
}

/// Lifecycle state guarded by the per-instance operation lock
struct Lifecycle {
    /// Bumped by every launch and every termination; stale exits and pending
    /// automatic restarts compare against it
    generation: u64,
    run: Option<ActiveRun>,
    policy: RestartPolicy,
    tracker: RestartTracker,
    /// When the memory limit last triggered a restart; every later run stays
    /// unarmed until the cooldown since then has passed
    last_breach: Option<Instant>,
}

impl Lifecycle {
    fn is_current(&self, generation: u64) -> bool {
        self.run
            .as_ref()
            .map(|run| run.generation == generation)
            .unwrap_or(false)
    }
}

struct Inner {
    spec: Arc<ProcessSpec>,
    instance: usize,
    name: String,
    options: ControllerOptions,
    ops: Mutex<Lifecycle>,
    state: watch::Sender<ProcessHandle>,
    /// Every status the instance went through, oldest first
    #[cfg(test)]
    transitions: std::sync::Mutex<Vec<ProcessStatus>>,
}

/// Owns the lifecycle of one instance of an app
///
/// Cloning is cheap; all clones drive the same instance. Lifecycle operations
/// are serialized per instance, while state reads go through a watch channel
/// and never wait on a running operation.
#[derive(Clone)]
pub struct ProcessController {
    inner: Arc<Inner>,
}

impl ProcessController {
    pub fn new(spec: Arc<ProcessSpec>, instance: usize, options: ControllerOptions) -> Self {
        let name = spec.instance_name(instance);
        let (state, _) = watch::channel(ProcessHandle::new(&spec.name, instance, name.clone()));
        let lifecycle = Lifecycle {
            generation: 0,
            run: None,
            policy: RestartPolicy::from_spec(&spec),
            tracker: RestartTracker::new(),
            last_breach: None,
        };

        Self {
            inner: Arc::new(Inner {
                spec,
                instance,
                name,
                options,
                ops: Mutex::new(lifecycle),
                state,
                #[cfg(test)]
                transitions: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.inner.spec
    }

    /// Current state of the instance
    pub fn snapshot(&self) -> ProcessHandle {
        self.inner.state.borrow().clone()
    }

    /// Receive every state change of the instance
    pub fn subscribe(&self) -> watch::Receiver<ProcessHandle> {
        self.inner.state.subscribe()
    }

    /// Spawn the process
    ///
    /// Does nothing if it is already running. A spawn failure leaves the
    /// instance Failed and is returned.
    pub async fn start(&self) -> Result<ProcessHandle> {
        let mut lc = self.inner.ops.lock().await;
        if lc.run.is_some() {
            return Ok(self.snapshot());
        }

        match self.launch(&mut lc, LaunchReason::Start) {
            Ok(_) => Ok(self.snapshot()),
            Err(e) => {
                error!("Failed to start {}: {}", self.inner.name, e);
                self.update(|h| h.mark_failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stop the process, escalating to SIGKILL after `timeout`
    ///
    /// Returns once the process group is gone and log redirection and memory
    /// monitoring have shut down. Also cancels a pending automatic restart and
    /// clears a Failed status.
    pub async fn stop(&self, timeout: Duration) -> Result<ProcessHandle> {
        let mut lc = self.inner.ops.lock().await;
        let exit = self.terminate(&mut lc, timeout).await;
        lc.tracker.clear();

        self.update(|h| {
            h.mark_exited(exit);
            h.status = ProcessStatus::Stopped;
            h.failure = None;
        });
        info!("Stopped {}", self.inner.name);
        Ok(self.snapshot())
    }

    /// Stop and start again with the same spec
    ///
    /// A manual restart forgets the crash history and clears a Failed status.
    pub async fn restart(&self) -> Result<ProcessHandle> {
        let mut lc = self.inner.ops.lock().await;

        self.update(|h| h.status = ProcessStatus::Restarting);
        let exit = self.terminate(&mut lc, self.inner.spec.kill_timeout).await;
        self.update(|h| h.mark_exited(exit));
        lc.tracker.clear();

        match self.launch(&mut lc, LaunchReason::ManualRestart) {
            Ok(_) => Ok(self.snapshot()),
            Err(e) => {
                error!("Failed to restart {}: {}", self.inner.name, e);
                self.update(|h| h.mark_failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Wait until the instance is Running
    ///
    /// Fails as soon as it lands in Failed or Stopped instead, or after `timeout`.
    pub async fn wait_until_running(&self, timeout: Duration) -> Result<ProcessHandle> {
        let mut rx = self.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|h| {
                matches!(
                    h.status,
                    ProcessStatus::Running | ProcessStatus::Failed | ProcessStatus::Stopped
                )
            }),
        )
        .await;

        let handle = match settled {
            Ok(Ok(handle)) => handle.clone(),
            Ok(Err(_)) => return Err(ProcwardError::Other("state channel closed".to_string())),
            Err(_) => {
                return Err(ProcwardError::TimeoutError(format!(
                    "{} did not reach running within {:?}",
                    self.inner.name, timeout
                )))
            }
        };

        match handle.status {
            ProcessStatus::Running => Ok(handle),
            ProcessStatus::Failed => Err(ProcwardError::SpawnError(format!(
                "{}: {}",
                self.inner.name,
                handle.failure.as_deref().unwrap_or("failed")
            ))),
            _ => Err(ProcwardError::Other(format!(
                "{} exited during startup ({})",
                self.inner.name,
                handle
                    .last_exit
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no exit status".to_string())
            ))),
        }
    }

    fn update(&self, f: impl FnOnce(&mut ProcessHandle)) {
        self.inner.state.send_modify(|h| {
            #[cfg(test)]
            let before = h.status;
            f(h);
            #[cfg(test)]
            self.record_transition(before, h.status);
        });
    }

    #[cfg(test)]
    fn record_transition(&self, before: ProcessStatus, after: ProcessStatus) {
        if before != after {
            if let Ok(mut log) = self.inner.transitions.lock() {
                log.push(after);
            }
        }
    }

    /// Spawn a new run and attach its waiter, log redirector and monitor
    fn launch(&self, lc: &mut Lifecycle, reason: LaunchReason) -> Result<u32> {
        let spec = &self.inner.spec;
        let instance = self.inner.instance;
        self.update(|h| h.status = ProcessStatus::Starting);

        let SpawnedProcess {
            mut child,
            pid,
            stdout,
            stderr,
        } = spawn_process(spec, instance)?;

        lc.generation += 1;
        let generation = lc.generation;

        let sink = LogSink::open(&spec.instance_logs(instance), spec.time);
        let logs = LogRedirector::start(stdout, stderr, sink);

        let (exit_tx, exit_rx) = watch::channel(None);
        let waiter = {
            let controller = self.clone();
            tokio::spawn(async move {
                let info = match child.wait().await {
                    Ok(status) => ExitInfo::from(status),
                    Err(e) => {
                        warn!("Failed to wait on pid {}: {}", pid, e);
                        ExitInfo {
                            code: None,
                            signal: None,
                        }
                    }
                };
                let _ = exit_tx.send(Some(info));
                controller.handle_exit(generation, info).await;
            })
        };

        let monitor = spec.memory_limit.map(|limit| {
            let now = Instant::now();
            let arm_after = breach_cooldown_left(
                lc.last_breach,
                self.inner.options.monitor.breach_cooldown,
                now,
            );
            let sampler = self.clone();
            let breached = self.clone();

            spawn_monitor(
                pid,
                BreachGuard::new(limit, arm_after, now),
                &self.inner.options.monitor,
                CancellationToken::new(),
                move |usage| {
                    sampler.update(|h| {
                        if h.pid == Some(pid) {
                            h.memory_bytes = Some(usage);
                        }
                    })
                },
                move |usage| {
                    warn!(
                        "{} uses {} bytes, over its limit of {} bytes; restarting",
                        breached.inner.name, usage, limit
                    );
                    tokio::spawn(async move {
                        breached.restart_for_breach(generation).await;
                    });
                },
            )
        });

        lc.run = Some(ActiveRun {
            generation,
            pid,
            exit_rx,
            _waiter: waiter,
            logs,
            monitor,
        });

        let restarted = reason.counts_as_restart();
        self.update(|h| {
            h.mark_running(pid);
            if restarted {
                h.restart_count += 1;
            }
        });

        info!("Started {} (pid {}, {:?})", self.inner.name, pid, reason);
        Ok(pid)
    }

    /// Signal the current run to stop and tear it down
    ///
    /// Returns the exit of the run, if there was one and it could be observed.
    async fn terminate(&self, lc: &mut Lifecycle, timeout: Duration) -> Option<ExitInfo> {
        lc.generation += 1;
        let run = lc.run.take()?;

        let signal = parse_signal(&self.inner.spec.kill_signal).unwrap_or(Signal::SIGTERM);
        if let Err(e) = signal_group(run.pid, signal) {
            warn!("{}", e);
        }

        let mut exit_rx = run.exit_rx.clone();
        let mut exit = wait_exit(&mut exit_rx, timeout).await;

        if exit.is_none() {
            warn!(
                "{} did not exit within {:?}, sending SIGKILL",
                self.inner.name, timeout
            );
            if let Err(e) = signal_group(run.pid, Signal::SIGKILL) {
                warn!("{}", e);
            }
            exit = wait_exit(&mut exit_rx, KILL_WAIT).await;
            if exit.is_none() {
                let err = ProcwardError::StopError(
                    self.inner.name.clone(),
                    format!("pid {} survived SIGKILL", run.pid),
                );
                error!("{}", err);
            }
        }

        self.teardown(run).await;
        exit
    }

    /// Join the log redirector and monitor of a finished run
    async fn teardown(&self, run: ActiveRun) {
        run.logs.finish(self.inner.options.log_drain_grace).await;
        if let Some(monitor) = run.monitor {
            monitor.shutdown().await;
        }
    }

    /// Called by the waiter once the child has exited
    async fn handle_exit(&self, generation: u64, exit: ExitInfo) {
        let mut lc = self.inner.ops.lock().await;
        if !lc.is_current(generation) {
            debug!("Ignoring exit of an old run of {}", self.inner.name);
            return;
        }

        if let Some(run) = lc.run.take() {
            self.teardown(run).await;
        }
        self.update(|h| h.mark_exited(Some(exit)));

        if !lc.policy.enabled {
            info!("{} exited ({})", self.inner.name, exit);
            self.update(|h| h.status = ProcessStatus::Stopped);
            return;
        }

        warn!("{} exited unexpectedly ({})", self.inner.name, exit);
        let now = Instant::now();
        let window = lc.policy.window;
        lc.tracker.record_failure(now);
        lc.tracker.prune(window, now);

        self.recover(lc).await;
    }

    /// Automatic restart loop after a failure has been recorded
    async fn recover<'a>(&'a self, mut lc: MutexGuard<'a, Lifecycle>) {
        loop {
            let now = Instant::now();
            match lc.policy.decide(&lc.tracker, now) {
                RestartDecision::Disabled => {
                    self.update(|h| h.status = ProcessStatus::Stopped);
                    return;
                }
                RestartDecision::GiveUp { failures } => {
                    let err = ProcwardError::CrashLoop(
                        self.inner.name.clone(),
                        format!(
                            "{} failures within {}s",
                            failures,
                            lc.policy.window.as_secs()
                        ),
                    );
                    error!("{}", err);
                    self.update(|h| h.mark_failed(err.to_string()));
                    return;
                }
                RestartDecision::Restart { delay } => {
                    self.update(|h| h.status = ProcessStatus::Restarting);

                    if !delay.is_zero() {
                        debug!("Restarting {} in {:?}", self.inner.name, delay);
                        let token = lc.generation;
                        drop(lc);
                        tokio::time::sleep(delay).await;
                        lc = self.inner.ops.lock().await;
                        // Stopped, restarted or deleted meanwhile
                        if lc.generation != token || lc.run.is_some() {
                            return;
                        }
                    }

                    match self.launch(&mut lc, LaunchReason::AutoRestart) {
                        Ok(_) => return,
                        Err(e) => {
                            warn!("Restart of {} failed: {}", self.inner.name, e);
                            let now = Instant::now();
                            let window = lc.policy.window;
                            lc.tracker.record_failure(now);
                            lc.tracker.prune(window, now);
                        }
                    }
                }
            }
        }
    }

    /// Restart triggered by the memory monitor of run `generation`
    async fn restart_for_breach(&self, generation: u64) {
        let mut lc = self.inner.ops.lock().await;
        if !lc.is_current(generation) {
            return;
        }

        lc.last_breach = Some(Instant::now());
        self.update(|h| h.status = ProcessStatus::Restarting);
        let exit = self.terminate(&mut lc, self.inner.spec.kill_timeout).await;
        self.update(|h| h.mark_exited(exit));

        if let Err(e) = self.launch(&mut lc, LaunchReason::MemoryRestart) {
            warn!("Restart of {} failed: {}", self.inner.name, e);
            let now = Instant::now();
            lc.tracker.record_failure(now);
            self.recover(lc).await;
        }
    }
}

/// Part of the breach cooldown still to run at `now`
fn breach_cooldown_left(
    last_breach: Option<Instant>,
    cooldown: Duration,
    now: Instant,
) -> Duration {
    match last_breach {
        Some(at) => cooldown.saturating_sub(now.saturating_duration_since(at)),
        None => Duration::ZERO,
    }
}

async fn wait_exit(
    exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
    timeout: Duration,
) -> Option<ExitInfo> {
    match tokio::time::timeout(timeout, exit_rx.wait_for(|e| e.is_some())).await {
        Ok(Ok(exit)) => *exit,
        // Waiter gone without reporting; nothing left to wait for
        Ok(Err(_)) => None,
        Err(_) => None,
    }
}
