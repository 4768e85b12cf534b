use crate::error::{ProcwardError, Result};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source of resident memory readings for a process
pub trait MemorySampler: Send {
    /// Resident set size of `pid` in bytes
    ///
    /// Returns `MonitorRead` when the process is gone or unreadable.
    fn resident_bytes(&mut self, pid: u32) -> Result<u64>;
}

/// Memory sampler backed by sysinfo
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn resident_bytes(&mut self, pid: u32) -> Result<u64> {
        let sys_pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        self.system
            .process(sys_pid)
            .map(|p| p.memory())
            .ok_or(ProcwardError::MonitorRead(pid))
    }
}

/// Builds a fresh sampler for each monitored run
pub type SamplerFactory = Arc<dyn Fn() -> Box<dyn MemorySampler> + Send + Sync>;

pub fn sysinfo_sampler_factory() -> SamplerFactory {
    Arc::new(|| Box::new(SysinfoSampler::new()) as Box<dyn MemorySampler>)
}

/// Monitor tuning shared by every controller of a supervisor
#[derive(Clone)]
pub struct MonitorOptions {
    /// Sampling period
    pub interval: Duration,
    /// Uptime a run needs after a memory restart before a breach counts again
    pub breach_cooldown: Duration,
    pub sampler_factory: SamplerFactory,
}

impl MonitorOptions {
    pub fn new(interval: Duration, breach_cooldown: Duration) -> Self {
        Self {
            interval,
            breach_cooldown,
            sampler_factory: sysinfo_sampler_factory(),
        }
    }

    pub fn with_sampler_factory(mut self, sampler_factory: SamplerFactory) -> Self {
        self.sampler_factory = sampler_factory;
        self
    }
}

impl fmt::Debug for MonitorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorOptions")
            .field("interval", &self.interval)
            .field("breach_cooldown", &self.breach_cooldown)
            .finish_non_exhaustive()
    }
}

/// Debounces memory breaches for one run of a process
///
/// Fires at most once, and only once the run has been up for `arm_after`.
#[derive(Debug, Clone)]
pub struct BreachGuard {
    limit: u64,
    arm_after: Duration,
    started: Instant,
    fired: bool,
}

impl BreachGuard {
    pub fn new(limit: u64, arm_after: Duration, started: Instant) -> Self {
        Self {
            limit,
            arm_after,
            started,
            fired: false,
        }
    }

    /// Feed one sample; returns true when a restart should be triggered
    pub fn observe(&mut self, usage: u64, now: Instant) -> bool {
        if self.fired || usage <= self.limit {
            return false;
        }
        if now.saturating_duration_since(self.started) < self.arm_after {
            return false;
        }
        self.fired = true;
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// Running monitor task for one run
pub struct MonitorHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl MonitorHandle {
    /// Cancel the task and wait for it to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!("Memory monitor task panicked: {}", e);
            }
        }
    }
}

/// Start sampling `pid` every `options.interval`
///
/// `on_sample` receives every successful reading. `on_breach` is called at most
/// once, when `guard` fires; the task ends right after.
pub fn spawn_monitor<S, B>(
    pid: u32,
    mut guard: BreachGuard,
    options: &MonitorOptions,
    cancel: CancellationToken,
    on_sample: S,
    on_breach: B,
) -> MonitorHandle
where
    S: Fn(u64) + Send + 'static,
    B: FnOnce(u64) + Send + 'static,
{
    let mut sampler = (options.sampler_factory)();
    let period = options.interval.max(Duration::from_millis(1));
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let usage = match sampler.resident_bytes(pid) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("Skipping memory sample: {}", e);
                    continue;
                }
            };

            on_sample(usage);

            if guard.observe(usage, Instant::now()) {
                on_breach(usage);
                break;
            }
        }
    });

    MonitorHandle { task, cancel }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tokio::process::Command;

    struct FixedSampler(u64);

    impl MemorySampler for FixedSampler {
        fn resident_bytes(&mut self, _pid: u32) -> Result<u64> {
            Ok(self.0)
        }
    }

    struct GoneSampler;

    impl MemorySampler for GoneSampler {
        fn resident_bytes(&mut self, pid: u32) -> Result<u64> {
            Err(ProcwardError::MonitorRead(pid))
        }
    }

    fn options(factory: SamplerFactory) -> MonitorOptions {
        MonitorOptions::new(Duration::from_millis(10), Duration::from_secs(30))
            .with_sampler_factory(factory)
    }

    #[test]
    fn test_guard_fires_once() {
        let start = Instant::now();
        let mut guard = BreachGuard::new(100, Duration::ZERO, start);

        assert!(!guard.observe(50, start));
        assert!(!guard.observe(100, start));
        assert!(guard.observe(101, start));
        assert!(!guard.observe(500, start));
        assert!(guard.has_fired());
    }

    #[test]
    fn test_guard_respects_cooldown() {
        let start = Instant::now();
        let mut guard = BreachGuard::new(100, Duration::from_secs(30), start);

        assert!(!guard.observe(200, start + Duration::from_secs(5)));
        assert!(!guard.observe(200, start + Duration::from_secs(29)));
        assert!(guard.observe(200, start + Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_sysinfo_sampler_reads_live_process() {
        let mut child = Command::new("/bin/sleep").arg("5").spawn().unwrap();
        let pid = child.id().unwrap();

        let mut sampler = SysinfoSampler::new();
        assert!(sampler.resident_bytes(pid).unwrap() > 0);

        child.kill().await.unwrap();
        let _ = child.wait().await;
        assert!(matches!(
            sampler.resident_bytes(pid),
            Err(ProcwardError::MonitorRead(_))
        ));
    }

    #[tokio::test]
    async fn test_monitor_triggers_breach_once() {
        let breaches = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicU64::new(0));
        let opts = options(Arc::new(|| Box::new(FixedSampler(4096)) as Box<dyn MemorySampler>));

        let b = breaches.clone();
        let l = last.clone();
        let handle = spawn_monitor(
            1,
            BreachGuard::new(1024, Duration::ZERO, Instant::now()),
            &opts,
            CancellationToken::new(),
            move |usage| l.store(usage, Ordering::SeqCst),
            move |_| {
                b.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert_eq!(breaches.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 4096);
    }

    #[tokio::test]
    async fn test_monitor_ignores_read_failures() {
        let breaches = Arc::new(AtomicUsize::new(0));
        let opts = options(Arc::new(|| Box::new(GoneSampler) as Box<dyn MemorySampler>));

        let b = breaches.clone();
        let handle = spawn_monitor(
            1,
            BreachGuard::new(1, Duration::ZERO, Instant::now()),
            &opts,
            CancellationToken::new(),
            |_| {},
            move |_| {
                b.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.shutdown().await;
        assert_eq!(breaches.load(Ordering::SeqCst), 0);
    }
}
