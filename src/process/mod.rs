// Process module - Lifecycle, restart policy and memory monitoring of supervised apps

pub mod controller;
pub mod monitor;
pub mod restart;
pub mod spawner;
pub mod supervisor;
mod types;

pub use controller::{ControllerOptions, ProcessController};
pub use monitor::{MemorySampler, MonitorOptions, SamplerFactory, SysinfoSampler};
pub use restart::{BackoffStrategy, RestartDecision, RestartPolicy, RestartTracker};
pub use spawner::{spawn_process, SpawnedProcess};
pub use supervisor::{StartReport, Supervisor};
pub use types::{ExitInfo, ProcessHandle, ProcessStatus};
