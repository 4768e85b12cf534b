use crate::config::ProcessSpec;
use crate::error::{ProcwardError, Result};
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// A freshly spawned child with its output pipes detached
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,
    /// Process ID assigned by the OS
    pub pid: u32,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn instance `instance` of `spec`
///
/// The child gets its own process group so stop signals also reach anything
/// it forks (worker pools, shells). Stdin is closed; stdout and stderr are
/// piped for log redirection.
pub fn spawn_process(spec: &ProcessSpec, instance: usize) -> Result<SpawnedProcess> {
    let name = spec.instance_name(instance);
    let mut command = Command::new(&spec.command);

    command
        .args(&spec.args)
        .envs(&spec.env)
        .env("NODE_APP_INSTANCE", instance.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }

    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|e| {
        ProcwardError::SpawnError(format!(
            "failed to spawn '{}' ({}): {}",
            name,
            spec.command.display(),
            e
        ))
    })?;

    let pid = child
        .id()
        .ok_or_else(|| ProcwardError::SpawnError(format!("failed to get PID for '{}'", name)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProcwardError::SpawnError(format!("no stdout pipe for '{}'", name)))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProcwardError::SpawnError(format!("no stderr pipe for '{}'", name)))?;

    Ok(SpawnedProcess {
        child,
        pid,
        stdout,
        stderr,
    })
}

#[cfg(unix)]
pub fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(ProcwardError::SignalError(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}

/// Send `sig` to the process group led by `pid`
///
/// A group that is already gone is not an error.
#[cfg(unix)]
pub fn signal_group(pid: u32, sig: Signal) -> Result<()> {
    match signal::killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcwardError::SignalError(format!(
            "failed to send {} to group {}: {}",
            sig, pid, e
        ))),
    }
}
