use crate::config::{ConfigLoader, LogPaths, ProcessSpec, SupervisorSettings};
use crate::error::{ProcwardError, Result};
use crate::process::controller::{ControllerOptions, ProcessController};
use crate::process::types::ProcessHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// One declared app and the controllers of its instances
struct App {
    spec: Arc<ProcessSpec>,
    instances: Vec<ProcessController>,
}

/// Outcome of starting every app of a config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartReport {
    /// Instances that reached Running
    pub started: Vec<ProcessHandle>,
    /// Apps or instances that could not be started, with the reason
    pub failures: Vec<(String, String)>,
}

impl StartReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Registry of supervised apps
///
/// Apps are keyed by name. Operations that take a name accept either an app
/// name (all its instances) or an instance name (`app-<index>`).
pub struct Supervisor {
    settings: SupervisorSettings,
    options: ControllerOptions,
    apps: RwLock<BTreeMap<String, App>>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        let options = ControllerOptions::from_settings(&settings);
        Self::with_options(settings, options)
    }

    pub fn with_options(settings: SupervisorSettings, options: ControllerOptions) -> Self {
        Self {
            settings,
            options,
            apps: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Register `spec` and start all its instances
    ///
    /// Every instance is attempted even if an earlier one fails to spawn; the
    /// first spawn error is returned. The app stays registered either way, so
    /// Failed instances remain visible.
    pub async fn start(&self, spec: ProcessSpec) -> Result<Vec<ProcessHandle>> {
        let controllers = {
            let mut apps = self.apps.write().await;
            if apps.contains_key(&spec.name) {
                return Err(ProcwardError::ProcessAlreadyExists(spec.name.clone()));
            }

            let spec = Arc::new(spec);
            let instances: Vec<ProcessController> = (0..spec.instances)
                .map(|i| ProcessController::new(spec.clone(), i, self.options.clone()))
                .collect();
            apps.insert(
                spec.name.clone(),
                App {
                    spec,
                    instances: instances.clone(),
                },
            );
            instances
        };

        let mut handles = Vec::with_capacity(controllers.len());
        let mut first_error = None;
        for controller in &controllers {
            match controller.start().await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(handles),
        }
    }

    /// Load a config file and start every valid app in it
    ///
    /// Invalid apps and apps that do not reach Running within `timeout` are
    /// reported in the returned [`StartReport`]; only unreadable or malformed
    /// files fail the whole call.
    pub async fn start_config(&self, path: &Path, timeout: Duration) -> Result<StartReport> {
        let loader = ConfigLoader::new(&self.settings.log_dir);
        let (specs, invalid) = loader.load_each(path)?;

        let mut report = StartReport::default();
        for (name, err) in invalid {
            error!("Skipping app {}: {}", name, err);
            report.failures.push((name, err.to_string()));
        }

        for spec in specs {
            let name = spec.name.clone();
            // Spawn failures surface per instance below
            if let Err(e @ ProcwardError::ProcessAlreadyExists(_)) = self.start(spec).await {
                error!("Failed to start {}: {}", name, e);
                report.failures.push((name, e.to_string()));
                continue;
            }

            for controller in self.select(&name).await? {
                match controller.wait_until_running(timeout).await {
                    Ok(handle) => report.started.push(handle),
                    Err(e) => report
                        .failures
                        .push((controller.name().to_string(), e.to_string())),
                }
            }
        }

        info!(
            "Started {} instance(s) from {}, {} failure(s)",
            report.started.len(),
            path.display(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Stop the named app or instance
    pub async fn stop(&self, name: &str) -> Result<Vec<ProcessHandle>> {
        let mut handles = Vec::new();
        for controller in self.select(name).await? {
            let timeout = controller.spec().kill_timeout;
            handles.push(controller.stop(timeout).await?);
        }
        Ok(handles)
    }

    /// Restart the named app or instance
    pub async fn restart(&self, name: &str) -> Result<Vec<ProcessHandle>> {
        let mut handles = Vec::new();
        for controller in self.select(name).await? {
            handles.push(controller.restart().await?);
        }
        Ok(handles)
    }

    /// Stop the named app or instance and forget it
    pub async fn delete(&self, name: &str) -> Result<Vec<ProcessHandle>> {
        let removed = {
            let mut apps = self.apps.write().await;
            if let Some(app) = apps.remove(name) {
                app.instances
            } else {
                let app_name = apps
                    .iter()
                    .find(|(_, app)| app.instances.iter().any(|c| c.name() == name))
                    .map(|(app_name, _)| app_name.clone())
                    .ok_or_else(|| ProcwardError::ProcessNotFound(name.to_string()))?;

                let mut removed = Vec::new();
                if let Some(app) = apps.get_mut(&app_name) {
                    let (gone, kept): (Vec<_>, Vec<_>) =
                        app.instances.drain(..).partition(|c| c.name() == name);
                    app.instances = kept;
                    removed = gone;
                }
                if apps.get(&app_name).map(|a| a.instances.is_empty()) == Some(true) {
                    apps.remove(&app_name);
                }
                removed
            }
        };

        let mut handles = Vec::new();
        for controller in removed {
            let timeout = controller.spec().kill_timeout;
            handles.push(controller.stop(timeout).await?);
        }
        info!("Deleted {}", name);
        Ok(handles)
    }

    /// Snapshot of every instance, or of the named app or instance
    pub async fn status(&self, name: Option<&str>) -> Result<Vec<ProcessHandle>> {
        let controllers = match name {
            Some(name) => self.select(name).await?,
            None => self
                .apps
                .read()
                .await
                .values()
                .flat_map(|app| app.instances.iter().cloned())
                .collect(),
        };
        Ok(controllers.iter().map(|c| c.snapshot()).collect())
    }

    /// Log file paths of the named app or instance, per instance name
    pub async fn log_paths(&self, name: &str) -> Result<Vec<(String, LogPaths)>> {
        let apps = self.apps.read().await;
        let mut paths = Vec::new();
        for app in apps.values() {
            let whole_app = app.spec.name == name;
            for controller in &app.instances {
                if whole_app || controller.name() == name {
                    let index = controller.snapshot().instance;
                    paths.push((controller.name().to_string(), app.spec.instance_logs(index)));
                }
            }
        }

        if paths.is_empty() {
            return Err(ProcwardError::ProcessNotFound(name.to_string()));
        }
        Ok(paths)
    }

    /// Stop every instance of every app
    pub async fn shutdown(&self) {
        let controllers: Vec<ProcessController> = self
            .apps
            .read()
            .await
            .values()
            .flat_map(|app| app.instances.iter().cloned())
            .collect();

        info!("Stopping {} instance(s)", controllers.len());
        let mut tasks = JoinSet::new();
        for controller in controllers {
            tasks.spawn(async move {
                let timeout = controller.spec().kill_timeout;
                if let Err(e) = controller.stop(timeout).await {
                    warn!("Failed to stop {}: {}", controller.name(), e);
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn select(&self, name: &str) -> Result<Vec<ProcessController>> {
        let apps = self.apps.read().await;
        if let Some(app) = apps.get(name) {
            return Ok(app.instances.clone());
        }

        apps.values()
            .flat_map(|app| app.instances.iter())
            .find(|c| c.name() == name)
            .map(|c| vec![c.clone()])
            .ok_or_else(|| ProcwardError::ProcessNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::types::ProcessStatus;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn settings(dir: &Path) -> SupervisorSettings {
        SupervisorSettings {
            socket_path: dir.join("test.sock"),
            log_dir: dir.join("logs"),
            log_drain_grace: Duration::from_millis(100),
            ..SupervisorSettings::default()
        }
    }

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("apps.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_start_config_and_status() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings(temp_dir.path()));
        let config = write_config(
            temp_dir.path(),
            r#"
[[apps]]
name = "web"
script = "/bin/sleep"
args = "30"
instances = 2

[[apps]]
name = "worker"
script = "/bin/sleep"
args = ["30"]
"#,
        );

        let report = supervisor
            .start_config(&config, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report.failures);
        assert_eq!(report.started.len(), 3);

        let all = supervisor.status(None).await.unwrap();
        let names: Vec<&str> = all.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["web-0", "web-1", "worker"]);
        assert!(all.iter().all(|h| h.status == ProcessStatus::Running));

        let web = supervisor.status(Some("web")).await.unwrap();
        assert_eq!(web.len(), 2);
        let one = supervisor.status(Some("web-1")).await.unwrap();
        assert_eq!(one.len(), 1);

        supervisor.shutdown().await;
        let all = supervisor.status(None).await.unwrap();
        assert!(all.iter().all(|h| h.status == ProcessStatus::Stopped));
    }

    #[tokio::test]
    async fn test_invalid_app_does_not_block_others() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings(temp_dir.path()));
        let config = write_config(
            temp_dir.path(),
            r#"
[[apps]]
name = "good"
script = "/bin/sleep"
args = "30"

[[apps]]
name = "bad"
script = "/bin/sleep"
max_memory_restart = "lots"
"#,
        );

        let report = supervisor
            .start_config(&config, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(report.started.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "bad");

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_attempts_every_instance() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings(temp_dir.path()));
        let config = write_config(
            temp_dir.path(),
            r#"
[[apps]]
name = "ghost"
script = "/nonexistent/bin/ghost"
instances = 2

[[apps]]
name = "fine"
script = "/bin/sleep"
args = "30"
"#,
        );

        let report = supervisor
            .start_config(&config, Duration::from_secs(5))
            .await
            .unwrap();
        let failed: Vec<&str> = report.failures.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(failed, vec!["ghost-0", "ghost-1"]);
        assert_eq!(report.started.len(), 1);
        assert_eq!(report.started[0].name, "fine");

        // The second instance was attempted too, not left Stopped
        let ghosts = supervisor.status(Some("ghost")).await.unwrap();
        assert_eq!(ghosts.len(), 2);
        assert!(ghosts
            .iter()
            .all(|h| h.status == ProcessStatus::Failed && h.failure.is_some()));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_app_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings(temp_dir.path()));
        let config = write_config(
            temp_dir.path(),
            "name = \"solo\"\nscript = \"/bin/sleep\"\nargs = \"30\"\n",
        );

        let first = supervisor
            .start_config(&config, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(first.is_success());

        let second = supervisor
            .start_config(&config, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(second.started.is_empty());
        assert!(second.failures[0].1.contains("already exists"));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_restart_delete() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings(temp_dir.path()));
        let config = write_config(
            temp_dir.path(),
            "name = \"api\"\nscript = \"/bin/sleep\"\nargs = \"30\"\ninstances = 2\n",
        );
        supervisor
            .start_config(&config, Duration::from_secs(5))
            .await
            .unwrap();

        let stopped = supervisor.stop("api-0").await.unwrap();
        assert_eq!(stopped[0].status, ProcessStatus::Stopped);
        let status = supervisor.status(Some("api-1")).await.unwrap();
        assert_eq!(status[0].status, ProcessStatus::Running);

        let restarted = supervisor.restart("api").await.unwrap();
        assert_eq!(restarted.len(), 2);
        assert!(restarted.iter().all(|h| h.status == ProcessStatus::Running));

        supervisor.delete("api-1").await.unwrap();
        assert_eq!(supervisor.status(None).await.unwrap().len(), 1);

        supervisor.delete("api").await.unwrap();
        assert!(supervisor.status(None).await.unwrap().is_empty());
        assert!(matches!(
            supervisor.stop("api").await,
            Err(ProcwardError::ProcessNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_log_paths() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(settings(temp_dir.path()));
        let config = write_config(
            temp_dir.path(),
            "name = \"app\"\nscript = \"/bin/sleep\"\nargs = \"30\"\n",
        );
        supervisor
            .start_config(&config, Duration::from_secs(5))
            .await
            .unwrap();

        let paths = supervisor.log_paths("app").await.unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(
            paths[0].1.out,
            temp_dir.path().join("logs").join("app-out.log")
        );
        assert!(supervisor.log_paths("nope").await.is_err());

        supervisor.shutdown().await;
    }
}
