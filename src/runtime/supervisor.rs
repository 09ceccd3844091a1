//! Runtime process lifecycle: spawn, output capture, exit observation and
//! two-phase shutdown

use super::platform::{KillOutcome, ProcessControl, system_process_control};
use crate::config::ManagerConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::probe::probe_port;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

/// Runner processes the server forks for loaded models
const RUNNER_PROCESS_NAME: &str = "ollama_llama_server";

/// Platform-specific file name of the runtime executable
pub fn executable_name() -> &'static str {
    if cfg!(windows) { "ollama.exe" } else { "ollama" }
}

/// Lifecycle state of the supervised runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Everything needed to launch and tear down the runtime
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    pub bin_dir: PathBuf,
    pub executable: String,
    pub args: Vec<String>,
    pub models_dir: PathBuf,
    pub keep_alive: String,
    pub shutdown_grace: Duration,
    /// Process names force-killed during shutdown
    pub kill_targets: Vec<String>,
}

impl SupervisorConfig {
    pub fn from_manager(config: &ManagerConfig) -> Self {
        let runner = if cfg!(windows) {
            format!("{}.exe", RUNNER_PROCESS_NAME)
        } else {
            RUNNER_PROCESS_NAME.to_string()
        };

        Self {
            host: config.host.clone(),
            port: config.port,
            bin_dir: config.bin_dir.clone(),
            executable: executable_name().to_string(),
            args: vec!["serve".to_string()],
            models_dir: config.models_dir.clone(),
            keep_alive: config.keep_alive.clone(),
            shutdown_grace: config.shutdown_grace(),
            kill_targets: vec![executable_name().to_string(), runner],
        }
    }

    pub fn executable_path(&self) -> PathBuf {
        self.bin_dir.join(&self.executable)
    }

    /// Environment overlay applied on top of the inherited environment
    pub fn environment(&self) -> Vec<(String, String)> {
        let no_proxy = "localhost,127.0.0.1,::1".to_string();
        vec![
            ("OLLAMA_HOST".to_string(), format!("{}:{}", self.host, self.port)),
            ("OLLAMA_KEEP_ALIVE".to_string(), self.keep_alive.clone()),
            (
                "OLLAMA_MODELS".to_string(),
                self.models_dir.to_string_lossy().into_owned(),
            ),
            ("NO_PROXY".to_string(), no_proxy.clone()),
            ("no_proxy".to_string(), no_proxy),
        ]
    }
}

/// Read-only snapshot of a spawned runtime
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Result of [`RuntimeSupervisor::start`]
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(ProcessInfo),
    /// Something already serves the port; nothing was spawned
    AlreadyRunning,
}

/// The live child. Owned by the supervisor slot; the `Child` itself lives in
/// the exit watcher task.
struct RuntimeProcess {
    info: ProcessInfo,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    _watcher: JoinHandle<()>,
}

impl RuntimeProcess {
    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

/// Supervises exactly one runtime executable
pub struct RuntimeSupervisor {
    config: SupervisorConfig,
    control: Arc<dyn ProcessControl>,
    /// Held across the whole of start and shutdown so they never interleave
    process: Mutex<Option<RuntimeProcess>>,
    state: Arc<RwLock<RuntimeState>>,
}

impl RuntimeSupervisor {
    /// Create a supervisor with a custom process control backend
    pub fn new_with_control(config: SupervisorConfig, control: Arc<dyn ProcessControl>) -> Self {
        Self {
            config,
            control,
            process: Mutex::new(None),
            state: Arc::new(RwLock::new(RuntimeState::NotStarted)),
        }
    }

    /// Create a supervisor using the current platform's process control
    pub fn new(config: SupervisorConfig) -> Self {
        Self::new_with_control(config, system_process_control())
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub async fn state(&self) -> RuntimeState {
        *self.state.read().await
    }

    /// Snapshot of the process this supervisor spawned, if it is still alive
    pub async fn process_info(&self) -> Option<ProcessInfo> {
        let slot = self.process.lock().await;
        slot.as_ref()
            .filter(|p| !p.has_exited())
            .map(|p| p.info.clone())
    }

    /// Whether this supervisor currently holds a live child
    pub async fn holds_live_process(&self) -> bool {
        self.process_info().await.is_some()
    }

    /// Whether this supervisor ever spawned a runtime, live or not
    pub async fn has_spawned(&self) -> bool {
        self.state().await != RuntimeState::NotStarted
    }

    /// Launch the runtime unless something already serves its port
    pub async fn start(&self) -> RuntimeResult<StartOutcome> {
        let mut slot = self.process.lock().await;

        if let Some(existing) = slot.as_ref()
            && !existing.has_exited()
        {
            tracing::info!(pid = existing.info.pid, "Runtime already supervised");
            return Ok(StartOutcome::AlreadyRunning);
        }

        if probe_port(&self.config.host, self.config.port).await {
            tracing::info!(
                port = self.config.port,
                "Runtime port already in use, not starting a new process"
            );
            return Ok(StartOutcome::AlreadyRunning);
        }

        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, RuntimeState::Starting)
        };

        match self.spawn_process().await {
            Ok(process) => {
                let info = process.info.clone();
                *slot = Some(process);
                crate::metrics::record_runtime_started();

                tracing::info!(
                    pid = info.pid,
                    executable = ?info.executable,
                    port = self.config.port,
                    "Runtime started"
                );

                Ok(StartOutcome::Started(info))
            }
            Err(e) => {
                *self.state.write().await = previous;
                tracing::error!(error = %e, "Failed to start runtime");
                Err(e)
            }
        }
    }

    async fn spawn_process(&self) -> RuntimeResult<RuntimeProcess> {
        let executable = self.config.executable_path();

        if !tokio::fs::try_exists(&executable).await.unwrap_or(false) {
            return Err(RuntimeError::ExecutableNotFound(executable));
        }

        #[cfg(unix)]
        ensure_executable(&executable).await?;

        let working_dir = executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut cmd = Command::new(&executable);
        cmd.args(&self.config.args)
            .current_dir(&working_dir)
            .envs(self.config.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            executable = ?executable,
            working_dir = ?working_dir,
            args = ?self.config.args,
            "Spawning runtime process"
        );

        let mut child = cmd.spawn().map_err(|source| RuntimeError::Spawn {
            path: executable.clone(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| RuntimeError::Spawn {
            path: executable.clone(),
            source: std::io::Error::other("process exited before reporting a PID"),
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, pid, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, OutputStream::Stderr));
        }

        *self.state.write().await = RuntimeState::Running;

        let (exit_tx, exit_rx) = watch::channel(None);
        let state = self.state.clone();
        let watcher = tokio::spawn(async move {
            let status = child.wait().await;

            {
                let mut state = state.write().await;
                match *state {
                    RuntimeState::Running | RuntimeState::Starting => {
                        tracing::warn!(pid = pid, status = ?status, "Runtime exited unexpectedly");
                        *state = RuntimeState::Stopped;
                    }
                    _ => {
                        tracing::info!(pid = pid, status = ?status, "Runtime process exited");
                    }
                }
            }

            match status {
                Ok(status) => {
                    let _ = exit_tx.send(Some(status));
                }
                Err(e) => {
                    tracing::error!(pid = pid, error = %e, "Failed to wait on runtime process");
                    // Dropping the sender wakes waiters as well
                }
            }
        });

        Ok(RuntimeProcess {
            info: ProcessInfo {
                pid,
                executable,
                working_dir,
                started_at: Utc::now(),
            },
            exit_rx,
            _watcher: watcher,
        })
    }

    /// Two-phase teardown.
    ///
    /// Phase 1 asks the held child to exit and waits up to the grace window.
    /// Phase 2 always force-kills every process matching the kill targets, so
    /// runtimes started outside this session go away too. Missing processes
    /// are expected. Safe to call any number of times.
    pub async fn shutdown(&self) {
        let mut slot = self.process.lock().await;

        if let Some(process) = slot.take() {
            *self.state.write().await = RuntimeState::Stopping;
            self.stop_gracefully(process).await;
        } else {
            tracing::debug!("No runtime handle held, skipping graceful phase");
        }

        for name in &self.config.kill_targets {
            match self.control.list_processes_by_name(name).await {
                Ok(pids) if !pids.is_empty() => {
                    tracing::info!(process = %name, pids = ?pids, "Runtime processes still running");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(process = %name, error = %e, "Process listing failed");
                }
            }

            match self.control.force_kill(name).await {
                Ok(KillOutcome::Killed) => {
                    tracing::info!(process = %name, "Force-killed runtime processes");
                }
                Ok(KillOutcome::NotFound) => {
                    tracing::debug!(process = %name, "No matching processes to kill");
                }
                Err(e) => {
                    tracing::warn!(process = %name, error = %e, "Force-kill command failed");
                }
            }
        }

        let mut state = self.state.write().await;
        if *state != RuntimeState::NotStarted {
            *state = RuntimeState::Stopped;
        }

        tracing::info!("Runtime shutdown complete");
    }

    async fn stop_gracefully(&self, process: RuntimeProcess) {
        let pid = process.info.pid;

        if process.has_exited() {
            tracing::debug!(pid = pid, "Runtime already exited");
            return;
        }

        if let Err(e) = self.control.terminate_gracefully(pid).await {
            tracing::warn!(pid = pid, error = %e, "Graceful termination request failed");
        }

        let mut exit_rx = process.exit_rx.clone();
        match tokio::time::timeout(
            self.config.shutdown_grace,
            exit_rx.wait_for(|status| status.is_some()),
        )
        .await
        {
            Ok(Ok(_)) | Ok(Err(_)) => {
                tracing::info!(pid = pid, "Runtime stopped gracefully");
            }
            Err(_) => {
                tracing::warn!(
                    pid = pid,
                    grace_ms = self.config.shutdown_grace.as_millis() as u64,
                    "Graceful shutdown timed out"
                );
            }
        }
    }
}

#[cfg(unix)]
async fn ensure_executable(path: &Path) -> RuntimeResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = tokio::fs::metadata(path).await?;
    let mode = metadata.permissions().mode();
    if mode & 0o111 != 0o111 {
        tracing::debug!(path = ?path, mode = format!("{:o}", mode), "Marking runtime executable");
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

async fn forward_output<R>(reader: R, pid: u32, stream: OutputStream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        match stream {
            OutputStream::Stdout => {
                tracing::info!(target: "ollama_manager::runtime::output", pid = pid, "{}", line)
            }
            OutputStream::Stderr => {
                tracing::warn!(target: "ollama_manager::runtime::output", pid = pid, "{}", line)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::platform::mocks::MockProcessControl;
    use tokio::net::TcpListener;

    fn test_config(bin_dir: &Path, port: u16) -> SupervisorConfig {
        SupervisorConfig {
            host: "127.0.0.1".to_string(),
            port,
            bin_dir: bin_dir.to_path_buf(),
            executable: "ollama".to_string(),
            args: vec!["serve".to_string()],
            models_dir: bin_dir.join("models"),
            keep_alive: "5m".to_string(),
            shutdown_grace: Duration::from_secs(2),
            kill_targets: vec!["ollama".to_string(), "ollama_llama_server".to_string()],
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Write a fake runtime script without the executable bit
    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("ollama");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        path
    }

    #[test]
    fn test_environment_overlay_keys() {
        let config = test_config(Path::new("/opt/ollama"), 15537);
        let env = config.environment();
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };

        assert_eq!(get("OLLAMA_HOST").as_deref(), Some("127.0.0.1:15537"));
        assert_eq!(get("OLLAMA_KEEP_ALIVE").as_deref(), Some("5m"));
        assert_eq!(get("OLLAMA_MODELS").as_deref(), Some("/opt/ollama/models"));
        assert!(get("NO_PROXY").unwrap().contains("127.0.0.1"));
        assert!(get("no_proxy").is_some());
    }

    #[test]
    fn test_from_manager_config() {
        let manager = ManagerConfig::default();
        let config = SupervisorConfig::from_manager(&manager);
        assert_eq!(config.executable, executable_name());
        assert_eq!(config.args, vec!["serve".to_string()]);
        assert_eq!(config.kill_targets.len(), 2);
        assert_eq!(config.executable_path(), manager.bin_dir.join(executable_name()));
    }

    #[tokio::test]
    async fn test_start_when_port_occupied_does_not_spawn() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Executable does not even exist; the occupied port short-circuits first
        let dir = tempfile::tempdir().unwrap();
        let supervisor = RuntimeSupervisor::new_with_control(
            test_config(dir.path(), port),
            Arc::new(MockProcessControl::new()),
        );

        let outcome = supervisor.start().await.unwrap();
        assert!(matches!(outcome, StartOutcome::AlreadyRunning));
        assert_eq!(supervisor.state().await, RuntimeState::NotStarted);
        assert!(!supervisor.holds_live_process().await);
    }

    #[tokio::test]
    async fn test_missing_executable_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = RuntimeSupervisor::new_with_control(
            test_config(dir.path(), free_port().await),
            Arc::new(MockProcessControl::new()),
        );

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, RuntimeError::ExecutableNotFound(_)));
        assert_eq!(supervisor.state().await, RuntimeState::NotStarted);
    }

    #[tokio::test]
    async fn test_shutdown_without_handle_runs_force_kill() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(MockProcessControl::new());
        *control.fail_force_kill_for.lock().unwrap() = Some("ollama".to_string());

        let supervisor =
            RuntimeSupervisor::new_with_control(test_config(dir.path(), 1), control.clone());

        supervisor.shutdown().await;

        assert!(control.terminate_calls().is_empty());
        // A failing first kill command does not stop the second
        assert_eq!(
            control.force_kill_calls(),
            vec!["ollama".to_string(), "ollama_llama_server".to_string()]
        );

        // Repeated shutdown stays a no-op apart from the kill sweep
        supervisor.shutdown().await;
        assert_eq!(control.force_kill_calls().len(), 4);
        assert_eq!(supervisor.state().await, RuntimeState::NotStarted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_graceful_shutdown() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo \"listening on $OLLAMA_HOST\"\nexec sleep 30");
        let control = Arc::new(MockProcessControl::new());
        let supervisor = RuntimeSupervisor::new_with_control(
            test_config(dir.path(), free_port().await),
            control.clone(),
        );

        let outcome = supervisor.start().await.unwrap();
        let info = match outcome {
            StartOutcome::Started(info) => info,
            StartOutcome::AlreadyRunning => panic!("expected a fresh process"),
        };

        assert_eq!(info.working_dir, dir.path());
        assert_eq!(supervisor.state().await, RuntimeState::Running);
        let mode = std::fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        // A second start while the child is alive does not spawn again
        assert!(matches!(
            supervisor.start().await.unwrap(),
            StartOutcome::AlreadyRunning
        ));

        supervisor.shutdown().await;

        assert_eq!(control.terminate_calls(), vec![info.pid]);
        assert_eq!(supervisor.state().await, RuntimeState::Stopped);
        assert!(!supervisor.holds_live_process().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unexpected_exit_marks_stopped() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "exit 3");
        let supervisor = RuntimeSupervisor::new_with_control(
            test_config(dir.path(), free_port().await),
            Arc::new(MockProcessControl::new()),
        );

        supervisor.start().await.unwrap();

        let mut stopped = false;
        for _ in 0..50 {
            if supervisor.state().await == RuntimeState::Stopped {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(stopped, "exit watcher should mark the runtime stopped");
        assert!(!supervisor.holds_live_process().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_start() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "exec sleep 30");
        let control = Arc::new(MockProcessControl::new());
        let supervisor = RuntimeSupervisor::new_with_control(
            test_config(dir.path(), free_port().await),
            control.clone(),
        );

        // start() takes the slot lock on its first poll, so shutdown queues behind it
        let (outcome, ()) = tokio::join!(supervisor.start(), supervisor.shutdown());

        let info = match outcome.unwrap() {
            StartOutcome::Started(info) => info,
            StartOutcome::AlreadyRunning => panic!("expected a fresh process"),
        };
        assert_eq!(control.terminate_calls(), vec![info.pid]);
        assert_eq!(supervisor.state().await, RuntimeState::Stopped);
        assert!(!supervisor.holds_live_process().await);
    }
}
