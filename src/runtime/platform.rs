//! OS-specific process control
//!
//! Each target gets one [`ProcessControl`] implementation, selected once at
//! supervisor construction by [`system_process_control`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use std::sync::Arc;
use tokio::process::Command;

/// Result of a force-kill by process name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    /// Nothing matched; expected when the runtime already exited
    NotFound,
}

/// Capability set the supervisor needs from the operating system
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// PIDs of running processes whose image name is exactly `name`
    async fn list_processes_by_name(&self, name: &str) -> Result<Vec<u32>>;

    /// Ask a single process to exit
    async fn terminate_gracefully(&self, pid: u32) -> Result<()>;

    /// Kill every process named `name` without giving it a chance to clean up
    async fn force_kill(&self, name: &str) -> Result<KillOutcome>;
}

/// Pick the implementation for the current target
pub fn system_process_control() -> Arc<dyn ProcessControl> {
    #[cfg(windows)]
    {
        Arc::new(WindowsProcessControl)
    }

    #[cfg(not(windows))]
    {
        Arc::new(UnixProcessControl)
    }
}

async fn run_command(program: &str, args: &[&str]) -> Result<Output> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run {} {}", program, args.join(" ")))
}

// ============================================================================
// Unix
// ============================================================================

/// `pgrep`/`pkill` for name matching, signals for single PIDs
///
/// Both tools match `-x` patterns against the kernel `comm` field, so names
/// are cut to [`comm_name`] first.
#[cfg(not(windows))]
pub struct UnixProcessControl;

#[cfg(not(windows))]
#[async_trait]
impl ProcessControl for UnixProcessControl {
    async fn list_processes_by_name(&self, name: &str) -> Result<Vec<u32>> {
        let output = run_command("pgrep", &["-x", comm_name(name)]).await?;

        // pgrep exits 1 when nothing matched
        match output.status.code() {
            Some(0) => Ok(parse_pid_lines(&String::from_utf8_lossy(&output.stdout))),
            Some(1) => Ok(Vec::new()),
            _ => anyhow::bail!(
                "pgrep failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }

    async fn terminate_gracefully(&self, pid: u32) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).context("PID out of range")?;
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Failed to send SIGTERM to {}: {}", pid, e)),
        }
    }

    async fn force_kill(&self, name: &str) -> Result<KillOutcome> {
        let output = run_command("pkill", &["-9", "-x", comm_name(name)]).await?;

        match output.status.code() {
            Some(0) => Ok(KillOutcome::Killed),
            Some(1) => Ok(KillOutcome::NotFound),
            _ => anyhow::bail!(
                "pkill failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }
}

/// `name` as the kernel stores it in `comm`: at most 15 bytes
#[cfg_attr(windows, allow(dead_code))]
fn comm_name(name: &str) -> &str {
    const COMM_MAX: usize = 15;

    if name.len() <= COMM_MAX {
        return name;
    }
    let mut end = COMM_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg_attr(windows, allow(dead_code))]
fn parse_pid_lines(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

// ============================================================================
// Windows
// ============================================================================

/// `tasklist`/`taskkill` based control
#[cfg(windows)]
pub struct WindowsProcessControl;

/// taskkill exit code when no process matched
#[cfg(windows)]
const TASKKILL_NOT_FOUND: i32 = 128;

#[cfg(windows)]
#[async_trait]
impl ProcessControl for WindowsProcessControl {
    async fn list_processes_by_name(&self, name: &str) -> Result<Vec<u32>> {
        let filter = format!("IMAGENAME eq {}", name);
        let output = run_command("tasklist", &["/FI", &filter, "/FO", "CSV", "/NH"]).await?;
        if !output.status.success() {
            anyhow::bail!("tasklist exited with {}", output.status);
        }
        Ok(parse_tasklist_csv(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn terminate_gracefully(&self, pid: u32) -> Result<()> {
        let pid = pid.to_string();
        let output = run_command("taskkill", &["/PID", &pid]).await?;

        match output.status.code() {
            Some(0) | Some(TASKKILL_NOT_FOUND) => Ok(()),
            _ => anyhow::bail!(
                "taskkill failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }

    async fn force_kill(&self, name: &str) -> Result<KillOutcome> {
        let output = run_command("taskkill", &["/F", "/T", "/IM", name]).await?;

        match output.status.code() {
            Some(0) => Ok(KillOutcome::Killed),
            Some(TASKKILL_NOT_FOUND) => Ok(KillOutcome::NotFound),
            _ => anyhow::bail!(
                "taskkill failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }
}

/// Second CSV column of each `tasklist /FO CSV /NH` row is the PID
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_tasklist_csv(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| {
            let pid = line.split(',').nth(1)?;
            pid.trim().trim_matches('"').parse().ok()
        })
        .collect()
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
