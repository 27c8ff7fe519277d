use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use vm_core::{Result, VmError};

use crate::paths::InstancePaths;
use crate::plan::LaunchPlan;

/// How long the daemonized engine gets to write its pid file.
const PIDFILE_WAIT: Duration = Duration::from_secs(5);
/// Poll interval for liveness and pid-file checks.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bounded wait times for the tiered shutdown sequence.
#[derive(Debug, Clone, Copy)]
pub struct StopGrace {
    /// After a graceful power-down request over the monitor socket.
    pub powerdown: Duration,
    /// After SIGTERM.
    pub term: Duration,
}

impl Default for StopGrace {
    fn default() -> Self {
        Self {
            powerdown: Duration::from_secs(20),
            term: Duration::from_secs(5),
        }
    }
}

/// Owns start/liveness/stop for instances.
///
/// Liveness is always answered by matching the identity tag embedded in the
/// invocation against live processes, never by an in-memory flag, so manual
/// and watchdog-driven starts exclude each other through the same check.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    grace: StopGrace,
}

impl ProcessSupervisor {
    pub fn new(grace: StopGrace) -> Self {
        Self { grace }
    }

    /// `true` iff a live process carries this instance's identity tag.
    ///
    /// Prefers the pid file (background mode), verifying the recorded pid
    /// still runs the tagged invocation; falls back to a full process scan
    /// for foreground/attached instances.
    pub fn is_running(&self, paths: &InstancePaths) -> bool {
        let tag = crate::plan::identity_tag(paths.name());
        if let Some(pid) = read_pid_file(&paths.pid())
            && pid_has_tag(pid, &tag)
        {
            return true;
        }
        find_tagged_pid(&tag).is_some()
    }

    /// Launch the instance per `plan`.
    ///
    /// Background mode returns once the engine has daemonized and written a
    /// live pid file. Foreground mode intentionally blocks the calling task
    /// until the guest process exits, since the console is attached to it.
    pub async fn start(&self, plan: &LaunchPlan, background: bool, paths: &InstancePaths) -> Result<()> {
        if self.is_running(paths) {
            return Err(VmError::AlreadyRunning(paths.name().to_string()));
        }

        if background {
            self.start_background(plan, paths).await
        } else {
            self.start_foreground(plan, paths).await
        }
    }

    async fn start_background(&self, plan: &LaunchPlan, paths: &InstancePaths) -> Result<()> {
        // Orphaned artifacts from a prior crash must not satisfy the
        // pid-file wait below.
        remove_runtime_artifacts(paths).await;

        let output = tokio::process::Command::new(&plan.program)
            .args(&plan.args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| VmError::Launch(format!("spawn {}: {e}", plan.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VmError::Launch(format!(
                "{} exited with {}: {}",
                plan.program,
                output.status,
                stderr.trim()
            )));
        }

        // The parent exits as soon as it daemonizes; confirm the pid file
        // appeared and points at a live tagged process.
        let deadline = tokio::time::Instant::now() + PIDFILE_WAIT;
        loop {
            if let Some(pid) = read_pid_file(&paths.pid()) {
                if pid_has_tag(pid, &plan.identity_tag) {
                    info!(instance = %paths.name(), pid, "instance started");
                    return Ok(());
                }
                debug!(instance = %paths.name(), pid, "pid file present, process not tagged yet");
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmError::Launch(format!(
                    "{}: pid file {} never appeared",
                    paths.name(),
                    paths.pid().display()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn start_foreground(&self, plan: &LaunchPlan, paths: &InstancePaths) -> Result<()> {
        info!(instance = %paths.name(), "starting attached instance");
        let mut child = tokio::process::Command::new(&plan.program)
            .args(&plan.args)
            .spawn()
            .map_err(|e| VmError::Launch(format!("spawn {}: {e}", plan.program)))?;

        let status = child
            .wait()
            .await
            .map_err(|e| VmError::Launch(format!("wait for {}: {e}", plan.program)))?;

        if status.success() {
            info!(instance = %paths.name(), "instance exited");
        } else {
            warn!(instance = %paths.name(), %status, "instance exited abnormally");
        }
        Ok(())
    }

    /// Three-tier shutdown: graceful power-down over the monitor socket,
    /// then SIGTERM, then SIGKILL, each tier skipped once the instance is
    /// already down. Stale pid/socket artifacts are cleared on completion
    /// whether or not anything was running at entry.
    pub async fn stop(&self, paths: &InstancePaths) -> Result<()> {
        let tag = crate::plan::identity_tag(paths.name());
        let result = self.stop_inner(paths, &tag).await;
        remove_runtime_artifacts(paths).await;
        result
    }

    async fn stop_inner(&self, paths: &InstancePaths, tag: &str) -> Result<()> {
        let Some(pid) = live_pid(paths, tag) else {
            debug!(instance = %paths.name(), "already stopped");
            return Ok(());
        };

        // Tier 1: graceful power-down request, bounded wait.
        if paths.sock().exists() {
            if let Err(e) = send_powerdown(&paths.sock()).await {
                debug!(instance = %paths.name(), error = %e, "monitor powerdown failed");
            } else if wait_for_exit(pid, tag, self.grace.powerdown).await {
                info!(instance = %paths.name(), "powered down gracefully");
                return Ok(());
            }
        }

        // Tier 2: terminate signal, shorter wait.
        warn!(instance = %paths.name(), pid, "escalating to SIGTERM");
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if wait_for_exit(pid, tag, self.grace.term).await {
            return Ok(());
        }

        // Tier 3: unconditional kill.
        warn!(instance = %paths.name(), pid, "escalating to SIGKILL");
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|e| VmError::Shutdown(format!("kill {pid}: {e}")))?;
        if wait_for_exit(pid, tag, self.grace.term).await {
            return Ok(());
        }
        Err(VmError::Shutdown(format!(
            "{}: process {pid} survived SIGKILL",
            paths.name()
        )))
    }
}

/// Pid of the live tagged process, from the pid file or a process scan.
fn live_pid(paths: &InstancePaths, tag: &str) -> Option<u32> {
    if let Some(pid) = read_pid_file(&paths.pid())
        && pid_has_tag(pid, tag)
    {
        return Some(pid);
    }
    find_tagged_pid(tag)
}

fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
}

/// `true` iff `/proc/{pid}/cmdline` carries the identity tag.
///
/// Matching on the full `process=<tag>` suffix avoids prefix collisions
/// between instance names (`vm` vs `vm2`).
fn pid_has_tag(pid: u32, tag: &str) -> bool {
    let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let marker = format!("process={tag}");
    cmdline
        .split(|b| *b == 0)
        .any(|arg| String::from_utf8_lossy(arg).ends_with(&marker))
}

/// Scan `/proc` for a process whose cmdline carries the tag.
fn find_tagged_pid(tag: &str) -> Option<u32> {
    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid_has_tag(pid, tag) {
            return Some(pid);
        }
    }
    None
}

/// Poll until the tagged process is gone or the grace period expires.
/// Returns `true` if it exited in time.
async fn wait_for_exit(pid: u32, tag: &str, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !pid_has_tag(pid, tag) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Write a power-down request to the engine's monitor socket.
async fn send_powerdown(sock: &Path) -> std::io::Result<()> {
    let mut stream = tokio::net::UnixStream::connect(sock).await?;
    stream.write_all(b"system_powerdown\n").await?;
    stream.flush().await
}

/// Remove pid and socket files, running or not (orphan defense).
async fn remove_runtime_artifacts(paths: &InstancePaths) {
    for path in [paths.pid(), paths.sock()] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed runtime artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove artifact"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(StopGrace {
            powerdown: Duration::from_millis(300),
            term: Duration::from_millis(800),
        })
    }

    fn paths_in(dir: &Path, name: &str) -> InstancePaths {
        InstancePaths::new(dir, name)
    }

    /// Spawn a sleeper whose cmdline carries the given instance's identity
    /// tag, mimicking a detached engine process. Returns only once the tag
    /// is visible in /proc, which happens after the child's execve.
    fn spawn_tagged(name: &str) -> std::process::Child {
        let marker = format!("guest={name},process={}", crate::plan::identity_tag(name));
        // The trailing `:` stops bash from exec-replacing itself with sleep,
        // which would drop the tagged args from the visible cmdline.
        let child = std::process::Command::new("bash")
            .args(["-c", "sleep 30; :", "tag-holder", &marker])
            .spawn()
            .unwrap();
        for _ in 0..100 {
            let cmdline =
                std::fs::read(format!("/proc/{}/cmdline", child.id())).unwrap_or_default();
            if cmdline.split(|b| *b == 0).any(|arg| arg == marker.as_bytes()) {
                return child;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("tagged process never appeared in /proc");
    }

    #[tokio::test]
    async fn is_running_false_without_any_process() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = fast_supervisor();
        assert!(!supervisor.is_running(&paths_in(dir.path(), "ghost-instance-x9")));
    }

    #[tokio::test]
    async fn stale_pid_file_does_not_count_as_running() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path(), "stale-pid-vm");
        // A pid that cannot belong to a tagged process.
        std::fs::write(paths.pid(), "4294967").unwrap();
        assert!(!fast_supervisor().is_running(&paths));
    }

    #[tokio::test]
    async fn is_running_matches_tagged_process() {
        let dir = tempfile::tempdir().unwrap();
        let name = format!("sup-test-{}", std::process::id());
        let paths = paths_in(dir.path(), &name);
        let mut child = spawn_tagged(&name);

        assert!(fast_supervisor().is_running(&paths));

        child.kill().unwrap();
        let _ = child.wait();
    }

    #[tokio::test]
    async fn tag_matching_rejects_name_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let base = format!("prefix-test-{}", std::process::id());
        let longer = format!("{base}-longer");
        let mut child = spawn_tagged(&longer);

        // The shorter name must not match the longer instance's process.
        assert!(!fast_supervisor().is_running(&paths_in(dir.path(), &base)));

        child.kill().unwrap();
        let _ = child.wait();
    }

    #[tokio::test]
    async fn stop_on_stopped_instance_clears_stale_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path(), "orphaned-vm");
        std::fs::write(paths.pid(), "4294967").unwrap();
        std::fs::write(paths.sock(), b"").unwrap();

        fast_supervisor().stop(&paths).await.unwrap();

        assert!(!paths.pid().exists());
        assert!(!paths.sock().exists());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path(), "never-started");
        let supervisor = fast_supervisor();
        supervisor.stop(&paths).await.unwrap();
        supervisor.stop(&paths).await.unwrap();
    }

    #[tokio::test]
    async fn stop_escalates_to_signals_and_reaps_process() {
        let dir = tempfile::tempdir().unwrap();
        let name = format!("stop-test-{}", std::process::id());
        let paths = paths_in(dir.path(), &name);
        let mut child = spawn_tagged(&name);
        std::fs::write(paths.pid(), child.id().to_string()).unwrap();

        let supervisor = fast_supervisor();
        assert!(supervisor.is_running(&paths));
        supervisor.stop(&paths).await.unwrap();

        assert!(!supervisor.is_running(&paths));
        assert!(!paths.pid().exists());
        let _ = child.wait();
    }

    #[tokio::test]
    async fn start_refuses_when_tagged_process_exists() {
        let dir = tempfile::tempdir().unwrap();
        let name = format!("dup-test-{}", std::process::id());
        let paths = paths_in(dir.path(), &name);
        let mut child = spawn_tagged(&name);

        let plan = LaunchPlan {
            program: "true".into(),
            args: vec![],
            identity_tag: crate::plan::identity_tag(&name),
        };
        let err = fast_supervisor()
            .start(&plan, false, &paths)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::AlreadyRunning(_)), "got: {err}");

        child.kill().unwrap();
        let _ = child.wait();
    }

    #[tokio::test]
    async fn foreground_start_blocks_until_child_exit() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path(), "fg-quick-exit");
        let plan = LaunchPlan {
            program: "true".into(),
            args: vec![],
            identity_tag: crate::plan::identity_tag("fg-quick-exit"),
        };
        fast_supervisor().start(&plan, false, &paths).await.unwrap();
    }

    #[tokio::test]
    async fn background_start_fails_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path(), "bg-no-pidfile");
        // A program that exits successfully but never daemonizes/writes a pid.
        let plan = LaunchPlan {
            program: "true".into(),
            args: vec![],
            identity_tag: crate::plan::identity_tag("bg-no-pidfile"),
        };
        let err = fast_supervisor()
            .start(&plan, true, &paths)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::Launch(_)), "got: {err}");
    }

    #[tokio::test]
    async fn background_start_surfaces_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path(), "bg-bad-binary");
        let plan = LaunchPlan {
            program: "/nonexistent/qemu".into(),
            args: vec![],
            identity_tag: crate::plan::identity_tag("bg-bad-binary"),
        };
        let err = fast_supervisor()
            .start(&plan, true, &paths)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::Launch(_)), "got: {err}");
    }
}
