use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::paths::InstancePaths;

/// Bounded-retry policy for crash restarts.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogPolicy {
    pub check_interval: Duration,
    /// Sliding window; the restart count resets once the time since the
    /// last restart exceeds it.
    pub restart_window: Duration,
    /// Ceiling within one window. Reaching it is terminal.
    pub max_restarts: u32,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            restart_window: Duration::from_secs(3600),
            max_restarts: 10,
        }
    }
}

/// Seam between the watchdog loop and the instance it monitors, so the
/// policy logic is testable with a scripted control.
#[async_trait]
pub trait InstanceControl: Send + Sync {
    /// `false` once the backing config record has been deleted.
    async fn config_exists(&self) -> bool;
    async fn is_running(&self) -> bool;
    /// Reload the latest persisted config and attempt a start.
    async fn restart(&self) -> vm_core::Result<()>;
}

/// Why the watchdog loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The instance's config was deleted; nothing left to monitor.
    ConfigDeleted,
    /// The restart ceiling was reached within the window. Terminal and
    /// non-retryable; recorded in the watchdog log for the operator.
    Exhausted,
}

/// Monitor one instance until its config disappears or restarts exhaust.
///
/// The restart count and timestamp advance whether or not a restart attempt
/// succeeds, so a tight crash loop cannot bypass the ceiling.
pub async fn run_watchdog(
    name: &str,
    policy: WatchdogPolicy,
    control: &dyn InstanceControl,
) -> WatchdogOutcome {
    let mut restart_count: u32 = 0;
    let mut last_restart: Option<Instant> = None;

    info!(
        instance = name,
        interval_secs = policy.check_interval.as_secs(),
        window_secs = policy.restart_window.as_secs(),
        max_restarts = policy.max_restarts,
        "watchdog started"
    );

    loop {
        tokio::time::sleep(policy.check_interval).await;

        if !control.config_exists().await {
            info!(instance = name, "config deleted, watchdog exiting");
            return WatchdogOutcome::ConfigDeleted;
        }
        if control.is_running().await {
            continue;
        }

        if let Some(at) = last_restart
            && at.elapsed() > policy.restart_window
        {
            restart_count = 0;
        }
        if restart_count >= policy.max_restarts {
            error!(
                instance = name,
                max_restarts = policy.max_restarts,
                "restart ceiling reached, watchdog giving up"
            );
            return WatchdogOutcome::Exhausted;
        }

        restart_count += 1;
        last_restart = Some(Instant::now());
        warn!(
            instance = name,
            attempt = restart_count,
            "instance not running, restarting"
        );
        match control.restart().await {
            Ok(()) => info!(instance = name, "restart succeeded"),
            Err(e) => warn!(instance = name, error = %e, "restart failed"),
        }
    }
}

/// Pid of a live watchdog process for this instance, if the marker file
/// points at one. A stale marker (dead pid, or pid reused by an unrelated
/// process) yields `None`.
pub fn marker_pid(paths: &InstancePaths) -> Option<u32> {
    let raw = std::fs::read_to_string(paths.watchdog_pid()).ok()?;
    let pid: u32 = raw.trim().parse().ok()?;
    if watchdog_cmdline_matches(pid, paths.name()) {
        Some(pid)
    } else {
        None
    }
}

fn watchdog_cmdline_matches(pid: u32, name: &str) -> bool {
    let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let args: Vec<String> = cmdline
        .split(|b| *b == 0)
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect();
    args.iter().any(|a| a == "watchdog") && args.iter().any(|a| a == name)
}

/// Record this process as the instance's watchdog.
pub fn write_marker(paths: &InstancePaths) -> std::io::Result<()> {
    write_marker_pid(paths, std::process::id())
}

/// Record `pid` as the instance's watchdog. The spawner writes the child's
/// pid here before the child itself runs, so a second start attempt in the
/// spawn-to-exec gap still sees a claimed marker; the child later rewrites
/// the same value.
pub fn write_marker_pid(paths: &InstancePaths, pid: u32) -> std::io::Result<()> {
    std::fs::write(paths.watchdog_pid(), pid.to_string())
}

pub fn clear_marker(paths: &InstancePaths) {
    match std::fs::remove_file(paths.watchdog_pid()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %paths.watchdog_pid().display(), error = %e, "failed to clear watchdog marker"),
    }
}

/// Remove a marker file that no longer points at a live watchdog.
pub fn clear_stale_marker(paths: &InstancePaths) {
    if Path::new(&paths.watchdog_pid()).exists() && marker_pid(paths).is_none() {
        warn!(instance = %paths.name(), "clearing stale watchdog marker");
        clear_marker(paths);
    }
}
