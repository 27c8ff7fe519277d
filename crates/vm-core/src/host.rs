use std::path::{Path, PathBuf};

use crate::config::DiskSize;

/// Host facts gathered once at startup and threaded through every component
/// that needs them. Components never read ambient process state themselves.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    /// Base directory for all instance state (configs, disks, seeds, pids).
    pub state_dir: PathBuf,
    pub total_memory_mb: u32,
    pub cpu_count: u32,
    /// Running inside a container/sandbox: lowers resource defaults and
    /// relaxes disk-cache durability for speed.
    pub constrained: bool,
}

impl HostEnvironment {
    pub fn detect() -> Self {
        let state_dir = match std::env::var_os("VMCTL_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_state_dir(),
        };
        Self {
            state_dir,
            total_memory_mb: read_total_memory_mb().unwrap_or(2048),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            constrained: detect_constrained(),
        }
    }

    /// Quarter of host memory, clamped; halved floor in constrained hosts.
    pub fn default_memory_mb(&self) -> u32 {
        let quarter = self.total_memory_mb / 4;
        if self.constrained {
            quarter.clamp(256, 1024)
        } else {
            quarter.clamp(512, 4096)
        }
    }

    pub fn default_cpu_count(&self) -> u32 {
        let half = (self.cpu_count / 2).max(1);
        if self.constrained { half.min(2) } else { half.min(4) }
    }

    pub fn default_disk_size(&self) -> DiskSize {
        let gigs = if self.constrained { 5 } else { 10 };
        DiskSize {
            value: gigs,
            unit: crate::config::SizeUnit::Giga,
        }
    }
}

fn default_state_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/vmctl"),
        None => PathBuf::from("/var/lib/vmctl"),
    }
}

fn read_total_memory_mb() -> Option<u32> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total_mb(&meminfo)
}

fn parse_meminfo_total_mb(meminfo: &str) -> Option<u32> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some((kb / 1024) as u32)
}

fn detect_constrained() -> bool {
    if std::env::var_os("VMCTL_SANDBOX").is_some_and(|v| v == "1") {
        return true;
    }
    Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists()
}

/// What the host can actually provide at launch time; probed per start so a
/// config created on one machine stays portable.
#[derive(Debug, Clone, Copy)]
pub struct HostCapabilities {
    /// `/dev/kvm` exists and is readable and writable by this user.
    pub kvm: bool,
    /// A graphical session is reachable.
    pub display: bool,
}

impl HostCapabilities {
    pub fn detect() -> Self {
        Self {
            kvm: kvm_usable(Path::new("/dev/kvm")),
            display: std::env::var_os("DISPLAY").is_some()
                || std::env::var_os("WAYLAND_DISPLAY").is_some(),
        }
    }
}

/// KVM is only usable if the device node can be opened read+write; a present
/// but root-owned `/dev/kvm` must fall back to emulation.
fn kvm_usable(dev: &Path) -> bool {
    dev.exists()
        && std::fs::File::options()
            .read(true)
            .write(true)
            .open(dev)
            .is_ok()
}
