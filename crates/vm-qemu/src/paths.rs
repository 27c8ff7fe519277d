use std::path::{Path, PathBuf};

/// Per-instance file layout under the state directory.
///
/// Every artifact belonging to instance `{name}` is prefixed by the name,
/// so deleting an instance can sweep the directory by prefix.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    state_dir: PathBuf,
    name: String,
}

impl InstancePaths {
    pub fn new(state_dir: &Path, name: &str) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            name: name.to_string(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persisted key=value config record.
    pub fn config(&self) -> PathBuf {
        self.state_dir.join(format!("{}.conf", self.name))
    }

    /// Instance disk, always in the canonical qcow2 container format.
    pub fn disk(&self) -> PathBuf {
        self.state_dir.join(format!("{}.qcow2", self.name))
    }

    /// First-boot seed volume.
    pub fn seed(&self) -> PathBuf {
        self.state_dir.join(format!("{}-seed.iso", self.name))
    }

    /// Pid file written by the daemonized engine (background mode only).
    pub fn pid(&self) -> PathBuf {
        self.state_dir.join(format!("{}.pid", self.name))
    }

    /// Monitor control socket (background mode only).
    pub fn sock(&self) -> PathBuf {
        self.state_dir.join(format!("{}.sock", self.name))
    }

    /// Serial console capture (background mode only).
    pub fn log(&self) -> PathBuf {
        self.state_dir.join(format!("{}.log", self.name))
    }

    pub fn watchdog_pid(&self) -> PathBuf {
        self.state_dir.join(format!("{}.watchdog.pid", self.name))
    }

    pub fn watchdog_log(&self) -> PathBuf {
        self.state_dir.join(format!("{}.watchdog.log", self.name))
    }

    /// Shared read-only base image cache directory.
    pub fn base_dir(&self) -> PathBuf {
        self.state_dir.join("base")
    }

    /// Cached base image, keyed by OS family and codename so instances of
    /// the same release share one download.
    pub fn base_image(&self, os_family: &str, codename: &str) -> PathBuf {
        self.base_dir().join(format!("{os_family}-{codename}.img"))
    }
}
