use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{Result, VmError};

/// Unit suffix for disk sizes. Only the two units accepted by the size
/// grammar are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    Mega,
    Giga,
}

impl SizeUnit {
    fn bytes(self) -> u64 {
        match self {
            Self::Mega => 1024 * 1024,
            Self::Giga => 1024 * 1024 * 1024,
        }
    }
}

/// Disk size with an `M`/`G` unit suffix, e.g. `5G` or `512M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSize {
    pub value: u64,
    pub unit: SizeUnit,
}

impl DiskSize {
    pub fn bytes(&self) -> u64 {
        self.value.saturating_mul(self.unit.bytes())
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.unit {
            SizeUnit::Mega => 'M',
            SizeUnit::Giga => 'G',
        };
        write!(f, "{}{}", self.value, suffix)
    }
}

impl FromStr for DiskSize {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (digits, suffix) = s.split_at(s.len().saturating_sub(1));
        let unit = match suffix {
            "M" | "m" => SizeUnit::Mega,
            "G" | "g" => SizeUnit::Giga,
            _ => {
                return Err(VmError::Validation(format!(
                    "disk size must end in M or G: {s}"
                )));
            }
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| VmError::Validation(format!("invalid disk size: {s}")))?;
        if value == 0 {
            return Err(VmError::Validation(format!("disk size must be > 0: {s}")));
        }
        if value.checked_mul(unit.bytes()).is_none() {
            return Err(VmError::Validation(format!("disk size too large: {s}")));
        }
        Ok(Self { value, unit })
    }
}

/// A `host:guest` TCP port forwarding pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForward {
    pub host: u16,
    pub guest: u16,
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.guest)
    }
}

impl FromStr for PortForward {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, guest) = s
            .split_once(':')
            .ok_or_else(|| VmError::Validation(format!("port forward must be host:guest: {s}")))?;
        let parse = |p: &str| -> Result<u16> {
            let port: u16 = p
                .trim()
                .parse()
                .map_err(|_| VmError::Validation(format!("invalid port: {p}")))?;
            if port == 0 {
                return Err(VmError::Validation("port must be > 0".into()));
            }
            Ok(port)
        };
        Ok(Self {
            host: parse(host)?,
            guest: parse(guest)?,
        })
    }
}

/// A `host_path:mount_tag` passthrough filesystem share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareMount {
    pub host_path: PathBuf,
    pub tag: String,
}

impl fmt::Display for ShareMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_path.display(), self.tag)
    }
}

impl FromStr for ShareMount {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        // Host paths may themselves contain colons; the tag is after the last one.
        let (path, tag) = s
            .rsplit_once(':')
            .ok_or_else(|| VmError::Validation(format!("share must be host_path:tag: {s}")))?;
        if path.is_empty() || tag.is_empty() {
            return Err(VmError::Validation(format!("share must be host_path:tag: {s}")));
        }
        Ok(Self {
            host_path: PathBuf::from(path),
            tag: tag.to_string(),
        })
    }
}

/// Declarative configuration of one named instance.
///
/// Persisted by the config store as key=value text; every field is written
/// on every save and fully overwritten on every load.
#[derive(Debug, Clone, PartialEq)]
pub struct VmConfig {
    /// Unique identifier, immutable after creation. `[A-Za-z0-9_-]+`.
    pub name: String,
    pub os_family: String,
    pub codename: String,
    pub source_image_url: String,
    pub hostname: String,
    pub username: String,
    /// Stored in clear text; the config file is chmod 0600 at save.
    pub password: String,
    pub disk_size: DiskSize,
    pub memory_mb: u32,
    pub cpu_count: u32,
    pub ssh_port: Option<u16>,
    pub port_forwards: Vec<PortForward>,
    pub shares: Vec<ShareMount>,
    pub gui: bool,
    pub kvm: bool,
    pub background: bool,
    pub created_at: DateTime<Utc>,
}

/// `true` iff the name is non-empty and matches `[A-Za-z0-9_-]+`.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl VmConfig {
    /// Validate all fields; called before create and after every edit.
    pub fn validate(&self) -> Result<()> {
        if !valid_name(&self.name) {
            return Err(VmError::Validation(format!(
                "instance name must match [A-Za-z0-9_-]+: {:?}",
                self.name
            )));
        }
        if self.memory_mb == 0 {
            return Err(VmError::Validation("memory must be > 0 MB".into()));
        }
        if self.cpu_count == 0 {
            return Err(VmError::Validation("cpu count must be > 0".into()));
        }
        if self.username.is_empty()
            || self
                .username
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || c == ':')
        {
            return Err(VmError::Validation(format!(
                "invalid username: {:?}",
                self.username
            )));
        }
        if self.hostname.is_empty()
            || self
                .hostname
                .chars()
                .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(VmError::Validation(format!(
                "invalid hostname: {:?}",
                self.hostname
            )));
        }
        // The password is persisted into a line-oriented key=value file; a
        // control character would let one field masquerade as another.
        if self.password.chars().any(char::is_control) {
            return Err(VmError::Validation(
                "password must not contain control characters".into(),
            ));
        }

        // Host ports must be unique across the ssh port and all forwards;
        // a collision would produce duplicate forwarding rules at launch.
        let mut host_ports: Vec<u16> = self.port_forwards.iter().map(|p| p.host).collect();
        if let Some(ssh) = self.ssh_port {
            host_ports.push(ssh);
        }
        let mut seen = std::collections::HashSet::new();
        for port in host_ports {
            if !seen.insert(port) {
                return Err(VmError::Validation(format!(
                    "host port {port} used more than once"
                )));
            }
        }
        Ok(())
    }
}
