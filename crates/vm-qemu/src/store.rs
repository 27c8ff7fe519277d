use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use vm_core::{DiskSize, PortForward, Result, ShareMount, VmConfig, VmError};

use crate::paths::InstancePaths;

/// Persists one [`VmConfig`] record per named instance as key=value text.
///
/// Serialization writes every field on every save, and parsing builds a
/// fresh record from scratch. A loaded config is never merged with prior
/// in-memory state, so a skipped or partial reload cannot leak stale fields.
/// The file carries a clear-text password and is chmod 0600.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    state_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn paths(&self, name: &str) -> InstancePaths {
        InstancePaths::new(&self.state_dir, name)
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.paths(name).config())
            .await
            .unwrap_or(false)
    }

    /// Write the record atomically (temp + rename) with owner-only access.
    ///
    /// Validation runs first: the line-oriented format cannot represent
    /// values with embedded newlines, so they must never reach the file.
    pub async fn save(&self, config: &VmConfig) -> Result<()> {
        config.validate()?;
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .map_err(|e| VmError::Config(format!("create {}: {e}", self.state_dir.display())))?;

        let target = self.paths(&config.name).config();
        let tmp = target.with_extension(format!("conf.tmp.{}", std::process::id()));

        let result = async {
            tokio::fs::write(&tmp, serialize(config))
                .await
                .map_err(|e| VmError::Config(format!("write {}: {e}", tmp.display())))?;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| VmError::Config(format!("chmod {}: {e}", tmp.display())))?;
            tokio::fs::rename(&tmp, &target)
                .await
                .map_err(|e| VmError::Config(format!("rename to {}: {e}", target.display())))
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    pub async fn load(&self, name: &str) -> Result<VmConfig> {
        let path = self.paths(name).config();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VmError::UnknownInstance(name.to_string()));
            }
            Err(e) => return Err(VmError::Config(format!("read {}: {e}", path.display()))),
        };
        parse(&content).map_err(|e| VmError::Config(format!("{}: {e}", path.display())))
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.paths(name).config();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VmError::UnknownInstance(name.to_string()))
            }
            Err(e) => Err(VmError::Config(format!("remove {}: {e}", path.display()))),
        }
    }

    /// Sorted names of every instance with a persisted config.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.state_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => {
                return Err(VmError::Config(format!(
                    "read {}: {e}",
                    self.state_dir.display()
                )));
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_string_lossy().strip_suffix(".conf") {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn serialize(config: &VmConfig) -> String {
    let mut out = String::new();
    let mut push = |key: &str, value: &str| {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    };
    push("name", &config.name);
    push("os_family", &config.os_family);
    push("codename", &config.codename);
    push("source_image_url", &config.source_image_url);
    push("hostname", &config.hostname);
    push("username", &config.username);
    push("password", &config.password);
    push("disk_size", &config.disk_size.to_string());
    push("memory_mb", &config.memory_mb.to_string());
    push("cpu_count", &config.cpu_count.to_string());
    push(
        "ssh_port",
        &config.ssh_port.map(|p| p.to_string()).unwrap_or_default(),
    );
    push("port_forwards", &join(&config.port_forwards));
    push("shares", &join(&config.shares));
    push("gui", bool_str(config.gui));
    push("kvm", bool_str(config.kvm));
    push("background", bool_str(config.background));
    push("created_at", &config.created_at.to_rfc3339());
    out
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn bool_str(v: bool) -> &'static str {
    if v { "true" } else { "false" }
}

fn parse(content: &str) -> Result<VmConfig> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| VmError::Config(format!("malformed line: {line:?}")))?;
        fields.insert(key.trim(), value);
    }

    let required = |key: &str| -> Result<&str> {
        fields
            .get(key)
            .copied()
            .ok_or_else(|| VmError::Config(format!("missing field: {key}")))
    };

    let disk_size: DiskSize = required("disk_size")?
        .parse()
        .map_err(|e| VmError::Config(format!("disk_size: {e}")))?;
    let memory_mb: u32 = required("memory_mb")?
        .parse()
        .map_err(|_| VmError::Config("memory_mb: not a number".into()))?;
    let cpu_count: u32 = required("cpu_count")?
        .parse()
        .map_err(|_| VmError::Config("cpu_count: not a number".into()))?;

    let ssh_port = match required("ssh_port")? {
        "" => None,
        raw => Some(
            raw.parse::<u16>()
                .map_err(|_| VmError::Config("ssh_port: not a port".into()))?,
        ),
    };

    let port_forwards = parse_list::<PortForward>(required("port_forwards")?)
        .map_err(|e| VmError::Config(format!("port_forwards: {e}")))?;
    let shares = parse_list::<ShareMount>(required("shares")?)
        .map_err(|e| VmError::Config(format!("shares: {e}")))?;

    let created_at = DateTime::parse_from_rfc3339(required("created_at")?)
        .map_err(|e| VmError::Config(format!("created_at: {e}")))?
        .with_timezone(&Utc);

    Ok(VmConfig {
        name: required("name")?.to_string(),
        os_family: required("os_family")?.to_string(),
        codename: required("codename")?.to_string(),
        source_image_url: required("source_image_url")?.to_string(),
        hostname: required("hostname")?.to_string(),
        username: required("username")?.to_string(),
        password: required("password")?.to_string(),
        disk_size,
        memory_mb,
        cpu_count,
        ssh_port,
        port_forwards,
        shares,
        gui: parse_bool("gui", required("gui")?)?,
        kvm: parse_bool("kvm", required("kvm")?)?,
        background: parse_bool("background", required("background")?)?,
        created_at,
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(VmError::Config(format!("{key}: expected true/false, got {raw:?}"))),
    }
}

fn parse_list<T: std::str::FromStr<Err = VmError>>(raw: &str) -> Result<Vec<T>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',').map(|item| item.trim().parse()).collect()
}
