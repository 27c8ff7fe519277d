use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{info, warn};
use vm_core::{
    DiskSize, HostCapabilities, HostEnvironment, ImageCatalog, PortForward, Result, ShareMount,
    VmConfig, VmError, valid_name,
};

use crate::download::HttpImagePreparer;
use crate::paths::InstancePaths;
use crate::plan::build_plan;
use crate::provision::{ImageProvisioner, QemuImg};
use crate::seed::{CloudInitSeedBuilder, SeedTool};
use crate::store::ConfigStore;
use crate::supervisor::ProcessSupervisor;
use crate::watchdog::{
    InstanceControl, clear_marker, clear_stale_marker, marker_pid, write_marker_pid,
};

/// Ties the store, provisioner, and supervisor together into the instance
/// lifecycle operations the CLI exposes.
///
/// Per-instance ordering is enforced by authoritative liveness checks
/// against live processes, never by in-memory flags; instances are fully
/// independent of each other.
pub struct Orchestrator {
    store: ConfigStore,
    provisioner: ImageProvisioner,
    supervisor: ProcessSupervisor,
    catalog: ImageCatalog,
    env: HostEnvironment,
    caps: HostCapabilities,
}

/// Inputs for a new instance. Unset fields fall back to catalog defaults
/// (identity) or host-derived defaults (resources).
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: String,
    /// Catalog key, e.g. `ubuntu`.
    pub os: String,
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub disk_size: Option<DiskSize>,
    pub memory_mb: Option<u32>,
    pub cpu_count: Option<u32>,
    pub ssh_port: Option<u16>,
    pub port_forwards: Vec<PortForward>,
    pub shares: Vec<ShareMount>,
    pub gui: bool,
    pub kvm: bool,
    pub background: bool,
}

/// Field changes for `edit`. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct EditRequest {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub memory_mb: Option<u32>,
    pub cpu_count: Option<u32>,
    pub ssh_port: Option<u16>,
    pub port_forwards: Option<Vec<PortForward>>,
    pub shares: Option<Vec<ShareMount>>,
    pub gui: Option<bool>,
    pub kvm: Option<bool>,
    pub background: Option<bool>,
    /// Applies to the disk file immediately; refused while running.
    pub disk_size: Option<DiskSize>,
    /// Shrinking discards data and needs explicit confirmation.
    pub confirm_shrink: bool,
}

#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub config: VmConfig,
    pub running: bool,
    pub watchdog: bool,
    /// Virtual size reported by the image tool; `None` when unavailable.
    pub disk_bytes: Option<u64>,
}

impl Orchestrator {
    pub fn new(
        store: ConfigStore,
        provisioner: ImageProvisioner,
        supervisor: ProcessSupervisor,
        catalog: ImageCatalog,
        env: HostEnvironment,
        caps: HostCapabilities,
    ) -> Self {
        Self {
            store,
            provisioner,
            supervisor,
            catalog,
            env,
            caps,
        }
    }

    /// Wire up the real backends (HTTP download, cloud-init seed, qemu-img).
    pub fn production(
        env: HostEnvironment,
        caps: HostCapabilities,
        catalog: ImageCatalog,
        seed_tool: SeedTool,
    ) -> Self {
        let provisioner = ImageProvisioner::new(
            Arc::new(HttpImagePreparer),
            Arc::new(CloudInitSeedBuilder::new(seed_tool)),
            Arc::new(QemuImg),
        );
        Self::new(
            ConfigStore::new(&env.state_dir),
            provisioner,
            ProcessSupervisor::default(),
            catalog,
            env,
            caps,
        )
    }

    pub fn env(&self) -> &HostEnvironment {
        &self.env
    }

    pub fn caps(&self) -> &HostCapabilities {
        &self.caps
    }

    pub fn paths(&self, name: &str) -> InstancePaths {
        self.store.paths(name)
    }

    /// Provision disk and seed, then persist the config. Nothing is
    /// persisted when provisioning fails, and partial instance artifacts
    /// are swept away.
    pub async fn create(&self, request: CreateRequest) -> Result<VmConfig> {
        if !valid_name(&request.name) {
            return Err(VmError::Validation(format!(
                "invalid instance name {:?}: use letters, digits, '-' and '_'",
                request.name
            )));
        }
        if self.store.exists(&request.name).await {
            return Err(VmError::Validation(format!(
                "instance {:?} already exists",
                request.name
            )));
        }
        let spec = self.catalog.get(&request.os).ok_or_else(|| {
            VmError::Validation(format!(
                "unknown OS {:?}; known: {}",
                request.os,
                self.catalog
                    .entries()
                    .map(|(k, _)| k)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        let config = VmConfig {
            name: request.name.clone(),
            os_family: spec.os_family.to_string(),
            codename: spec.codename.to_string(),
            source_image_url: spec.url.to_string(),
            hostname: request.hostname.unwrap_or_else(|| request.name.clone()),
            username: request
                .username
                .unwrap_or_else(|| spec.default_username.to_string()),
            password: request
                .password
                .unwrap_or_else(|| spec.default_password.to_string()),
            disk_size: request.disk_size.unwrap_or_else(|| self.env.default_disk_size()),
            memory_mb: request.memory_mb.unwrap_or_else(|| self.env.default_memory_mb()),
            cpu_count: request.cpu_count.unwrap_or_else(|| self.env.default_cpu_count()),
            ssh_port: request.ssh_port,
            port_forwards: request.port_forwards,
            shares: request.shares,
            gui: request.gui,
            kvm: request.kvm,
            background: request.background,
            created_at: Utc::now(),
        };
        config.validate()?;

        let paths = self.paths(&config.name);
        if let Err(e) = self.provisioner.prepare(&config, &paths).await {
            self.sweep_artifacts(&config.name).await;
            return Err(e);
        }
        self.store.save(&config).await?;
        info!(instance = %config.name, os = %config.os_family, "instance created");
        Ok(config)
    }

    /// One-step instance from a catalog key with host-derived defaults.
    pub async fn quick(&self, os: &str, name: Option<&str>) -> Result<VmConfig> {
        let default_name = self
            .catalog
            .get(os)
            .map(|spec| spec.os_family.to_string())
            .unwrap_or_else(|| os.to_string());
        self.create(CreateRequest {
            name: name.map(ToString::to_string).unwrap_or(default_name),
            os: os.to_string(),
            kvm: true,
            background: true,
            ..CreateRequest::default()
        })
        .await
    }

    /// Launch the instance, re-provisioning any missing artifact first.
    /// Blocks until guest exit for foreground instances.
    pub async fn start(&self, name: &str, watchdog: bool) -> Result<()> {
        let config = self.store.load(name).await?;
        if watchdog && !config.background {
            return Err(VmError::Validation(format!(
                "{name}: the watchdog only monitors background instances"
            )));
        }
        let paths = self.paths(name);
        self.provisioner.prepare(&config, &paths).await?;
        let plan = build_plan(&config, &self.caps, self.env.constrained, &paths);
        self.supervisor.start(&plan, config.background, &paths).await?;
        if watchdog {
            self.watchdog_start(name).await?;
        }
        Ok(())
    }

    /// Idempotent on a stopped instance.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let _ = self.store.load(name).await?;
        self.supervisor.stop(&self.paths(name)).await
    }

    /// Remove the config and every file the instance ever produced.
    /// Refused while the instance runs; stops its watchdog first.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _ = self.store.load(name).await?;
        let paths = self.paths(name);
        if self.supervisor.is_running(&paths) {
            return Err(VmError::NotStopped(name.to_string()));
        }
        self.watchdog_stop(name);
        self.store.delete(name).await?;
        self.sweep_artifacts(name).await;
        info!(instance = name, "instance deleted");
        Ok(())
    }

    pub async fn info(&self, name: &str) -> Result<InstanceInfo> {
        let config = self.store.load(name).await?;
        let paths = self.paths(name);
        Ok(InstanceInfo {
            running: self.supervisor.is_running(&paths),
            watchdog: marker_pid(&paths).is_some(),
            disk_bytes: self.provisioner.disk_virtual_size(&paths).await.ok(),
            config,
        })
    }

    pub async fn list(&self) -> Result<Vec<InstanceInfo>> {
        let mut infos = Vec::new();
        for name in self.store.list().await? {
            infos.push(self.info(&name).await?);
        }
        Ok(infos)
    }

    /// Apply field changes and persist them.
    ///
    /// Identity changes (hostname, user, password) need a stopped instance
    /// and regenerate the first-boot seed. Resource changes take effect on
    /// the next start. A disk resize changes the image file immediately and
    /// is refused while running.
    pub async fn edit(&self, name: &str, changes: EditRequest) -> Result<VmConfig> {
        let mut config = self.store.load(name).await?;
        let paths = self.paths(name);
        let running = self.supervisor.is_running(&paths);

        let identity_change =
            changes.hostname.is_some() || changes.username.is_some() || changes.password.is_some();
        if identity_change && running {
            return Err(VmError::NotStopped(name.to_string()));
        }
        if changes.disk_size.is_some() && running {
            return Err(VmError::NotStopped(name.to_string()));
        }

        if let Some(hostname) = changes.hostname {
            config.hostname = hostname;
        }
        if let Some(username) = changes.username {
            config.username = username;
        }
        if let Some(password) = changes.password {
            config.password = password;
        }
        if let Some(memory_mb) = changes.memory_mb {
            config.memory_mb = memory_mb;
        }
        if let Some(cpu_count) = changes.cpu_count {
            config.cpu_count = cpu_count;
        }
        if let Some(ssh_port) = changes.ssh_port {
            config.ssh_port = Some(ssh_port);
        }
        if let Some(port_forwards) = changes.port_forwards {
            config.port_forwards = port_forwards;
        }
        if let Some(shares) = changes.shares {
            config.shares = shares;
        }
        if let Some(gui) = changes.gui {
            config.gui = gui;
        }
        if let Some(kvm) = changes.kvm {
            config.kvm = kvm;
        }
        if let Some(background) = changes.background {
            config.background = background;
        }
        config.validate()?;

        if let Some(size) = changes.disk_size {
            let shrink = size.bytes() < config.disk_size.bytes();
            if shrink && !changes.confirm_shrink {
                return Err(VmError::Validation(format!(
                    "{name}: shrinking {} -> {size} discards data; confirm explicitly",
                    config.disk_size
                )));
            }
            self.provisioner.resize(&paths, size, shrink).await?;
            config.disk_size = size;
        }

        self.store.save(&config).await?;
        if identity_change {
            self.provisioner.rebuild_seed(&config, &paths).await?;
        }
        Ok(config)
    }

    pub async fn resize(&self, name: &str, size: DiskSize, confirm_shrink: bool) -> Result<VmConfig> {
        self.edit(
            name,
            EditRequest {
                disk_size: Some(size),
                confirm_shrink,
                ..EditRequest::default()
            },
        )
        .await
    }

    /// Spawn a detached watchdog child for a background instance.
    /// A no-op when a live watchdog already holds the marker.
    pub async fn watchdog_start(&self, name: &str) -> Result<()> {
        let config = self.store.load(name).await?;
        if !config.background {
            return Err(VmError::Validation(format!(
                "{name}: the watchdog only monitors background instances"
            )));
        }
        let paths = self.paths(name);
        clear_stale_marker(&paths);
        if let Some(pid) = marker_pid(&paths) {
            info!(instance = name, pid, "watchdog already running");
            return Ok(());
        }
        let exe = std::env::current_exe()
            .map_err(|e| VmError::Launch(format!("resolve own executable: {e}")))?;
        let child = std::process::Command::new(exe)
            .args(["watchdog", name])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| VmError::Launch(format!("spawn watchdog: {e}")))?;
        // Claim the marker on the child's behalf; the child rewrites the
        // same pid once it is up. Without this, a second start could slip
        // in before the child's own marker write and spawn a duplicate.
        if let Err(e) = write_marker_pid(&paths, child.id()) {
            warn!(instance = name, error = %e, "failed to record watchdog marker");
        }
        info!(instance = name, pid = child.id(), "watchdog spawned");
        Ok(())
    }

    /// Terminate the instance's watchdog, if any, and clear its marker.
    /// Never fails; a missing or stale marker just gets removed.
    pub fn watchdog_stop(&self, name: &str) {
        let paths = self.paths(name);
        if let Some(pid) = marker_pid(&paths) {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => info!(instance = name, pid, "watchdog stopped"),
                Err(e) => warn!(instance = name, pid, error = %e, "failed to signal watchdog"),
            }
        }
        clear_marker(&paths);
    }

    /// The production [`InstanceControl`] used by the watchdog process.
    pub fn control(self: &Arc<Self>, name: &str) -> InstanceHandle {
        InstanceHandle {
            orchestrator: Arc::clone(self),
            name: name.to_string(),
        }
    }

    /// Delete every regular file in the state dir belonging to `name`.
    /// The shared base image cache is untouched.
    async fn sweep_artifacts(&self, name: &str) {
        let seed_name = format!("{name}-seed.iso");
        let prefix = format!("{name}.");
        let Ok(mut entries) = tokio::fs::read_dir(&self.env.state_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if !file_name.starts_with(&prefix) && file_name != seed_name {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

/// Binds the watchdog loop to one instance of a shared orchestrator.
pub struct InstanceHandle {
    orchestrator: Arc<Orchestrator>,
    name: String,
}

#[async_trait]
impl InstanceControl for InstanceHandle {
    async fn config_exists(&self) -> bool {
        self.orchestrator.store.exists(&self.name).await
    }

    async fn is_running(&self) -> bool {
        self.orchestrator
            .supervisor
            .is_running(&self.orchestrator.paths(&self.name))
    }

    async fn restart(&self) -> Result<()> {
        self.orchestrator.start(&self.name, false).await
    }
}
