use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use vm_core::{DiskSize, GuestIdentity, ImagePreparer, Result, SeedBuilder, VmConfig, VmError};

use crate::command::exec;
use crate::paths::InstancePaths;

/// Disk image toolchain operations.
///
/// Abstracted as a trait so tests can inject a lightweight backend instead
/// of calling `qemu-img`.
#[async_trait]
pub trait DiskBackend: Send + Sync {
    /// Container format of an existing image (`qcow2`, `raw`, ...).
    async fn detect_format(&self, image: &Path) -> Result<String>;
    /// Copy-on-write overlay at `dest` referencing `base`.
    async fn create_overlay(&self, base: &Path, base_format: &str, dest: &Path) -> Result<()>;
    /// Full byte copy of `src` normalized to qcow2 at `dest`.
    async fn convert_to_qcow2(&self, src: &Path, src_format: &str, dest: &Path) -> Result<()>;
    async fn resize(&self, image: &Path, size: DiskSize, shrink: bool) -> Result<()>;
    /// Reported virtual size in bytes.
    async fn virtual_size(&self, image: &Path) -> Result<u64>;
}

/// Production backend delegating to `qemu-img`.
pub struct QemuImg;

impl QemuImg {
    async fn info(&self, image: &Path) -> Result<serde_json::Value> {
        let stdout = exec(
            "qemu-img",
            &[
                "info".as_ref(),
                "--output=json".as_ref(),
                image.as_os_str(),
            ],
        )
        .await
        .map_err(|e| VmError::Provision(e.to_string()))?;
        serde_json::from_str(&stdout)
            .map_err(|e| VmError::Provision(format!("parse qemu-img info: {e}")))
    }
}

#[async_trait]
impl DiskBackend for QemuImg {
    async fn detect_format(&self, image: &Path) -> Result<String> {
        let info = self.info(image).await?;
        info.get("format")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| {
                VmError::Provision(format!(
                    "undetectable image format: {}",
                    image.display()
                ))
            })
    }

    async fn create_overlay(&self, base: &Path, base_format: &str, dest: &Path) -> Result<()> {
        exec(
            "qemu-img",
            &[
                "create".as_ref(),
                "-q".as_ref(),
                "-f".as_ref(),
                "qcow2".as_ref(),
                "-b".as_ref(),
                base.as_os_str(),
                "-F".as_ref(),
                base_format.as_ref(),
                dest.as_os_str(),
            ],
        )
        .await
        .map(|_| ())
        .map_err(|e| VmError::Provision(e.to_string()))
    }

    async fn convert_to_qcow2(&self, src: &Path, src_format: &str, dest: &Path) -> Result<()> {
        exec(
            "qemu-img",
            &[
                "convert".as_ref(),
                "-f".as_ref(),
                src_format.as_ref(),
                "-O".as_ref(),
                "qcow2".as_ref(),
                src.as_os_str(),
                dest.as_os_str(),
            ],
        )
        .await
        .map(|_| ())
        .map_err(|e| VmError::Provision(e.to_string()))
    }

    async fn resize(&self, image: &Path, size: DiskSize, shrink: bool) -> Result<()> {
        let size_arg = size.to_string();
        let mut args: Vec<&std::ffi::OsStr> = vec!["resize".as_ref(), "-q".as_ref()];
        if shrink {
            args.push("--shrink".as_ref());
        }
        args.push(image.as_os_str());
        args.push(size_arg.as_ref());
        exec("qemu-img", &args)
            .await
            .map(|_| ())
            .map_err(|e| VmError::Provision(e.to_string()))
    }

    async fn virtual_size(&self, image: &Path) -> Result<u64> {
        let info = self.info(image).await?;
        info.get("virtual-size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                VmError::Provision(format!("no virtual size for {}", image.display()))
            })
    }
}

/// Ensures a runnable disk image and seed volume exist for a config.
///
/// All target files are produced via temp path + atomic rename; a failed
/// operation leaves no partially written artifact behind.
pub struct ImageProvisioner {
    preparer: Arc<dyn ImagePreparer>,
    seed_builder: Arc<dyn SeedBuilder>,
    disk: Arc<dyn DiskBackend>,
}

impl ImageProvisioner {
    pub fn new(
        preparer: Arc<dyn ImagePreparer>,
        seed_builder: Arc<dyn SeedBuilder>,
        disk: Arc<dyn DiskBackend>,
    ) -> Self {
        Self {
            preparer,
            seed_builder,
            disk,
        }
    }

    /// Idempotent: existing base, disk, and seed files are left untouched.
    pub async fn prepare(&self, config: &VmConfig, paths: &InstancePaths) -> Result<()> {
        self.ensure_base(config, paths).await?;
        self.ensure_disk(config, paths).await?;
        self.ensure_seed(config, paths).await?;
        Ok(())
    }

    /// Download the shared base image once per (os_family, codename).
    async fn ensure_base(&self, config: &VmConfig, paths: &InstancePaths) -> Result<()> {
        let base = paths.base_image(&config.os_family, &config.codename);
        if tokio::fs::try_exists(&base).await.unwrap_or(false) {
            debug!(base = %base.display(), "base image cached");
            return Ok(());
        }
        tokio::fs::create_dir_all(paths.base_dir())
            .await
            .map_err(|e| VmError::Provision(format!("create base dir: {e}")))?;
        info!(url = %config.source_image_url, base = %base.display(), "fetching base image");
        self.preparer
            .prepare(&config.source_image_url, &base, None)
            .await
    }

    async fn ensure_disk(&self, config: &VmConfig, paths: &InstancePaths) -> Result<()> {
        let disk = paths.disk();
        if tokio::fs::try_exists(&disk).await.unwrap_or(false) {
            debug!(disk = %disk.display(), "instance disk exists");
            return Ok(());
        }

        let base = paths.base_image(&config.os_family, &config.codename);
        let base_format = self.disk.detect_format(&base).await?;
        let tmp = disk.with_extension(format!("qcow2.tmp.{}", std::process::id()));

        let result = async {
            // Prefer a copy-on-write overlay; fall back to a full copy
            // normalized to qcow2 when the backend refuses.
            match self.disk.create_overlay(&base, &base_format, &tmp).await {
                Ok(()) => {
                    debug!(disk = %disk.display(), "created overlay disk");
                }
                Err(e) => {
                    warn!(error = %e, "overlay creation failed, falling back to full copy");
                    self.disk.convert_to_qcow2(&base, &base_format, &tmp).await?;
                }
            }
            self.disk.resize(&tmp, config.disk_size, false).await?;
            tokio::fs::rename(&tmp, &disk)
                .await
                .map_err(|e| VmError::Provision(format!("rename to {}: {e}", disk.display())))
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        } else {
            info!(instance = %config.name, disk = %disk.display(), size = %config.disk_size, "instance disk ready");
        }
        result
    }

    async fn ensure_seed(&self, config: &VmConfig, paths: &InstancePaths) -> Result<()> {
        let seed = paths.seed();
        if tokio::fs::try_exists(&seed).await.unwrap_or(false) {
            return Ok(());
        }
        self.seed_builder.build(&identity_of(config), &seed).await
    }

    /// Regenerate the seed volume after an identity change.
    pub async fn rebuild_seed(&self, config: &VmConfig, paths: &InstancePaths) -> Result<()> {
        let seed = paths.seed();
        match tokio::fs::remove_file(&seed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(VmError::Provision(format!(
                    "remove {}: {e}",
                    seed.display()
                )));
            }
        }
        info!(instance = %config.name, "regenerating seed volume");
        self.seed_builder.build(&identity_of(config), &seed).await
    }

    /// Grow (or, when allowed, shrink) the instance disk in place.
    /// Running/confirmation policy is the orchestrator's job.
    pub async fn resize(&self, paths: &InstancePaths, size: DiskSize, shrink: bool) -> Result<()> {
        self.disk.resize(&paths.disk(), size, shrink).await?;
        info!(instance = %paths.name(), size = %size, "disk resized");
        Ok(())
    }

    pub async fn disk_virtual_size(&self, paths: &InstancePaths) -> Result<u64> {
        self.disk.virtual_size(&paths.disk()).await
    }
}

fn identity_of(config: &VmConfig) -> GuestIdentity {
    GuestIdentity {
        hostname: config.hostname.clone(),
        username: config.username.clone(),
        password: config.password.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use chrono::Utc;
    use vm_core::GuestIdentity;

    use super::*;

    struct CountingPreparer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ImagePreparer for CountingPreparer {
        async fn prepare(&self, _url: &str, dest: &Path, _sha256: Option<&str>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, b"base-image").await?;
            Ok(())
        }
    }

    struct CountingSeedBuilder {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SeedBuilder for CountingSeedBuilder {
        async fn build(&self, identity: &GuestIdentity, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, identity.hostname.as_bytes()).await?;
            Ok(())
        }
    }

    /// In-memory disk backend: tracks sizes, optionally refuses overlays.
    struct FakeDisk {
        overlay_supported: bool,
        overlay_used: AtomicBool,
        fail_all: bool,
    }

    impl FakeDisk {
        fn new(overlay_supported: bool) -> Self {
            Self {
                overlay_supported,
                overlay_used: AtomicBool::new(false),
                fail_all: false,
            }
        }
    }

    #[async_trait]
    impl DiskBackend for FakeDisk {
        async fn detect_format(&self, image: &Path) -> Result<String> {
            if !image.exists() {
                return Err(VmError::Provision("no such image".into()));
            }
            Ok("raw".into())
        }

        async fn create_overlay(&self, _base: &Path, _fmt: &str, dest: &Path) -> Result<()> {
            if self.fail_all || !self.overlay_supported {
                return Err(VmError::Provision("overlay unsupported".into()));
            }
            self.overlay_used.store(true, Ordering::SeqCst);
            tokio::fs::write(dest, b"overlay").await?;
            Ok(())
        }

        async fn convert_to_qcow2(&self, _src: &Path, _fmt: &str, dest: &Path) -> Result<()> {
            if self.fail_all {
                return Err(VmError::Provision("convert failed".into()));
            }
            tokio::fs::write(dest, b"full-copy").await?;
            Ok(())
        }

        async fn resize(&self, image: &Path, _size: DiskSize, _shrink: bool) -> Result<()> {
            if self.fail_all {
                return Err(VmError::Provision("resize failed".into()));
            }
            if !image.exists() {
                return Err(VmError::Provision("no such image".into()));
            }
            Ok(())
        }

        async fn virtual_size(&self, _image: &Path) -> Result<u64> {
            Ok(0)
        }
    }

    fn config() -> VmConfig {
        VmConfig {
            name: "prov-vm".into(),
            os_family: "alpine".into(),
            codename: "3.19".into(),
            source_image_url: "https://example.com/alpine.img".into(),
            hostname: "prov-vm".into(),
            username: "alpine".into(),
            password: "alpine".into(),
            disk_size: "5G".parse().unwrap(),
            memory_mb: 512,
            cpu_count: 1,
            ssh_port: None,
            port_forwards: vec![],
            shares: vec![],
            gui: false,
            kvm: false,
            background: false,
            created_at: Utc::now(),
        }
    }

    fn provisioner(disk: FakeDisk) -> (ImageProvisioner, Arc<CountingPreparer>, Arc<CountingSeedBuilder>) {
        let preparer = Arc::new(CountingPreparer {
            calls: AtomicU32::new(0),
        });
        let seeder = Arc::new(CountingSeedBuilder {
            calls: AtomicU32::new(0),
        });
        let prov = ImageProvisioner::new(preparer.clone(), seeder.clone(), Arc::new(disk));
        (prov, preparer, seeder)
    }

    #[tokio::test]
    async fn prepare_creates_base_disk_and_seed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstancePaths::new(dir.path(), "prov-vm");
        let (prov, preparer, seeder) = provisioner(FakeDisk::new(true));

        prov.prepare(&config(), &paths).await.unwrap();

        assert!(paths.base_image("alpine", "3.19").exists());
        assert!(paths.disk().exists());
        assert!(paths.seed().exists());
        assert_eq!(preparer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(seeder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstancePaths::new(dir.path(), "prov-vm");
        let (prov, preparer, seeder) = provisioner(FakeDisk::new(true));

        prov.prepare(&config(), &paths).await.unwrap();
        let disk_content = std::fs::read(paths.disk()).unwrap();

        prov.prepare(&config(), &paths).await.unwrap();

        // No second download, no seed rebuild, disk untouched.
        assert_eq!(preparer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(seeder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(paths.disk()).unwrap(), disk_content);
    }

    #[tokio::test]
    async fn base_image_shared_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let (prov, preparer, _) = provisioner(FakeDisk::new(true));

        let first = InstancePaths::new(dir.path(), "vm-a");
        let mut config_a = config();
        config_a.name = "vm-a".into();
        prov.prepare(&config_a, &first).await.unwrap();

        let second = InstancePaths::new(dir.path(), "vm-b");
        let mut config_b = config();
        config_b.name = "vm-b".into();
        prov.prepare(&config_b, &second).await.unwrap();

        assert_eq!(preparer.calls.load(Ordering::SeqCst), 1, "one download total");
        assert!(first.disk().exists());
        assert!(second.disk().exists());
    }

    #[tokio::test]
    async fn overlay_failure_falls_back_to_full_copy() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstancePaths::new(dir.path(), "prov-vm");
        let (prov, _, _) = provisioner(FakeDisk::new(false));

        prov.prepare(&config(), &paths).await.unwrap();

        assert_eq!(std::fs::read(paths.disk()).unwrap(), b"full-copy");
    }

    #[tokio::test]
    async fn overlay_preferred_when_supported() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstancePaths::new(dir.path(), "prov-vm");
        let (prov, _, _) = provisioner(FakeDisk::new(true));

        prov.prepare(&config(), &paths).await.unwrap();

        assert_eq!(std::fs::read(paths.disk()).unwrap(), b"overlay");
    }

    #[tokio::test]
    async fn disk_failure_leaves_no_partial_target() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstancePaths::new(dir.path(), "prov-vm");
        let mut disk = FakeDisk::new(true);
        disk.fail_all = true;
        let (prov, _, _) = provisioner(disk);

        prov.prepare(&config(), &paths).await.unwrap_err();

        assert!(!paths.disk().exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains("tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }

    #[tokio::test]
    async fn rebuild_seed_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstancePaths::new(dir.path(), "prov-vm");
        let (prov, _, seeder) = provisioner(FakeDisk::new(true));
        let mut config = config();

        prov.prepare(&config, &paths).await.unwrap();
        config.hostname = "renamed".into();
        prov.rebuild_seed(&config, &paths).await.unwrap();

        assert_eq!(seeder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read(paths.seed()).unwrap(), b"renamed");
    }
}
