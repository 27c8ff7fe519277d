use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use vm_core::{GuestIdentity, Result, SeedBuilder, VmError};

use crate::command::exec;

/// Builds a cloud-init NoCloud seed ISO carrying the guest's first-boot
/// identity (hostname, user, clear-text password).
///
/// Uses `cloud-localds` when available and falls back to `genisoimage` with
/// the `cidata` volume label the NoCloud datasource expects.
pub struct CloudInitSeedBuilder {
    tool: SeedTool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedTool {
    CloudLocalds,
    Genisoimage,
}

impl CloudInitSeedBuilder {
    pub fn new(tool: SeedTool) -> Self {
        Self { tool }
    }
}

fn user_data(identity: &GuestIdentity) -> String {
    format!(
        r#"#cloud-config
hostname: {hostname}
ssh_pwauth: true
users:
  - name: {user}
    plain_text_passwd: {password}
    lock_passwd: false
    sudo: ALL=(ALL) NOPASSWD:ALL
    shell: /bin/bash
chpasswd:
  expire: false
"#,
        hostname = identity.hostname,
        user = identity.username,
        password = identity.password,
    )
}

fn meta_data(identity: &GuestIdentity) -> String {
    format!(
        "instance-id: {hostname}\nlocal-hostname: {hostname}\n",
        hostname = identity.hostname
    )
}

#[async_trait]
impl SeedBuilder for CloudInitSeedBuilder {
    async fn build(&self, identity: &GuestIdentity, dest: &Path) -> Result<()> {
        let work = tempfile::tempdir()
            .map_err(|e| VmError::Provision(format!("seed workdir: {e}")))?;
        let user_path = work.path().join("user-data");
        let meta_path = work.path().join("meta-data");
        tokio::fs::write(&user_path, user_data(identity))
            .await
            .map_err(|e| VmError::Provision(format!("write user-data: {e}")))?;
        tokio::fs::write(&meta_path, meta_data(identity))
            .await
            .map_err(|e| VmError::Provision(format!("write meta-data: {e}")))?;

        let tmp: PathBuf = dest.with_extension(format!("iso.tmp.{}", std::process::id()));
        let result = match self.tool {
            SeedTool::CloudLocalds => {
                exec(
                    "cloud-localds",
                    &[tmp.as_os_str(), user_path.as_os_str(), meta_path.as_os_str()],
                )
                .await
            }
            SeedTool::Genisoimage => {
                exec(
                    "genisoimage",
                    &[
                        "-output".as_ref(),
                        tmp.as_os_str(),
                        "-volid".as_ref(),
                        "cidata".as_ref(),
                        "-joliet".as_ref(),
                        "-rock".as_ref(),
                        user_path.as_os_str(),
                        meta_path.as_os_str(),
                    ],
                )
                .await
            }
        };

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(VmError::Provision(e.to_string()));
        }

        match tokio::fs::rename(&tmp, dest).await {
            Ok(()) => {
                debug!(seed = %dest.display(), "seed volume written");
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(VmError::Provision(format!(
                    "rename to {}: {e}",
                    dest.display()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> GuestIdentity {
        GuestIdentity {
            hostname: "dev-box".into(),
            username: "dev".into(),
            password: "hunter2".into(),
        }
    }

    #[test]
    fn user_data_is_cloud_config() {
        let doc = user_data(&identity());
        assert!(doc.starts_with("#cloud-config\n"), "got: {doc}");
        assert!(doc.contains("hostname: dev-box"), "got: {doc}");
        assert!(doc.contains("- name: dev"), "got: {doc}");
        assert!(doc.contains("plain_text_passwd: hunter2"), "got: {doc}");
        assert!(doc.contains("ssh_pwauth: true"), "got: {doc}");
    }

    #[test]
    fn meta_data_carries_instance_id() {
        let doc = meta_data(&identity());
        assert!(doc.contains("instance-id: dev-box"), "got: {doc}");
        assert!(doc.contains("local-hostname: dev-box"), "got: {doc}");
    }

    #[tokio::test]
    async fn missing_tool_leaves_no_partial_seed() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("vm-seed.iso");
        // cloud-localds is not expected on the test host with this name.
        let builder = CloudInitSeedBuilder::new(SeedTool::CloudLocalds);
        if builder.build(&identity(), &dest).await.is_err() {
            assert!(!dest.exists());
        }
    }
}
