use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// Guest first-boot identity injected via the seed volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestIdentity {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

/// Produces a validated disk image at `dest` from a source URL.
///
/// Implementations must write through a temporary path and rename on
/// success; a failed prepare leaves no partial file at `dest`.
#[async_trait]
pub trait ImagePreparer: Send + Sync {
    async fn prepare(&self, url: &str, dest: &Path, sha256: Option<&str>) -> Result<()>;
}

/// Produces a first-boot seed volume at `dest` for a guest identity.
///
/// Same atomicity contract as [`ImagePreparer`].
#[async_trait]
pub trait SeedBuilder: Send + Sync {
    async fn build(&self, identity: &GuestIdentity, dest: &Path) -> Result<()>;
}
