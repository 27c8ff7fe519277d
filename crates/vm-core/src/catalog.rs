/// Origin of a downloadable base disk image plus its first-boot defaults.
#[derive(Debug, Clone)]
pub struct SourceImageSpec {
    pub display_name: &'static str,
    pub url: &'static str,
    pub os_family: &'static str,
    pub codename: &'static str,
    pub default_username: &'static str,
    pub default_password: &'static str,
    /// Expected SHA-256 of the downloaded file, verified when present.
    pub sha256: Option<&'static str>,
}

/// Immutable lookup table from a short OS key to its image spec.
///
/// Injected into the orchestrator at construction so tests can substitute
/// a catalog pointing at local files.
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    entries: Vec<(&'static str, SourceImageSpec)>,
}

impl ImageCatalog {
    pub fn new(entries: Vec<(&'static str, SourceImageSpec)>) -> Self {
        Self { entries }
    }

    /// The default catalog of well-known cloud images.
    pub fn builtin() -> Self {
        Self::new(vec![
            (
                "alpine",
                SourceImageSpec {
                    display_name: "Alpine Linux 3.19",
                    url: "https://dl-cdn.alpinelinux.org/alpine/v3.19/releases/cloud/nocloud_alpine-3.19.1-x86_64-bios-cloudinit-r0.qcow2",
                    os_family: "alpine",
                    codename: "3.19",
                    default_username: "alpine",
                    default_password: "alpine",
                    sha256: None,
                },
            ),
            (
                "ubuntu",
                SourceImageSpec {
                    display_name: "Ubuntu 24.04 LTS (Noble)",
                    url: "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img",
                    os_family: "ubuntu",
                    codename: "noble",
                    default_username: "ubuntu",
                    default_password: "ubuntu",
                    sha256: None,
                },
            ),
            (
                "debian",
                SourceImageSpec {
                    display_name: "Debian 12 (Bookworm)",
                    url: "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-genericcloud-amd64.qcow2",
                    os_family: "debian",
                    codename: "bookworm",
                    default_username: "debian",
                    default_password: "debian",
                    sha256: None,
                },
            ),
            (
                "fedora",
                SourceImageSpec {
                    display_name: "Fedora Cloud 40",
                    url: "https://download.fedoraproject.org/pub/fedora/linux/releases/40/Cloud/x86_64/images/Fedora-Cloud-Base-Generic.x86_64-40-1.14.qcow2",
                    os_family: "fedora",
                    codename: "40",
                    default_username: "fedora",
                    default_password: "fedora",
                    sha256: None,
                },
            ),
        ])
    }

    /// Case-insensitive lookup by short key.
    pub fn get(&self, key: &str) -> Option<&SourceImageSpec> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, spec)| spec)
    }

    /// All `(key, spec)` pairs in catalog order.
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &SourceImageSpec)> {
        self.entries.iter().map(|(k, spec)| (*k, spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup_is_case_insensitive() {
        let catalog = ImageCatalog::builtin();
        assert!(catalog.get("alpine").is_some());
        assert!(catalog.get("Alpine").is_some());
        assert!(catalog.get("UBUNTU").is_some());
        assert!(catalog.get("windows").is_none());
    }

    #[test]
    fn builtin_entries_carry_defaults() {
        let catalog = ImageCatalog::builtin();
        let alpine = catalog.get("alpine").unwrap();
        assert_eq!(alpine.os_family, "alpine");
        assert_eq!(alpine.default_username, "alpine");
        assert!(alpine.url.starts_with("https://"));
    }

    #[test]
    fn custom_catalog_shadows_builtin() {
        let catalog = ImageCatalog::new(vec![(
            "test",
            SourceImageSpec {
                display_name: "Test",
                url: "file:///tmp/test.img",
                os_family: "test",
                codename: "1",
                default_username: "root",
                default_password: "root",
                sha256: None,
            },
        )]);
        assert!(catalog.get("test").is_some());
        assert!(catalog.get("alpine").is_none());
    }
}
