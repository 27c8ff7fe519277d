use tracing::warn;
use vm_core::{HostCapabilities, VmConfig};

use crate::paths::InstancePaths;

/// A fully decided engine invocation, consumed verbatim by the supervisor.
///
/// Building a plan never spawns anything and never inspects whether a
/// process later starts; the only host probe is a read-only existence check
/// on shared-folder paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Token embedded in the invocation (`-name ...,process=<tag>`) used to
    /// match a live process back to its owning instance.
    pub identity_tag: String,
}

/// Process-name token for an instance, unique per name.
pub fn identity_tag(name: &str) -> String {
    format!("vmctl-{name}")
}

/// Derive the engine invocation for one instance.
///
/// Decisions are made in a fixed order so the resulting argument list is
/// deterministic for a given `(config, capabilities)` pair.
pub fn build_plan(
    config: &VmConfig,
    caps: &HostCapabilities,
    constrained_host: bool,
    paths: &InstancePaths,
) -> LaunchPlan {
    let tag = identity_tag(&config.name);
    let mut args: Vec<String> = Vec::new();
    let mut arg = |parts: &[&str]| args.extend(parts.iter().map(|s| s.to_string()));

    arg(&[
        "-name",
        &format!("guest={},process={tag}", config.name),
    ]);

    // 1. Acceleration. KVM only when requested by the config and usable on
    // this host; the machine type follows the accelerator, the two backends
    // are not interchangeable at the machine level.
    if config.kvm && caps.kvm {
        arg(&["-machine", "q35,accel=kvm", "-cpu", "host"]);
    } else {
        arg(&["-machine", "q35,accel=tcg", "-cpu", "qemu64"]);
    }

    // 2. Memory and CPU topology: single socket, N cores, one thread each.
    arg(&["-m", &format!("{}M", config.memory_mb)]);
    arg(&[
        "-smp",
        &format!(
            "{n},sockets=1,cores={n},threads=1",
            n = config.cpu_count
        ),
    ]);

    // 3. Storage. Relaxed cache durability in constrained/sandboxed hosts,
    // write-back elsewhere; trim requests pass through to the image.
    let cache = if constrained_host { "unsafe" } else { "writeback" };
    arg(&[
        "-drive",
        &format!(
            "file={},if=virtio,format=qcow2,cache={cache},discard=unmap",
            paths.disk().display()
        ),
    ]);
    if paths.seed().exists() {
        arg(&[
            "-drive",
            &format!(
                "file={},if=virtio,format=raw,readonly=on",
                paths.seed().display()
            ),
        ]);
    }

    // 4. Boot order: disk first, always.
    arg(&["-boot", "order=c"]);

    // 5. Network. One primary user-mode NIC carrying the ssh forward; each
    // extra port forward gets its own NIC with a distinct netdev id.
    let mut primary = String::from("user,id=net0");
    if let Some(ssh) = config.ssh_port {
        primary.push_str(&format!(",hostfwd=tcp::{ssh}-:22"));
    }
    arg(&["-netdev", &primary, "-device", "virtio-net-pci,netdev=net0"]);
    for (i, fwd) in config.port_forwards.iter().enumerate() {
        let id = format!("net{}", i + 1);
        arg(&[
            "-netdev",
            &format!("user,id={id},hostfwd=tcp::{}-:{}", fwd.host, fwd.guest),
            "-device",
            &format!("virtio-net-pci,netdev={id}"),
        ]);
    }

    // 6. Display/console.
    if config.background {
        arg(&["-display", "none"]);
        arg(&["-serial", &format!("file:{}", paths.log().display())]);
        arg(&[
            "-monitor",
            &format!("unix:{},server,nowait", paths.sock().display()),
        ]);
    } else if config.gui {
        if caps.display {
            arg(&["-display", "gtk,gl=on"]);
        } else {
            arg(&["-display", "gtk"]);
        }
    } else {
        // Serial console straight to the invoking terminal.
        arg(&["-nographic"]);
    }

    // 7. Auxiliary devices: balloon for host memory pressure, virtio rng to
    // avoid guest entropy starvation.
    arg(&["-device", "virtio-balloon-pci"]);
    arg(&[
        "-object",
        "rng-random,filename=/dev/urandom,id=rng0",
        "-device",
        "virtio-rng-pci,rng=rng0",
    ]);
    if config.background {
        arg(&["-daemonize", "-pidfile", &paths.pid().display().to_string()]);
    }

    // 8. Shared folders. Entries pointing at a missing host path are skipped.
    for (i, share) in config.shares.iter().enumerate() {
        if !share.host_path.exists() {
            warn!(
                instance = %config.name,
                path = %share.host_path.display(),
                "skipping share with missing host path"
            );
            continue;
        }
        arg(&[
            "-virtfs",
            &format!(
                "local,id=fsdev{i},path={},mount_tag={},security_model=mapped-xattr",
                share.host_path.display(),
                share.tag
            ),
        ]);
    }

    LaunchPlan {
        program: "qemu-system-x86_64".to_string(),
        args,
        identity_tag: tag,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use chrono::Utc;
    use vm_core::VmConfig;

    use super::*;

    fn config(name: &str) -> VmConfig {
        VmConfig {
            name: name.into(),
            os_family: "alpine".into(),
            codename: "3.19".into(),
            source_image_url: "https://example.com/alpine.img".into(),
            hostname: name.into(),
            username: "alpine".into(),
            password: "alpine".into(),
            disk_size: "5G".parse().unwrap(),
            memory_mb: 512,
            cpu_count: 2,
            ssh_port: None,
            port_forwards: vec![],
            shares: vec![],
            gui: false,
            kvm: true,
            background: false,
            created_at: Utc::now(),
        }
    }

    fn caps(kvm: bool) -> HostCapabilities {
        HostCapabilities { kvm, display: false }
    }

    fn paths() -> InstancePaths {
        InstancePaths::new(Path::new("/tmp/vmctl"), "vm")
    }

    fn joined(plan: &LaunchPlan) -> String {
        plan.args.join(" ")
    }

    #[test]
    fn kvm_requested_and_available_uses_host_passthrough() {
        let plan = build_plan(&config("vm"), &caps(true), false, &paths());
        let line = joined(&plan);
        assert!(line.contains("q35,accel=kvm"), "got: {line}");
        assert!(line.contains("-cpu host"), "got: {line}");
    }

    #[test]
    fn kvm_unavailable_falls_back_to_emulation() {
        let plan = build_plan(&config("vm"), &caps(false), false, &paths());
        let line = joined(&plan);
        assert!(line.contains("q35,accel=tcg"), "got: {line}");
        assert!(line.contains("-cpu qemu64"), "got: {line}");
    }

    #[test]
    fn kvm_not_requested_is_emulated_even_when_available() {
        let mut config = config("vm");
        config.kvm = false;
        let plan = build_plan(&config, &caps(true), false, &paths());
        assert!(joined(&plan).contains("accel=tcg"));
    }

    #[test]
    fn memory_cpu_and_boot_order() {
        let plan = build_plan(&config("vm"), &caps(true), false, &paths());
        let line = joined(&plan);
        assert!(line.contains("-m 512M"), "got: {line}");
        assert!(line.contains("2,sockets=1,cores=2,threads=1"), "got: {line}");
        assert!(line.contains("-boot order=c"), "got: {line}");
    }

    #[test]
    fn constrained_host_relaxes_disk_cache() {
        let relaxed = build_plan(&config("vm"), &caps(true), true, &paths());
        assert!(joined(&relaxed).contains("cache=unsafe"));

        let durable = build_plan(&config("vm"), &caps(true), false, &paths());
        assert!(joined(&durable).contains("cache=writeback"));
    }

    #[test]
    fn port_forwards_get_distinct_netdev_ids() {
        let mut config = config("vm");
        config.port_forwards = vec!["8080:80".parse().unwrap(), "8443:443".parse().unwrap()];
        let plan = build_plan(&config, &caps(true), false, &paths());

        let netdev_ids: Vec<&String> = plan
            .args
            .iter()
            .filter(|a| a.starts_with("user,id="))
            .collect();
        assert_eq!(netdev_ids.len(), 3, "primary + one per forward");
        let mut unique = std::collections::HashSet::new();
        for spec in &netdev_ids {
            let id = spec
                .split(',')
                .find_map(|p| p.strip_prefix("id="))
                .unwrap();
            assert!(unique.insert(id.to_string()), "duplicate netdev id {id}");
        }
        let line = joined(&plan);
        assert!(line.contains("hostfwd=tcp::8080-:80"), "got: {line}");
        assert!(line.contains("hostfwd=tcp::8443-:443"), "got: {line}");
    }

    #[test]
    fn ssh_port_folds_into_primary_nic() {
        let mut config = config("vm");
        config.ssh_port = Some(2222);
        let plan = build_plan(&config, &caps(true), false, &paths());
        assert!(joined(&plan).contains("user,id=net0,hostfwd=tcp::2222-:22"));
    }

    #[test]
    fn background_mode_gets_daemon_artifacts() {
        let mut config = config("vm");
        config.background = true;
        let plan = build_plan(&config, &caps(true), false, &paths());
        let line = joined(&plan);
        assert!(line.contains("-display none"), "got: {line}");
        assert!(line.contains("-serial file:/tmp/vmctl/vm.log"), "got: {line}");
        assert!(
            line.contains("-monitor unix:/tmp/vmctl/vm.sock,server,nowait"),
            "got: {line}"
        );
        assert!(line.contains("-daemonize -pidfile /tmp/vmctl/vm.pid"), "got: {line}");
        assert!(!line.contains("-nographic"), "got: {line}");
    }

    #[test]
    fn foreground_console_is_direct_passthrough() {
        let plan = build_plan(&config("vm"), &caps(true), false, &paths());
        let line = joined(&plan);
        assert!(line.contains("-nographic"), "got: {line}");
        assert!(!line.contains("-daemonize"), "got: {line}");
        assert!(!line.contains("-monitor"), "got: {line}");
    }

    #[test]
    fn gui_mode_uses_gl_only_with_display() {
        let mut config = config("vm");
        config.gui = true;

        let with_display = build_plan(
            &config,
            &HostCapabilities { kvm: true, display: true },
            false,
            &paths(),
        );
        assert!(joined(&with_display).contains("gtk,gl=on"));

        let without = build_plan(&config, &caps(true), false, &paths());
        assert!(joined(&without).contains("-display gtk"));
        assert!(!joined(&without).contains("gl=on"));
    }

    #[test]
    fn aux_devices_always_present() {
        let plan = build_plan(&config("vm"), &caps(true), false, &paths());
        let line = joined(&plan);
        assert!(line.contains("virtio-balloon-pci"), "got: {line}");
        assert!(line.contains("virtio-rng-pci,rng=rng0"), "got: {line}");
    }

    #[test]
    fn missing_share_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config("vm");
        config.shares = vec![
            format!("{}:code", dir.path().display()).parse().unwrap(),
            "/definitely/not/there:gone".parse().unwrap(),
        ];
        let plan = build_plan(&config, &caps(true), false, &paths());
        let virtfs: Vec<&String> = plan
            .args
            .iter()
            .filter(|a| a.starts_with("local,id=fsdev"))
            .collect();
        assert_eq!(virtfs.len(), 1, "only the existing share survives");
        assert!(virtfs.first().unwrap().contains("mount_tag=code"));
    }

    #[test]
    fn identity_tag_embedded_in_name_argument() {
        let plan = build_plan(&config("dev-box"), &caps(true), false, &paths());
        assert_eq!(plan.identity_tag, "vmctl-dev-box");
        assert!(joined(&plan).contains("guest=dev-box,process=vmctl-dev-box"));
    }

    #[test]
    fn plan_is_deterministic() {
        let a = build_plan(&config("vm"), &caps(true), false, &paths());
        let b = build_plan(&config("vm"), &caps(true), false, &paths());
        assert_eq!(a, b);
    }
}
