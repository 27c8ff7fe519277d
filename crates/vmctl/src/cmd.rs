use std::io::Write;
use std::sync::Arc;

use clap::Args;
use tracing::info;
use vm_core::{
    DiskSize, HostCapabilities, HostEnvironment, ImageCatalog, PortForward, Result, ShareMount,
    VmConfig,
};
use vm_qemu::{
    CreateRequest, EditRequest, Orchestrator, WatchdogPolicy, clear_marker, run_watchdog as watchdog_loop,
    write_marker,
};

use crate::deps;

fn orchestrator() -> Result<Arc<Orchestrator>> {
    let seed_tool = deps::check()?;
    Ok(Arc::new(Orchestrator::production(
        HostEnvironment::detect(),
        HostCapabilities::detect(),
        ImageCatalog::builtin(),
        seed_tool,
    )))
}

/// Interactive yes/no gate for destructive operations.
fn confirm(prompt: &str) -> bool {
    print!("{prompt} [y/N] ");
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

#[derive(Args)]
pub struct NameArg {
    /// Instance name
    pub name: String,
}

#[derive(Args)]
pub struct CreateArgs {
    /// Instance name
    pub name: String,
    /// Catalog OS key (see `vmctl system`)
    #[arg(long, default_value = "ubuntu")]
    pub os: String,
    #[arg(long)]
    pub hostname: Option<String>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub password: Option<String>,
    /// Disk size such as 10G or 512M
    #[arg(long)]
    pub disk: Option<DiskSize>,
    /// Guest memory in MiB
    #[arg(long)]
    pub memory: Option<u32>,
    #[arg(long)]
    pub cpus: Option<u32>,
    /// Host port forwarded to guest port 22
    #[arg(long)]
    pub ssh_port: Option<u16>,
    /// Extra port forward as HOST:GUEST (repeatable)
    #[arg(long = "forward", value_name = "HOST:GUEST")]
    pub forwards: Vec<PortForward>,
    /// Shared host directory as PATH:TAG (repeatable)
    #[arg(long = "share", value_name = "PATH:TAG")]
    pub shares: Vec<ShareMount>,
    /// Attach a graphical display
    #[arg(long)]
    pub gui: bool,
    /// Force software emulation even when /dev/kvm is usable
    #[arg(long)]
    pub no_kvm: bool,
    /// Run detached with a serial log and monitor socket
    #[arg(long)]
    pub background: bool,
}

impl CreateArgs {
    fn into_request(self) -> CreateRequest {
        CreateRequest {
            name: self.name,
            os: self.os,
            hostname: self.hostname,
            username: self.username,
            password: self.password,
            disk_size: self.disk,
            memory_mb: self.memory,
            cpu_count: self.cpus,
            ssh_port: self.ssh_port,
            port_forwards: self.forwards,
            shares: self.shares,
            gui: self.gui,
            kvm: !self.no_kvm,
            background: self.background,
        }
    }
}

#[derive(Args)]
pub struct QuickArgs {
    /// Catalog OS key, e.g. `ubuntu`
    pub os: String,
    /// Instance name (defaults to the OS key)
    pub name: Option<String>,
}

#[derive(Args)]
pub struct StartArgs {
    /// Instance name
    pub name: String,
    /// Restart the instance automatically when it dies (background only)
    #[arg(long)]
    pub watchdog: bool,
}

#[derive(Args)]
pub struct DeleteArgs {
    /// Instance name
    pub name: String,
    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

#[derive(Args)]
pub struct InfoArgs {
    /// Instance name
    pub name: String,
    /// Machine-readable output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct EditArgs {
    /// Instance name
    pub name: String,
    /// New hostname (requires a stopped instance, regenerates the seed)
    #[arg(long)]
    pub hostname: Option<String>,
    /// New username (requires a stopped instance, regenerates the seed)
    #[arg(long)]
    pub username: Option<String>,
    /// New password (requires a stopped instance, regenerates the seed)
    #[arg(long)]
    pub password: Option<String>,
    /// Guest memory in MiB, applied on next start
    #[arg(long)]
    pub memory: Option<u32>,
    /// CPU count, applied on next start
    #[arg(long)]
    pub cpus: Option<u32>,
    #[arg(long)]
    pub ssh_port: Option<u16>,
    /// Replace all port forwards (repeatable)
    #[arg(long = "forward", value_name = "HOST:GUEST")]
    pub forwards: Option<Vec<PortForward>>,
    /// Replace all shared directories (repeatable)
    #[arg(long = "share", value_name = "PATH:TAG")]
    pub shares: Option<Vec<ShareMount>>,
    #[arg(long)]
    pub gui: Option<bool>,
    #[arg(long)]
    pub kvm: Option<bool>,
    #[arg(long)]
    pub background: Option<bool>,
}

#[derive(Args)]
pub struct ResizeArgs {
    /// Instance name
    pub name: String,
    /// New disk size such as 20G
    pub size: DiskSize,
    /// Allow shrinking (discards data beyond the new size)
    #[arg(long)]
    pub shrink: bool,
    /// Skip the shrink confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

pub async fn run_create(args: CreateArgs) -> Result<()> {
    let orch = orchestrator()?;
    let config = orch.create(args.into_request()).await?;
    println!(
        "created {} ({} {}, {} MiB, {} cpus, {})",
        config.name, config.os_family, config.codename, config.memory_mb, config.cpu_count,
        config.disk_size
    );
    Ok(())
}

pub async fn run_quick(args: QuickArgs) -> Result<()> {
    let orch = orchestrator()?;
    let config = orch.quick(&args.os, args.name.as_deref()).await?;
    println!("created {}, starting", config.name);
    orch.start(&config.name, false).await?;
    print_connect_hint(&config);
    Ok(())
}

pub async fn run_start(args: StartArgs) -> Result<()> {
    let orch = orchestrator()?;
    orch.start(&args.name, args.watchdog).await?;
    let info = orch.info(&args.name).await?;
    if info.config.background {
        println!("{} started", args.name);
        print_connect_hint(&info.config);
    }
    Ok(())
}

pub async fn run_stop(args: NameArg) -> Result<()> {
    let orch = orchestrator()?;
    orch.watchdog_stop(&args.name);
    orch.stop(&args.name).await?;
    println!("{} stopped", args.name);
    Ok(())
}

pub async fn run_delete(args: DeleteArgs) -> Result<()> {
    if !args.yes
        && !confirm(&format!(
            "delete instance {:?} and all of its data?",
            args.name
        ))
    {
        println!("aborted");
        return Ok(());
    }
    let orch = orchestrator()?;
    orch.delete(&args.name).await?;
    println!("{} deleted", args.name);
    Ok(())
}

pub async fn run_info(args: InfoArgs) -> Result<()> {
    let orch = orchestrator()?;
    let info = orch.info(&args.name).await?;
    let config = &info.config;

    if args.json {
        let doc = serde_json::json!({
            "name": config.name,
            "os_family": config.os_family,
            "codename": config.codename,
            "hostname": config.hostname,
            "username": config.username,
            "disk_size": config.disk_size.to_string(),
            "memory_mb": config.memory_mb,
            "cpu_count": config.cpu_count,
            "ssh_port": config.ssh_port,
            "port_forwards": config.port_forwards.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "shares": config.shares.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "gui": config.gui,
            "kvm": config.kvm,
            "background": config.background,
            "created_at": config.created_at.to_rfc3339(),
            "running": info.running,
            "watchdog": info.watchdog,
            "disk_bytes": info.disk_bytes,
        });
        println!("{doc:#}");
        return Ok(());
    }

    println!("{}: {}", config.name, state_label(info.running));
    println!("  os:       {} {}", config.os_family, config.codename);
    println!("  identity: {}@{}", config.username, config.hostname);
    println!(
        "  resources: {} MiB, {} cpus, {} disk",
        config.memory_mb, config.cpu_count, config.disk_size
    );
    if let Some(port) = config.ssh_port {
        println!("  ssh:      localhost:{port}");
    }
    for forward in &config.port_forwards {
        println!("  forward:  {forward}");
    }
    for share in &config.shares {
        println!("  share:    {share}");
    }
    println!(
        "  mode:     {}{}{}",
        if config.background { "background" } else { "foreground" },
        if config.gui { ", gui" } else { "" },
        if info.watchdog { ", watchdog active" } else { "" },
    );
    println!("  created:  {}", config.created_at.to_rfc3339());
    Ok(())
}

pub async fn run_edit(args: EditArgs) -> Result<()> {
    let orch = orchestrator()?;
    let config = orch
        .edit(
            &args.name,
            EditRequest {
                hostname: args.hostname,
                username: args.username,
                password: args.password,
                memory_mb: args.memory,
                cpu_count: args.cpus,
                ssh_port: args.ssh_port,
                port_forwards: args.forwards,
                shares: args.shares,
                gui: args.gui,
                kvm: args.kvm,
                background: args.background,
                disk_size: None,
                confirm_shrink: false,
            },
        )
        .await?;
    println!("{} updated", config.name);
    Ok(())
}

pub async fn run_resize(args: ResizeArgs) -> Result<()> {
    if args.shrink
        && !args.yes
        && !confirm(&format!(
            "shrink {:?} to {}? data beyond the new size is lost",
            args.name, args.size
        ))
    {
        println!("aborted");
        return Ok(());
    }
    let orch = orchestrator()?;
    let config = orch.resize(&args.name, args.size, args.shrink).await?;
    println!("{} disk resized to {}", config.name, config.disk_size);
    Ok(())
}

pub async fn run_list() -> Result<()> {
    let orch = orchestrator()?;
    let infos = orch.list().await?;
    if infos.is_empty() {
        println!("no instances (try `vmctl quick ubuntu`)");
        return Ok(());
    }
    println!(
        "{:<20} {:<10} {:>8} {:>5} {:>8}",
        "NAME", "STATE", "MEM", "CPUS", "DISK"
    );
    for info in infos {
        println!(
            "{:<20} {:<10} {:>7}M {:>5} {:>8}",
            info.config.name,
            state_label(info.running),
            info.config.memory_mb,
            info.config.cpu_count,
            info.config.disk_size.to_string(),
        );
    }
    Ok(())
}

pub async fn run_system() -> Result<()> {
    let env = HostEnvironment::detect();
    let caps = HostCapabilities::detect();

    println!("state dir:    {}", env.state_dir.display());
    println!(
        "host:         {} MiB, {} cpus{}",
        env.total_memory_mb,
        env.cpu_count,
        if env.constrained { " (constrained)" } else { "" }
    );
    println!(
        "defaults:     {} MiB, {} cpus, {} disk",
        env.default_memory_mb(),
        env.default_cpu_count(),
        env.default_disk_size()
    );
    println!("kvm:          {}", if caps.kvm { "usable" } else { "unavailable" });
    println!("display:      {}", if caps.display { "available" } else { "none" });

    println!("dependencies:");
    for (tool, path) in deps::report() {
        match path {
            Some(path) => println!("  {tool:<22} {}", path.display()),
            None => println!("  {tool:<22} NOT FOUND"),
        }
    }

    println!("images:");
    for (key, spec) in ImageCatalog::builtin().entries() {
        println!("  {key:<22} {}", spec.display_name);
    }
    Ok(())
}

/// Stop the instance's watchdog while leaving the instance itself running.
pub async fn run_watchdog_stop(args: NameArg) -> Result<()> {
    let orch = orchestrator()?;
    // Fail on unknown names instead of silently clearing nothing.
    let _ = orch.info(&args.name).await?;
    orch.watchdog_stop(&args.name);
    println!("{} watchdog stopped", args.name);
    Ok(())
}

/// Body of the hidden `watchdog` subcommand: the detached monitor process.
pub async fn run_watchdog(args: NameArg) -> Result<()> {
    let orch = orchestrator()?;
    let paths = orch.paths(&args.name);
    write_marker(&paths)?;

    let control = orch.control(&args.name);
    let outcome = watchdog_loop(&args.name, WatchdogPolicy::default(), &control).await;
    info!(instance = %args.name, ?outcome, "watchdog finished");

    clear_marker(&paths);
    Ok(())
}

fn state_label(running: bool) -> &'static str {
    if running { "running" } else { "stopped" }
}

fn print_connect_hint(config: &VmConfig) {
    if let Some(port) = config.ssh_port {
        println!("connect with: ssh -p {port} {}@localhost", config.username);
    }
}
