mod cmd;
mod deps;

use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;
use vm_core::HostEnvironment;
use vm_qemu::InstancePaths;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "vmctl", version, about = "Manage local QEMU virtual machines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new instance without starting it
    Create(cmd::CreateArgs),
    /// Create and start an instance with catalog and host defaults
    Quick(cmd::QuickArgs),
    /// Start an instance
    Start(cmd::StartArgs),
    /// Stop an instance (graceful, then forceful)
    Stop(cmd::NameArg),
    /// Delete an instance and every file it owns
    Delete(cmd::DeleteArgs),
    /// Show one instance's configuration and state
    Info(cmd::InfoArgs),
    /// Change instance settings
    Edit(cmd::EditArgs),
    /// Resize the instance disk
    Resize(cmd::ResizeArgs),
    /// List all instances
    List,
    /// Show host environment, capabilities, and dependency status
    System,
    /// Stop an instance's watchdog without touching the instance
    WatchdogStop(cmd::NameArg),
    /// Internal: monitor loop spawned by `start --watchdog`
    #[command(hide = true)]
    Watchdog(cmd::NameArg),
}

/// The watchdog runs detached with no terminal; its diagnostics go to the
/// instance's watchdog log instead of stderr.
fn init_tracing(command: &Command) {
    if let Command::Watchdog(args) = command {
        let env = HostEnvironment::detect();
        let _ = std::fs::create_dir_all(&env.state_dir);
        let paths = InstancePaths::new(&env.state_dir, &args.name);
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.watchdog_log())
        {
            tracing_subscriber::fmt()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.command);

    let result = match cli.command {
        Command::Create(args) => cmd::run_create(args).await,
        Command::Quick(args) => cmd::run_quick(args).await,
        Command::Start(args) => cmd::run_start(args).await,
        Command::Stop(args) => cmd::run_stop(args).await,
        Command::Delete(args) => cmd::run_delete(args).await,
        Command::Info(args) => cmd::run_info(args).await,
        Command::Edit(args) => cmd::run_edit(args).await,
        Command::Resize(args) => cmd::run_resize(args).await,
        Command::List => cmd::run_list().await,
        Command::System => cmd::run_system().await,
        Command::WatchdogStop(args) => cmd::run_watchdog_stop(args).await,
        Command::Watchdog(args) => cmd::run_watchdog(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
