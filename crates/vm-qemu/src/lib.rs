mod command;
mod download;
mod orchestrator;
mod paths;
mod plan;
mod provision;
mod seed;
mod store;
mod supervisor;
mod watchdog;

pub use command::{CommandError, exec};
pub use download::HttpImagePreparer;
pub use orchestrator::{CreateRequest, EditRequest, InstanceHandle, InstanceInfo, Orchestrator};
pub use paths::InstancePaths;
pub use plan::{LaunchPlan, build_plan};
pub use provision::{DiskBackend, ImageProvisioner, QemuImg};
pub use seed::{CloudInitSeedBuilder, SeedTool};
pub use store::ConfigStore;
pub use supervisor::{ProcessSupervisor, StopGrace};
pub use watchdog::{
    InstanceControl, WatchdogOutcome, WatchdogPolicy, clear_marker, clear_stale_marker,
    marker_pid, run_watchdog, write_marker,
};
