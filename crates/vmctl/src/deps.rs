//! External tool discovery. Everything is checked up front so a missing
//! binary surfaces as one actionable error instead of failing mid-operation.

use std::path::PathBuf;

use vm_core::{Result, VmError};
use vm_qemu::SeedTool;

const ENGINE: &str = "qemu-system-x86_64";
const IMAGE_TOOL: &str = "qemu-img";

/// Verify every required tool is on PATH and pick the seed ISO builder.
pub fn check() -> Result<SeedTool> {
    let mut missing = Vec::new();
    for tool in [ENGINE, IMAGE_TOOL] {
        if which::which(tool).is_err() {
            missing.push(tool);
        }
    }
    let seed_tool = detect_seed_tool();
    if seed_tool.is_none() {
        missing.push("cloud-localds (or genisoimage)");
    }
    match seed_tool {
        Some(tool) if missing.is_empty() => Ok(tool),
        _ => Err(VmError::DependencyMissing(missing.join(", "))),
    }
}

/// `cloud-localds` wraps the ISO details for us; `genisoimage` is the
/// fallback on hosts without cloud-image-utils.
fn detect_seed_tool() -> Option<SeedTool> {
    if which::which("cloud-localds").is_ok() {
        return Some(SeedTool::CloudLocalds);
    }
    if which::which("genisoimage").is_ok() {
        return Some(SeedTool::Genisoimage);
    }
    None
}

/// Resolution status of every tool, for `vmctl system`.
pub fn report() -> Vec<(&'static str, Option<PathBuf>)> {
    [ENGINE, IMAGE_TOOL, "cloud-localds", "genisoimage"]
        .into_iter()
        .map(|tool| (tool, which::which(tool).ok()))
        .collect()
}
