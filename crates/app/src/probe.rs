//! Local capability probe
//!
//! Reads Linux procfs/sysfs. Anything unreadable falls back to a neutral
//! value so the peer still reports a sample on other platforms.

use std::fs;
use std::path::Path;

use peercoord_core::{CapabilityProbe, CapabilitySample};
use tracing::debug;

const LOADAVG: &str = "/proc/loadavg";
const MEMINFO: &str = "/proc/meminfo";
const DRI_DIR: &str = "/dev/dri";
const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

/// Samples CPU headroom, free memory, GPU presence and battery charge
#[derive(Debug, Default)]
pub struct SystemProbe;

impl CapabilityProbe for SystemProbe {
    fn sample(&self) -> CapabilitySample {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let cpu = fs::read_to_string(LOADAVG)
            .ok()
            .and_then(|s| cpu_headroom(&s, cores))
            .unwrap_or(0.5);
        let memory = fs::read_to_string(MEMINFO)
            .ok()
            .and_then(|s| memory_available(&s))
            .unwrap_or(0.5);
        let gpu = if has_render_node(Path::new(DRI_DIR)) {
            1.0
        } else {
            0.0
        };
        // No battery means mains power
        let battery = battery_level(Path::new(POWER_SUPPLY_DIR)).unwrap_or(1.0);

        let sample = CapabilitySample::new(cpu, memory, gpu, battery);
        debug!(?sample, "Sampled local capability");
        sample
    }
}

/// `1 - load1 / cores`, from `/proc/loadavg` content
fn cpu_headroom(loadavg: &str, cores: usize) -> Option<f64> {
    let load1: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    Some(1.0 - load1 / cores.max(1) as f64)
}

/// `MemAvailable / MemTotal`, from `/proc/meminfo` content
fn memory_available(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };

    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(available / total)
}

fn has_render_node(dri: &Path) -> bool {
    fs::read_dir(dri)
        .map(|entries| {
            entries
                .flatten()
                .any(|e| e.file_name().to_string_lossy().starts_with("renderD"))
        })
        .unwrap_or(false)
}

/// Charge of the first battery found, in [0, 1]
fn battery_level(power_supply: &Path) -> Option<f64> {
    let entries = fs::read_dir(power_supply).ok()?;
    entries.flatten().find_map(|entry| {
        let dir = entry.path();
        let kind = fs::read_to_string(dir.join("type")).ok()?;
        if kind.trim() != "Battery" {
            return None;
        }
        let capacity: f64 = fs::read_to_string(dir.join("capacity"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        Some(capacity / 100.0)
    })
}
