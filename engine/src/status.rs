//! Host status reporting via `get_status()`. Reading CPU frequency,
//! temperature, and the current scaling governor from sysfs is squarely
//! external-collaborator territory — this module only reads; changing the
//! governor is out of scope, same as the rest of system-service control.

use std::fs;
use std::time::Instant;

/// Snapshot returned by `get_status()`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostStatus {
    pub underruns: u64,
    pub ms_since_last_underrun: Option<u64>,
    pub cpu_use: f32,
    pub cpu_freq_min_hz: Option<u64>,
    pub cpu_freq_max_hz: Option<u64>,
    pub temperature_mc: Option<i64>,
    pub governor: Option<String>,
    pub active: bool,
}

/// Seam over the handful of sysfs reads `get_status()` needs, so tests can
/// supply fixed values instead of depending on the machine they run on.
pub trait SystemStatusSource: Send {
    fn cpu_freq_min_hz(&self) -> Option<u64>;
    fn cpu_freq_max_hz(&self) -> Option<u64>;
    fn temperature_mc(&self) -> Option<i64>;
    fn governor(&self) -> Option<String>;
}

/// Reads `/sys/devices/system/cpu/cpu0/cpufreq/*` and
/// `/sys/class/thermal/thermal_zone0/temp`, the same paths a Raspberry Pi
/// host exposes these through.
pub struct SysfsStatusSource {
    pub cpu_index: u32,
    pub thermal_zone: u32,
}

impl Default for SysfsStatusSource {
    fn default() -> Self {
        Self { cpu_index: 0, thermal_zone: 0 }
    }
}

fn read_u64(path: &str) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

impl SystemStatusSource for SysfsStatusSource {
    fn cpu_freq_min_hz(&self) -> Option<u64> {
        read_u64(&format!("/sys/devices/system/cpu/cpu{}/cpufreq/scaling_min_freq", self.cpu_index)).map(|khz| khz * 1000)
    }

    fn cpu_freq_max_hz(&self) -> Option<u64> {
        read_u64(&format!("/sys/devices/system/cpu/cpu{}/cpufreq/scaling_max_freq", self.cpu_index)).map(|khz| khz * 1000)
    }

    fn temperature_mc(&self) -> Option<i64> {
        fs::read_to_string(format!("/sys/class/thermal/thermal_zone{}/temp", self.thermal_zone))
        .ok()?
        .trim()
        .parse()
        .ok()
    }

    fn governor(&self) -> Option<String> {
        fs::read_to_string(format!("/sys/devices/system/cpu/cpu{}/cpufreq/scaling_governor", self.cpu_index))
        .ok()
        .map(|s| s.trim().to_string())
    }
}

/// Tracks the underrun counter and last-underrun timestamp across calls to
/// `get_status()`, folding in whatever [`SystemStatusSource`] the host was
/// built with.
pub struct StatusTracker<S: SystemStatusSource> {
    source: S,
    underruns: u64,
    last_underrun_at: Option<Instant>,
}

impl<S: SystemStatusSource> StatusTracker<S> {
    pub fn new(source: S) -> Self {
        Self { source, underruns: 0, last_underrun_at: None }
    }

    pub fn record_underrun(&mut self, count: u64) {
        self.underruns += count;
        self.last_underrun_at = Some(Instant::now());
    }

    pub fn snapshot(&self, cpu_use: f32, active: bool) -> HostStatus {
        HostStatus {
            underruns: self.underruns,
            ms_since_last_underrun: self.last_underrun_at.map(|t| t.elapsed().as_millis() as u64),
            cpu_use,
            cpu_freq_min_hz: self.source.cpu_freq_min_hz(),
            cpu_freq_max_hz: self.source.cpu_freq_max_hz(),
            temperature_mc: self.source.temperature_mc(),
            governor: self.source.governor(),
            active,
        }
    }
}
