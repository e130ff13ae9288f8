//! Peak memory reporting for the device the model runs on

use crate::error::VisionError;
use crate::models::Device;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Source of allocated and total memory for one device
pub trait MemoryProbe {
    /// Fold current usage into the running peak
    fn sample(&self) -> Result<(), VisionError>;

    /// Peak bytes allocated since the probe was created
    fn peak_allocated(&self) -> Result<u64, VisionError>;

    /// Total bytes the device offers
    fn total(&self) -> Result<u64, VisionError>;
}

/// Probe for a CUDA device, backed by NVML.
///
/// NVML reports current usage only, so the peak is the running maximum of
/// every sample taken.
pub struct NvmlProbe {
    nvml: Nvml,
    index: u32,
    peak: AtomicU64,
    device_wide_warned: AtomicBool,
}

impl NvmlProbe {
    pub fn new(index: u32) -> Result<Self, VisionError> {
        let nvml = Nvml::init()?;
        let name = nvml.device_by_index(index)?.name()?;
        info!("Tracking memory of GPU {} ({})", index, name);

        let probe = Self {
            nvml,
            index,
            peak: AtomicU64::new(0),
            device_wide_warned: AtomicBool::new(false),
        };
        probe.sample()?;
        Ok(probe)
    }

    /// This process's usage, or the device-wide figure when the driver
    /// does not report per-process accounting
    fn current_usage(&self) -> Result<u64, VisionError> {
        let device = self.nvml.device_by_index(self.index)?;
        let pid = std::process::id();

        let own = device
            .running_compute_processes()
            .ok()
            .and_then(|processes| processes.into_iter().find(|p| p.pid == pid))
            .and_then(|process| match process.used_gpu_memory {
                UsedGpuMemory::Used(bytes) => Some(bytes),
                UsedGpuMemory::Unavailable => None,
            });

        usage_or_device_wide(own, || Ok(device.memory_info()?.used), &self.device_wide_warned)
    }
}

/// Per-process usage when known, otherwise device-wide usage with a one-time
/// warning since that figure includes other processes.
fn usage_or_device_wide<F>(own: Option<u64>, device_used: F, warned: &AtomicBool) -> Result<u64, VisionError>
where
    F: FnOnce() -> Result<u64, VisionError>,
{
    if let Some(bytes) = own {
        return Ok(bytes);
    }
    if !warned.swap(true, Ordering::Relaxed) {
        warn!("Per-process GPU memory is unavailable; reporting device-wide usage, which includes other processes");
    }
    device_used()
}

impl MemoryProbe for NvmlProbe {
    fn sample(&self) -> Result<(), VisionError> {
        let used = self.current_usage()?;
        self.peak.fetch_max(used, Ordering::Relaxed);
        Ok(())
    }

    fn peak_allocated(&self) -> Result<u64, VisionError> {
        Ok(self.peak.load(Ordering::Relaxed))
    }

    fn total(&self) -> Result<u64, VisionError> {
        Ok(self.nvml.device_by_index(self.index)?.memory_info()?.total)
    }
}

/// Probe for host execution: the process high-water mark against
/// physical memory
pub struct HostProbe;

impl HostProbe {
    pub fn new() -> Result<Self, VisionError> {
        let probe = HostProbe;
        probe.total()?;
        Ok(probe)
    }
}

fn read_proc(path: &str) -> Result<String, VisionError> {
    std::fs::read_to_string(path)
        .map_err(|e| VisionError::Device(format!("Cannot read {}: {}", path, e)))
}

/// Value of a `Name:   1234 kB` line, in bytes
pub(crate) fn parse_kib_field(text: &str, field: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.strip_prefix(':')?;
        let kib = rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok()?;
        Some(kib * 1024)
    })
}

impl MemoryProbe for HostProbe {
    fn sample(&self) -> Result<(), VisionError> {
        // The kernel keeps the high-water mark itself
        Ok(())
    }

    fn peak_allocated(&self) -> Result<u64, VisionError> {
        let status = read_proc("/proc/self/status")?;
        parse_kib_field(&status, "VmHWM")
            .ok_or_else(|| VisionError::Device("VmHWM missing from /proc/self/status".to_string()))
    }

    fn total(&self) -> Result<u64, VisionError> {
        let meminfo = read_proc("/proc/meminfo")?;
        parse_kib_field(&meminfo, "MemTotal")
            .ok_or_else(|| VisionError::Device("MemTotal missing from /proc/meminfo".to_string()))
    }
}

/// Pick the probe matching where the model runs
pub fn probe_for(device: Device) -> Result<Box<dyn MemoryProbe>, VisionError> {
    match device {
        Device::Cuda(index) => Ok(Box::new(NvmlProbe::new(index)?)),
        Device::Cpu => {
            warn!("Running on the host; reporting process memory instead of device memory");
            Ok(Box::new(HostProbe::new()?))
        }
    }
}

/// Peak memory as a share of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReport {
    pub peak_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryReport {
    pub fn new(peak_bytes: u64, total_bytes: u64) -> Result<Self, VisionError> {
        if total_bytes == 0 {
            return Err(VisionError::Device("Device reports zero total memory".to_string()));
        }
        Ok(Self {
            peak_bytes,
            total_bytes,
        })
    }

    /// Read the probe without resetting its peak
    pub fn from_probe(probe: &dyn MemoryProbe) -> Result<Self, VisionError> {
        let report = Self::new(probe.peak_allocated()?, probe.total()?)?;
        debug!("Memory peak {} of {} bytes", report.peak_bytes, report.total_bytes);
        Ok(report)
    }

    /// Peak in whole MiB, truncated
    pub fn peak_mib(&self) -> u64 {
        self.peak_bytes >> 20
    }

    /// Peak as a whole percentage of total, truncated
    pub fn percentage(&self) -> u64 {
        (self.peak_bytes as u128 * 100 / self.total_bytes as u128) as u64
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memory(MiB): {} memory(%): {}", self.peak_mib(), self.percentage())
    }
}
