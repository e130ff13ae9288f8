//! Compute device selection

use crate::error::VisionError;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Device a model runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    /// CUDA device ordinal
    Cuda(u32),
}

impl Device {
    /// Execution providers registered on every session for this device.
    ///
    /// CUDA registration is strict: a missing provider fails session
    /// creation instead of silently falling back to the CPU.
    pub(crate) fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        match self {
            Device::Cpu => vec![CPUExecutionProvider::default().build()],
            Device::Cuda(ordinal) => vec![CUDAExecutionProvider::default()
                .with_device_id(*ordinal as i32)
                .build()
                .error_on_failure()],
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
        }
    }
}

impl FromStr for Device {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            _ => {
                let ordinal = name
                    .strip_prefix("cuda:")
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| VisionError::Device(format!("Unknown device '{}'", s)))?;
                // Keep ordinals in the range NVML and CUDA accept
                if ordinal > 63 {
                    return Err(VisionError::Device(format!("Device ordinal too large: {}", ordinal)));
                }
                Ok(Device::Cuda(ordinal))
            }
        }
    }
}
