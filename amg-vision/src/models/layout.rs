//! Per-submodule mode, precision and device bookkeeping

use crate::error::VisionError;
use crate::models::device::Device;
use crate::models::precision::{Mode, Precision};
use std::path::PathBuf;
use tracing::debug;

/// Configuration state of one named submodule
#[derive(Debug, Clone, PartialEq)]
pub struct SubmoduleState {
    pub name: &'static str,
    /// Graph file backing the submodule; submodules may share one
    pub graph: PathBuf,
    pub mode: Mode,
    /// Precision the submodule was cast to, `None` until cast
    pub precision: Option<Precision>,
    /// Precision the graph was exported at
    pub native: Precision,
    pub device: Device,
}

impl SubmoduleState {
    pub fn new(name: &'static str, graph: PathBuf, native: Precision, device: Device) -> Self {
        Self {
            name,
            graph,
            mode: Mode::Train,
            precision: None,
            native,
            device,
        }
    }

    /// Precision inputs are fed at
    pub fn effective_precision(&self) -> Precision {
        self.precision.unwrap_or(self.native)
    }

    /// Switch to inference mode and optionally cast.
    ///
    /// Exported graphs cannot change their arithmetic after loading, so a
    /// cast only succeeds when the graph already runs at that precision.
    /// A rejected cast leaves the submodule untouched.
    fn prepare(&mut self, precision: Option<Precision>) -> Result<(), VisionError> {
        if let Some(precision) = precision {
            if precision != self.native {
                return Err(VisionError::Config(format!(
                    "{} graph {:?} was exported at {} and cannot run at {}",
                    self.name, self.graph, self.native, precision
                )));
            }
            self.precision = Some(precision);
        }
        self.mode = Mode::Eval;
        debug!("Prepared {} ({}, {})", self.name, self.effective_precision(), self.device);
        Ok(())
    }
}

/// The set of submodules making up a model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelLayout {
    submodules: Vec<SubmoduleState>,
}

impl ModelLayout {
    pub fn new(submodules: Vec<SubmoduleState>) -> Result<Self, VisionError> {
        if submodules.is_empty() {
            return Err(VisionError::Config("A model needs at least one submodule".to_string()));
        }
        let device = submodules[0].device;
        if let Some(other) = submodules.iter().find(|s| s.device != device) {
            return Err(VisionError::Config(format!(
                "Submodule {} is on {} but the model is on {}",
                other.name, other.device, device
            )));
        }
        Ok(Self { submodules })
    }

    pub fn submodules(&self) -> &[SubmoduleState] {
        &self.submodules
    }

    pub fn get(&self, name: &str) -> Option<&SubmoduleState> {
        self.submodules.iter().find(|s| s.name == name)
    }

    pub fn device(&self) -> Device {
        self.submodules[0].device
    }

    /// Prepare a single submodule by name
    pub fn prepare(&mut self, name: &str, precision: Option<Precision>) -> Result<(), VisionError> {
        let submodule = self
            .submodules
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| VisionError::Config(format!("Unknown submodule {}", name)))?;
        submodule.prepare(precision)
    }

    /// Put every submodule in eval mode and cast it, one at a time
    pub fn apply_eval_precision(&mut self, precision: Option<Precision>) -> Result<(), VisionError> {
        let names: Vec<&'static str> = self.submodules.iter().map(|s| s.name).collect();
        for name in names {
            self.prepare(name, precision)?;
        }
        self.validate()
    }

    /// Check the layout invariants
    pub fn validate(&self) -> Result<(), VisionError> {
        let mode = self.submodules[0].mode;
        if let Some(other) = self.submodules.iter().find(|s| s.mode != mode) {
            return Err(VisionError::Config(format!(
                "Submodule {} is in {:?} mode, expected {:?}",
                other.name, other.mode, mode
            )));
        }

        for (i, a) in self.submodules.iter().enumerate() {
            for b in &self.submodules[i + 1..] {
                if a.graph == b.graph && a.effective_precision() != b.effective_precision() {
                    return Err(VisionError::Config(format!(
                        "{} and {} share graph {:?} but run at {} and {}",
                        a.name,
                        b.name,
                        a.graph,
                        a.effective_precision(),
                        b.effective_precision()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every submodule is in eval mode and the layout is consistent
    pub fn is_configured(&self) -> bool {
        self.submodules.iter().all(|s| s.mode == Mode::Eval) && self.validate().is_ok()
    }
}
