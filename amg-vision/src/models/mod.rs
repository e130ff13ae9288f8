//! SAM2 model loading and configuration

pub mod descriptor;
pub mod device;
pub mod layout;
pub mod manager;
pub mod precision;
pub mod sam;

pub use descriptor::{ModelDescriptor, Sam2Variant};
pub use device::Device;
pub use layout::{ModelLayout, SubmoduleState};
pub use manager::ModelManager;
pub use precision::{Mode, Precision};
pub use sam::{build_sam2, Sam2Model};
