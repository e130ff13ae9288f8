//! Numeric precision and execution mode of model submodules

use ort::tensor::TensorElementType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Floating-point precision a submodule runs at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F16,
    BF16,
}

impl Precision {
    /// Tensor element type fed to a graph running at this precision
    pub fn element_type(self) -> TensorElementType {
        match self {
            Precision::F32 => TensorElementType::Float32,
            Precision::F16 => TensorElementType::Float16,
            Precision::BF16 => TensorElementType::Bfloat16,
        }
    }

    /// Precision matching a graph input element type, if it is a float type
    pub fn from_element_type(ty: TensorElementType) -> Option<Self> {
        match ty {
            TensorElementType::Float32 => Some(Precision::F32),
            TensorElementType::Float16 => Some(Precision::F16),
            TensorElementType::Bfloat16 => Some(Precision::BF16),
            _ => None,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precision::F32 => "f32",
            Precision::F16 => "f16",
            Precision::BF16 => "bf16",
        };
        f.write_str(name)
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f32" | "float32" | "fp32" => Ok(Precision::F32),
            "f16" | "float16" | "fp16" | "half" => Ok(Precision::F16),
            "bf16" | "bfloat16" => Ok(Precision::BF16),
            other => Err(format!("Unknown precision '{}'", other)),
        }
    }
}

/// Execution mode of a submodule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Freshly loaded, not yet prepared for inference
    Train,
    /// Inference only
    Eval,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_parse() {
        assert_eq!("f32".parse::<Precision>().unwrap(), Precision::F32);
        assert_eq!("FP16".parse::<Precision>().unwrap(), Precision::F16);
        assert_eq!("bfloat16".parse::<Precision>().unwrap(), Precision::BF16);
        assert!("int8".parse::<Precision>().is_err());
    }

    #[test]
    fn test_precision_element_type_roundtrip() {
        for precision in [Precision::F32, Precision::F16, Precision::BF16] {
            assert_eq!(Precision::from_element_type(precision.element_type()), Some(precision));
        }
        assert_eq!(Precision::from_element_type(TensorElementType::Int64), None);
    }

    #[test]
    fn test_precision_serde_names() {
        assert_eq!(serde_json::to_string(&Precision::BF16).unwrap(), "\"bf16\"");
        let parsed: Precision = serde_json::from_str("\"f16\"").unwrap();
        assert_eq!(parsed, Precision::F16);
    }
}
