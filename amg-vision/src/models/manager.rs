//! Descriptor resolution and checkpoint verification

use crate::error::VisionError;
use crate::models::descriptor::{ModelDescriptor, Sam2Variant, SUBMODULES};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Directories searched for descriptor files, in order
pub const DEFAULT_SEARCH_DIRS: &[&str] = &[".", "configs", "sam2_configs"];

/// Resolves configuration ids to descriptors and checks checkpoints against them
pub struct ModelManager {
    search_dirs: Vec<PathBuf>,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_DIRS.iter().map(PathBuf::from).collect())
    }
}

impl ModelManager {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    /// Resolve a configuration id to a descriptor.
    ///
    /// A path to an existing file wins, then the search directories, then
    /// the built-in variants. A file named after a built-in variant that does
    /// not parse as a descriptor yields the built-in one.
    pub fn resolve_descriptor(&self, config_id: &str) -> Result<ModelDescriptor, VisionError> {
        let config_id = config_id.trim();
        if config_id.is_empty() {
            return Err(VisionError::Config("Empty model configuration id".to_string()));
        }

        let builtin = Sam2Variant::from_config_id(config_id);
        let direct = PathBuf::from(config_id);
        let candidates = std::iter::once(direct.clone())
            .chain(self.search_dirs.iter().map(|dir| dir.join(&direct)));

        for candidate in candidates {
            if !candidate.is_file() {
                continue;
            }
            info!("Loading model descriptor from {:?}", candidate);
            let content = fs::read_to_string(&candidate)?;
            match ModelDescriptor::from_yaml(&content) {
                Ok(descriptor) => return Ok(descriptor),
                // A SAM2 checkout ships training configs under the variant names
                Err(e) if builtin.is_some() => {
                    warn!(
                        "{:?} is not a model descriptor ({}), falling back to the built-in variant",
                        candidate, e
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        match builtin {
            Some(variant) => {
                debug!("Using built-in descriptor for {}", variant.config_id());
                Ok(variant.descriptor())
            }
            None => Err(VisionError::Config(format!(
                "Unknown model configuration '{}' (searched {:?})",
                config_id, self.search_dirs
            ))),
        }
    }

    /// Check that every graph the descriptor names exists under `checkpoint`
    /// (and matches its checksum when one is given). Returns graph paths by
    /// submodule name.
    pub fn verify_checkpoint(
        &self,
        descriptor: &ModelDescriptor,
        checkpoint: &Path,
    ) -> Result<BTreeMap<&'static str, PathBuf>, VisionError> {
        if !checkpoint.is_dir() {
            return Err(VisionError::Config(format!(
                "Checkpoint directory {:?} does not exist",
                checkpoint
            )));
        }

        let mut graphs = BTreeMap::new();
        let mut verified: BTreeMap<PathBuf, String> = BTreeMap::new();

        for name in SUBMODULES {
            let graph = descriptor
                .submodules
                .get(name)
                .ok_or_else(|| VisionError::Config(format!("Descriptor lacks {}", name)))?;

            // Graph paths must stay inside the checkpoint directory
            if graph.graph.is_absolute()
                || graph.graph.components().any(|c| matches!(c, Component::ParentDir))
            {
                return Err(VisionError::Config(format!(
                    "Graph path {:?} for {} escapes the checkpoint directory",
                    graph.graph, name
                )));
            }

            let path = checkpoint.join(&graph.graph);
            if !path.is_file() {
                return Err(VisionError::Config(format!(
                    "{} graph {:?} not found in checkpoint {:?} (does the checkpoint match '{}'?)",
                    name, graph.graph, checkpoint, descriptor.name
                )));
            }

            if let Some(expected) = &graph.sha256 {
                let computed = match verified.get(&path) {
                    Some(hash) => hash.clone(),
                    None => {
                        let hash = sha256_file(&path)?;
                        verified.insert(path.clone(), hash.clone());
                        hash
                    }
                };
                if !computed.eq_ignore_ascii_case(expected.trim()) {
                    return Err(VisionError::Config(format!(
                        "Checksum mismatch for {} graph {:?}: expected {}, got {}",
                        name, path, expected, computed
                    )));
                }
                info!("Verified checksum for {} graph", name);
            }

            graphs.insert(name, path);
        }

        Ok(graphs)
    }
}

/// Hex SHA-256 of a file, streamed
pub fn sha256_file(path: &Path) -> Result<String, VisionError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
