//! Reading trained weights into a name → tensor map and checking it
//! against the network before anything is built from it.
//!
//! PyTorch checkpoints come in a few shapes: a bare `state_dict`, a dict
//! that nests it under `"state_dict"`, and keys prefixed with `module.` when
//! the model was wrapped for distributed training. All of them are
//! normalized here so the network only ever sees plain parameter names.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::debug;

use super::ModelError;

/// Key under which training scripts commonly nest the real state dict.
const NESTED_STATE_DICT_KEY: &str = "state_dict";

/// Prefix added by `DataParallel` / `DistributedDataParallel`.
const DISTRIBUTED_PREFIX: &str = "module.";

/// Batch-norm step counters: present in most PyTorch checkpoints, unused at
/// inference, so neither required nor rejected.
const OPTIONAL_BUFFER_SUFFIX: &str = ".num_batches_tracked";

/// How many key names to print per category in a mismatch report.
const MAX_REPORTED_KEYS: usize = 8;

/// On-disk weight format, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// `torch.save` pickle archive (`.pth`, `.pt`, `.bin`, `.ckpt`).
    Pickle,
    /// `.safetensors`
    SafeTensors,
    /// ONNX graph export (`.onnx`).
    Onnx,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Result<Self, ModelError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "pth" | "pt" | "bin" | "ckpt" => Ok(Self::Pickle),
            "safetensors" => Ok(Self::SafeTensors),
            "onnx" => Ok(Self::Onnx),
            _ => Err(ModelError::UnsupportedFormat(format!(
                "unrecognized weight file extension: {}",
                path.display()
            ))),
        }
    }
}

/// Expected name and shape of one network parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
        }
    }
}

/// Named tensors read from a checkpoint.
#[derive(Debug)]
pub struct StateDict {
    tensors: HashMap<String, Tensor>,
}

impl StateDict {
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Read every tensor from `path` onto the CPU.
    ///
    /// For pickle archives, a file with no top-level tensors is retried
    /// under the nested `"state_dict"` key.
    pub fn load(path: &Path, format: CheckpointFormat) -> Result<Self, ModelError> {
        let read_err = |e: candle_core::Error| ModelError::CheckpointRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let tensors: HashMap<String, Tensor> = match format {
            CheckpointFormat::Pickle => {
                let flat = candle_core::pickle::read_all_with_key(path, None).map_err(read_err)?;
                if flat.is_empty() {
                    debug!(
                        path = %path.display(),
                        "No top-level tensors, reading nested {NESTED_STATE_DICT_KEY}"
                    );
                    candle_core::pickle::read_all_with_key(path, Some(NESTED_STATE_DICT_KEY))
                        .map_err(read_err)?
                        .into_iter()
                        .collect()
                } else {
                    flat.into_iter().collect()
                }
            }
            CheckpointFormat::SafeTensors => {
                candle_core::safetensors::load(path, &Device::Cpu).map_err(read_err)?
            }
            CheckpointFormat::Onnx => {
                return Err(ModelError::UnsupportedFormat(
                    "ONNX graphs carry no state dict".into(),
                ))
            }
        };

        if tensors.is_empty() {
            return Err(ModelError::CheckpointRead {
                path: path.to_path_buf(),
                reason: "no tensors found".into(),
            });
        }

        debug!(path = %path.display(), tensors = tensors.len(), "Checkpoint read");
        Ok(Self { tensors })
    }

    /// Remove the first `module.` from every key, but only when at least
    /// one key starts with it.
    pub fn strip_distributed_prefix(self) -> Self {
        if !self.tensors.keys().any(|k| k.starts_with(DISTRIBUTED_PREFIX)) {
            return self;
        }

        debug!("Stripping distributed-training key prefix");
        let tensors = self
            .tensors
            .into_iter()
            .map(|(k, v)| (k.replacen(DISTRIBUTED_PREFIX, "", 1), v))
            .collect();
        Self { tensors }
    }

    /// Strict match against the network: every expected key present with the
    /// expected shape, and no unknown keys besides optional BN counters.
    pub fn validate(&self, expected: &[ParameterSpec]) -> Result<(), ModelError> {
        let mut missing = Vec::new();
        let mut mismatched = Vec::new();

        for spec in expected {
            match self.tensors.get(&spec.name) {
                None => missing.push(spec.name.clone()),
                Some(t) if t.dims() != spec.shape.as_slice() => mismatched.push(format!(
                    "{} (expected {:?}, found {:?})",
                    spec.name,
                    spec.shape,
                    t.dims()
                )),
                Some(_) => {}
            }
        }

        let known: HashSet<&str> = expected.iter().map(|s| s.name.as_str()).collect();
        let mut unexpected: Vec<String> = self
            .tensors
            .keys()
            .filter(|k| !known.contains(k.as_str()) && !k.ends_with(OPTIONAL_BUFFER_SUFFIX))
            .cloned()
            .collect();

        if missing.is_empty() && unexpected.is_empty() && mismatched.is_empty() {
            return Ok(());
        }

        missing.sort();
        unexpected.sort();
        mismatched.sort();

        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing keys: {}", summarize(&missing)));
        }
        if !unexpected.is_empty() {
            problems.push(format!("unexpected keys: {}", summarize(&unexpected)));
        }
        if !mismatched.is_empty() {
            problems.push(format!("shape mismatches: {}", summarize(&mismatched)));
        }
        Err(ModelError::IncompatibleCheckpoint(problems.join("; ")))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn into_tensors(self) -> HashMap<String, Tensor> {
        self.tensors
    }
}

fn summarize(keys: &[String]) -> String {
    let shown = keys
        .iter()
        .take(MAX_REPORTED_KEYS)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if keys.len() > MAX_REPORTED_KEYS {
        format!("{shown} (+{} more)", keys.len() - MAX_REPORTED_KEYS)
    } else {
        shown
    }
}
