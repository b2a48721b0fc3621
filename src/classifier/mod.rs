//! Turbidity classifier: turns a standardized image tensor into a
//! probability distribution over the six turbidity classes.
//!
//! `ResNetClassifier` (candle) is the production network. `OnnxClassifier`
//! runs an ONNX export of the same network behind the `onnx` feature, and
//! `MockClassifier` stands in for both in tests.

pub mod checkpoint;
pub mod mock;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod resnet;

pub use checkpoint::{CheckpointFormat, ParameterSpec, StateDict};
pub use mock::MockClassifier;
#[cfg(feature = "onnx")]
pub use onnx::OnnxClassifier;
pub use resnet::ResNetClassifier;

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::preprocess::InputTensor;
use crate::turbidity::{ClassLabel, NUM_CLASSES};

/// Tolerance used when checking that probabilities sum to one.
pub const PROBABILITY_TOLERANCE: f32 = 1e-4;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model weights not found at: {0}")]
    WeightsNotFound(PathBuf),

    #[error("Unsupported model format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read checkpoint {path}: {reason}")]
    CheckpointRead { path: PathBuf, reason: String },

    #[error("Checkpoint does not match the network: {0}")]
    IncompatibleCheckpoint(String),

    #[error("Model initialization failed: {0}")]
    ModelInit(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Unexpected model output: {0}")]
    UnexpectedOutput(String),
}

/// A loaded, immutable classifier. Shared read-only across requests.
pub trait TurbidityModel: Send + Sync {
    /// Run one forward pass in inference mode.
    fn classify(&self, input: &InputTensor) -> Result<ClassProbabilities, ModelError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════
// ClassProbabilities
// ═══════════════════════════════════════════════════════════

/// Softmax output in `ClassLabel::ALL` order.
///
/// Serializes as a JSON object keyed by label wire name, always with all
/// six labels, in class order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassProbabilities([f32; NUM_CLASSES]);

impl ClassProbabilities {
    /// Wrap an already-normalized distribution.
    pub fn from_probs(probs: &[f32]) -> Result<Self, ModelError> {
        let probs: [f32; NUM_CLASSES] = probs.try_into().map_err(|_| {
            ModelError::UnexpectedOutput(format!(
                "expected {NUM_CLASSES} probabilities, got {}",
                probs.len()
            ))
        })?;

        if probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(ModelError::UnexpectedOutput(format!(
                "probabilities must be finite and non-negative: {probs:?}"
            )));
        }

        let total: f32 = probs.iter().sum();
        if (total - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(ModelError::UnexpectedOutput(format!(
                "probabilities sum to {total}, expected 1"
            )));
        }

        Ok(Self(probs))
    }

    /// Apply softmax to raw network logits.
    pub fn from_logits(logits: &[f32]) -> Result<Self, ModelError> {
        if logits.len() != NUM_CLASSES {
            return Err(ModelError::UnexpectedOutput(format!(
                "expected {NUM_CLASSES} logits, got {}",
                logits.len()
            )));
        }
        Self::from_probs(&softmax(logits))
    }

    pub fn get(&self, label: ClassLabel) -> f32 {
        self.0[label.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassLabel, f32)> + '_ {
        ClassLabel::ALL.iter().copied().zip(self.0.iter().copied())
    }

    /// Most probable class and its probability. The first class wins ties.
    pub fn top(&self) -> (ClassLabel, f32) {
        let mut best = 0;
        for (i, &p) in self.0.iter().enumerate().skip(1) {
            if p > self.0[best] {
                best = i;
            }
        }
        (ClassLabel::ALL[best], self.0[best])
    }

    pub fn as_array(&self) -> &[f32; NUM_CLASSES] {
        &self.0
    }
}

impl Serialize for ClassProbabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(NUM_CLASSES))?;
        for (label, p) in self.iter() {
            map.serialize_entry(label.as_str(), &p)?;
        }
        map.end()
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

// ═══════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════

/// CUDA device 0 when compiled with `cuda` and available, CPU otherwise.
pub fn select_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!("CUDA device unavailable, using CPU: {e}");
            Device::Cpu
        }
    }
}

/// Load the classifier stored at `path`, picking the backend from the
/// file extension.
pub fn load_model(path: &Path, device: &Device) -> Result<Box<dyn TurbidityModel>, ModelError> {
    if !path.exists() {
        return Err(ModelError::WeightsNotFound(path.to_path_buf()));
    }

    match CheckpointFormat::from_path(path)? {
        CheckpointFormat::Onnx => load_onnx(path),
        CheckpointFormat::Pickle | CheckpointFormat::SafeTensors => {
            Ok(Box::new(ResNetClassifier::load(path, device)?))
        }
    }
}

#[cfg(feature = "onnx")]
fn load_onnx(path: &Path) -> Result<Box<dyn TurbidityModel>, ModelError> {
    Ok(Box::new(OnnxClassifier::load(path)?))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(path: &Path) -> Result<Box<dyn TurbidityModel>, ModelError> {
    Err(ModelError::UnsupportedFormat(format!(
        "{} is an ONNX model; rebuild with --features onnx",
        path.display()
    )))
}
