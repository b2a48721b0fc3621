//! Process-wide service state.
//!
//! `ServiceContext` is built once at startup, wrapped in `Arc`, and handed
//! to the router as axum state. It never changes after construction, so
//! requests share it without locks.

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::classifier::{self, ClassProbabilities, ModelError, TurbidityModel};
use crate::config::ServerConfig;
use crate::preprocess::{ImagePreprocessor, PreprocessError, PreprocessingPipeline};
use crate::turbidity::{ClassLabel, TurbidityRange};

#[derive(Error, Debug)]
pub enum PredictError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Response body of a successful prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub predicted_class: ClassLabel,
    pub confidence: f32,
    pub ntu_range: TurbidityRange,
    pub per_class_probs: ClassProbabilities,
}

impl PredictionResult {
    /// Top class (first wins ties), its probability and NTU range.
    pub fn from_probabilities(probs: ClassProbabilities) -> Self {
        let (predicted_class, confidence) = probs.top();
        Self {
            predicted_class,
            confidence,
            ntu_range: predicted_class.ntu_range(),
            per_class_probs: probs,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// ServiceContext
// ═══════════════════════════════════════════════════════════

pub struct ServiceContext {
    preprocessor: Box<dyn ImagePreprocessor>,
    model: Box<dyn TurbidityModel>,
}

impl ServiceContext {
    pub fn new(preprocessor: Box<dyn ImagePreprocessor>, model: Box<dyn TurbidityModel>) -> Self {
        Self {
            preprocessor,
            model,
        }
    }

    /// Standard preprocessing plus the weights at `config.model_path`.
    pub fn load(config: &ServerConfig) -> Result<Self, ModelError> {
        let device = classifier::select_device();
        let model = classifier::load_model(&config.model_path, &device)?;
        info!(backend = model.name(), "Turbidity model ready");
        Ok(Self::new(Box::new(PreprocessingPipeline::standard()), model))
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Normalize, classify and map one uploaded image.
    ///
    /// CPU-bound; call from a blocking thread.
    pub fn predict(&self, image_bytes: &[u8]) -> Result<PredictionResult, PredictError> {
        let input = self.preprocessor.preprocess(image_bytes)?;
        let probs = self.model.classify(&input)?;
        Ok(PredictionResult::from_probabilities(probs))
    }
}
