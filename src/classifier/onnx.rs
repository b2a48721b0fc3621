//! ONNX Runtime backend for an exported copy of the turbidity network.
//!
//! The export must take one `N x 3 x H x W` float input and return
//! `N x 6` logits, in `ClassLabel::ALL` order.

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::TensorRef;

use super::{ClassProbabilities, ModelError, TurbidityModel};
use crate::preprocess::InputTensor;
use crate::turbidity::NUM_CLASSES;

/// Uses a Mutex because `Session::run` needs `&mut self` while
/// `TurbidityModel` is shared behind `&self`.
pub struct OnnxClassifier {
    session: Mutex<Session>,
}

impl OnnxClassifier {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::WeightsNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()
            .map_err(|e: ort::Error| ModelError::ModelInit(e.to_string()))?
            .with_intra_threads(2)
            .map_err(|e: ort::Error| ModelError::ModelInit(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e: ort::Error| ModelError::ModelInit(format!("ONNX load failed: {e}")))?;

        tracing::info!("ONNX turbidity model loaded from {}", model_path.display());

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl TurbidityModel for OnnxClassifier {
    fn classify(&self, input: &InputTensor) -> Result<ClassProbabilities, ModelError> {
        let tensor = TensorRef::from_array_view(input.array())
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| ModelError::Inference("Session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| ModelError::Inference(format!("ONNX inference failed: {e}")))?;

        let (shape, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::UnexpectedOutput(format!("Output extraction: {e}")))?;

        if shape.len() != 2 || shape[0] != 1 || shape[1] as usize != NUM_CLASSES {
            return Err(ModelError::UnexpectedOutput(format!(
                "Unexpected output shape: {shape:?}, expected [1, {NUM_CLASSES}]"
            )));
        }

        ClassProbabilities::from_logits(logits)
    }

    fn name(&self) -> &'static str {
        "onnx"
    }
}
