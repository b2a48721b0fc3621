//! Deterministic stand-in for the turbidity network.
//!
//! Lets the pipeline, the context and the HTTP layer run without weights.

use super::{ClassProbabilities, ModelError, TurbidityModel};
use crate::preprocess::InputTensor;
use crate::turbidity::NUM_CLASSES;

enum Behavior {
    FromInput,
    Fixed(ClassProbabilities),
    Fail,
    Panic,
}

/// Mock classifier for testing: deterministic output without weights.
///
/// The default mode derives logits from the input mean, so brighter
/// (after standardization) images lean towards the clear end.
pub struct MockClassifier {
    behavior: Behavior,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self {
            behavior: Behavior::FromInput,
        }
    }

    /// Always returns `probs`.
    pub fn fixed(probs: ClassProbabilities) -> Self {
        Self {
            behavior: Behavior::Fixed(probs),
        }
    }

    /// Every call returns `ModelError::Inference`.
    pub fn failing() -> Self {
        Self {
            behavior: Behavior::Fail,
        }
    }

    /// Every call panics.
    pub fn panicking() -> Self {
        Self {
            behavior: Behavior::Panic,
        }
    }
}

impl Default for MockClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TurbidityModel for MockClassifier {
    fn classify(&self, input: &InputTensor) -> Result<ClassProbabilities, ModelError> {
        match &self.behavior {
            Behavior::FromInput => ClassProbabilities::from_logits(&input_logits(input)),
            Behavior::Fixed(probs) => Ok(*probs),
            Behavior::Fail => Err(ModelError::Inference("mock inference failure".into())),
            Behavior::Panic => panic!("mock classifier panicked"),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

fn input_logits(input: &InputTensor) -> [f32; NUM_CLASSES] {
    let mean = input.mean();
    let center = (NUM_CLASSES as f32 - 1.0) / 2.0;
    let mut logits = [0.0; NUM_CLASSES];
    for (i, logit) in logits.iter_mut().enumerate() {
        *logit = mean * (i as f32 - center);
    }
    logits
}
