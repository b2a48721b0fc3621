//! ResNet-34 backbone with the turbidity head, in candle.
//!
//! Parameter names follow torchvision's `resnet34` so a PyTorch state dict
//! loads without renaming. The original `fc` layer is replaced by
//! `Sequential(Dropout, Linear(512, 512), ReLU, Dropout, Linear(512, 6))`;
//! dropout is the identity at inference, which is why the head's linear
//! layers live at `fc.1` and `fc.4`.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder};
use tracing::info;

use super::checkpoint::{CheckpointFormat, ParameterSpec, StateDict};
use super::{ClassProbabilities, ModelError, TurbidityModel};
use crate::preprocess::InputTensor;
use crate::turbidity::NUM_CLASSES;

/// Basic blocks per stage.
const BLOCKS_PER_STAGE: [usize; 4] = [3, 4, 6, 3];
/// Output channels per stage.
const STAGE_WIDTHS: [usize; 4] = [64, 128, 256, 512];
const STEM_WIDTH: usize = 64;
const FEATURE_DIM: usize = 512;
const HEAD_HIDDEN_DIM: usize = 512;
const BN_EPS: f64 = 1e-5;

/// Parameter name of the head's hidden linear layer (after `fc.0` dropout).
const HEAD_HIDDEN: &str = "fc.1";
/// Parameter name of the head's output layer (after `fc.2` ReLU, `fc.3` dropout).
const HEAD_OUTPUT: &str = "fc.4";

// ═══════════════════════════════════════════════════════════
// Layers
// ═══════════════════════════════════════════════════════════

fn conv(
    c_in: usize,
    c_out: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    vb: VarBuilder,
) -> candle_core::Result<Conv2d> {
    let cfg = Conv2dConfig {
        stride,
        padding,
        ..Default::default()
    };
    candle_nn::conv2d_no_bias(c_in, c_out, kernel, cfg, vb)
}

fn bn(channels: usize, vb: VarBuilder) -> candle_core::Result<BatchNorm> {
    candle_nn::batch_norm(channels, BN_EPS, vb)
}

struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    fn load(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let downsample = if stride != 1 || c_in != c_out {
            let ds = vb.pp("downsample");
            Some((conv(c_in, c_out, 1, stride, 0, ds.pp("0"))?, bn(c_out, ds.pp("1"))?))
        } else {
            None
        };

        Ok(Self {
            conv1: conv(c_in, c_out, 3, stride, 1, vb.pp("conv1"))?,
            bn1: bn(c_out, vb.pp("bn1"))?,
            conv2: conv(c_out, c_out, 3, 1, 1, vb.pp("conv2"))?,
            bn2: bn(c_out, vb.pp("bn2"))?,
            downsample,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = xs
            .apply(&self.conv1)?
            .apply_t(&self.bn1, false)?
            .relu()?
            .apply(&self.conv2)?
            .apply_t(&self.bn2, false)?;

        let shortcut = match &self.downsample {
            Some((conv, bn)) => xs.apply(conv)?.apply_t(bn, false)?,
            None => xs.clone(),
        };
        (shortcut + ys)?.relu()
    }
}

/// Dropout → Linear → ReLU → Dropout → Linear, dropout as identity.
struct TurbidityHead {
    hidden: Linear,
    output: Linear,
}

impl TurbidityHead {
    fn load(num_classes: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            hidden: candle_nn::linear(FEATURE_DIM, HEAD_HIDDEN_DIM, vb.pp(HEAD_HIDDEN))?,
            output: candle_nn::linear(HEAD_HIDDEN_DIM, num_classes, vb.pp(HEAD_OUTPUT))?,
        })
    }
}

impl Module for TurbidityHead {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.apply(&self.hidden)?.relu()?.apply(&self.output)
    }
}

struct ResNet34 {
    conv1: Conv2d,
    bn1: BatchNorm,
    stages: Vec<Vec<BasicBlock>>,
    head: TurbidityHead,
}

impl ResNet34 {
    fn load(num_classes: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let conv1 = conv(3, STEM_WIDTH, 7, 2, 3, vb.pp("conv1"))?;
        let bn1 = bn(STEM_WIDTH, vb.pp("bn1"))?;

        let mut stages = Vec::with_capacity(BLOCKS_PER_STAGE.len());
        let mut c_in = STEM_WIDTH;
        for (stage, (&blocks, &width)) in BLOCKS_PER_STAGE.iter().zip(&STAGE_WIDTHS).enumerate() {
            let stage_vb = vb.pp(format!("layer{}", stage + 1));
            let mut layer = Vec::with_capacity(blocks);
            for block in 0..blocks {
                let stride = if stage > 0 && block == 0 { 2 } else { 1 };
                layer.push(BasicBlock::load(c_in, width, stride, stage_vb.pp(block.to_string()))?);
                c_in = width;
            }
            stages.push(layer);
        }

        let head = TurbidityHead::load(num_classes, vb)?;
        Ok(Self {
            conv1,
            bn1,
            stages,
            head,
        })
    }
}

impl Module for ResNet34 {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // 3x3/2 max pool with padding 1. Inputs are post-ReLU, so edge
        // replication pads exactly like -inf padding would.
        let mut xs = xs
            .apply(&self.conv1)?
            .apply_t(&self.bn1, false)?
            .relu()?
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;

        for block in self.stages.iter().flatten() {
            xs = block.forward(&xs)?;
        }

        // Global average pool → (batch, 512)
        let features = xs.mean(D::Minus1)?.mean(D::Minus1)?;
        self.head.forward(&features)
    }
}

/// Names and shapes of every learned parameter and running statistic,
/// in torchvision naming.
pub fn parameter_specs(num_classes: usize) -> Vec<ParameterSpec> {
    fn push_bn(specs: &mut Vec<ParameterSpec>, prefix: &str, channels: usize) {
        for suffix in ["weight", "bias", "running_mean", "running_var"] {
            specs.push(ParameterSpec::new(format!("{prefix}.{suffix}"), &[channels]));
        }
    }

    let mut specs = vec![ParameterSpec::new("conv1.weight", &[STEM_WIDTH, 3, 7, 7])];
    push_bn(&mut specs, "bn1", STEM_WIDTH);

    let mut c_in = STEM_WIDTH;
    for (stage, (&blocks, &width)) in BLOCKS_PER_STAGE.iter().zip(&STAGE_WIDTHS).enumerate() {
        for block in 0..blocks {
            let p = format!("layer{}.{block}", stage + 1);
            specs.push(ParameterSpec::new(format!("{p}.conv1.weight"), &[width, c_in, 3, 3]));
            push_bn(&mut specs, &format!("{p}.bn1"), width);
            specs.push(ParameterSpec::new(format!("{p}.conv2.weight"), &[width, width, 3, 3]));
            push_bn(&mut specs, &format!("{p}.bn2"), width);
            if block == 0 && (stage > 0 || c_in != width) {
                specs.push(ParameterSpec::new(
                    format!("{p}.downsample.0.weight"),
                    &[width, c_in, 1, 1],
                ));
                push_bn(&mut specs, &format!("{p}.downsample.1"), width);
            }
            c_in = width;
        }
    }

    specs.push(ParameterSpec::new(
        format!("{HEAD_HIDDEN}.weight"),
        &[HEAD_HIDDEN_DIM, FEATURE_DIM],
    ));
    specs.push(ParameterSpec::new(format!("{HEAD_HIDDEN}.bias"), &[HEAD_HIDDEN_DIM]));
    specs.push(ParameterSpec::new(
        format!("{HEAD_OUTPUT}.weight"),
        &[num_classes, HEAD_HIDDEN_DIM],
    ));
    specs.push(ParameterSpec::new(format!("{HEAD_OUTPUT}.bias"), &[num_classes]));
    specs
}

// ═══════════════════════════════════════════════════════════
// ResNetClassifier
// ═══════════════════════════════════════════════════════════

/// Production classifier. Immutable after `load`.
pub struct ResNetClassifier {
    network: ResNet34,
    device: Device,
}

impl ResNetClassifier {
    /// Load weights from a pickle or safetensors checkpoint.
    ///
    /// Fails if the file is missing, unreadable, or does not match the
    /// network exactly (see `StateDict::validate`).
    pub fn load(path: &Path, device: &Device) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::WeightsNotFound(path.to_path_buf()));
        }

        let format = CheckpointFormat::from_path(path)?;
        let state = StateDict::load(path, format)?.strip_distributed_prefix();
        state.validate(&parameter_specs(NUM_CLASSES))?;

        let vb = VarBuilder::from_tensors(state.into_tensors(), DType::F32, device);
        let classifier = Self::from_var_builder(vb, device)?;

        info!(path = %path.display(), device = ?device, "ResNet-34 turbidity model loaded");
        Ok(classifier)
    }

    /// Build the network from any variable source (tests use zeros).
    pub fn from_var_builder(vb: VarBuilder, device: &Device) -> Result<Self, ModelError> {
        let network = ResNet34::load(NUM_CLASSES, vb)
            .map_err(|e| ModelError::ModelInit(format!("building ResNet-34: {e}")))?;
        Ok(Self {
            network,
            device: device.clone(),
        })
    }

    /// Raw logits, shape `(batch, NUM_CLASSES)`.
    pub fn logits(&self, input: &InputTensor) -> Result<Tensor, ModelError> {
        let shape = input.shape();
        if shape.len() != 4 || shape[1] != 3 {
            return Err(ModelError::Inference(format!(
                "expected an N x 3 x H x W input, got {shape:?}"
            )));
        }
        let data = input
            .as_slice()
            .ok_or_else(|| ModelError::Inference("input tensor is not contiguous".into()))?;

        let xs = Tensor::from_slice(data, shape, &self.device)?;
        Ok(self.network.forward(&xs)?)
    }
}

impl TurbidityModel for ResNetClassifier {
    fn classify(&self, input: &InputTensor) -> Result<ClassProbabilities, ModelError> {
        if input.shape().first() != Some(&1) {
            return Err(ModelError::Inference(format!(
                "expected a batch of one, got {:?}",
                input.shape()
            )));
        }

        let logits = self.logits(input)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?
            .squeeze(0)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        ClassProbabilities::from_probs(&probs)
    }

    fn name(&self) -> &'static str {
        "resnet34"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use ndarray::Array4;

    use super::*;
    use crate::turbidity::ClassLabel;

    fn small_input() -> InputTensor {
        // 64x64 keeps the forward pass cheap; the network is size-agnostic.
        InputTensor::from_array(Array4::from_elem((1, 3, 64, 64), 0.25))
    }

    fn zero_classifier() -> ResNetClassifier {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        ResNetClassifier::from_var_builder(vb, &Device::Cpu).unwrap()
    }

    fn zero_weights(prefix: &str) -> HashMap<String, Tensor> {
        parameter_specs(NUM_CLASSES)
            .into_iter()
            .map(|s| {
                let t = Tensor::zeros(s.shape.as_slice(), DType::F32, &Device::Cpu).unwrap();
                (format!("{prefix}{}", s.name), t)
            })
            .collect()
    }

    #[test]
    fn parameter_count_matches_torchvision_layout() {
        let specs = parameter_specs(NUM_CLASSES);
        // 36 batch norms x 4 + 36 convs + 4 head tensors
        assert_eq!(specs.len(), 36 * 4 + 36 + 4);
    }

    #[test]
    fn parameter_specs_use_torchvision_names() {
        let specs = parameter_specs(NUM_CLASSES);
        let find = |name: &str| specs.iter().find(|s| s.name == name).map(|s| s.shape.clone());

        assert_eq!(find("conv1.weight"), Some(vec![64, 3, 7, 7]));
        assert_eq!(find("layer1.2.bn2.running_var"), Some(vec![64]));
        assert_eq!(find("layer2.0.downsample.0.weight"), Some(vec![128, 64, 1, 1]));
        assert_eq!(find("layer3.5.conv2.weight"), Some(vec![256, 256, 3, 3]));
        assert_eq!(find("layer4.0.conv1.weight"), Some(vec![512, 256, 3, 3]));
        assert_eq!(find("fc.1.weight"), Some(vec![512, 512]));
        assert_eq!(find("fc.4.weight"), Some(vec![6, 512]));
        assert_eq!(find("fc.4.bias"), Some(vec![6]));

        assert_eq!(find("layer1.0.downsample.0.weight"), None);
        assert_eq!(find("layer3.6.conv1.weight"), None);
        assert_eq!(find("fc.weight"), None);
    }

    #[test]
    fn parameter_names_are_unique() {
        let specs = parameter_specs(NUM_CLASSES);
        let mut names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), specs.len());
    }

    #[test]
    fn zero_network_outputs_uniform_distribution() {
        let classifier = zero_classifier();
        let probs = classifier.classify(&small_input()).unwrap();

        for (_, p) in probs.iter() {
            assert!((p - 1.0 / NUM_CLASSES as f32).abs() < 1e-5);
        }
        // All tied: the first class wins.
        assert_eq!(probs.top().0, ClassLabel::UltraCloudy);
    }

    #[test]
    fn logits_have_one_row_per_class() {
        let logits = zero_classifier().logits(&small_input()).unwrap();
        assert_eq!(logits.dims(), &[1, NUM_CLASSES]);
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let input = InputTensor::from_array(Array4::zeros((1, 1, 32, 32)));
        let err = zero_classifier().classify(&input).unwrap_err();
        assert!(matches!(err, ModelError::Inference(_)));
    }

    #[test]
    fn rejects_batches_larger_than_one() {
        let input = InputTensor::from_array(Array4::zeros((2, 3, 32, 32)));
        assert!(zero_classifier().classify(&input).is_err());
    }

    #[test]
    fn load_missing_weights_fails() {
        let err = ResNetClassifier::load(Path::new("missing/best_turbidity_model.pth"), &Device::Cpu)
            .err()
            .unwrap();
        assert!(matches!(err, ModelError::WeightsNotFound(_)));
    }

    #[test]
    fn loads_distributed_checkpoint_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let mut weights = zero_weights("module.");
        weights.insert(
            "module.bn1.num_batches_tracked".into(),
            Tensor::zeros((), DType::I64, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&weights, &path).unwrap();

        let classifier = ResNetClassifier::load(&path, &Device::Cpu).unwrap();
        let probs = classifier.classify(&small_input()).unwrap();
        let total: f32 = probs.as_array().iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn load_rejects_wrong_class_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let mut weights = zero_weights("");
        weights.insert(
            "fc.4.weight".into(),
            Tensor::zeros((5, HEAD_HIDDEN_DIM), DType::F32, &Device::Cpu).unwrap(),
        );
        weights.insert(
            "fc.4.bias".into(),
            Tensor::zeros(5, DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&weights, &path).unwrap();

        let err = ResNetClassifier::load(&path, &Device::Cpu).err().unwrap();
        let msg = err.to_string();
        assert!(matches!(err, ModelError::IncompatibleCheckpoint(_)));
        assert!(msg.contains("fc.4.weight"), "{msg}");
    }

    #[test]
    fn load_rejects_stock_imagenet_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let mut weights = zero_weights("");
        weights.retain(|k, _| !k.starts_with("fc."));
        weights.insert(
            "fc.weight".into(),
            Tensor::zeros((1000, FEATURE_DIM), DType::F32, &Device::Cpu).unwrap(),
        );
        weights.insert(
            "fc.bias".into(),
            Tensor::zeros(1000, DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&weights, &path).unwrap();

        let msg = ResNetClassifier::load(&path, &Device::Cpu)
            .err()
            .unwrap()
            .to_string();
        assert!(msg.contains("missing keys"), "{msg}");
        assert!(msg.contains("unexpected keys: fc.bias, fc.weight"), "{msg}");
    }
}
