use ndarray::Array3;
use shared::Label;
use std::path::PathBuf;
use std::sync::Mutex;
use tch::{CModule, Device, Kind, Tensor};

use super::preprocess::{INPUT_SIZE, NormalizedTensor};

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Model artifact not found at {0}")]
    ModelMissing(PathBuf),
    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),
    #[error("Model lock poisoned")]
    Poisoned,
    #[error("Invalid model output: {0}")]
    InvalidOutput(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: Label,
    pub probability: f32,
    pub confidence: f32,
}

impl Prediction {
    pub fn from_probability(probability: f32) -> Self {
        let label = Label::from_probability(probability);
        let confidence = match label {
            Label::Pneumonia => probability,
            Label::Normal => 1.0 - probability,
        };
        Self {
            label,
            probability,
            confidence,
        }
    }
}

/// Activations of the last convolutional stage (`H x W x C`) and the gradient
/// of the Pneumonia score with respect to them, in the same layout.
#[derive(Debug, Clone)]
pub struct ConvTrace {
    pub activations: Array3<f32>,
    pub gradients: Array3<f32>,
}

pub trait Classifier: Send + Sync {
    /// Sigmoid probability of Pneumonia.
    fn predict(&self, input: &NormalizedTensor) -> Result<f32, ClassifierError>;

    /// `Ok(None)` when the model exposes no convolutional stage.
    fn conv_trace(&self, input: &NormalizedTensor) -> Result<Option<ConvTrace>, ClassifierError>;

    fn classify(&self, input: &NormalizedTensor) -> Result<Prediction, ClassifierError> {
        let probability = self.predict(input)?;
        if !(0.0..=1.0).contains(&probability) {
            return Err(ClassifierError::InvalidOutput(format!(
                "probability {} is outside [0, 1]",
                probability
            )));
        }
        Ok(Prediction::from_probability(probability))
    }
}

/// Named methods of the exported TorchScript module that split the network at
/// its last convolutional stage: `features(image) -> activations` and
/// `head(activations) -> score`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvStage {
    pub features: String,
    pub head: String,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub model_path: PathBuf,
    pub conv_stage: Option<ConvStage>,
    /// Feed NCHW instead of NHWC to the module.
    pub channels_first: bool,
}

pub struct TorchClassifier {
    module: Mutex<CModule>,
    device: Device,
    conv_stage: Option<ConvStage>,
    channels_first: bool,
}

impl TorchClassifier {
    pub fn load(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        if !config.model_path.exists() {
            return Err(ClassifierError::ModelMissing(config.model_path.clone()));
        }
        let device = Device::cuda_if_available();
        let mut module = CModule::load_on_device(&config.model_path, device)?;
        module.set_eval();
        log::info!(
            "Loaded classifier from {} on {:?}",
            config.model_path.display(),
            device
        );
        match &config.conv_stage {
            Some(stage) => log::info!(
                "Saliency uses conv stage methods '{}' / '{}'",
                stage.features,
                stage.head
            ),
            None => log::warn!("No conv stage configured, overlays are disabled"),
        }
        Ok(Self {
            module: Mutex::new(module),
            device,
            conv_stage: config.conv_stage.clone(),
            channels_first: config.channels_first,
        })
    }

    fn to_input(&self, input: &NormalizedTensor) -> Result<Tensor, ClassifierError> {
        let side = INPUT_SIZE as i64;
        let tensor = Tensor::from_slice(&input.to_vec())
            .f_view([1, side, side, 3])?
            .to_device(self.device);
        if self.channels_first {
            Ok(tensor.f_permute([0, 3, 1, 2])?.contiguous())
        } else {
            Ok(tensor)
        }
    }

    fn scalar(output: &Tensor) -> Result<f32, ClassifierError> {
        let flat = output.to_kind(Kind::Float).f_view([-1])?;
        if flat.size()[0] < 1 {
            return Err(ClassifierError::InvalidOutput("empty output".to_string()));
        }
        Ok(flat.f_double_value(&[0])? as f32)
    }
}

/// `[1, C, H, W]` (or `[1, H, W, C]` for channels-last models) into `H x W x C`.
fn to_hwc(tensor: &Tensor, channels_first: bool) -> Result<Array3<f32>, ClassifierError> {
    let size = tensor.size();
    if size.len() != 4 || size[0] != 1 {
        return Err(ClassifierError::InvalidOutput(format!(
            "expected a single 4-D activation map, got {:?}",
            size
        )));
    }
    let hwc = if channels_first {
        tensor.f_squeeze_dim(0)?.f_permute([1, 2, 0])?
    } else {
        tensor.f_squeeze_dim(0)?
    };
    let hwc = hwc.to_kind(Kind::Float).to_device(Device::Cpu).contiguous();
    let dims = hwc.size();
    let (h, w, c) = (dims[0] as usize, dims[1] as usize, dims[2] as usize);
    let mut values = vec![0.0f32; h * w * c];
    hwc.f_copy_data(&mut values, h * w * c)?;
    Array3::from_shape_vec((h, w, c), values)
        .map_err(|e| ClassifierError::InvalidOutput(e.to_string()))
}

impl Classifier for TorchClassifier {
    fn predict(&self, input: &NormalizedTensor) -> Result<f32, ClassifierError> {
        let tensor = self.to_input(input)?;
        let module = self.module.lock().map_err(|_| ClassifierError::Poisoned)?;
        let output = tch::no_grad(|| module.forward_ts(&[tensor]))?;
        Self::scalar(&output)
    }

    fn conv_trace(&self, input: &NormalizedTensor) -> Result<Option<ConvTrace>, ClassifierError> {
        let Some(stage) = &self.conv_stage else {
            return Ok(None);
        };
        let tensor = self.to_input(input)?;
        let module = self.module.lock().map_err(|_| ClassifierError::Poisoned)?;

        let activations = module
            .method_ts(&stage.features, &[tensor])?
            .detach()
            .set_requires_grad(true);
        let score = module.method_ts(&stage.head, &[&activations])?;
        let score = score.f_view([-1])?.f_get(0)?;
        let mut grads = Tensor::f_run_backward(&[&score], &[&activations], false, false)?;
        let gradients = grads
            .pop()
            .filter(|g| g.defined())
            .ok_or_else(|| ClassifierError::InvalidOutput("no gradient flow".to_string()))?;

        Ok(Some(ConvTrace {
            activations: to_hwc(&activations.detach(), self.channels_first)?,
            gradients: to_hwc(&gradients, self.channels_first)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_probability_is_confident_normal() {
        let prediction = Prediction::from_probability(0.2);
        assert_eq!(prediction.label, Label::Normal);
        assert!((prediction.confidence - 0.8).abs() < 1e-6);
        assert_eq!(shared::to_percent(prediction.confidence), 80.0);
    }

    #[test]
    fn high_probability_is_pneumonia() {
        let prediction = Prediction::from_probability(0.93);
        assert_eq!(prediction.label, Label::Pneumonia);
        assert_eq!(shared::to_percent(prediction.confidence), 93.0);
    }

    #[test]
    fn confidence_stays_in_upper_half() {
        for i in 0..=100 {
            let prediction = Prediction::from_probability(i as f32 / 100.0);
            assert!((0.5..=1.0).contains(&prediction.confidence));
            assert_eq!(prediction.label == Label::Pneumonia, prediction.probability > 0.5);
        }
    }

    #[test]
    fn exactly_half_maps_to_normal() {
        let prediction = Prediction::from_probability(0.5);
        assert_eq!(prediction.label, Label::Normal);
        assert_eq!(prediction.confidence, 0.5);
    }

    #[test]
    fn missing_artifact_is_reported_before_loading() {
        let config = ClassifierConfig {
            model_path: PathBuf::from("/nonexistent/model.pt"),
            conv_stage: None,
            channels_first: true,
        };
        let err = TorchClassifier::load(&config).err().unwrap();
        assert!(matches!(err, ClassifierError::ModelMissing(_)));
    }

    struct Fixed(f32);

    impl Classifier for Fixed {
        fn predict(&self, _input: &NormalizedTensor) -> Result<f32, ClassifierError> {
            Ok(self.0)
        }

        fn conv_trace(&self, _input: &NormalizedTensor) -> Result<Option<ConvTrace>, ClassifierError> {
            Ok(None)
        }
    }

    #[test]
    fn nan_probability_is_rejected() {
        let input = super::super::preprocess::preprocess_image(&image::RgbImage::new(4, 4));
        assert!(matches!(
            Fixed(f32::NAN).classify(&input),
            Err(ClassifierError::InvalidOutput(_))
        ));
        assert_eq!(Fixed(0.7).classify(&input).unwrap().label, Label::Pneumonia);
    }

    #[test]
    fn out_of_range_probability_is_rejected() {
        let input = super::super::preprocess::preprocess_image(&image::RgbImage::new(4, 4));
        for raw in [3.2, -0.1, f32::INFINITY] {
            assert!(matches!(
                Fixed(raw).classify(&input),
                Err(ClassifierError::InvalidOutput(_))
            ));
        }
        assert_eq!(Fixed(1.0).classify(&input).unwrap().confidence, 1.0);
        assert_eq!(Fixed(0.0).classify(&input).unwrap().label, Label::Normal);
    }
}
