//! Grad-CAM saliency over the classifier's last convolutional stage.

use ndarray::{Array2, ArrayView3, Axis};

use super::classifier::{Classifier, ClassifierError};
use super::preprocess::NormalizedTensor;

#[derive(Debug, thiserror::Error)]
pub enum SaliencyError {
    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("Activation shape {activations:?} does not match gradient shape {gradients:?}")]
    ShapeMismatch {
        activations: Vec<usize>,
        gradients: Vec<usize>,
    },
    #[error("Empty activation map")]
    Empty,
    #[error("Non-finite values in weighted activation map")]
    NonFinite,
}

/// Normalized saliency, values in `[0, 1]`, at the conv stage's resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyMap {
    values: Array2<f32>,
}

impl SaliencyMap {
    /// Clamps negatives to zero and divides by the maximum. A map with no
    /// positive value becomes all zeros.
    pub fn normalize(raw: Array2<f32>) -> Result<Self, SaliencyError> {
        if raw.is_empty() {
            return Err(SaliencyError::Empty);
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(SaliencyError::NonFinite);
        }
        let clamped = raw.mapv(|v| v.max(0.0));
        let max = clamped.fold(0.0f32, |acc, &v| acc.max(v));
        let values = if max > 0.0 {
            clamped.mapv(|v| (v / max).min(1.0))
        } else {
            Array2::zeros(clamped.raw_dim())
        };
        Ok(Self { values })
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    /// `(height, width)`.
    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn intensity(&self) -> f32 {
        self.values.mean().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct Saliency {
    pub map: Option<SaliencyMap>,
    pub intensity: f32,
}

impl Saliency {
    pub fn unavailable() -> Self {
        Self {
            map: None,
            intensity: 0.0,
        }
    }
}

pub fn grad_cam(
    activations: ArrayView3<'_, f32>,
    gradients: ArrayView3<'_, f32>,
) -> Result<SaliencyMap, SaliencyError> {
    if activations.shape() != gradients.shape() {
        return Err(SaliencyError::ShapeMismatch {
            activations: activations.shape().to_vec(),
            gradients: gradients.shape().to_vec(),
        });
    }
    // (H, W, C) -> (C)
    let weights = gradients
        .mean_axis(Axis(0))
        .and_then(|per_row| per_row.mean_axis(Axis(0)))
        .ok_or(SaliencyError::Empty)?;
    let weighted = (&activations * &weights).sum_axis(Axis(2));
    SaliencyMap::normalize(weighted)
}

fn try_extract(
    input: &NormalizedTensor,
    classifier: &dyn Classifier,
) -> Result<Option<SaliencyMap>, SaliencyError> {
    match classifier.conv_trace(input)? {
        Some(trace) => grad_cam(trace.activations.view(), trace.gradients.view()).map(Some),
        None => Ok(None),
    }
}

/// Best effort: every failure degrades to no map and zero intensity.
pub fn extract(input: &NormalizedTensor, classifier: &dyn Classifier) -> Saliency {
    match try_extract(input, classifier) {
        Ok(Some(map)) => {
            let intensity = map.intensity();
            Saliency {
                map: Some(map),
                intensity,
            }
        }
        Ok(None) => {
            log::debug!("Classifier has no convolutional stage, skipping saliency");
            Saliency::unavailable()
        }
        Err(e) => {
            log::warn!("Saliency unavailable: {}", e);
            Saliency::unavailable()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classifier::ConvTrace;
    use crate::pipeline::preprocess::preprocess_image;
    use image::RgbImage;
    use ndarray::{Array3, array};

    struct Traced(Result<Option<ConvTrace>, ()>);

    impl Classifier for Traced {
        fn predict(&self, _input: &NormalizedTensor) -> Result<f32, ClassifierError> {
            Ok(0.9)
        }

        fn conv_trace(&self, _input: &NormalizedTensor) -> Result<Option<ConvTrace>, ClassifierError> {
            self.0
                .clone()
                .map_err(|_| ClassifierError::InvalidOutput("no gradient flow".to_string()))
        }
    }

    fn input() -> NormalizedTensor {
        preprocess_image(&RgbImage::new(8, 8))
    }

    #[test]
    fn channels_are_weighted_by_mean_gradient() {
        // Channel 0 has gradient 1, channel 1 has gradient -1.
        let activations = Array3::from_shape_fn((2, 2, 2), |(y, x, c)| {
            if c == 0 { (y * 2 + x) as f32 } else { 1.0 }
        });
        let gradients = Array3::from_shape_fn((2, 2, 2), |(_, _, c)| if c == 0 { 1.0 } else { -1.0 });
        let map = grad_cam(activations.view(), gradients.view()).unwrap();
        // raw = [[-1, 0], [1, 2]] -> clamp -> [[0, 0], [1, 2]] -> / 2
        assert_eq!(map.values(), &array![[0.0, 0.0], [0.5, 1.0]]);
        assert!((map.intensity() - 0.375).abs() < 1e-6);
    }

    #[test]
    fn non_positive_map_normalizes_to_zeros() {
        let raw = array![[-3.0, -1.0], [0.0, -0.5]];
        let map = SaliencyMap::normalize(raw).unwrap();
        assert!(map.values().iter().all(|&v| v == 0.0));
        assert_eq!(map.intensity(), 0.0);
    }

    #[test]
    fn values_stay_in_unit_range() {
        let raw = Array2::from_shape_fn((7, 7), |(y, x)| (y as f32 - 3.0) * (x as f32 + 0.25));
        let map = SaliencyMap::normalize(raw).unwrap();
        assert!(map.values().iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(map.values().fold(0.0f32, |a, &v| a.max(v)), 1.0);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let activations = Array3::<f32>::zeros((2, 2, 3));
        let gradients = Array3::<f32>::zeros((2, 2, 4));
        assert!(matches!(
            grad_cam(activations.view(), gradients.view()),
            Err(SaliencyError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn nan_activations_are_rejected() {
        let raw = array![[f32::NAN, 1.0]];
        assert!(matches!(SaliencyMap::normalize(raw), Err(SaliencyError::NonFinite)));
    }

    #[test]
    fn missing_conv_stage_yields_no_map() {
        let saliency = extract(&input(), &Traced(Ok(None)));
        assert!(saliency.map.is_none());
        assert_eq!(saliency.intensity, 0.0);
    }

    #[test]
    fn gradient_failure_degrades_silently() {
        let saliency = extract(&input(), &Traced(Err(())));
        assert!(saliency.map.is_none());
        assert_eq!(saliency.intensity, 0.0);
    }

    #[test]
    fn extract_reports_mean_intensity() {
        let trace = ConvTrace {
            activations: Array3::from_elem((4, 4, 1), 2.0),
            gradients: Array3::from_elem((4, 4, 1), 0.5),
        };
        let saliency = extract(&input(), &Traced(Ok(Some(trace))));
        let map = saliency.map.unwrap();
        assert_eq!(map.dim(), (4, 4));
        assert_eq!(saliency.intensity, 1.0);
    }
}
