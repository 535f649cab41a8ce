pub mod classifier;
pub mod colormap;
pub mod font;
pub mod overlay;
pub mod preprocess;
pub mod saliency;

use image::RgbImage;
use std::sync::Arc;

use classifier::{Classifier, ClassifierError, Prediction};
use overlay::{OverlayImage, OverlayRenderer};
use preprocess::preprocess_image;

pub struct Analysis {
    pub prediction: Prediction,
    pub intensity: f32,
    pub overlay: Option<OverlayImage>,
}

/// Process-wide prediction context: the loaded classifier and the renderer.
#[derive(Clone)]
pub struct Pipeline {
    classifier: Arc<dyn Classifier>,
    renderer: Arc<OverlayRenderer>,
}

impl Pipeline {
    pub fn new(classifier: Arc<dyn Classifier>, renderer: OverlayRenderer) -> Self {
        Self {
            classifier,
            renderer: Arc::new(renderer),
        }
    }

    /// Fails only when inference itself fails; saliency and rendering problems
    /// leave `overlay` empty.
    pub fn analyze(&self, image: &RgbImage) -> Result<Analysis, ClassifierError> {
        let input = preprocess_image(image);
        let prediction = self.classifier.classify(&input)?;
        log::info!(
            "Prediction: {} (p={:.4}, confidence={:.4})",
            prediction.label,
            prediction.probability,
            prediction.confidence
        );

        let saliency = saliency::extract(&input, self.classifier.as_ref());
        let overlay = saliency.map.as_ref().map(|map| {
            self.renderer.render(
                image,
                map,
                prediction.label,
                prediction.confidence * 100.0,
                saliency.intensity,
            )
        });
        if let Some(overlay) = &overlay {
            log::debug!("Overlay rendered with {} ROI boxes", overlay.regions.len());
        }

        Ok(Analysis {
            prediction,
            intensity: saliency.intensity,
            overlay,
        })
    }
}
