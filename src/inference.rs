//! Serving contract: load a trained model directory, decode a request body, predict,
//! and encode the response.

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    prelude::*,
    record::CompactRecorder,
    tensor::activation::softmax,
};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    checkpoint::{CONFIG_FILE, MODEL_FILE},
    error::{Error, Result},
    mapping::{BreedMapping, CLASSES_FILE},
    model::Model,
    training::TrainingConfig,
    transform::EvalTransform,
};

pub const IMAGE_CONTENT_TYPE: &str = "application/x-image";
pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const TOP_K: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreedScore {
    pub breed: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub breed: String,
    pub confidence: f32,
    pub top_breeds: Vec<BreedScore>,
}

impl Prediction {
    /// Ranks class probabilities; ties keep the lower class index first.
    pub fn from_probabilities(
        probabilities: &[f32],
        mapping: &BreedMapping,
        k: usize,
    ) -> Result<Self> {
        let mut ranked: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let top_breeds = ranked
            .iter()
            .take(k.min(mapping.len()))
            .map(|&(idx, confidence)| {
                Ok(BreedScore {
                    breed: mapping.label(idx)?.to_string(),
                    confidence,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let best = top_breeds
            .first()
            .cloned()
            .ok_or_else(|| Error::Inference("model produced no scores".to_string()))?;

        Ok(Self {
            breed: best.breed,
            confidence: best.confidence,
            top_breeds,
        })
    }
}

/// Decodes an `application/x-image` body into an RGB image.
pub fn decode_request(body: &[u8], content_type: &str) -> Result<DynamicImage> {
    if content_type != IMAGE_CONTENT_TYPE {
        return Err(Error::UnsupportedContentType(content_type.to_string()));
    }
    let image = image::load_from_memory(body)
        .map_err(|e| Error::Inference(format!("cannot decode request image: {e}")))?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// Serializes a prediction; returns the body and its content type.
pub fn encode_response(prediction: &Prediction, accept: &str) -> Result<(String, String)> {
    if accept != JSON_CONTENT_TYPE {
        return Err(Error::UnsupportedAccept(accept.to_string()));
    }
    Ok((serde_json::to_string(prediction)?, accept.to_string()))
}

/// A trained model together with its breed table.
pub struct BreedClassifier<B: Backend> {
    model: Model<B>,
    mapping: BreedMapping,
    transform: EvalTransform,
    device: B::Device,
}

impl<B: Backend> BreedClassifier<B> {
    pub fn new(model: Model<B>, mapping: BreedMapping, device: B::Device) -> Self {
        Self {
            model,
            mapping,
            transform: EvalTransform::inference(),
            device,
        }
    }

    /// Rebuilds the architecture recorded in `config.json` and loads the best weights.
    pub fn load(model_dir: &Path, device: B::Device) -> Result<Self> {
        let mapping = BreedMapping::read_json(&model_dir.join(CLASSES_FILE))?;
        let config = TrainingConfig::load(model_dir.join(CONFIG_FILE))
            .map_err(|e| Error::Inference(format!("cannot read {CONFIG_FILE}: {e:?}")))?;

        if config.model.classes != mapping.len() {
            return Err(Error::Inference(format!(
                "model has {} outputs but {} classes are listed",
                config.model.classes,
                mapping.len()
            )));
        }

        let model = config.model.init::<B>(&device).load_file(
            model_dir.join(MODEL_FILE),
            &CompactRecorder::new(),
            &device,
        )?;
        info!(classes = mapping.len(), dir = %model_dir.display(), "model loaded");

        Ok(Self::new(model, mapping, device))
    }

    pub fn probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let pixels = self.transform.apply(image);
        let (channels, height, width) = pixels.dim();
        let input = Tensor::<B, 4>::from_data(
            TensorData::new(pixels.iter().copied().collect::<Vec<f32>>(), [1, channels, height, width])
                .convert::<B::FloatElem>(),
            &self.device,
        );

        softmax(self.model.forward(input), 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::Inference(format!("{e:?}")))
    }

    pub fn predict(&self, image: &DynamicImage) -> Result<Prediction> {
        Prediction::from_probabilities(&self.probabilities(image)?, &self.mapping, TOP_K)
    }

    /// Full request cycle: decode, predict, encode.
    pub fn handle(&self, body: &[u8], content_type: &str, accept: &str) -> Result<(String, String)> {
        let image = decode_request(body, content_type)?;
        encode_response(&self.predict(&image)?, accept)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb, RgbImage};

    use super::*;

    fn mapping() -> BreedMapping {
        BreedMapping::new(["Bengal", "Birman", "Bombay"].map(String::from).to_vec())
    }

    #[test]
    fn ranks_and_caps_top_k() {
        let prediction = Prediction::from_probabilities(&[0.2, 0.5, 0.3], &mapping(), 5).unwrap();
        assert_eq!(prediction.breed, "Birman");
        assert_eq!(prediction.confidence, 0.5);
        let order: Vec<&str> = prediction.top_breeds.iter().map(|b| b.breed.as_str()).collect();
        assert_eq!(order, vec!["Birman", "Bombay", "Bengal"]);

        let top_one = Prediction::from_probabilities(&[0.2, 0.5, 0.3], &mapping(), 1).unwrap();
        assert_eq!(top_one.top_breeds.len(), 1);
    }

    #[test]
    fn rejects_other_content_types() {
        assert!(matches!(
            decode_request(b"{}", "application/json"),
            Err(Error::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn decodes_png_body() {
        let mut body = Vec::new();
        RgbImage::from_pixel(3, 2, Rgb([1, 2, 3]))
            .write_to(&mut Cursor::new(&mut body), ImageFormat::Png)
            .unwrap();
        let image = decode_request(&body, IMAGE_CONTENT_TYPE).unwrap();
        assert_eq!((image.width(), image.height()), (3, 2));
    }

    #[test]
    fn response_is_json_only() {
        let prediction = Prediction::from_probabilities(&[0.9, 0.05, 0.05], &mapping(), 5).unwrap();
        let (body, content_type) = encode_response(&prediction, JSON_CONTENT_TYPE).unwrap();
        assert_eq!(content_type, JSON_CONTENT_TYPE);

        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["breed"], "Bengal");
        assert_eq!(parsed["top_breeds"].as_array().unwrap().len(), 3);

        assert!(matches!(
            encode_response(&prediction, "text/csv"),
            Err(Error::UnsupportedAccept(_))
        ));
    }
}
