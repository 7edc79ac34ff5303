//! OCR (Optical Character Recognition) module
//!
//! Uses PaddleOCR models via ONNX Runtime for text detection and recognition.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ndarray::{ArrayView3, Axis, Ix3, Ix4};
use ort::{inputs, value::TensorRef};
use std::path::Path;
use std::time::Instant;
use tracing::debug;

use super::models::{ModelManager, ModelType, OnnxSession};
use super::postprocess::{boxes_from_bitmap, ctc_decode, load_character_dict, DbParams, TextBox};
use super::preprocess::{
    crop_polygon, preprocess_for_detection, preprocess_for_recognition, rgb_from_array, PreprocessConfig,
};
use super::{Acceleration, Detection};
use crate::render::Point;

/// Where an engine's sessions should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    /// GPU when an execution provider is available, CPU otherwise
    PreferGpu,
}

/// OCR engine using PaddleOCR via ONNX Runtime
pub struct OcrEngine {
    /// Text detection session (DBNet)
    detector: OnnxSession,
    /// Text recognition session (CRNN)
    recognizer: OnnxSession,
    /// CTC labels, blank first
    characters: Vec<String>,
    preprocess: PreprocessConfig,
    db_params: DbParams,
}

impl OcrEngine {
    /// Initialize OCR engine from the files cached by a model manager
    pub fn from_manager(
        models: &ModelManager,
        device: Device,
        preprocess: PreprocessConfig,
        db_params: DbParams,
    ) -> Result<Self> {
        let det_path = models.require_model(ModelType::Detection)?;
        let rec_path = models.require_model(ModelType::Recognition)?;
        let dict_path = models.require_model(ModelType::Dictionary)?;

        Self::new(&det_path, &rec_path, &dict_path, device, preprocess, db_params)
    }

    /// Initialize OCR engine with model paths
    pub fn new(
        detection_model: &Path,
        recognition_model: &Path,
        character_dict: &Path,
        device: Device,
        preprocess: PreprocessConfig,
        db_params: DbParams,
    ) -> Result<Self> {
        let load = |path: &Path| match device {
            Device::Cpu => OnnxSession::new(path),
            Device::PreferGpu => OnnxSession::new_with_gpu(path),
        };

        let detector = load(detection_model).context("Failed to load text detection model")?;
        let recognizer = load(recognition_model).context("Failed to load text recognition model")?;

        let dict = std::fs::read_to_string(character_dict)
            .with_context(|| format!("Failed to read character dictionary {:?}", character_dict))?;
        let characters = load_character_dict(&dict);
        debug!("Loaded {} recognition labels", characters.len());

        Ok(Self {
            detector,
            recognizer,
            characters,
            preprocess,
            db_params,
        })
    }

    /// Hardware the detection session runs on
    pub fn acceleration(&self) -> &Acceleration {
        self.detector.acceleration()
    }

    /// Run OCR on an `(H, W, C)` pixel array
    pub fn recognize(&mut self, image: ArrayView3<u8>) -> Result<Vec<Detection>> {
        let start = Instant::now();
        let rgb = rgb_from_array(image)?;

        let boxes = self.detect(&rgb)?;
        let detect_time = start.elapsed();

        let mut detections = Vec::with_capacity(boxes.len());
        for text_box in boxes {
            let Some(crop) = crop_polygon(&rgb, &text_box.points) else {
                continue;
            };
            let (text, confidence) = self.read_line(&crop)?;
            debug!("Read {:?} (box score {:.2}, confidence {:.2})", text, text_box.score, confidence);

            detections.push(Detection {
                // Truncate like an integer cast of the float corners
                polygon: text_box.points.iter().map(|&(x, y)| Point::new(x as i32, y as i32)).collect(),
                text,
                confidence,
            });
        }

        debug!(
            "OCR found {} regions (detection {:?}, total {:?})",
            detections.len(),
            detect_time,
            start.elapsed()
        );

        Ok(detections)
    }

    /// Detection stage: probability map to boxes in source coordinates
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<TextBox>> {
        let input = preprocess_for_detection(image, &self.preprocess);
        debug!("Detection input {}x{}", input.width, input.height);

        let tensor = TensorRef::from_array_view(input.tensor.view())?;
        let outputs = self
            .detector
            .session_mut()
            .run(inputs![tensor])
            .context("Detection inference failed")?;

        // Output shape: [1, 1, H, W]
        let pred = outputs[0]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()
            .map_err(|e| anyhow!("Unexpected detection output shape: {e}"))?;
        let pred = pred.index_axis_move(Axis(0), 0).index_axis_move(Axis(0), 0);

        Ok(boxes_from_bitmap(pred, image.dimensions(), &self.db_params))
    }

    /// Recognition stage for one cropped line
    fn read_line(&mut self, crop: &RgbImage) -> Result<(String, f32)> {
        let input = preprocess_for_recognition(crop, &self.preprocess);

        let tensor = TensorRef::from_array_view(input.view())?;
        let outputs = self
            .recognizer
            .session_mut()
            .run(inputs![tensor])
            .context("Recognition inference failed")?;

        // Output shape: [1, T, C]
        let preds = outputs[0]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix3>()
            .map_err(|e| anyhow!("Unexpected recognition output shape: {e}"))?;
        let preds = preds.index_axis_move(Axis(0), 0);

        Ok(ctc_decode(preds, &self.characters))
    }
}
