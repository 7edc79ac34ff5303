//! Mode Dispatcher
//!
//! Turns one page interaction (selected mode plus optional upload) into the
//! view to render. Nothing survives between calls; every interaction starts
//! from the request alone.

use anyhow::{Context, Result};
use image::DynamicImage;
use ndarray::Array3;
use std::str::FromStr;
use tracing::{debug, info};

use crate::render::{draw_polyline, image_to_array, RenderError, RenderSettings};
use crate::vision::{Acceleration, Detection, ReadOptions, Recognizer};

/// Application mode chosen in the sidebar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Print the recognized text
    #[default]
    Extraction,
    /// Draw detected regions on the image
    Detection,
}

impl Mode {
    /// Sidebar order
    pub const ALL: [Mode; 2] = [Mode::Extraction, Mode::Detection];

    /// Sidebar label
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Extraction => "Text Extraction",
            Mode::Detection => "Text Detection",
        }
    }

    /// Form value
    pub fn slug(&self) -> &'static str {
        match self {
            Mode::Extraction => "extraction",
            Mode::Detection => "detection",
        }
    }

    /// Page heading
    pub fn title(&self) -> &'static str {
        match self {
            Mode::Extraction => "Image Text Extraction App",
            Mode::Detection => "Text Detection and Bounding Boxes App",
        }
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .into_iter()
            .find(|m| s.eq_ignore_ascii_case(m.slug()) || s == m.label())
            .ok_or_else(|| anyhow::anyhow!("Unknown app mode '{}'", s))
    }
}

/// A decoded upload
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub image: DynamicImage,
}

/// Everything one interaction needs
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub mode: Mode,
    pub upload: Option<Upload>,
}

/// Settings the dispatcher reads, passed in per request
#[derive(Debug, Clone, Default)]
pub struct DispatchSettings {
    /// Languages handed to the recognizer
    pub languages: Vec<String>,
    /// Bounding box appearance
    pub render: RenderSettings,
}

/// An image shown on the page
#[derive(Debug, Clone)]
pub struct DisplayImage {
    pub caption: String,
    pub image: DynamicImage,
}

/// What the page should show
#[derive(Debug, Clone)]
pub struct PageView {
    pub mode: Mode,
    pub title: &'static str,
    pub images: Vec<DisplayImage>,
    /// Extracted text (extraction mode only)
    pub text: Option<String>,
    /// Informational message, e.g. GPU fallback
    pub notice: Option<String>,
}

impl PageView {
    /// The page with no upload yet
    pub fn empty(mode: Mode) -> Self {
        Self {
            mode,
            title: mode.title(),
            images: vec![],
            text: None,
            notice: None,
        }
    }
}

/// Handle one interaction
pub fn handle_request(
    request: PageRequest,
    recognizer: &mut dyn Recognizer,
    settings: &DispatchSettings,
) -> Result<PageView> {
    let mut view = PageView::empty(request.mode);

    let Some(upload) = request.upload else {
        return Ok(view);
    };

    info!("Processing {:?} upload in {:?} mode", upload.filename, request.mode);

    let img_array = image_to_array(&upload.image);
    view.images.push(DisplayImage {
        caption: "Uploaded Image".to_string(),
        image: upload.image,
    });

    match request.mode {
        Mode::Extraction => {
            let options = ReadOptions {
                languages: settings.languages.clone(),
                prefer_gpu: false,
            };
            let recognition = recognizer.read_text(img_array.view(), &options)?;
            view.text = Some(extract_text(&recognition.detections));
        }
        Mode::Detection => {
            let options = ReadOptions {
                languages: settings.languages.clone(),
                prefer_gpu: true,
            };
            let recognition = recognizer.read_text(img_array.view(), &options)?;

            if recognition.acceleration == Acceleration::CpuFallback {
                view.notice = Some("GPU acceleration unavailable; detection ran on the CPU.".to_string());
            }

            let boxed = draw_detections(img_array, &recognition.detections, &settings.render)?;
            view.images.push(DisplayImage {
                caption: "Text Detection with Bounding Boxes".to_string(),
                image: crate::render::array_to_image(&boxed).context("Failed to build result image")?,
            });
        }
    }

    Ok(view)
}

/// Join recognized text with single spaces, in detection order
pub fn extract_text(detections: &[Detection]) -> String {
    detections
        .iter()
        .map(|d| d.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Draw every detection's closed polygon, threading the image through each call
pub fn draw_detections(
    image: Array3<u8>,
    detections: &[Detection],
    settings: &RenderSettings,
) -> Result<Array3<u8>, RenderError> {
    debug!("Drawing {} bounding boxes", detections.len());

    detections.iter().try_fold(image, |img, detection| {
        draw_polyline(&img, &detection.polygon, true, settings.color, settings.thickness)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{Color, Point};
    use crate::vision::Recognition;
    use image::{Rgb, RgbImage};
    use ndarray::ArrayView3;

    /// Recognizer returning canned detections and recording each call
    struct FakeRecognizer {
        detections: Vec<Detection>,
        acceleration: Acceleration,
        calls: Vec<ReadOptions>,
    }

    impl FakeRecognizer {
        fn new(detections: Vec<Detection>) -> Self {
            Self {
                detections,
                acceleration: Acceleration::Cpu,
                calls: vec![],
            }
        }
    }

    impl Recognizer for FakeRecognizer {
        fn read_text(&mut self, _image: ArrayView3<u8>, options: &ReadOptions) -> Result<Recognition> {
            self.calls.push(options.clone());
            Ok(Recognition {
                detections: self.detections.clone(),
                acceleration: self.acceleration.clone(),
            })
        }
    }

    fn detection(text: &str, points: &[(i32, i32)]) -> Detection {
        Detection {
            polygon: points.iter().map(|&p| Point::from(p)).collect(),
            text: text.to_string(),
            confidence: 0.9,
        }
    }

    fn hello() -> Detection {
        detection("HELLO", &[(10, 10), (50, 10), (50, 30), (10, 30)])
    }

    fn white_upload() -> Upload {
        Upload {
            filename: "blank.png".to_string(),
            image: DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]))),
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            languages: vec!["en".to_string()],
            render: RenderSettings::default(),
        }
    }

    fn request(mode: Mode) -> PageRequest {
        PageRequest {
            mode,
            upload: Some(white_upload()),
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("extraction".parse::<Mode>().unwrap(), Mode::Extraction);
        assert_eq!("Detection".parse::<Mode>().unwrap(), Mode::Detection);
        assert_eq!("Text Detection".parse::<Mode>().unwrap(), Mode::Detection);
        assert!("ocr".parse::<Mode>().is_err());
        assert_eq!(Mode::default(), Mode::Extraction);
    }

    #[test]
    fn test_extract_text_joins_in_order() {
        let detections = vec![
            detection("first", &[]),
            detection("second", &[]),
            detection("third", &[]),
        ];
        assert_eq!(extract_text(&detections), "first second third");
        assert_eq!(extract_text(&[]), "");
    }

    #[test]
    fn test_no_upload_renders_empty_page() {
        let mut recognizer = FakeRecognizer::new(vec![hello()]);
        let view = handle_request(
            PageRequest {
                mode: Mode::Detection,
                upload: None,
            },
            &mut recognizer,
            &settings(),
        )
        .unwrap();

        assert_eq!(view.title, "Text Detection and Bounding Boxes App");
        assert!(view.images.is_empty());
        assert!(view.text.is_none());
        assert!(recognizer.calls.is_empty());
    }

    #[test]
    fn test_extraction_of_blank_image_is_empty_string() {
        let mut recognizer = FakeRecognizer::new(vec![]);
        let view = handle_request(request(Mode::Extraction), &mut recognizer, &settings()).unwrap();

        assert_eq!(view.text.as_deref(), Some(""));
        assert_eq!(view.images.len(), 1);
        assert_eq!(view.images[0].caption, "Uploaded Image");
        assert_eq!(recognizer.calls.len(), 1);
        assert!(!recognizer.calls[0].prefer_gpu);
        assert_eq!(recognizer.calls[0].languages, vec!["en"]);
    }

    #[test]
    fn test_detection_of_blank_image_is_unchanged() {
        let mut recognizer = FakeRecognizer::new(vec![]);
        let view = handle_request(request(Mode::Detection), &mut recognizer, &settings()).unwrap();

        assert!(view.text.is_none());
        assert_eq!(view.images.len(), 2);
        assert_eq!(view.images[1].caption, "Text Detection with Bounding Boxes");
        assert_eq!(view.images[1].image.to_rgb8(), white_upload().image.to_rgb8());
        assert!(recognizer.calls[0].prefer_gpu);
    }

    #[test]
    fn test_extraction_shows_recognized_text() {
        let mut recognizer = FakeRecognizer::new(vec![hello()]);
        let view = handle_request(request(Mode::Extraction), &mut recognizer, &settings()).unwrap();

        assert_eq!(view.text.as_deref(), Some("HELLO"));
    }

    #[test]
    fn test_detection_draws_green_box() {
        let mut recognizer = FakeRecognizer::new(vec![hello()]);
        let view = handle_request(request(Mode::Detection), &mut recognizer, &settings()).unwrap();

        let result = view.images[1].image.to_rgb8();
        assert_eq!(result.get_pixel(30, 10), &Rgb([0, 255, 0]));
        assert_eq!(result.get_pixel(50, 20), &Rgb([0, 255, 0]));
        assert_eq!(result.get_pixel(30, 20), &Rgb([255, 255, 255]));
        // Two pixel top edge: rows 9 and 10 only
        assert_eq!(result.get_pixel(30, 9), &Rgb([0, 255, 0]));
        assert_eq!(result.get_pixel(30, 8), &Rgb([255, 255, 255]));
        assert_eq!(result.get_pixel(30, 11), &Rgb([255, 255, 255]));
        assert!(view.notice.is_none());
    }

    #[test]
    fn test_detection_draws_every_box_in_order() {
        let detections = vec![
            hello(),
            detection("WORLD", &[(20, 60), (80, 60), (80, 90), (20, 90)]),
            // Overlaps the first box; drawn last so its color wins
            detection("AGAIN", &[(30, 5), (45, 5), (45, 15), (30, 15)]),
        ];
        let mut settings = settings();
        settings.render.color = Color([255, 0, 0, 255]);

        let mut recognizer = FakeRecognizer::new(detections.clone());
        let view = handle_request(request(Mode::Detection), &mut recognizer, &settings).unwrap();

        let expected = detections.iter().fold(image_to_array(&white_upload().image), |img, d| {
            draw_polyline(&img, &d.polygon, true, settings.render.color, settings.render.thickness).unwrap()
        });
        assert_eq!(image_to_array(&view.images[1].image), expected);
        assert_eq!(recognizer.calls.len(), 1);
    }

    #[test]
    fn test_gpu_fallback_is_surfaced() {
        let mut recognizer = FakeRecognizer::new(vec![]);
        recognizer.acceleration = Acceleration::CpuFallback;

        let view = handle_request(request(Mode::Detection), &mut recognizer, &settings()).unwrap();
        assert!(view.notice.unwrap().contains("GPU"));
    }

    #[test]
    fn test_recognizer_errors_propagate() {
        struct Broken;
        impl Recognizer for Broken {
            fn read_text(&mut self, _image: ArrayView3<u8>, _options: &ReadOptions) -> Result<Recognition> {
                anyhow::bail!("model exploded")
            }
        }

        let err = handle_request(request(Mode::Extraction), &mut Broken, &settings()).unwrap_err();
        assert_eq!(err.to_string(), "model exploded");
    }
}
